use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use tracing::info;
use uuid::Uuid;

use super::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Confirmation,
    Recovery,
}

impl TemplateKind {
    pub const ALL: [TemplateKind; 2] = [TemplateKind::Confirmation, TemplateKind::Recovery];

    pub fn as_str(&self) -> &'static str {
        use TemplateKind::*;
        match self {
            Confirmation => "confirmation",
            Recovery => "recovery",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.html", self.as_str())
    }

    pub fn default_subject(&self) -> &'static str {
        use TemplateKind::*;
        match self {
            Confirmation => "Confirm your hushline account",
            Recovery => "Reset your hushline password",
        }
    }

    fn default_body(&self) -> &'static str {
        use TemplateKind::*;
        match self {
            Confirmation => "<p>Hi {email},</p><p>Follow <a href=\"{link}\">this link</a> to confirm your account.</p>",
            Recovery => "<p>Hi {email},</p><p>Follow <a href=\"{link}\">this link</a> to choose a new password.</p>",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct Template {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct OutboxMail {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// Renders the stored templates and drops the result into the outbox table.
/// Delivery beyond the outbox belongs to whatever relay reads it.
#[derive(Clone)]
pub struct Mailer {
    pool: SqlitePool,
}

impl Mailer {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn template(&self, kind: TemplateKind) -> Result<Template, sqlx::Error> {
        let stored: Option<Template> = sqlx::query_as("SELECT subject,body FROM email_templates WHERE kind=?")
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await?;

        Ok(stored.unwrap_or_else(|| Template {
            subject: kind.default_subject().to_owned(),
            body: kind.default_body().to_owned(),
        }))
    }

    pub async fn set_template(&self, kind: TemplateKind, subject: &str, body: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO email_templates (kind,subject,body) VALUES (?,?,?)
             ON CONFLICT (kind) DO UPDATE SET subject=excluded.subject, body=excluded.body",
        )
        .bind(kind.as_str())
        .bind(subject)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn send(&self, kind: TemplateKind, recipient: &str, link: &str) -> Result<(), sqlx::Error> {
        let Template { subject, body } = self.template(kind).await?;
        let body = body.replace("{email}", recipient).replace("{link}", link);

        sqlx::query("INSERT INTO outbox (id,recipient,subject,body,created_at) VALUES (?,?,?,?,?)")
            .bind(Uuid::now_v7())
            .bind(recipient)
            .bind(&subject)
            .bind(&body)
            .bind(now_millis())
            .execute(&self.pool)
            .await?;

        info!(kind = kind.as_str(), %recipient, %link, "mail queued");
        Ok(())
    }

    pub async fn outbox_for(&self, recipient: &str) -> Result<Vec<OutboxMail>, sqlx::Error> {
        sqlx::query_as("SELECT recipient,subject,body FROM outbox WHERE recipient=? ORDER BY created_at, id")
            .bind(recipient)
            .fetch_all(&self.pool)
            .await
    }
}
