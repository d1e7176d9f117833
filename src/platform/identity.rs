//! Identities, credentials and the auth settings that govern them.
//!
//! Creating an identity always creates its profile in the same transaction,
//! so every signed-in principal can be found by the chat views.

use rand::distr::{Alphanumeric, SampleString};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    mail::{Mailer, TemplateKind},
    now_millis, password,
};

const CONFIRMATION_TTL_MS: i64 = 24 * 60 * 60 * 1000;
const RECOVERY_TTL_MS: i64 = 60 * 60 * 1000;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("that doesn't look like an email address")]
    InvalidEmail,
    #[error("passwords need at least {0} characters")]
    WeakPassword(usize),
    #[error("an account with that email already exists")]
    EmailTaken,
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("confirm your email address before signing in")]
    NotConfirmed,
    #[error("that link is invalid or has expired")]
    InvalidToken,
    #[error("{0} hasn't verified that email address")]
    UnverifiedEmail(String),
    #[error("hashing the password failed: {0}")]
    Hash(argon2::password_hash::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl AuthError {
    /// Whether the message is safe and useful to show on a form.
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, AuthError::Sqlx(_) | AuthError::Hash(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct Identity {
    pub id: Uuid,
    pub email: String,
    pub provider: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub confirmed_at: Option<i64>,
    pub created_at: i64,
}

/// What an external OAuth provider told us about a principal.
#[derive(Debug, Clone)]
pub struct OAuthProfile {
    pub provider: String,
    pub subject: String,
    pub email: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    /// Whether the provider vouches that the principal owns `email`.
    pub email_verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthSettings {
    pub site_url: String,
    pub session_ttl_secs: i64,
    pub mailer_autoconfirm: bool,
    pub min_password_length: usize,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            site_url: "http://localhost:8080".to_owned(),
            session_ttl_secs: 3600,
            mailer_autoconfirm: false,
            min_password_length: 6,
        }
    }
}

#[derive(Clone, Copy)]
enum TokenKind {
    Confirmation,
    Recovery,
}

impl TokenKind {
    fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Confirmation => "confirmation",
            TokenKind::Recovery => "recovery",
        }
    }

    fn ttl_ms(&self) -> i64 {
        match self {
            TokenKind::Confirmation => CONFIRMATION_TTL_MS,
            TokenKind::Recovery => RECOVERY_TTL_MS,
        }
    }
}

#[derive(Clone)]
pub struct Identities {
    pool: SqlitePool,
    mailer: Mailer,
}

impl Identities {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            mailer: Mailer::new(pool.clone()),
            pool,
        }
    }

    pub fn mailer(&self) -> &Mailer {
        &self.mailer
    }

    pub async fn identity(&self, id: Uuid) -> Result<Option<Identity>, AuthError> {
        Ok(sqlx::query_as(
            "SELECT id,email,provider,display_name,avatar_url,confirmed_at,created_at FROM identities WHERE id=?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn by_email(&self, email: &str) -> Result<Option<Identity>, AuthError> {
        Ok(sqlx::query_as(
            "SELECT id,email,provider,display_name,avatar_url,confirmed_at,created_at FROM identities WHERE email=?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Registers an email/password identity. Unless the settings auto-confirm,
    /// the identity can't sign in until the mailed confirmation link is used.
    pub async fn sign_up(&self, email: &str, password: &str, display_name: Option<&str>) -> Result<Identity, AuthError> {
        let settings = self.settings().await?;
        let identity = self
            .create(email, password, display_name, settings.mailer_autoconfirm, &settings)
            .await?;

        if identity.confirmed_at.is_none() {
            let token = self.issue_token(identity.id, TokenKind::Confirmation).await?;
            let link = format!("{}/auth/confirm?token={token}", settings.site_url);
            self.mailer.send(TemplateKind::Confirmation, &identity.email, &link).await?;
        }

        info!(id = %identity.id, email = %identity.email, "signed up");
        Ok(identity)
    }

    /// Creates an already confirmed identity without sending mail.
    pub async fn provision(&self, email: &str, password: &str, display_name: Option<&str>) -> Result<Identity, AuthError> {
        let settings = self.settings().await?;
        self.create(email, password, display_name, true, &settings).await
    }

    async fn create(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
        confirmed: bool,
        settings: &AuthSettings,
    ) -> Result<Identity, AuthError> {
        let email = normalize_email(email)?;
        if password.chars().count() < settings.min_password_length {
            return Err(AuthError::WeakPassword(settings.min_password_length));
        }

        let now = now_millis();
        let display_name = display_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| local_part(&email).to_owned());

        let identity = Identity {
            id: Uuid::now_v7(),
            email,
            provider: "email".to_owned(),
            display_name: Some(display_name),
            avatar_url: None,
            confirmed_at: confirmed.then_some(now),
            created_at: now,
        };
        let password_hash = password::hash(password).map_err(AuthError::Hash)?;
        self.insert(&identity, Some(&password_hash), None).await?;
        Ok(identity)
    }

    async fn insert(&self, identity: &Identity, password_hash: Option<&str>, subject: Option<&str>) -> Result<(), AuthError> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO identities (id,email,password_hash,provider,provider_subject,display_name,avatar_url,confirmed_at,created_at)
             VALUES (?,?,?,?,?,?,?,?,?)",
        )
        .bind(identity.id)
        .bind(&identity.email)
        .bind(password_hash)
        .bind(&identity.provider)
        .bind(subject)
        .bind(&identity.display_name)
        .bind(&identity.avatar_url)
        .bind(identity.confirmed_at)
        .bind(identity.created_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => return Err(AuthError::EmailTaken),
            other => {
                other?;
            }
        }

        sqlx::query("INSERT INTO profiles (id,email,display_name,avatar_url,created_at) VALUES (?,?,?,?,?)")
            .bind(identity.id)
            .bind(&identity.email)
            .bind(&identity.display_name)
            .bind(&identity.avatar_url)
            .bind(identity.created_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn confirm(&self, token: &str) -> Result<Identity, AuthError> {
        let id = self.consume_token(token, TokenKind::Confirmation).await?;
        sqlx::query("UPDATE identities SET confirmed_at=coalesce(confirmed_at, ?) WHERE id=?")
            .bind(now_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;

        let identity = self.identity(id).await?.ok_or(AuthError::InvalidToken)?;
        info!(id = %identity.id, "email confirmed");
        Ok(identity)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        let email = email.trim().to_lowercase();
        let row: Option<(Uuid, Option<String>, Option<i64>)> =
            sqlx::query_as("SELECT id,password_hash,confirmed_at FROM identities WHERE email=?")
                .bind(&email)
                .fetch_optional(&self.pool)
                .await?;

        let Some((id, Some(hash), confirmed_at)) = row else {
            return Err(AuthError::InvalidCredentials);
        };
        if !password::verify(password, &hash) {
            warn!(%email, "wrong password");
            return Err(AuthError::InvalidCredentials);
        }
        if confirmed_at.is_none() {
            return Err(AuthError::NotConfirmed);
        }

        self.identity(id).await?.ok_or(AuthError::InvalidCredentials)
    }

    /// Mails a password reset link. Unknown addresses are silently ignored so
    /// the form never reveals which accounts exist.
    pub async fn request_recovery(&self, email: &str) -> Result<(), AuthError> {
        let email = email.trim().to_lowercase();
        let Some(identity) = self.by_email(&email).await? else {
            info!(%email, "recovery requested for unknown address");
            return Ok(());
        };

        let settings = self.settings().await?;
        let token = self.issue_token(identity.id, TokenKind::Recovery).await?;
        let link = format!("{}/auth/update-password?token={token}", settings.site_url);
        self.mailer.send(TemplateKind::Recovery, &identity.email, &link).await?;
        Ok(())
    }

    pub async fn update_password(&self, token: &str, password: &str) -> Result<Identity, AuthError> {
        let settings = self.settings().await?;
        if password.chars().count() < settings.min_password_length {
            return Err(AuthError::WeakPassword(settings.min_password_length));
        }

        let password_hash = password::hash(password).map_err(AuthError::Hash)?;
        let id = self.consume_token(token, TokenKind::Recovery).await?;
        // a recovery link proves control of the mailbox, so it confirms too
        sqlx::query("UPDATE identities SET password_hash=?, confirmed_at=coalesce(confirmed_at, ?) WHERE id=?")
            .bind(password_hash)
            .bind(now_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;

        info!(%id, "password updated");
        self.identity(id).await?.ok_or(AuthError::InvalidToken)
    }

    /// Finds or creates the identity behind an OAuth sign-in.
    ///
    /// The provider must have verified the email. A confirmed account with
    /// that email is linked. An unconfirmed one never proved mailbox
    /// ownership, so its password and pending links are discarded before the
    /// provider's principal takes it over.
    pub async fn sign_in_oauth(&self, profile: OAuthProfile) -> Result<Identity, AuthError> {
        let by_subject: Option<Identity> = sqlx::query_as(
            "SELECT id,email,provider,display_name,avatar_url,confirmed_at,created_at FROM identities
             WHERE provider=? AND provider_subject=?",
        )
        .bind(&profile.provider)
        .bind(&profile.subject)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(identity) = by_subject {
            return Ok(identity);
        }

        if !profile.email_verified {
            warn!(provider = %profile.provider, email = %profile.email, "oauth email not verified");
            return Err(AuthError::UnverifiedEmail(profile.provider));
        }

        let email = normalize_email(&profile.email)?;
        if let Some(identity) = self.by_email(&email).await? {
            let mut tx = self.pool.begin().await?;
            if identity.confirmed_at.is_none() {
                warn!(id = %identity.id, provider = %profile.provider, "unconfirmed account taken over by oauth sign-in");
                sqlx::query("UPDATE identities SET password_hash=NULL, confirmed_at=? WHERE id=?")
                    .bind(now_millis())
                    .bind(identity.id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM auth_tokens WHERE identity_id=?")
                    .bind(identity.id)
                    .execute(&mut *tx)
                    .await?;
            }
            if identity.avatar_url.is_none() && profile.avatar_url.is_some() {
                sqlx::query("UPDATE identities SET avatar_url=? WHERE id=?")
                    .bind(&profile.avatar_url)
                    .bind(identity.id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("UPDATE profiles SET avatar_url=? WHERE id=?")
                    .bind(&profile.avatar_url)
                    .bind(identity.id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            return self.identity(identity.id).await?.ok_or(AuthError::InvalidCredentials);
        }

        let now = now_millis();
        let identity = Identity {
            id: Uuid::now_v7(),
            display_name: profile.name.clone().or_else(|| Some(local_part(&email).to_owned())),
            email,
            provider: profile.provider.clone(),
            avatar_url: profile.avatar_url.clone(),
            confirmed_at: Some(now),
            created_at: now,
        };
        self.insert(&identity, None, Some(&profile.subject)).await?;
        info!(id = %identity.id, provider = %identity.provider, "signed up through oauth");
        Ok(identity)
    }

    pub async fn settings(&self) -> Result<AuthSettings, AuthError> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key,value FROM auth_settings")
            .fetch_all(&self.pool)
            .await?;

        let mut settings = AuthSettings::default();
        for (key, value) in rows {
            let parsed = match key.as_str() {
                "site_url" => {
                    settings.site_url = value.clone();
                    true
                }
                "session_ttl_secs" => value.parse().map(|v| settings.session_ttl_secs = v).is_ok(),
                "mailer_autoconfirm" => value.parse().map(|v| settings.mailer_autoconfirm = v).is_ok(),
                "min_password_length" => value.parse().map(|v| settings.min_password_length = v).is_ok(),
                _ => false,
            };
            if !parsed {
                warn!(%key, %value, "ignoring auth setting");
            }
        }
        Ok(settings)
    }

    pub async fn configure(&self, settings: &AuthSettings) -> Result<(), AuthError> {
        let pairs = [
            ("site_url", settings.site_url.trim_end_matches('/').to_owned()),
            ("session_ttl_secs", settings.session_ttl_secs.to_string()),
            ("mailer_autoconfirm", settings.mailer_autoconfirm.to_string()),
            ("min_password_length", settings.min_password_length.to_string()),
        ];

        let mut tx = self.pool.begin().await?;
        for (key, value) in pairs {
            sqlx::query(
                "INSERT INTO auth_settings (key,value) VALUES (?,?)
                 ON CONFLICT (key) DO UPDATE SET value=excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn issue_token(&self, identity: Uuid, kind: TokenKind) -> Result<String, AuthError> {
        let token = Alphanumeric.sample_string(&mut rand::rng(), 40);
        sqlx::query("INSERT INTO auth_tokens (token,identity_id,kind,expires_at) VALUES (?,?,?,?)")
            .bind(&token)
            .bind(identity)
            .bind(kind.as_str())
            .bind(now_millis() + kind.ttl_ms())
            .execute(&self.pool)
            .await?;
        Ok(token)
    }

    async fn consume_token(&self, token: &str, kind: TokenKind) -> Result<Uuid, AuthError> {
        let row: Option<(Uuid, i64)> =
            sqlx::query_as("DELETE FROM auth_tokens WHERE token=? AND kind=? RETURNING identity_id,expires_at")
                .bind(token)
                .bind(kind.as_str())
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((id, expires_at)) if expires_at > now_millis() => Ok(id),
            _ => Err(AuthError::InvalidToken),
        }
    }
}

fn normalize_email(email: &str) -> Result<String, AuthError> {
    let email = email.trim().to_lowercase();
    let valid = email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.'));
    if !valid || email.chars().any(char::is_whitespace) {
        return Err(AuthError::InvalidEmail);
    }
    Ok(email)
}

fn local_part(email: &str) -> &str {
    email.split('@').next().unwrap_or(email)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::platform::Platform;

    use super::*;

    async fn identities() -> Identities {
        Platform::open("sqlite::memory:", Duration::from_secs(30))
            .await
            .unwrap()
            .identities
    }

    fn token_from(body: &str, marker: &str) -> String {
        let start = body.find(marker).unwrap() + marker.len();
        body[start..].chars().take_while(char::is_ascii_alphanumeric).collect()
    }

    #[tokio::test]
    async fn sign_up_needs_confirmation() {
        let identities = identities().await;
        let created = identities.sign_up(" Alice@Example.com ", "password123", None).await.unwrap();
        assert_eq!(created.email, "alice@example.com");
        assert_eq!(created.display_name.as_deref(), Some("alice"));
        assert!(created.confirmed_at.is_none());

        let result = identities.sign_in("alice@example.com", "password123").await;
        assert!(matches!(result, Err(AuthError::NotConfirmed)));

        let mails = identities.mailer().outbox_for("alice@example.com").await.unwrap();
        assert_eq!(mails.len(), 1);
        let token = token_from(&mails[0].body, "token=");

        identities.confirm(&token).await.unwrap();
        let signed_in = identities.sign_in("ALICE@example.com", "password123").await.unwrap();
        assert_eq!(signed_in.id, created.id);

        // tokens are single use
        assert!(matches!(identities.confirm(&token).await, Err(AuthError::InvalidToken)));
    }

    #[tokio::test]
    async fn sign_up_creates_profile() {
        let platform = Platform::open("sqlite::memory:", Duration::from_secs(30)).await.unwrap();
        let created = platform
            .identities
            .sign_up("bob@example.com", "password123", Some("Bob Johnson"))
            .await
            .unwrap();

        let profile = platform.db.profile(created.id).await.unwrap().unwrap();
        assert_eq!(profile.email, "bob@example.com");
        assert_eq!(profile.name(), "Bob Johnson");
    }

    #[tokio::test]
    async fn rejects_bad_input() {
        let identities = identities().await;
        assert!(matches!(identities.sign_up("nope", "password123", None).await, Err(AuthError::InvalidEmail)));
        assert!(matches!(identities.sign_up("a@b.co", "short", None).await, Err(AuthError::WeakPassword(6))));

        identities.provision("a@b.co", "password123", None).await.unwrap();
        assert!(matches!(identities.sign_up("A@b.co", "password123", None).await, Err(AuthError::EmailTaken)));
        assert!(matches!(identities.sign_in("a@b.co", "password124").await, Err(AuthError::InvalidCredentials)));
        assert!(matches!(identities.sign_in("x@b.co", "password123").await, Err(AuthError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn recovery_resets_password() {
        let identities = identities().await;
        identities.provision("carol@example.com", "old-password", None).await.unwrap();

        identities.request_recovery("ghost@example.com").await.unwrap();
        identities.request_recovery("carol@example.com").await.unwrap();
        let mails = identities.mailer().outbox_for("carol@example.com").await.unwrap();
        let token = token_from(&mails[0].body, "token=");

        assert!(matches!(identities.update_password(&token, "tiny").await, Err(AuthError::WeakPassword(_))));
        identities.update_password(&token, "new-password").await.unwrap();

        assert!(identities.sign_in("carol@example.com", "new-password").await.is_ok());
        assert!(identities.sign_in("carol@example.com", "old-password").await.is_err());
    }

    #[tokio::test]
    async fn autoconfirm_skips_mail() {
        let identities = identities().await;
        identities
            .configure(&AuthSettings {
                mailer_autoconfirm: true,
                min_password_length: 8,
                ..AuthSettings::default()
            })
            .await
            .unwrap();

        let settings = identities.settings().await.unwrap();
        assert!(settings.mailer_autoconfirm);
        assert_eq!(settings.min_password_length, 8);

        identities.sign_up("dave@example.com", "password123", None).await.unwrap();
        assert!(identities.mailer().outbox_for("dave@example.com").await.unwrap().is_empty());
        assert!(identities.sign_in("dave@example.com", "password123").await.is_ok());
    }

    #[tokio::test]
    async fn oauth_reuses_identities() {
        let identities = identities().await;
        let profile = OAuthProfile {
            provider: "github".to_owned(),
            subject: "42".to_owned(),
            email: "eve@example.com".to_owned(),
            name: Some("Eve Wilson".to_owned()),
            avatar_url: Some("https://avatars.example/eve.png".to_owned()),
            email_verified: true,
        };

        let first = identities.sign_in_oauth(profile.clone()).await.unwrap();
        let second = identities.sign_in_oauth(profile).await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(first.confirmed_at.is_some());

        let existing = identities.provision("frank@example.com", "password123", None).await.unwrap();
        let linked = identities
            .sign_in_oauth(OAuthProfile {
                provider: "google".to_owned(),
                subject: "g-1".to_owned(),
                email: "Frank@example.com".to_owned(),
                name: None,
                avatar_url: Some("https://avatars.example/frank.png".to_owned()),
                email_verified: true,
            })
            .await
            .unwrap();
        assert_eq!(linked.id, existing.id);
        assert_eq!(linked.avatar_url.as_deref(), Some("https://avatars.example/frank.png"));
        assert!(identities.sign_in("frank@example.com", "password123").await.is_ok());
    }

    fn google(email: &str, email_verified: bool) -> OAuthProfile {
        OAuthProfile {
            provider: "google".to_owned(),
            subject: format!("g-{email}"),
            email: email.to_owned(),
            name: None,
            avatar_url: Some("https://avatars.example/victim.png".to_owned()),
            email_verified,
        }
    }

    #[tokio::test]
    async fn oauth_evicts_unconfirmed_squatter() {
        let identities = identities().await;
        let squatter = identities.sign_up("victim@example.com", "attacker-pw", None).await.unwrap();
        assert!(squatter.confirmed_at.is_none());
        let mails = identities.mailer().outbox_for("victim@example.com").await.unwrap();
        let token = token_from(&mails[0].body, "token=");

        let owner = identities.sign_in_oauth(google("victim@example.com", true)).await.unwrap();
        assert!(owner.confirmed_at.is_some());

        assert!(matches!(
            identities.sign_in("victim@example.com", "attacker-pw").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(identities.confirm(&token).await, Err(AuthError::InvalidToken)));
    }

    #[tokio::test]
    async fn oauth_needs_verified_email() {
        let identities = identities().await;
        identities.provision("grace@example.com", "password123", None).await.unwrap();

        let refused = identities.sign_in_oauth(google("grace@example.com", false)).await;
        assert!(matches!(refused, Err(AuthError::UnverifiedEmail(_))));
        assert!(identities.sign_in_oauth(google("new@example.com", false)).await.is_err());
    }
}
