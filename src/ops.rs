//! Operator tasks behind `hushctl`: sample users, auth settings and mail
//! templates.

use std::{fs, path::Path};

use anyhow::{Context, bail};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::platform::{
    AuthError, AuthSettings, Identities,
    mail::TemplateKind,
};

pub struct SampleUser {
    pub email: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
}

pub const SAMPLE_USERS: [SampleUser; 5] = [
    SampleUser {
        email: "alice@example.com",
        display_name: "Alice Smith",
        description: "Product Manager",
    },
    SampleUser {
        email: "bob@example.com",
        display_name: "Bob Johnson",
        description: "Software Engineer",
    },
    SampleUser {
        email: "charlie@example.com",
        display_name: "Charlie Brown",
        description: "UX Designer",
    },
    SampleUser {
        email: "diana@example.com",
        display_name: "Diana Prince",
        description: "Marketing Lead",
    },
    SampleUser {
        email: "eve@example.com",
        display_name: "Eve Wilson",
        description: "Data Analyst",
    },
];

#[derive(Debug, Default, Serialize)]
pub struct SeedReport {
    pub created: Vec<String>,
    pub existed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Provisions every sample user with `password`, already confirmed.
/// Users that exist are left alone.
pub async fn seed_users(identities: &Identities, password: &str) -> SeedReport {
    let mut report = SeedReport::default();
    for user in &SAMPLE_USERS {
        match identities.provision(user.email, password, Some(user.display_name)).await {
            Ok(identity) => {
                info!(id = %identity.id, email = user.email, role = user.description, "sample user created");
                report.created.push(user.email.to_owned());
            }
            Err(AuthError::EmailTaken) => report.existed.push(user.email.to_owned()),
            Err(e) => {
                error!(email = user.email, "creating sample user failed: {e}");
                report.failed.push((user.email.to_owned(), e.to_string()));
            }
        }
    }
    report
}

/// Fields left `None` keep their current value.
#[derive(Debug, Default, Clone)]
pub struct AuthPatch {
    pub site_url: Option<String>,
    pub session_ttl_secs: Option<i64>,
    pub mailer_autoconfirm: Option<bool>,
    pub min_password_length: Option<usize>,
}

impl AuthPatch {
    fn apply(self, settings: &mut AuthSettings) {
        if let Some(site_url) = self.site_url {
            settings.site_url = site_url.trim_end_matches('/').to_owned();
        }
        if let Some(ttl) = self.session_ttl_secs {
            settings.session_ttl_secs = ttl;
        }
        if let Some(autoconfirm) = self.mailer_autoconfirm {
            settings.mailer_autoconfirm = autoconfirm;
        }
        if let Some(length) = self.min_password_length {
            settings.min_password_length = length;
        }
    }
}

/// Writes the patched settings and returns what reading them back gives.
pub async fn configure_auth(identities: &Identities, patch: AuthPatch) -> anyhow::Result<AuthSettings> {
    let mut wanted = identities.settings().await?;
    patch.apply(&mut wanted);
    if wanted.session_ttl_secs <= 0 {
        bail!("session ttl must be positive, got {}", wanted.session_ttl_secs);
    }

    identities.configure(&wanted).await?;
    let stored = identities.settings().await?;
    if stored != wanted {
        bail!("auth settings did not stick: wanted {wanted:?}, found {stored:?}");
    }
    info!(?stored, "auth settings updated");
    Ok(stored)
}

/// Loads `confirmation.html` and `recovery.html` from `dir`. Missing files
/// are skipped; every stored template is read back and compared.
pub async fn configure_email(identities: &Identities, dir: &Path) -> anyhow::Result<Vec<TemplateKind>> {
    let mailer = identities.mailer();
    let mut configured = Vec::new();

    for kind in TemplateKind::ALL {
        let path = dir.join(kind.file_name());
        if !path.exists() {
            warn!(path = %path.display(), "template file missing, skipping");
            continue;
        }
        let body = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;

        mailer.set_template(kind, kind.default_subject(), &body).await?;
        let stored = mailer.template(kind).await?;
        if stored.body != body || stored.subject != kind.default_subject() {
            bail!("{} template did not stick", kind.as_str());
        }

        info!(kind = kind.as_str(), path = %path.display(), "template stored");
        configured.push(kind);
    }

    Ok(configured)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::platform::db::tests::platform;

    use super::*;

    #[tokio::test]
    async fn seeding_twice_reports_existing_users() {
        let platform = platform().await;

        let first = seed_users(&platform.identities, "password123").await;
        assert_eq!(first.created.len(), 5);
        assert!(first.existed.is_empty() && first.failed.is_empty());

        let second = seed_users(&platform.identities, "password123").await;
        assert!(second.created.is_empty());
        assert_eq!(second.existed.len(), 5);

        let alice = platform.identities.sign_in("alice@example.com", "password123").await.unwrap();
        assert_eq!(alice.display_name.as_deref(), Some("Alice Smith"));
    }

    #[tokio::test]
    async fn short_passwords_fail_every_user() {
        let platform = platform().await;
        let report = seed_users(&platform.identities, "pw").await;
        assert_eq!(report.failed.len(), 5);
    }

    #[tokio::test]
    async fn auth_patch_keeps_untouched_fields() {
        let platform = platform().await;
        let settings = configure_auth(
            &platform.identities,
            AuthPatch {
                mailer_autoconfirm: Some(true),
                site_url: Some("https://chat.example.com/".to_owned()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(settings.mailer_autoconfirm);
        assert_eq!(settings.site_url, "https://chat.example.com");
        assert_eq!(settings.min_password_length, AuthSettings::default().min_password_length);

        let rejected = configure_auth(
            &platform.identities,
            AuthPatch {
                session_ttl_secs: Some(0),
                ..Default::default()
            },
        )
        .await;
        assert!(rejected.is_err());
    }

    #[tokio::test]
    async fn shipped_templates_load() {
        let platform = platform().await;
        let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("templates");

        let configured = configure_email(&platform.identities, &dir).await.unwrap();
        assert_eq!(configured, TemplateKind::ALL);

        let template = platform.identities.mailer().template(TemplateKind::Recovery).await.unwrap();
        assert!(template.body.contains("{link}"));
    }
}
