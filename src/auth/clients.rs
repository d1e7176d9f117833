use std::fmt;

use anyhow::anyhow;
use oauth2::{AuthUrl, Client, ClientId, ClientSecret, RedirectUrl, TokenUrl, basic::BasicClient};
use reqwest::header::{ACCEPT, USER_AGENT};
use serde::Deserialize;
use serde_json::Value;

use crate::{AppResult, GetField, platform::OAuthProfile};

type HappyClient = Client<oauth2::StandardErrorResponse<oauth2::basic::BasicErrorResponseType>, oauth2::StandardTokenResponse<oauth2::EmptyExtraTokenFields, oauth2::basic::BasicTokenType>, oauth2::StandardTokenIntrospectionResponse<oauth2::EmptyExtraTokenFields, oauth2::basic::BasicTokenType>, oauth2::StandardRevocableToken, oauth2::StandardErrorResponse<oauth2::RevocationErrorResponseType>, oauth2::EndpointSet, oauth2::EndpointNotSet, oauth2::EndpointNotSet, oauth2::EndpointNotSet, oauth2::EndpointSet>;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClientProvider {
    Google,
    Github,
}

impl ClientProvider {
    pub const ALL: [ClientProvider; 2] = [ClientProvider::Google, ClientProvider::Github];

    pub fn slug(&self) -> &'static str {
        use ClientProvider::*;
        match self {
            Google => "google",
            Github => "github",
        }
    }

    pub fn label(&self) -> &'static str {
        use ClientProvider::*;
        match self {
            Google => "Google",
            Github => "GitHub",
        }
    }

    pub(crate) fn scopes(&self) -> &'static [&'static str] {
        use ClientProvider::*;
        match self {
            Google => &["openid", "email", "profile"],
            Github => &["read:user", "user:email"],
        }
    }

    fn endpoints(&self) -> (&'static str, &'static str) {
        use ClientProvider::*;
        match self {
            Google => (
                "https://accounts.google.com/o/oauth2/auth",
                "https://oauth2.googleapis.com/token",
            ),
            Github => (
                "https://github.com/login/oauth/authorize",
                "https://github.com/login/oauth/access_token",
            ),
        }
    }
}

impl fmt::Display for ClientProvider {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Configured OAuth clients. Providers missing from the secrets file are
/// simply not offered.
#[derive(Clone, Default)]
pub struct Clients {
    google_client: Option<HappyClient>,
    github_client: Option<HappyClient>,
}

impl Clients {
    /// Reads `{"google": {"client_id", "client_secret"}, "github": {...}}`.
    pub fn from_json(json: Value, public_url: &str) -> AppResult<Clients> {
        let public_url = public_url.trim_end_matches('/');
        let client = |provider: ClientProvider| -> AppResult<Option<HappyClient>> {
            let Some(json) = json.get(provider.slug()) else {
                return Ok(None);
            };
            let client_id = ClientId::new(json.get_str_field("client_id")?);
            let client_secret = ClientSecret::new(json.get_str_field("client_secret")?);

            let (auth_url, token_url) = provider.endpoints();
            let auth_url = AuthUrl::new(auth_url.to_owned())?;
            let token_url = TokenUrl::new(token_url.to_owned())?;
            let redirect_url = RedirectUrl::new(format!("{public_url}/auth/lockin/{}", provider.slug()))?;

            Ok(Some(
                BasicClient::new(client_id)
                .set_client_secret(client_secret)
                .set_auth_uri(auth_url)
                .set_token_uri(token_url)
                .set_redirect_uri(redirect_url)
            ))
        };

        Ok(
            Clients {
                google_client: client(ClientProvider::Google)?,
                github_client: client(ClientProvider::Github)?,
            }
        )
    }

    pub fn providers(&self) -> Vec<ClientProvider> {
        ClientProvider::ALL
            .into_iter()
            .filter(|provider| self.client(*provider).is_some())
            .collect()
    }

    fn client(&self, provider: ClientProvider) -> Option<&HappyClient> {
        use ClientProvider::*;
        match provider {
            Google => self.google_client.as_ref(),
            Github => self.github_client.as_ref(),
        }
    }

    pub fn get_client(&self, provider: ClientProvider) -> AppResult<HappyClient> {
        self.client(provider)
            .cloned()
            .ok_or_else(|| anyhow!("OAuth provider {provider} keys not supplied").into())
    }
}

/// Asks the provider who the access token belongs to.
pub(crate) async fn fetch_profile(
    provider: ClientProvider,
    http_client: &reqwest::Client,
    access_token: &str,
) -> AppResult<OAuthProfile> {
    match provider {
        ClientProvider::Google => {
            let body: Value = http_client
                .get("https://www.googleapis.com/oauth2/v3/userinfo")
                .bearer_auth(access_token)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            Ok(OAuthProfile {
                provider: provider.slug().to_owned(),
                subject: body.get_str_field("sub")?,
                email: body.get_str_field("email")?,
                name: body.get_str_field("name").ok(),
                avatar_url: body.get_str_field("picture").ok(),
                email_verified: body["email_verified"].as_bool() == Some(true),
            })
        }
        ClientProvider::Github => {
            let github = |url: &str| {
                http_client
                    .get(url)
                    .bearer_auth(access_token)
                    .header(USER_AGENT, "hushline")
                    .header(ACCEPT, "application/vnd.github+json")
            };

            let body: Value = github("https://api.github.com/user").send().await?.error_for_status()?.json().await?;
            let subject = body
                .get_obj_field("id")?
                .as_i64()
                .ok_or_else(|| anyhow!("expected numeric id in {body}"))?
                .to_string();

            // the public profile email carries no verification flag, so the
            // address always comes from the verified entries of /user/emails
            let emails: Vec<Value> = github("https://api.github.com/user/emails")
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            let public = body.get_str_field("email").ok();
            let verified = || emails.iter().filter(|e| e["verified"].as_bool() == Some(true));
            let email = verified()
                .find(|e| public.is_some() && e["email"].as_str() == public.as_deref())
                .or_else(|| verified().find(|e| e["primary"].as_bool() == Some(true)))
                .ok_or_else(|| anyhow!("GitHub account has no verified email"))?
                .get_str_field("email")?;

            Ok(OAuthProfile {
                provider: provider.slug().to_owned(),
                subject,
                email,
                name: body.get_str_field("name").or_else(|_| body.get_str_field("login")).ok(),
                avatar_url: body.get_str_field("avatar_url").ok(),
                email_verified: true,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn only_configured_providers_are_offered() {
        assert!(Clients::default().providers().is_empty());

        let clients = Clients::from_json(
            json!({ "github": { "client_id": "id", "client_secret": "secret" } }),
            "http://localhost:8080/",
        )
        .unwrap();
        assert_eq!(clients.providers(), [ClientProvider::Github]);
        assert!(clients.get_client(ClientProvider::Google).is_err());
    }

    #[test]
    fn incomplete_secrets_are_rejected() {
        assert!(Clients::from_json(json!({ "google": { "client_id": "id" } }), "http://localhost:8080").is_err());
    }
}
