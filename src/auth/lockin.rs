use anyhow::anyhow;
use axum::{
    debug_handler,
    extract::{Path, Query, State},
    response::{IntoResponse, Redirect, Response},
};
use oauth2::{AuthorizationCode, CsrfToken, PkceCodeVerifier, TokenResponse};
use serde::Deserialize;
use tower_sessions::Session;
use tracing::{info, warn};

use crate::{
    AppResult, AppState,
    platform::Identities,
    session::{self, CSRF_STATE, PKCE_VERIFIER, RETURN_URL},
};

use super::{ClientProvider, Clients, clients::fetch_profile};

#[derive(Deserialize)]
pub struct LockinQuery {
    pub state: Option<String>,
    pub code: Option<String>,
    pub error: Option<String>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn lockin(
    Path(provider): Path<ClientProvider>,
    Query(LockinQuery { state, code, error }): Query<LockinQuery>,
    State(identities): State<Identities>,
    State(clients): State<Clients>,
    session: Session,
) -> AppResult<Response> {
    if let Some(error) = error {
        info!(%provider, %error, "provider refused sign in");
        return Ok(Redirect::to(&format!("/auth/login?error={}", urlencoding::encode(&format!("{provider} sign in was cancelled")))).into_response());
    }

    let state = CsrfToken::new(state.ok_or(anyhow!("OAuth: without state"))?);
    let code = AuthorizationCode::new(code.ok_or(anyhow!("OAuth: without code"))?);

    let Some(stored_state) = session.remove::<String>(CSRF_STATE).await? else {
        return Err(anyhow!("no csrf_state"))?;
    };

    if state.secret().as_str() != stored_state.as_str() {
        return Err(anyhow!("csrf tokens don't match"))?;
    }

    let Some(pkce_verifier) = session.remove::<String>(PKCE_VERIFIER).await? else {
        return Err(anyhow!("no pkce_verifier"))?;
    };

    let client = clients.get_client(provider)?;
    let http_client = reqwest::ClientBuilder::new()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;
    let token_result = client
        .exchange_code(code)
        .set_pkce_verifier(PkceCodeVerifier::new(pkce_verifier))
        .request_async(&http_client)
        .await?;

    let access_token = token_result.access_token().secret();
    let profile = fetch_profile(provider, &http_client, access_token).await?;
    let identity = match identities.sign_in_oauth(profile).await {
        Ok(identity) => identity,
        Err(e) if e.is_user_facing() => {
            warn!(%provider, "oauth sign in refused: {e}");
            return Ok(Redirect::to(&format!("/auth/login?error={}", urlencoding::encode(&e.to_string()))).into_response());
        }
        Err(e) => return Err(e.into()),
    };

    let return_url: Option<String> = session.remove(RETURN_URL).await?;
    session::sign_in(&session, identity.id).await?;
    info!(id = %identity.id, %provider, "welcome");

    Ok(Redirect::to(&session::safe_return_url(return_url.as_deref())).into_response())
}
