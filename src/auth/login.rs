use axum::{
    Form, debug_handler,
    extract::{Path, Query, State},
    response::{Html, IntoResponse, Redirect, Response},
};
use oauth2::{CsrfToken, PkceCodeChallenge, Scope};
use serde::Deserialize;
use tower_sessions::Session;
use tracing::{info, warn};

use crate::{
    AppResult, AppState, include_res,
    platform::{AuthError, Identities},
    res::{self, escape},
    session::{self, CSRF_STATE, PKCE_VERIFIER, RETURN_URL},
};

use super::{ClientProvider, Clients, notice};

#[derive(Deserialize)]
pub(crate) struct LoginQuery {
    pub(crate) return_url: Option<String>,
    pub(crate) error: Option<String>,
}

pub(crate) fn render(clients: &Clients, return_url: Option<&str>, email: &str, error: Option<&str>) -> Html<String> {
    let return_url = session::safe_return_url(return_url);
    let providers: String = clients
        .providers()
        .into_iter()
        .map(|provider| {
            include_res!(str, "/pages/auth/provider.html")
                .replace("{slug}", provider.slug())
                .replace("{label}", provider.label())
                .replace("{return_url}", &urlencoding::encode(&return_url))
        })
        .collect();

    res::page(
        "Sign in",
        &include_res!(str, "/pages/auth/login.html")
            .replace("{return_url}", &escape(&return_url))
            .replace("{email}", &escape(email))
            .replace("{providers}", &providers)
            .replace("{error}", &notice(error)),
    )
}

#[debug_handler(state = AppState)]
pub(crate) async fn login_page(
    State(clients): State<Clients>,
    Query(LoginQuery { return_url, error }): Query<LoginQuery>,
) -> Html<String> {
    render(&clients, return_url.as_deref(), "", error.as_deref())
}

#[derive(Deserialize)]
pub(crate) struct LoginForm {
    email: String,
    password: String,
    return_url: Option<String>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn login_submit(
    State(identities): State<Identities>,
    State(clients): State<Clients>,
    session: Session,
    Form(LoginForm { email, password, return_url }): Form<LoginForm>,
) -> AppResult<Response> {
    match identities.sign_in(&email, &password).await {
        Ok(identity) => {
            session::sign_in(&session, identity.id).await?;
            info!(id = %identity.id, "signed in");
            Ok(Redirect::to(&session::safe_return_url(return_url.as_deref())).into_response())
        }
        Err(e @ (AuthError::InvalidCredentials | AuthError::NotConfirmed)) => {
            Ok(render(&clients, return_url.as_deref(), &email, Some(&e.to_string())).into_response())
        }
        Err(e) => Err(e.into()),
    }
}

#[debug_handler(state = AppState)]
pub(crate) async fn login(
    Path(provider): Path<ClientProvider>,
    Query(LoginQuery { return_url, .. }): Query<LoginQuery>,
    State(clients): State<Clients>,
    session: Session,
) -> AppResult<Response> {
    let Ok(client) = clients.get_client(provider) else {
        warn!(%provider, "sign in attempted with unconfigured provider");
        return res::sorry("sign-in provider");
    };

    let (pkce_code_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

    let (authorize_url, csrf_state) = client.authorize_url(CsrfToken::new_random)
        .add_scopes(provider.scopes().iter().map(|scope| Scope::new((*scope).to_owned())))
        .set_pkce_challenge(pkce_code_challenge)
        .url();

    session.insert(CSRF_STATE, csrf_state.secret()).await?;
    session.insert(PKCE_VERIFIER, pkce_verifier.secret()).await?;
    session.insert(RETURN_URL, session::safe_return_url(return_url.as_deref())).await?;

    Ok(Redirect::to(authorize_url.as_str()).into_response())
}
