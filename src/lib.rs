pub mod auth;
pub mod chat;
pub mod config;
pub mod ops;
pub mod platform;
pub mod res;
pub mod session;

use std::sync::Arc;

use axum::{
    Router, debug_handler,
    extract::{FromRef, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tower_sessions::{Expiry, MemoryStore, Session, SessionManagerLayer, cookie::SameSite};
use tracing::error;

use config::Config;
use platform::{Database, Identities, Platform, Realtime};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db: Database,
    pub identities: Identities,
    pub realtime: Realtime,
    pub clients: auth::Clients,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(platform: Platform, clients: auth::Clients, config: Config) -> Self {
        Self {
            db: platform.db,
            identities: platform.identities,
            realtime: platform.realtime,
            clients,
            config: Arc::new(config),
        }
    }
}

/// The whole HTTP surface: pages, JSON endpoints and the realtime socket.
pub fn app(state: AppState, session_ttl: time::Duration) -> Router {
    let session_layer = SessionManagerLayer::new(MemoryStore::default())
        .with_secure(state.config.secure_cookies)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(session_ttl));

    Router::new()
        .route("/", get(landing))
        .route("/protected", get(protected))
        .route("/static/{file}", get(res::asset))
        .merge(auth::router())
        .merge(chat::router())
        .fallback(|| async { AppError::NotFound })
        .with_state(state)
        .layer(session_layer)
        .layer(TraceLayer::new_for_http())
}

#[debug_handler(state = AppState)]
async fn landing(State(identities): State<Identities>, session: Session) -> AppResult<Response> {
    let identity = match session::user_id(&session).await? {
        Some(id) => identities.identity(id).await?,
        None => None,
    };

    let account = match identity {
        Some(identity) => include_res!(str, "/pages/account.html")
            .replace("{avatar}", &res::avatar(identity.avatar_url.as_deref()))
            .replace("{email}", &res::escape(&identity.email))
            .replace("{name}", &res::escape(identity.display_name.as_deref().unwrap_or(""))),
        None => include_res!(str, "/pages/guest.html").to_owned(),
    };

    Ok(res::page("hushline", &include_res!(str, "/pages/landing.html").replace("{account}", &account)).into_response())
}

#[debug_handler(state = AppState)]
async fn protected(State(identities): State<Identities>, session: Session) -> AppResult<Response> {
    let Some(user_id) = session::user_id(&session).await? else {
        return Ok(session::login_redirect("/protected"));
    };
    let Some(identity) = identities.identity(user_id).await? else {
        session.clear().await;
        return Ok(session::login_redirect("/protected"));
    };

    let details = serde_json::to_string_pretty(&identity)?;
    Ok(res::page(
        "Your account",
        &include_res!(str, "/pages/protected.html").replace("{details}", &res::escape(&details)),
    )
    .into_response())
}

pub trait GetField {
    fn get_str_field(&self, field: &str) -> AppResult<String>;
    fn get_obj_field(&self, field: &str) -> AppResult<&Value>;
}

impl GetField for serde_json::Value {
    fn get_str_field(&self, field: &str) -> AppResult<String> {
        Ok(
            self.get(field)
            .ok_or_else(|| anyhow::anyhow!("expected {field} in {self}"))?
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("expected {field} in {self} to be string"))?
            .to_owned()
        )
    }

    fn get_obj_field(&self, field: &str) -> AppResult<&Value> {
        Ok(
            self.get(field)
            .ok_or_else(|| anyhow::anyhow!("expected {field} in {self}"))?
        )
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub enum AppError {
    NotFound,
    Unauthorized,
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NotFound => (StatusCode::NOT_FOUND, res::not_found("page")).into_response(),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "sign in first").into_response(),
            AppError::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason).into_response(),
            AppError::Internal(err) => {
                error!("{err}\n\n{}", err.backtrace());
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Html("Something went wrong. Please try again."),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Internal(err.into())
    }
}
