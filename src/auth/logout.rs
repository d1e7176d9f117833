use axum::{debug_handler, extract::Query, response::Redirect};
use serde::Deserialize;
use tower_sessions::Session;
use tracing::info;

use crate::{AppResult, session};

#[derive(Deserialize)]
pub(crate) struct LogoutQuery {
    pub(crate) return_url: Option<String>,
}

#[debug_handler]
pub(crate) async fn logout(
    Query(LogoutQuery { return_url }): Query<LogoutQuery>,
    session: Session
) -> AppResult<Redirect> {
    if let Some(id) = session::user_id(&session).await? {
        info!(%id, "signed out");
    }
    session.flush().await?;

    let target = match return_url {
        Some(url) => session::safe_return_url(Some(&url)),
        None => "/".to_owned(),
    };
    Ok(Redirect::to(&target))
}
