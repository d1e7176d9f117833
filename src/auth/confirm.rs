use axum::{
    debug_handler,
    extract::{Query, State},
    response::{IntoResponse, Redirect, Response},
};
use serde::Deserialize;
use tower_sessions::Session;

use crate::{
    AppResult, AppState,
    platform::{AuthError, Identities},
    session,
};

#[derive(Deserialize)]
pub(crate) struct ConfirmQuery {
    token: Option<String>,
}

/// Target of the link in the confirmation mail. Signs the new identity in.
#[debug_handler(state = AppState)]
pub(crate) async fn confirm(
    State(identities): State<Identities>,
    session: Session,
    Query(ConfirmQuery { token }): Query<ConfirmQuery>,
) -> AppResult<Response> {
    let confirmed = match token {
        Some(token) => identities.confirm(&token).await,
        None => Err(AuthError::InvalidToken),
    };

    match confirmed {
        Ok(identity) => {
            session::sign_in(&session, identity.id).await?;
            Ok(Redirect::to("/chat").into_response())
        }
        Err(e) if e.is_user_facing() => {
            Ok(Redirect::to(&format!("/auth/login?error={}", urlencoding::encode(&e.to_string()))).into_response())
        }
        Err(e) => Err(e.into()),
    }
}
