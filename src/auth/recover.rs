use axum::{
    Form, debug_handler,
    extract::{Query, State},
    response::{Html, IntoResponse, Redirect, Response},
};
use serde::Deserialize;
use tower_sessions::Session;
use tracing::info;

use crate::{
    AppResult, AppState, include_res,
    platform::Identities,
    res::{self, escape},
    session,
};

use super::notice;

#[debug_handler]
pub(crate) async fn forgot_password_page() -> Html<String> {
    res::page(
        "Reset your password",
        &include_res!(str, "/pages/auth/forgot_password.html").replace("{error}", ""),
    )
}

#[derive(Deserialize)]
pub(crate) struct ForgotPasswordForm {
    email: String,
}

/// Answers the same whether or not the address has an account.
#[debug_handler(state = AppState)]
pub(crate) async fn forgot_password_submit(
    State(identities): State<Identities>,
    Form(ForgotPasswordForm { email }): Form<ForgotPasswordForm>,
) -> AppResult<Html<String>> {
    identities.request_recovery(&email).await?;
    Ok(res::page(
        "Check your email",
        &include_res!(str, "/pages/auth/recovery_sent.html").replace("{email}", &escape(email.trim())),
    ))
}

#[derive(Deserialize)]
pub(crate) struct UpdatePasswordQuery {
    #[serde(default)]
    token: String,
}

fn render_update(token: &str, error: Option<&str>) -> Html<String> {
    res::page(
        "Choose a new password",
        &include_res!(str, "/pages/auth/update_password.html")
            .replace("{token}", &escape(token))
            .replace("{error}", &notice(error)),
    )
}

#[debug_handler]
pub(crate) async fn update_password_page(Query(UpdatePasswordQuery { token }): Query<UpdatePasswordQuery>) -> Html<String> {
    render_update(&token, None)
}

#[derive(Deserialize)]
pub(crate) struct UpdatePasswordForm {
    token: String,
    password: String,
}

#[debug_handler(state = AppState)]
pub(crate) async fn update_password_submit(
    State(identities): State<Identities>,
    session: Session,
    Form(UpdatePasswordForm { token, password }): Form<UpdatePasswordForm>,
) -> AppResult<Response> {
    match identities.update_password(&token, &password).await {
        Ok(identity) => {
            session::sign_in(&session, identity.id).await?;
            info!(id = %identity.id, "signed in after password reset");
            Ok(Redirect::to("/chat").into_response())
        }
        Err(e) if e.is_user_facing() => Ok(render_update(&token, Some(&e.to_string())).into_response()),
        Err(e) => Err(e.into()),
    }
}
