use axum::{
    Form, debug_handler,
    extract::State,
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

fn render(email: &str, display_name: &str, error: Option<&str>) -> Html<String> {
    res::page(
        "Sign up",
        &include_res!(str, "/pages/auth/sign_up.html")
            .replace("{email}", &escape(email))
            .replace("{display_name}", &escape(display_name))
            .replace("{error}", &notice(error)),
    )
}

#[debug_handler]
pub(crate) async fn sign_up_page() -> Html<String> {
    render("", "", None)
}

#[derive(Deserialize)]
pub(crate) struct SignUpForm {
    email: String,
    password: String,
    repeat_password: String,
    #[serde(default)]
    display_name: String,
}

#[debug_handler(state = AppState)]
pub(crate) async fn sign_up_submit(
    State(identities): State<Identities>,
    session: Session,
    Form(form): Form<SignUpForm>,
) -> AppResult<Response> {
    if form.password != form.repeat_password {
        return Ok(render(&form.email, &form.display_name, Some("passwords do not match")).into_response());
    }

    let identity = match identities.sign_up(&form.email, &form.password, Some(&form.display_name)).await {
        Ok(identity) => identity,
        Err(e) if e.is_user_facing() => {
            info!(email = %form.email, "sign up refused: {e}");
            return Ok(render(&form.email, &form.display_name, Some(&e.to_string())).into_response());
        }
        Err(e) => return Err(e.into()),
    };

    // with auto-confirmation on there is no mail to wait for
    if identity.confirmed_at.is_some() {
        session::sign_in(&session, identity.id).await?;
        return Ok(Redirect::to("/chat").into_response());
    }
    Ok(Redirect::to("/auth/sign-up-success").into_response())
}

#[debug_handler]
pub(crate) async fn sign_up_success() -> Html<String> {
    res::page("Check your email", include_res!(str, "/pages/auth/sign_up_success.html"))
}
