//! Sign-in pages and the session gate they feed.
//!
//! Email/password flows go through [`Identities`](crate::platform::Identities);
//! Google and GitHub sign-in are offered when their OAuth clients are
//! configured.

use axum::{
    Router,
    routing::get,
};

use crate::{AppState, include_res, res::escape};

mod clients;
mod confirm;
mod lockin;
mod login;
mod logout;
mod recover;
mod signup;

pub use clients::{ClientProvider, Clients};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/login", get(login::login_page).post(login::login_submit))
        .route("/auth/login/{provider}", get(login::login))
        .route("/auth/lockin/{provider}", get(lockin::lockin))
        .route("/auth/sign-up", get(signup::sign_up_page).post(signup::sign_up_submit))
        .route("/auth/sign-up-success", get(signup::sign_up_success))
        .route("/auth/confirm", get(confirm::confirm))
        .route(
            "/auth/forgot-password",
            get(recover::forgot_password_page).post(recover::forgot_password_submit),
        )
        .route(
            "/auth/update-password",
            get(recover::update_password_page).post(recover::update_password_submit),
        )
        .route("/auth/logout", get(logout::logout))
}

/// The error banner shown above a form, or nothing.
fn notice(error: Option<&str>) -> String {
    match error {
        Some(message) => include_res!(str, "/pages/auth/error.html").replace("{message}", &escape(message)),
        None => String::new(),
    }
}
