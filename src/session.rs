use axum::response::{IntoResponse, Redirect, Response};
use tower_sessions::Session;
use uuid::Uuid;

use crate::AppResult;

pub const USER_ID: &str = "user_id";
pub const CSRF_STATE: &str = "csrf_state";
pub const PKCE_VERIFIER: &str = "pkce_verifier";
pub const RETURN_URL: &str = "return_url";

pub async fn user_id(session: &Session) -> AppResult<Option<Uuid>> {
    Ok(session.get::<Uuid>(USER_ID).await?)
}

/// Binds `user_id` to a fresh session id.
pub async fn sign_in(session: &Session, user_id: Uuid) -> AppResult<()> {
    session.cycle_id().await?;
    session.insert(USER_ID, user_id).await?;
    Ok(())
}

pub fn login_redirect(return_url: &str) -> Response {
    Redirect::to(&format!("/auth/login?return_url={}", urlencoding::encode(return_url))).into_response()
}

/// Only same-site paths are followed after signing in.
pub fn safe_return_url(return_url: Option<&str>) -> String {
    match return_url {
        Some(url) if url.starts_with('/') && !url.starts_with("//") && !url.contains('\\') => url.to_owned(),
        _ => "/chat".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_urls_stay_on_site() {
        assert_eq!(safe_return_url(Some("/chat/abc")), "/chat/abc");
        assert_eq!(safe_return_url(Some("https://evil.example")), "/chat");
        assert_eq!(safe_return_url(Some("//evil.example")), "/chat");
        assert_eq!(safe_return_url(None), "/chat");
    }

    #[test]
    fn login_redirect_keeps_the_query() {
        let response = login_redirect("/chat/abc?x=1 2");
        let location = response.headers()[axum::http::header::LOCATION].to_str().unwrap();
        assert_eq!(location, "/auth/login?return_url=%2Fchat%2Fabc%3Fx%3D1%202");
    }
}
