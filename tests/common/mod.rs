#![allow(dead_code)]

use std::time::Duration;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, Response, header},
};
use hushline::{
    AppState, app,
    auth::Clients,
    config::Config,
    platform::{Platform, Profile},
};
use tower::ServiceExt;

pub async fn platform() -> Platform {
    Platform::open("sqlite::memory:", Duration::from_secs(30)).await.unwrap()
}

pub async fn user(platform: &Platform, email: &str) -> Profile {
    let identity = platform.identities.provision(email, "correct horse", None).await.unwrap();
    platform.db.profile(identity.id).await.unwrap().unwrap()
}

pub fn router(platform: &Platform) -> Router {
    let state = AppState::new(platform.clone(), Clients::default(), Config::default());
    app(state, time::Duration::hours(1))
}

pub async fn send(router: &Router, request: Request<Body>) -> Response<Body> {
    router.clone().oneshot(request).await.unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub fn location(response: &Response<Body>) -> &str {
    response.headers()[header::LOCATION].to_str().unwrap()
}

/// Signs `email` in through the login form and returns the session cookie.
pub async fn sign_in(router: &Router, email: &str) -> String {
    let response = send(
        router,
        Request::post("/auth/login")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(format!("email={}&password=correct+horse&return_url=%2Fchat", email.replace('@', "%40"))))
            .unwrap(),
    )
    .await;
    assert!(response.status().is_redirection(), "login failed with {}", response.status());
    assert_eq!(location(&response), "/chat");

    let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
    cookie.split(';').next().unwrap().to_owned()
}

pub fn get(uri: &str, cookie: Option<&str>) -> Request<Body> {
    let mut request = Request::get(uri);
    if let Some(cookie) = cookie {
        request = request.header(header::COOKIE, cookie);
    }
    request.body(Body::empty()).unwrap()
}

pub fn post_json(uri: &str, cookie: &str, json: serde_json::Value) -> Request<Body> {
    Request::post(uri)
        .header(header::COOKIE, cookie)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json.to_string()))
        .unwrap()
}
