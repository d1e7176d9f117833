mod common;

use axum::http::StatusCode;
use serde_json::{Value, json};
use uuid::Uuid;

use common::*;

#[tokio::test]
async fn chat_requires_a_session() {
    let platform = platform().await;
    let router = router(&platform);

    let response = send(&router, get("/chat", None)).await;
    assert!(response.status().is_redirection());
    assert_eq!(location(&response), "/auth/login?return_url=%2Fchat");

    let response = send(&router, get("/api/users/search?q=bob", None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn wrong_password_shows_the_form_again() {
    let platform = platform().await;
    user(&platform, "alice@example.com").await;
    let router = router(&platform);

    let response = send(
        &router,
        axum::http::Request::post("/auth/login")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(axum::body::Body::from("email=alice%40example.com&password=nope"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await.contains("invalid email or password"));
}

#[tokio::test]
async fn empty_directory_shows_the_empty_state() {
    let platform = platform().await;
    user(&platform, "alice@example.com").await;
    let router = router(&platform);
    let cookie = sign_in(&router, "alice@example.com").await;

    let response = send(&router, get("/chat", Some(&cookie))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await.contains("No conversations yet"));
}

#[tokio::test]
async fn unknown_and_foreign_conversations_are_not_found() {
    let platform = platform().await;
    let alice = user(&platform, "alice@example.com").await;
    let bob = user(&platform, "bob@example.com").await;
    user(&platform, "eve@example.com").await;
    let private = platform.db.get_or_create_conversation(alice.id, bob.id).await.unwrap();

    let router = router(&platform);
    let cookie = sign_in(&router, "eve@example.com").await;

    let response = send(&router, get(&format!("/chat/{}", Uuid::now_v7()), Some(&cookie))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(&router, get(&format!("/chat/{private}"), Some(&cookie))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(
        &router,
        post_json(&format!("/api/conversations/{private}/messages"), &cookie, json!({ "content": "hi" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn search_skips_short_queries_and_self() {
    let platform = platform().await;
    user(&platform, "alice@example.com").await;
    user(&platform, "bob@example.com").await;
    let router = router(&platform);
    let cookie = sign_in(&router, "alice@example.com").await;

    let response = send(&router, get("/api/users/search?q=b", Some(&cookie))).await;
    let found: Vec<Value> = serde_json::from_str(&body_text(response).await).unwrap();
    assert!(found.is_empty());

    let response = send(&router, get("/api/users/search?q=example", Some(&cookie))).await;
    let found: Vec<Value> = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["email"], "bob@example.com");
}

#[tokio::test]
async fn starting_a_chat_with_yourself_is_refused() {
    let platform = platform().await;
    let alice = user(&platform, "alice@example.com").await;
    let router = router(&platform);
    let cookie = sign_in(&router, "alice@example.com").await;

    let response = send(&router, post_json("/api/conversations", &cookie, json!({ "user_id": alice.id }))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn signing_out_ends_the_session() {
    let platform = platform().await;
    user(&platform, "alice@example.com").await;
    let router = router(&platform);
    let cookie = sign_in(&router, "alice@example.com").await;

    let response = send(&router, get("/auth/logout", Some(&cookie))).await;
    assert!(response.status().is_redirection());

    let response = send(&router, get("/chat", Some(&cookie))).await;
    assert!(response.status().is_redirection());
}
