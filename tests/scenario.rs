//! Two people find each other and exchange a message, the way the browser
//! drives it.

mod common;

use axum::http::StatusCode;
use hushline::{
    chat::{presence, thread::ThreadView},
    platform::{ChannelEvent, ChangeFilter, Message},
};
use serde_json::{Value, json};

use common::*;

#[tokio::test]
async fn hello_reaches_the_other_side() {
    let platform = platform().await;
    let u1 = user(&platform, "u1@example.com").await;
    let u2 = user(&platform, "u2@example.com").await;
    let router = router(&platform);
    let cookie1 = sign_in(&router, "u1@example.com").await;
    let cookie2 = sign_in(&router, "u2@example.com").await;

    // u1 finds u2 and opens a conversation; doing it again lands in the same one
    let response = send(&router, get("/api/users/search?q=u2@", Some(&cookie1))).await;
    let found: Vec<Value> = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(found[0]["id"], json!(u2.id));

    let response = send(&router, post_json("/api/conversations", &cookie1, json!({ "user_id": u2.id }))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let started: Value = serde_json::from_str(&body_text(response).await).unwrap();
    let conversation_id = started["conversation_id"].as_str().unwrap().to_owned();

    let response = send(&router, post_json("/api/conversations", &cookie2, json!({ "user_id": u1.id }))).await;
    let again: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(again["conversation_id"], conversation_id.as_str());

    // u2 has the thread open and listens for inserts
    let mut view = ThreadView::load(&platform.db, u2.id, conversation_id.parse().unwrap())
        .await
        .unwrap();
    assert!(view.messages().is_empty());

    let mut channel = platform
        .realtime
        .channel(format!("messages:{conversation_id}"))
        .on_insert(ChangeFilter::eq("messages", "conversation_id", &conversation_id))
        .subscribe();
    let _tracker = presence::PresenceTracker::join(&platform.realtime, &u2).unwrap();

    let response = send(
        &router,
        post_json(
            &format!("/api/conversations/{conversation_id}/messages"),
            &cookie1,
            json!({ "content": "hello" }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let record = loop {
        match channel.recv().await {
            Some(ChannelEvent::Insert(change)) => break change.record,
            Some(ChannelEvent::Presence(_)) => continue,
            None => panic!("channel closed"),
        }
    };
    let message: Message = serde_json::from_value(record).unwrap();
    assert!(view.apply_insert(message.clone()).is_some());
    assert!(view.apply_insert(message).is_none());

    assert_eq!(view.messages().len(), 1);
    assert_eq!(view.messages()[0].message.content, "hello");
    assert!(!view.messages()[0].mine);
    assert_eq!(view.scroll_target(), Some(view.messages()[0].message.id));

    // both directories now lead with this conversation, and u1 sees u2 online
    let response = send(&router, get("/chat", Some(&cookie1))).await;
    let page = body_text(response).await;
    assert!(page.contains(&format!("/chat/{conversation_id}")));
    assert!(page.contains("hello"));
    assert!(page.contains("presence online"));

    let response = send(&router, get(&format!("/api/conversations/{conversation_id}/messages"), Some(&cookie2))).await;
    let messages: Vec<Value> = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["sender_name"], "u1");
    assert_eq!(messages[0]["mine"], false);

    let response = send(&router, get(&format!("/chat/{conversation_id}"), Some(&cookie2))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await.contains("<p>hello</p>"));
}

#[tokio::test]
async fn blank_messages_are_rejected() {
    let platform = platform().await;
    let u1 = user(&platform, "u1@example.com").await;
    let u2 = user(&platform, "u2@example.com").await;
    let conversation_id = platform.db.get_or_create_conversation(u1.id, u2.id).await.unwrap();
    let router = router(&platform);
    let cookie = sign_in(&router, "u1@example.com").await;

    let response = send(
        &router,
        post_json(&format!("/api/conversations/{conversation_id}/messages"), &cookie, json!({ "content": "  \n " })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(platform.db.messages(conversation_id).await.unwrap().is_empty());
}
