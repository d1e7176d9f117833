use std::collections::BTreeSet;

use axum::{
    Json, debug_handler,
    extract::{Query, State},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tower_sessions::Session;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    AppError, AppResult, AppState,
    config::Config,
    include_res,
    platform::{Conversation, Database, Message, PlatformError, Profile, Realtime},
    res, session,
};

use super::{msg, presence};

pub const MIN_SEARCH_LEN: usize = 2;
pub const SEARCH_LIMIT: i64 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct ConversationEntry {
    pub conversation: Conversation,
    pub other_id: Uuid,
    pub other: Option<Profile>,
    pub last_message: Option<Message>,
}

/// The viewer's conversations, newest activity first, each with the other
/// participant's profile and a last-message preview.
///
/// Profiles for every participant come from a single batched lookup.
pub async fn list_conversations(db: &Database, me: Uuid) -> Result<Vec<ConversationEntry>, PlatformError> {
    let conversations = db.list_conversations(me).await?;
    if conversations.is_empty() {
        return Ok(Vec::new());
    }

    let participant_ids: Vec<Uuid> = conversations
        .iter()
        .flat_map(|c| [c.participant1_id, c.participant2_id])
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let profiles = db.profiles_by_ids(&participant_ids).await?;

    let mut entries = Vec::with_capacity(conversations.len());
    for conversation in conversations {
        let other_id = conversation.other_participant(me);
        let last_message = db.last_message(conversation.id).await?;
        entries.push(ConversationEntry {
            other: profiles.get(&other_id).cloned(),
            other_id,
            last_message,
            conversation,
        });
    }
    Ok(entries)
}

/// Other people whose email contains `query`. Fewer than
/// [`MIN_SEARCH_LEN`] characters never reach storage.
pub async fn search_users(db: &Database, me: Uuid, query: &str) -> Result<Vec<Profile>, PlatformError> {
    let query = query.trim();
    if query.chars().count() < MIN_SEARCH_LEN {
        return Ok(Vec::new());
    }
    db.search_profiles(query, me, SEARCH_LIMIT).await
}

pub async fn start_conversation(db: &Database, me: Uuid, other: Uuid) -> Result<Uuid, PlatformError> {
    if db.profile(other).await?.is_none() {
        return Err(PlatformError::ProfileNotFound(other));
    }
    let id = db.get_or_create_conversation(me, other).await?;
    info!(%id, %me, %other, "conversation started");
    Ok(id)
}

#[debug_handler(state = AppState)]
pub(crate) async fn directory_page(
    State(db): State<Database>,
    State(realtime): State<Realtime>,
    State(config): State<std::sync::Arc<Config>>,
    session: Session,
) -> AppResult<Response> {
    let Some(me) = session::user_id(&session).await? else {
        return Ok(session::login_redirect("/chat"));
    };
    let Some(profile) = db.profile(me).await? else {
        session.clear().await;
        return Ok(session::login_redirect("/chat"));
    };

    let entries = list_conversations(&db, me).await?;

    let items = if entries.is_empty() {
        include_res!(str, "/pages/chat/empty.html").to_owned()
    } else {
        entries
            .iter()
            .map(|entry| msg::conversation_html(entry, presence::status_of(&realtime, entry.other_id)))
            .collect()
    };

    let body = include_res!(str, "/pages/chat/directory.html")
        .replace("{me}", &me.to_string())
        .replace("{debounce_ms}", &config.search_debounce.as_millis().to_string())
        .replace("{heartbeat_ms}", &config.heartbeat_interval.as_millis().to_string())
        .replace("{min_search}", &MIN_SEARCH_LEN.to_string())
        .replace("{email}", &res::escape(&profile.email))
        .replace("{conversations}", &items);

    Ok(res::page("Chats", &body).into_response())
}

#[derive(Deserialize)]
pub(crate) struct SearchQuery {
    #[serde(default)]
    q: String,
}

#[debug_handler(state = AppState)]
pub(crate) async fn search(
    State(db): State<Database>,
    session: Session,
    Query(SearchQuery { q }): Query<SearchQuery>,
) -> AppResult<Json<Vec<Profile>>> {
    let me = session::user_id(&session).await?.ok_or(AppError::Unauthorized)?;
    let profiles = search_users(&db, me, &q).await.inspect_err(|e| error!("search failed: {e}"))?;
    Ok(Json(profiles))
}

#[debug_handler(state = AppState)]
pub(crate) async fn list(State(db): State<Database>, session: Session) -> AppResult<Json<Vec<ConversationEntry>>> {
    let me = session::user_id(&session).await?.ok_or(AppError::Unauthorized)?;
    Ok(Json(list_conversations(&db, me).await?))
}

#[derive(Deserialize)]
pub(crate) struct StartRequest {
    user_id: Uuid,
}

#[derive(Serialize)]
pub(crate) struct StartResponse {
    conversation_id: Uuid,
    url: String,
}

#[debug_handler(state = AppState)]
pub(crate) async fn start(
    State(db): State<Database>,
    session: Session,
    Json(StartRequest { user_id }): Json<StartRequest>,
) -> AppResult<Json<StartResponse>> {
    let me = session::user_id(&session).await?.ok_or(AppError::Unauthorized)?;

    match start_conversation(&db, me, user_id).await {
        Ok(conversation_id) => Ok(Json(StartResponse {
            conversation_id,
            url: format!("/chat/{conversation_id}"),
        })),
        Err(PlatformError::SelfConversation) => Err(AppError::BadRequest("you can't start a chat with yourself".to_owned())),
        Err(PlatformError::ProfileNotFound(_)) => Err(AppError::NotFound),
        Err(e) => {
            error!("creating conversation failed: {e}");
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::platform::db::tests::{platform, user};

    use super::*;

    #[tokio::test]
    async fn empty_directory() {
        let platform = platform().await;
        let alice = user(&platform, "alice@example.com").await;
        assert!(list_conversations(&platform.db, alice.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn entries_resolve_the_other_side() {
        let platform = platform().await;
        let alice = user(&platform, "alice@example.com").await;
        let bob = user(&platform, "bob@example.com").await;
        let carol = user(&platform, "carol@example.com").await;

        let with_bob = start_conversation(&platform.db, alice.id, bob.id).await.unwrap();
        let with_carol = start_conversation(&platform.db, carol.id, alice.id).await.unwrap();
        platform.db.insert_message(with_bob, bob.id, "first").await.unwrap();
        platform.db.insert_message(with_bob, alice.id, "latest").await.unwrap();

        let entries = list_conversations(&platform.db, alice.id).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].conversation.id, with_bob);
        assert_eq!(entries[0].other.as_ref().map(|p| p.id), Some(bob.id));
        assert_eq!(entries[0].last_message.as_ref().map(|m| m.content.as_str()), Some("latest"));
        assert_eq!(entries[1].conversation.id, with_carol);
        assert_eq!(entries[1].other_id, carol.id);
        assert!(entries[1].last_message.is_none());
    }

    #[tokio::test]
    async fn short_queries_never_search() {
        let platform = platform().await;
        let alice = user(&platform, "alice@example.com").await;
        user(&platform, "bob@example.com").await;

        assert!(search_users(&platform.db, alice.id, "").await.unwrap().is_empty());
        assert!(search_users(&platform.db, alice.id, " b ").await.unwrap().is_empty());
        assert_eq!(search_users(&platform.db, alice.id, "bo").await.unwrap().len(), 1);
        assert!(search_users(&platform.db, alice.id, "alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_people_cannot_be_messaged() {
        let platform = platform().await;
        let alice = user(&platform, "alice@example.com").await;
        let result = start_conversation(&platform.db, alice.id, Uuid::now_v7()).await;
        assert!(matches!(result, Err(PlatformError::ProfileNotFound(_))));
    }
}
