use axum::{
    Json, debug_handler,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tower_sessions::Session;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    AppError, AppResult, AppState,
    config::Config,
    include_res,
    platform::{Conversation, Database, Message, PlatformError, Profile, Realtime},
    res, session,
};

use super::{msg, presence};

/// Topic carrying the message inserts of one conversation.
pub fn topic(conversation_id: Uuid) -> String {
    format!("messages:{conversation_id}")
}

/// A message with what the thread needs to show it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadMessage {
    #[serde(flatten)]
    pub message: Message,
    pub sender_name: String,
    pub sender_initials: String,
    pub mine: bool,
}

pub fn decorate(message: Message, me: &Profile, other: &Profile) -> ThreadMessage {
    let mine = message.user_id == me.id;
    let sender = if mine { me } else { other };
    ThreadMessage {
        sender_name: sender.name().to_owned(),
        sender_initials: sender.initials(),
        mine,
        message,
    }
}

/// Trims `content` and stores it. Blank messages are never sent.
pub async fn send_message(
    db: &Database,
    conversation_id: Uuid,
    sender: Uuid,
    content: &str,
) -> Result<Option<Message>, PlatformError> {
    let content = content.trim();
    if content.is_empty() {
        return Ok(None);
    }
    let message = db.insert_message(conversation_id, sender, content).await?;
    info!(conversation = %conversation_id, message = %message.id, "message sent");
    Ok(Some(message))
}

/// One open conversation as its viewer sees it.
#[derive(Debug)]
pub struct ThreadView {
    conversation: Conversation,
    me: Profile,
    other: Profile,
    messages: Vec<ThreadMessage>,
    draft: String,
}

impl ThreadView {
    /// Loads the other participant, then every message oldest first.
    pub async fn load(db: &Database, me: Uuid, conversation_id: Uuid) -> Result<Self, PlatformError> {
        let conversation = db
            .conversation(conversation_id)
            .await?
            .ok_or(PlatformError::ConversationNotFound(conversation_id))?;
        if !conversation.includes(me) {
            return Err(PlatformError::NotParticipant);
        }

        let other_id = conversation.other_participant(me);
        let other = db.profile(other_id).await?.ok_or(PlatformError::ProfileNotFound(other_id))?;
        let me = db.profile(me).await?.ok_or(PlatformError::ProfileNotFound(me))?;

        let messages = db
            .messages(conversation_id)
            .await?
            .into_iter()
            .map(|m| decorate(m, &me, &other))
            .collect();
        Ok(Self {
            conversation,
            me,
            other,
            messages,
            draft: String::new(),
        })
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn other(&self) -> &Profile {
        &self.other
    }

    pub fn messages(&self) -> &[ThreadMessage] {
        &self.messages
    }

    /// The message the view should be scrolled to, the newest one.
    pub fn scroll_target(&self) -> Option<Uuid> {
        self.messages.last().map(|m| m.message.id)
    }

    /// Adds a message pushed by the realtime layer and returns it decorated.
    /// Messages of other conversations and ones already shown give `None`.
    pub fn apply_insert(&mut self, message: Message) -> Option<&ThreadMessage> {
        if message.conversation_id != self.conversation.id
            || self.messages.iter().any(|m| m.message.id == message.id)
        {
            return None;
        }

        let key = (message.created_at, message.id);
        let at = self
            .messages
            .partition_point(|m| (m.message.created_at, m.message.id) <= key);
        self.messages.insert(at, decorate(message, &self.me, &self.other));
        self.messages.get(at)
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn set_draft(&mut self, draft: impl Into<String>) {
        self.draft = draft.into();
    }

    /// Sends the draft. The draft is only cleared once the insert succeeded,
    /// and the message shows up through [`ThreadView::apply_insert`] like any
    /// other.
    pub async fn send(&mut self, db: &Database) -> Result<Option<Message>, PlatformError> {
        let sent = send_message(db, self.conversation.id, self.me.id, &self.draft).await?;
        if sent.is_some() {
            self.draft.clear();
        }
        Ok(sent)
    }
}

#[debug_handler(state = AppState)]
pub(crate) async fn thread_page(
    State(db): State<Database>,
    State(realtime): State<Realtime>,
    State(config): State<std::sync::Arc<Config>>,
    session: Session,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<Response> {
    let Some(me) = session::user_id(&session).await? else {
        return Ok(session::login_redirect(&format!("/chat/{conversation_id}")));
    };

    let view = match ThreadView::load(&db, me, conversation_id).await {
        Ok(view) => view,
        Err(
            PlatformError::ConversationNotFound(_) | PlatformError::NotParticipant | PlatformError::ProfileNotFound(_),
        ) => {
            warn!(conversation = %conversation_id, viewer = %me, "conversation not available");
            return res::sorry("conversation");
        }
        Err(e) => return Err(e.into()),
    };

    let header = msg::header_html(view.other(), presence::status_of(&realtime, view.other().id));
    let messages: String = view.messages().iter().map(msg::message_html).collect();

    let body = include_res!(str, "/pages/chat/thread.html")
        .replace("{conversation_id}", &conversation_id.to_string())
        .replace("{me}", &me.to_string())
        .replace("{other_id}", &view.other().id.to_string())
        .replace("{heartbeat_ms}", &config.heartbeat_interval.as_millis().to_string())
        .replace("{header}", &header)
        .replace("{messages}", &messages);

    Ok(res::page(view.other().name(), &body).into_response())
}

#[debug_handler(state = AppState)]
pub(crate) async fn list_messages(
    State(db): State<Database>,
    session: Session,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<Json<Vec<ThreadMessage>>> {
    let me = session::user_id(&session).await?.ok_or(AppError::Unauthorized)?;

    match ThreadView::load(&db, me, conversation_id).await {
        Ok(view) => Ok(Json(view.messages().to_vec())),
        Err(
            PlatformError::ConversationNotFound(_) | PlatformError::NotParticipant | PlatformError::ProfileNotFound(_),
        ) => Err(AppError::NotFound),
        Err(e) => Err(e.into()),
    }
}

#[derive(Deserialize)]
pub(crate) struct SendRequest {
    content: String,
}

#[debug_handler(state = AppState)]
pub(crate) async fn send(
    State(db): State<Database>,
    session: Session,
    Path(conversation_id): Path<Uuid>,
    Json(SendRequest { content }): Json<SendRequest>,
) -> AppResult<Response> {
    let me = session::user_id(&session).await?.ok_or(AppError::Unauthorized)?;

    match send_message(&db, conversation_id, me, &content).await {
        Ok(Some(message)) => Ok((StatusCode::CREATED, Json(message)).into_response()),
        Ok(None) => Err(AppError::BadRequest("message is empty".to_owned())),
        Err(PlatformError::ConversationNotFound(_) | PlatformError::NotParticipant) => Err(AppError::NotFound),
        Err(e) => {
            error!("sending message failed: {e}");
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::platform::db::tests::{platform, user};

    use super::*;

    fn message(conversation_id: Uuid, user_id: Uuid, created_at: i64, content: &str) -> Message {
        Message {
            id: Uuid::now_v7(),
            conversation_id,
            user_id,
            content: content.to_owned(),
            created_at,
        }
    }

    #[tokio::test]
    async fn loads_oldest_first_with_senders() {
        let platform = platform().await;
        let alice = user(&platform, "alice@example.com").await;
        let bob = user(&platform, "bob@example.com").await;
        let id = platform.db.get_or_create_conversation(alice.id, bob.id).await.unwrap();
        platform.db.insert_message(id, alice.id, "one").await.unwrap();
        platform.db.insert_message(id, bob.id, "two").await.unwrap();

        let view = ThreadView::load(&platform.db, alice.id, id).await.unwrap();

        assert_eq!(view.other().id, bob.id);
        let contents: Vec<_> = view.messages().iter().map(|m| m.message.content.as_str()).collect();
        assert_eq!(contents, ["one", "two"]);
        assert!(view.messages()[0].mine);
        assert!(!view.messages()[1].mine);
        assert_eq!(view.messages()[1].sender_initials, "BO");
        assert_eq!(view.scroll_target(), Some(view.messages()[1].message.id));
    }

    #[tokio::test]
    async fn outsiders_and_unknown_ids_are_refused() {
        let platform = platform().await;
        let alice = user(&platform, "alice@example.com").await;
        let bob = user(&platform, "bob@example.com").await;
        let eve = user(&platform, "eve@example.com").await;
        let id = platform.db.get_or_create_conversation(alice.id, bob.id).await.unwrap();

        let result = ThreadView::load(&platform.db, eve.id, id).await;
        assert!(matches!(result, Err(PlatformError::NotParticipant)));

        let result = ThreadView::load(&platform.db, alice.id, Uuid::now_v7()).await;
        assert!(matches!(result, Err(PlatformError::ConversationNotFound(_))));
    }

    #[tokio::test]
    async fn inserts_are_deduplicated_and_ordered() {
        let platform = platform().await;
        let alice = user(&platform, "alice@example.com").await;
        let bob = user(&platform, "bob@example.com").await;
        let id = platform.db.get_or_create_conversation(alice.id, bob.id).await.unwrap();
        let mut view = ThreadView::load(&platform.db, alice.id, id).await.unwrap();

        let late = message(id, bob.id, 2_000, "late");
        let early = message(id, alice.id, 1_000, "early");
        assert!(!view.apply_insert(late.clone()).unwrap().mine);
        assert!(view.apply_insert(early).unwrap().mine);
        assert!(view.apply_insert(late).is_none());
        assert!(view.apply_insert(message(Uuid::now_v7(), bob.id, 3_000, "elsewhere")).is_none());

        let contents: Vec<_> = view.messages().iter().map(|m| m.message.content.as_str()).collect();
        assert_eq!(contents, ["early", "late"]);
        assert!(
            view.messages()
                .windows(2)
                .all(|w| w[0].message.created_at <= w[1].message.created_at)
        );
    }

    #[tokio::test]
    async fn send_clears_draft_only_on_success() {
        let platform = platform().await;
        let alice = user(&platform, "alice@example.com").await;
        let bob = user(&platform, "bob@example.com").await;
        let id = platform.db.get_or_create_conversation(alice.id, bob.id).await.unwrap();
        let mut view = ThreadView::load(&platform.db, alice.id, id).await.unwrap();

        view.set_draft("   ");
        assert!(view.send(&platform.db).await.unwrap().is_none());
        assert_eq!(view.draft(), "   ");
        assert!(platform.db.messages(id).await.unwrap().is_empty());

        view.set_draft("  hello ");
        let sent = view.send(&platform.db).await.unwrap().unwrap();
        assert_eq!(sent.content, "hello");
        assert_eq!(view.draft(), "");
        assert_eq!(platform.db.messages(id).await.unwrap().len(), 1);
        // shown only once the realtime insert arrives
        assert!(view.messages().is_empty());

        sqlx::query("DELETE FROM conversations WHERE id=?")
            .bind(id)
            .execute(platform.db.pool())
            .await
            .unwrap();
        view.set_draft("lost?");
        assert!(view.send(&platform.db).await.is_err());
        assert_eq!(view.draft(), "lost?");
    }
}
