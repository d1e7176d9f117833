//! The backing platform every view talks to: relational storage, identities and
//! realtime channels.
//!
//! A [`Platform`] is opened once when the process starts and its parts are
//! handed to whoever needs them. Nothing below this module knows about HTTP.

pub mod db;
pub mod identity;
pub mod mail;
pub mod password;
pub mod realtime;

use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;
use tracing::info;

pub use db::{Conversation, Database, Message, Profile};
pub use identity::{AuthError, AuthSettings, Identities, Identity, OAuthProfile};
pub use realtime::{Channel, ChannelEvent, ChangeFilter, PresenceEvent, PresenceState, Realtime};

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("a conversation needs two different participants")]
    SelfConversation,
    #[error("sender is not a participant of this conversation")]
    NotParticipant,
    #[error("conversation {0} not found")]
    ConversationNotFound(uuid::Uuid),
    #[error("profile {0} not found")]
    ProfileNotFound(uuid::Uuid),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct Platform {
    pub db: Database,
    pub identities: Identities,
    pub realtime: Realtime,
}

impl Platform {
    pub async fn open(database_url: &str, presence_timeout: Duration) -> anyhow::Result<Self> {
        let pool = db::connect(database_url).await?;
        db::migrate(&pool).await?;
        info!("storage ready at {database_url}");

        let realtime = Realtime::new(presence_timeout);
        Ok(Self {
            db: Database::new(pool.clone(), realtime.clone()),
            identities: Identities::new(pool),
            realtime,
        })
    }
}

/// Current time as unix milliseconds, the unit every stored timestamp uses.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
