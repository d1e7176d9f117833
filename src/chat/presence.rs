//! Online indicators.
//!
//! Every signed-in page tracks its owner on `presence:<user id>`; anyone
//! rendering that user's status watches the same topic.

use axum::{
    Json, debug_handler,
    extract::{Path, State},
};
use serde::Serialize;
use serde_json::json;
use tower_sessions::Session;
use tracing::debug;
use uuid::Uuid;

use crate::{
    AppError, AppResult, AppState,
    platform::{Channel, PresenceEvent, Profile, Realtime, now_millis, realtime::RealtimeError},
    session,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Unknown,
    Online,
    Offline,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Unknown => "unknown",
            Status::Online => "online",
            Status::Offline => "offline",
        }
    }
}

pub fn topic(user_id: Uuid) -> String {
    format!("presence:{user_id}")
}

/// What the presence topic says about `user_id` right now.
pub fn status_of(realtime: &Realtime, user_id: Uuid) -> Status {
    let state = realtime.presence_state(&topic(user_id));
    if state.get(&user_id.to_string()).is_some_and(|records| !records.is_empty()) {
        Status::Online
    } else {
        Status::Offline
    }
}

/// Folds presence events for one user into a [`Status`].
///
/// Starts out `Unknown` and only moves when an event arrives.
#[derive(Debug, Clone)]
pub struct PresenceObserver {
    key: String,
    status: Status,
}

impl PresenceObserver {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            key: user_id.to_string(),
            status: Status::Unknown,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn apply(&mut self, event: &PresenceEvent) -> Status {
        match event {
            PresenceEvent::Sync { state } => {
                self.status = if state.get(&self.key).is_some_and(|records| !records.is_empty()) {
                    Status::Online
                } else {
                    Status::Offline
                };
            }
            PresenceEvent::Join { key, .. } if *key == self.key => self.status = Status::Online,
            PresenceEvent::Leave { key, .. } if *key == self.key => self.status = Status::Offline,
            _ => {}
        }
        self.status
    }
}

/// Announces one user as online for as long as it is held.
pub struct PresenceTracker {
    channel: Channel,
}

impl PresenceTracker {
    pub fn join(realtime: &Realtime, profile: &Profile) -> Result<Self, RealtimeError> {
        let mut channel = realtime
            .channel(topic(profile.id))
            .with_presence_key(profile.id.to_string())
            .subscribe();
        channel.track(json!({
            "user_id": profile.id,
            "email": profile.email,
            "online_at": now_millis(),
        }))?;
        debug!(user = %profile.id, "presence tracked");
        Ok(Self { channel })
    }

    pub fn heartbeat(&mut self) -> Result<(), RealtimeError> {
        self.channel.heartbeat()
    }

    pub fn leave(mut self) {
        self.channel.untrack();
        self.channel.close();
    }
}

#[derive(Serialize)]
pub(crate) struct StatusResponse {
    user_id: Uuid,
    status: Status,
}

#[debug_handler(state = AppState)]
pub(crate) async fn status(
    State(realtime): State<Realtime>,
    session: Session,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<StatusResponse>> {
    session::user_id(&session).await?.ok_or(AppError::Unauthorized)?;
    Ok(Json(StatusResponse {
        user_id,
        status: status_of(&realtime, user_id),
    }))
}
