mod directory;
pub mod format;
mod msg;
pub mod presence;
pub mod search;
pub mod thread;
mod ws;

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use axum::{Router, routing::get};

use crate::AppState;

pub use directory::{ConversationEntry, MIN_SEARCH_LEN, SEARCH_LIMIT, list_conversations, search_users, start_conversation};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/chat", get(directory::directory_page))
        .route("/chat/{conversation_id}", get(thread::thread_page))
        .route("/api/users/search", get(directory::search))
        .route("/api/conversations", get(directory::list).post(directory::start))
        .route(
            "/api/conversations/{conversation_id}/messages",
            get(thread::list_messages).post(thread::send),
        )
        .route("/api/presence/{user_id}", get(presence::status))
        .route("/realtime", get(ws::realtime_ws))
}

/// Hands out generation tickets so a load can tell whether the viewer moved
/// on while it was in flight.
#[derive(Clone, Default)]
pub struct Navigation {
    generation: Arc<AtomicU64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

impl Navigation {
    /// Starts a new navigation; every earlier ticket becomes stale.
    pub fn navigate(&self) -> Ticket {
        Ticket(self.generation.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn is_current(&self, ticket: Ticket) -> bool {
        self.generation.load(Ordering::SeqCst) == ticket.0
    }
}
