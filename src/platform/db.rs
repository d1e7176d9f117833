use std::{collections::HashMap, str::FromStr};

use serde::{Deserialize, Serialize};
use sqlx::{
    FromRow, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use tracing::debug;
use uuid::Uuid;

use super::{PlatformError, Realtime, now_millis};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS identities (
        id BLOB PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        password_hash TEXT,
        provider TEXT NOT NULL,
        provider_subject TEXT,
        display_name TEXT,
        avatar_url TEXT,
        confirmed_at INTEGER,
        created_at INTEGER NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS identities_provider_subject
        ON identities (provider, provider_subject) WHERE provider_subject IS NOT NULL",
    "CREATE TABLE IF NOT EXISTS profiles (
        id BLOB PRIMARY KEY REFERENCES identities (id) ON DELETE CASCADE,
        email TEXT NOT NULL,
        display_name TEXT,
        avatar_url TEXT,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS conversations (
        id BLOB PRIMARY KEY,
        participant1_id BLOB NOT NULL REFERENCES profiles (id),
        participant2_id BLOB NOT NULL REFERENCES profiles (id),
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        CHECK (participant1_id <> participant2_id)
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS conversations_pair ON conversations (
        min(participant1_id, participant2_id),
        max(participant1_id, participant2_id)
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id BLOB PRIMARY KEY,
        conversation_id BLOB NOT NULL REFERENCES conversations (id) ON DELETE CASCADE,
        user_id BLOB NOT NULL REFERENCES profiles (id),
        content TEXT NOT NULL CHECK (length(content) > 0),
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS messages_by_conversation ON messages (conversation_id, created_at, id)",
    "CREATE TABLE IF NOT EXISTS auth_tokens (
        token TEXT PRIMARY KEY,
        identity_id BLOB NOT NULL REFERENCES identities (id) ON DELETE CASCADE,
        kind TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS auth_settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS email_templates (
        kind TEXT PRIMARY KEY,
        subject TEXT NOT NULL,
        body TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS outbox (
        id BLOB PRIMARY KEY,
        recipient TEXT NOT NULL,
        subject TEXT NOT NULL,
        body TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
];

pub async fn connect(url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true);

    // every connection to ":memory:" is its own database, so keep exactly one alive
    let pool = if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(16)
    };

    pool.connect_with(options).await
}

pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Profile {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl Profile {
    pub fn name(&self) -> &str {
        match self.display_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => self.email.split('@').next().unwrap_or(&self.email),
        }
    }

    pub fn initials(&self) -> String {
        self.email.chars().take(2).collect::<String>().to_uppercase()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct Conversation {
    pub id: Uuid,
    pub participant1_id: Uuid,
    pub participant2_id: Uuid,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Conversation {
    pub fn includes(&self, identity: Uuid) -> bool {
        self.participant1_id == identity || self.participant2_id == identity
    }

    /// The participant that isn't `me`.
    pub fn other_participant(&self, me: Uuid) -> Uuid {
        if self.participant1_id == me {
            self.participant2_id
        } else {
            self.participant1_id
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    pub created_at: i64,
}

/// Relational reads and writes for profiles, conversations and messages.
///
/// Writes that other clients care about are pushed to [`Realtime`] after they
/// commit.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    realtime: Realtime,
}

impl Database {
    pub fn new(pool: SqlitePool, realtime: Realtime) -> Self {
        Self { pool, realtime }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn profile(&self, id: Uuid) -> Result<Option<Profile>, PlatformError> {
        Ok(
            sqlx::query_as("SELECT id,email,display_name,avatar_url FROM profiles WHERE id=?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// One lookup for every id, keyed by profile id. Unknown ids are absent from the map.
    pub async fn profiles_by_ids(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Profile>, PlatformError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!("SELECT id,email,display_name,avatar_url FROM profiles WHERE id IN ({placeholders})");
        let mut query = sqlx::query_as::<_, Profile>(&sql);
        for id in ids {
            query = query.bind(*id);
        }

        let profiles = query.fetch_all(&self.pool).await?;
        Ok(profiles.into_iter().map(|profile| (profile.id, profile)).collect())
    }

    /// Profiles whose email contains `needle` (case-insensitive), never `exclude`.
    pub async fn search_profiles(&self, needle: &str, exclude: Uuid, limit: i64) -> Result<Vec<Profile>, PlatformError> {
        let pattern = format!("%{}%", escape_like(needle));
        Ok(
            sqlx::query_as(
                "SELECT id,email,display_name,avatar_url FROM profiles
                 WHERE email LIKE ? ESCAPE '\\' AND id<>?
                 ORDER BY email
                 LIMIT ?",
            )
            .bind(pattern)
            .bind(exclude)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?,
        )
    }

    pub async fn conversation(&self, id: Uuid) -> Result<Option<Conversation>, PlatformError> {
        Ok(
            sqlx::query_as("SELECT id,participant1_id,participant2_id,created_at,updated_at FROM conversations WHERE id=?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Every conversation `identity` takes part in, most recently updated first.
    pub async fn list_conversations(&self, identity: Uuid) -> Result<Vec<Conversation>, PlatformError> {
        Ok(
            sqlx::query_as(
                "SELECT id,participant1_id,participant2_id,created_at,updated_at FROM conversations
                 WHERE participant1_id=? OR participant2_id=?
                 ORDER BY updated_at DESC, id DESC",
            )
            .bind(identity)
            .bind(identity)
            .fetch_all(&self.pool)
            .await?,
        )
    }

    /// Returns the conversation between `a` and `b`, creating it on first use.
    ///
    /// Argument order doesn't matter and concurrent callers end up with the
    /// same id: the unordered pair is unique in storage.
    pub async fn get_or_create_conversation(&self, a: Uuid, b: Uuid) -> Result<Uuid, PlatformError> {
        if a == b {
            return Err(PlatformError::SelfConversation);
        }

        let now = now_millis();
        let created = sqlx::query(
            "INSERT OR IGNORE INTO conversations (id,participant1_id,participant2_id,created_at,updated_at)
             VALUES (?,?,?,?,?)",
        )
        .bind(Uuid::now_v7())
        .bind(a)
        .bind(b)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let (id,): (Uuid,) = sqlx::query_as(
            "SELECT id FROM conversations
             WHERE (participant1_id=? AND participant2_id=?) OR (participant1_id=? AND participant2_id=?)",
        )
        .bind(a)
        .bind(b)
        .bind(b)
        .bind(a)
        .fetch_one(&self.pool)
        .await?;

        debug!(%id, created = created > 0, "conversation resolved");
        Ok(id)
    }

    /// All messages of a conversation, oldest first.
    pub async fn messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, PlatformError> {
        Ok(
            sqlx::query_as(
                "SELECT id,conversation_id,user_id,content,created_at FROM messages
                 WHERE conversation_id=?
                 ORDER BY created_at ASC, id ASC",
            )
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await?,
        )
    }

    pub async fn last_message(&self, conversation_id: Uuid) -> Result<Option<Message>, PlatformError> {
        Ok(
            sqlx::query_as(
                "SELECT id,conversation_id,user_id,content,created_at FROM messages
                 WHERE conversation_id=?
                 ORDER BY created_at DESC, id DESC
                 LIMIT 1",
            )
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?,
        )
    }

    /// Stores one message, bumps the conversation and pushes the new row to
    /// `messages` subscribers.
    pub async fn insert_message(&self, conversation_id: Uuid, sender: Uuid, content: &str) -> Result<Message, PlatformError> {
        let conversation = self
            .conversation(conversation_id)
            .await?
            .ok_or(PlatformError::ConversationNotFound(conversation_id))?;
        if !conversation.includes(sender) {
            return Err(PlatformError::NotParticipant);
        }

        let message = Message {
            id: Uuid::now_v7(),
            conversation_id,
            user_id: sender,
            content: content.to_owned(),
            created_at: now_millis().max(conversation.updated_at),
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO messages (id,conversation_id,user_id,content,created_at) VALUES (?,?,?,?,?)")
            .bind(message.id)
            .bind(message.conversation_id)
            .bind(message.user_id)
            .bind(&message.content)
            .bind(message.created_at)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE conversations SET updated_at=? WHERE id=?")
            .bind(message.created_at)
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.realtime.publish_insert("messages", serde_json::to_value(&message)?);
        Ok(message)
    }
}

fn escape_like(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len());
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
