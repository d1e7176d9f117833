//! Topic based channels carrying row inserts and presence.
//!
//! A topic exists while at least one [`Channel`] is subscribed to it or some
//! presence record is still tracked on it. Presence records live only as long
//! as the channel that tracked them: closing or dropping the channel retracts
//! the record, and records whose owner stopped sending heartbeats are swept
//! after the presence timeout.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

const CHANNEL_CAPACITY: usize = 256;

/// Tracked payloads per presence key.
pub type PresenceState = BTreeMap<String, Vec<Value>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PresenceEvent {
    Sync { state: PresenceState },
    Join { key: String, presences: Vec<Value> },
    Leave { key: String, presences: Vec<Value> },
}

/// A row that was just inserted into `table`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowChange {
    pub table: String,
    pub record: Value,
}

/// Selects inserts into `table` whose `column` equals `value`.
#[derive(Debug, Clone)]
pub struct ChangeFilter {
    pub table: String,
    pub column: String,
    pub value: String,
}

impl ChangeFilter {
    pub fn eq(table: &str, column: &str, value: impl ToString) -> Self {
        Self {
            table: table.to_owned(),
            column: column.to_owned(),
            value: value.to_string(),
        }
    }

    pub fn matches(&self, change: &RowChange) -> bool {
        change.table == self.table
            && change.record.get(&self.column).is_some_and(|field| match field {
                Value::String(s) => *s == self.value,
                other => other.to_string() == self.value,
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Insert(RowChange),
    Presence(PresenceEvent),
}

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("channel was subscribed without a presence key")]
    NoPresenceKey,
    #[error("channel topic {0} is gone")]
    TopicGone(String),
}

struct Record {
    conn_ref: u64,
    payload: Value,
    last_seen: Instant,
}

struct Topic {
    events: broadcast::Sender<PresenceEvent>,
    presences: HashMap<String, Vec<Record>>,
    subscribers: usize,
}

impl Topic {
    fn new() -> Self {
        Self {
            events: broadcast::channel(CHANNEL_CAPACITY).0,
            presences: HashMap::new(),
            subscribers: 0,
        }
    }

    fn state(&self) -> PresenceState {
        self.presences
            .iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(key, records)| (key.clone(), records.iter().map(|r| r.payload.clone()).collect()))
            .collect()
    }

    /// Sends a join or leave diff followed by the resulting full state.
    fn announce(&self, diff: PresenceEvent) {
        let _ = self.events.send(diff);
        let _ = self.events.send(PresenceEvent::Sync { state: self.state() });
    }

    fn is_idle(&self) -> bool {
        self.subscribers == 0 && self.presences.is_empty()
    }
}

struct Hub {
    topics: Mutex<HashMap<String, Topic>>,
    changes: broadcast::Sender<RowChange>,
    presence_timeout: Duration,
    next_ref: AtomicU64,
}

#[derive(Clone)]
pub struct Realtime {
    hub: Arc<Hub>,
}

impl Realtime {
    pub fn new(presence_timeout: Duration) -> Self {
        Self {
            hub: Arc::new(Hub {
                topics: Mutex::new(HashMap::new()),
                changes: broadcast::channel(CHANNEL_CAPACITY).0,
                presence_timeout,
                next_ref: AtomicU64::new(1),
            }),
        }
    }

    pub fn channel(&self, topic: impl Into<String>) -> ChannelBuilder {
        ChannelBuilder {
            realtime: self.clone(),
            topic: topic.into(),
            filter: None,
            presence_key: None,
        }
    }

    pub fn publish_insert(&self, table: &str, record: Value) {
        let receivers = self
            .hub
            .changes
            .send(RowChange {
                table: table.to_owned(),
                record,
            })
            .unwrap_or(0);
        debug!(table, receivers, "published insert");
    }

    pub fn presence_state(&self, topic: &str) -> PresenceState {
        self.topics().get(topic).map(Topic::state).unwrap_or_default()
    }

    /// Drops every presence record not refreshed within the presence timeout
    /// and tells the topic's subscribers. Returns how many were dropped.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let timeout = self.hub.presence_timeout;
        let mut topics = self.topics();
        let mut dropped = 0;

        for (name, topic) in topics.iter_mut() {
            let mut left = Vec::new();
            for (key, records) in topic.presences.iter_mut() {
                let (stale, fresh): (Vec<Record>, Vec<Record>) = records
                    .drain(..)
                    .partition(|r| now.saturating_duration_since(r.last_seen) > timeout);
                *records = fresh;
                if !stale.is_empty() {
                    left.push((key.clone(), stale.into_iter().map(|r| r.payload).collect::<Vec<_>>()));
                }
            }
            topic.presences.retain(|_, records| !records.is_empty());

            for (key, presences) in left {
                debug!(topic = %name, %key, "presence expired");
                dropped += presences.len();
                topic.announce(PresenceEvent::Leave { key, presences });
            }
        }

        topics.retain(|_, topic| !topic.is_idle());
        dropped
    }

    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let realtime = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let dropped = realtime.sweep_expired(Instant::now());
                if dropped > 0 {
                    info!(dropped, "swept presences without heartbeat");
                }
            }
        })
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, Topic>> {
        self.hub.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn retract(&self, topic_name: &str, key: &str, conn_ref: u64) {
        let mut topics = self.topics();
        let Some(topic) = topics.get_mut(topic_name) else {
            return;
        };

        let Some(records) = topic.presences.get_mut(key) else {
            return;
        };
        let (gone, kept): (Vec<Record>, Vec<Record>) = records.drain(..).partition(|r| r.conn_ref == conn_ref);
        *records = kept;
        if records.is_empty() {
            topic.presences.remove(key);
        }

        if !gone.is_empty() {
            topic.announce(PresenceEvent::Leave {
                key: key.to_owned(),
                presences: gone.into_iter().map(|r| r.payload).collect(),
            });
        }
    }
}

pub struct ChannelBuilder {
    realtime: Realtime,
    topic: String,
    filter: Option<ChangeFilter>,
    presence_key: Option<String>,
}

impl ChannelBuilder {
    pub fn on_insert(mut self, filter: ChangeFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_presence_key(mut self, key: impl Into<String>) -> Self {
        self.presence_key = Some(key.into());
        self
    }

    /// Joins the topic. The first event the channel yields is a presence
    /// `Sync` with the topic's current state.
    pub fn subscribe(self) -> Channel {
        let conn_ref = self.realtime.hub.next_ref.fetch_add(1, Ordering::Relaxed);
        let changes = self
            .filter
            .map(|filter| (filter, self.realtime.hub.changes.subscribe()));

        let (presence, state) = {
            let mut topics = self.realtime.topics();
            let topic = topics.entry(self.topic.clone()).or_insert_with(Topic::new);
            topic.subscribers += 1;
            (topic.events.subscribe(), topic.state())
        };
        debug!(topic = %self.topic, conn_ref, "channel subscribed");

        Channel {
            realtime: self.realtime,
            topic: self.topic,
            presence_key: self.presence_key,
            conn_ref,
            presence,
            changes,
            pending: VecDeque::from([ChannelEvent::Presence(PresenceEvent::Sync { state })]),
            tracked: None,
            closed: false,
        }
    }
}

pub struct Channel {
    realtime: Realtime,
    topic: String,
    presence_key: Option<String>,
    conn_ref: u64,
    presence: broadcast::Receiver<PresenceEvent>,
    changes: Option<(ChangeFilter, broadcast::Receiver<RowChange>)>,
    pending: VecDeque<ChannelEvent>,
    tracked: Option<Value>,
    closed: bool,
}

impl Channel {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn presence_state(&self) -> PresenceState {
        self.realtime.presence_state(&self.topic)
    }

    /// Publishes `payload` under this channel's presence key, replacing what
    /// this channel tracked before.
    pub fn track(&mut self, payload: Value) -> Result<(), RealtimeError> {
        let key = self.presence_key.clone().ok_or(RealtimeError::NoPresenceKey)?;
        {
            let mut topics = self.realtime.topics();
            let topic = topics
                .get_mut(&self.topic)
                .ok_or_else(|| RealtimeError::TopicGone(self.topic.clone()))?;
            let records = topic.presences.entry(key.clone()).or_default();
            records.retain(|r| r.conn_ref != self.conn_ref);
            records.push(Record {
                conn_ref: self.conn_ref,
                payload: payload.clone(),
                last_seen: Instant::now(),
            });
            topic.announce(PresenceEvent::Join {
                key,
                presences: vec![payload.clone()],
            });
        }

        self.tracked = Some(payload);
        Ok(())
    }

    pub fn untrack(&mut self) {
        if self.tracked.take().is_none() {
            return;
        }
        if let Some(key) = &self.presence_key {
            self.realtime.retract(&self.topic, key, self.conn_ref);
        }
    }

    /// Keeps this channel's presence record alive. A record that was already
    /// swept is tracked again.
    pub fn heartbeat(&mut self) -> Result<(), RealtimeError> {
        let (Some(payload), Some(key)) = (self.tracked.clone(), self.presence_key.as_deref()) else {
            return Ok(());
        };

        let refreshed = {
            let mut topics = self.realtime.topics();
            topics
                .get_mut(&self.topic)
                .and_then(|topic| topic.presences.get_mut(key))
                .and_then(|records| records.iter_mut().find(|r| r.conn_ref == self.conn_ref))
                .map(|record| record.last_seen = Instant::now())
                .is_some()
        };

        if !refreshed {
            self.track(payload)?;
        }
        Ok(())
    }

    /// Next event for this channel, or `None` once the topic is gone.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }

        tokio::select! {
            presence = next_presence(&mut self.presence) => match presence? {
                Ok(event) => Some(ChannelEvent::Presence(event)),
                Err(skipped) => {
                    warn!(topic = %self.topic, skipped, "presence receiver lagged, resyncing");
                    Some(ChannelEvent::Presence(PresenceEvent::Sync { state: self.presence_state() }))
                }
            },
            change = next_change(&mut self.changes) => change.map(ChannelEvent::Insert),
        }
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.untrack();

        let mut topics = self.realtime.topics();
        if let Some(topic) = topics.get_mut(&self.topic) {
            topic.subscribers = topic.subscribers.saturating_sub(1);
            if topic.is_idle() {
                topics.remove(&self.topic);
            }
        }
        debug!(topic = %self.topic, conn_ref = self.conn_ref, "channel closed");
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.release();
    }
}

async fn next_presence(rx: &mut broadcast::Receiver<PresenceEvent>) -> Option<Result<PresenceEvent, u64>> {
    match rx.recv().await {
        Ok(event) => Some(Ok(event)),
        Err(RecvError::Lagged(skipped)) => Some(Err(skipped)),
        Err(RecvError::Closed) => None,
    }
}

async fn next_change(changes: &mut Option<(ChangeFilter, broadcast::Receiver<RowChange>)>) -> Option<RowChange> {
    let Some((filter, rx)) = changes else {
        return std::future::pending().await;
    };

    loop {
        match rx.recv().await {
            Ok(change) if filter.matches(&change) => return Some(change),
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                warn!(table = %filter.table, skipped, "row change receiver lagged");
            }
            Err(RecvError::Closed) => return None,
        }
    }
}
