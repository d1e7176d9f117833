//! The browser's single realtime socket.
//!
//! Each joined topic gets a task that owns its [`Channel`]. Presence events
//! go straight to the outgoing queue; message inserts come back to the
//! connection, which runs them through the open [`ThreadView`]. Closing the
//! socket aborts every task, which releases the channels and retracts any
//! tracked presence.
//!
//! A connection shows at most one thread. Opening one subscribes to its
//! inserts first and loads the history in the background, so nothing sent in
//! between is lost; a load that finishes after the viewer opened something
//! else is dropped.

use std::{collections::HashMap, mem, time::Duration};

use axum::{
    debug_handler,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};
use tower_sessions::Session;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{
    AppError, AppResult, AppState,
    config::Config,
    platform::{
        Channel, ChannelEvent, ChangeFilter, Database, Message, PlatformError, PresenceEvent, PresenceState, Profile,
        Realtime,
    },
    session,
};

use super::{
    Navigation, Ticket, directory, msg,
    presence::{self, PresenceTracker},
    search::{Keystroke, SearchBox},
    thread::{self, ThreadMessage, ThreadView},
};

const OUTGOING_CAPACITY: usize = 64;
const COMMAND_CAPACITY: usize = 8;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Join { topic: String },
    Leave { topic: String },
    Track { topic: String },
    Untrack { topic: String },
    Heartbeat,
    Search { query: String },
    Open { conversation_id: Uuid },
    Close,
    Send { conversation_id: Uuid, content: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
    Subscribed {
        topic: String,
    },
    Insert {
        topic: String,
        record: Value,
        html: Option<String>,
        scroll_to: Option<Uuid>,
    },
    Thread {
        conversation_id: Uuid,
        messages: Vec<ShownMessage>,
        scroll_to: Option<Uuid>,
    },
    Sent {
        conversation_id: Uuid,
        message_id: Uuid,
    },
    PresenceSync {
        topic: String,
        state: PresenceState,
    },
    PresenceJoin {
        topic: String,
        key: String,
        presences: Vec<Value>,
    },
    PresenceLeave {
        topic: String,
        key: String,
        presences: Vec<Value>,
    },
    SearchResults {
        query: String,
        results: Vec<Profile>,
    },
    Error {
        topic: Option<String>,
        message: String,
    },
}

#[derive(Debug, Serialize)]
struct ShownMessage {
    id: Uuid,
    created_at: i64,
    html: String,
}

impl From<&ThreadMessage> for ShownMessage {
    fn from(message: &ThreadMessage) -> Self {
        Self {
            id: message.message.id,
            created_at: message.message.created_at,
            html: msg::message_html(message),
        }
    }
}

impl ServerFrame {
    fn error(topic: Option<&str>, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            topic: topic.map(str::to_owned),
            message: message.into(),
        }
    }
}

#[debug_handler(state = AppState)]
pub(crate) async fn realtime_ws(
    State(db): State<Database>,
    State(realtime): State<Realtime>,
    State(config): State<std::sync::Arc<Config>>,
    session: Session,

    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let me = session::user_id(&session).await?.ok_or(AppError::Unauthorized)?;
    let profile = db.profile(me).await?.ok_or(AppError::Unauthorized)?;

    Ok(ws
        .on_upgrade(async move |socket| {
            let (connection, inboxes) = Connection::new(db, realtime, profile, config.search_debounce);
            connection.run(socket, inboxes).await;
        })
        .into_response())
}

enum Command {
    Track,
    Untrack,
    Heartbeat,
}

struct Joined {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone)]
struct Insert {
    topic: String,
    record: Value,
}

struct Loaded {
    ticket: Ticket,
    result: Result<ThreadView, PlatformError>,
}

/// What topic tasks and background loads hand back to the connection.
struct Inboxes {
    inserts: mpsc::Receiver<Insert>,
    loads: mpsc::Receiver<Loaded>,
}

enum Thread {
    Closed,
    Loading { conversation_id: Uuid, buffered: Vec<Message> },
    Open(ThreadView),
}

impl Thread {
    fn conversation_id(&self) -> Option<Uuid> {
        match self {
            Thread::Closed => None,
            Thread::Loading { conversation_id, .. } => Some(*conversation_id),
            Thread::Open(view) => Some(view.conversation().id),
        }
    }
}

struct Connection {
    db: Database,
    realtime: Realtime,
    me: Profile,
    search: SearchBox,
    topics: HashMap<String, Joined>,
    navigation: Navigation,
    thread: Thread,
    inserts: mpsc::Sender<Insert>,
    loads: mpsc::Sender<Loaded>,
}

impl Connection {
    fn new(db: Database, realtime: Realtime, me: Profile, search_debounce: Duration) -> (Self, Inboxes) {
        let (inserts, insert_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let (loads, load_rx) = mpsc::channel(COMMAND_CAPACITY);
        let connection = Self {
            db,
            realtime,
            me,
            search: SearchBox::new(search_debounce),
            topics: HashMap::new(),
            navigation: Navigation::default(),
            thread: Thread::Closed,
            inserts,
            loads,
        };
        (
            connection,
            Inboxes {
                inserts: insert_rx,
                loads: load_rx,
            },
        )
    }

    async fn run(mut self, socket: WebSocket, mut inboxes: Inboxes) {
        let (mut sender, mut receiver) = socket.split();
        let (out, mut outgoing) = mpsc::channel::<ServerFrame>(OUTGOING_CAPACITY);

        let mut writer = tokio::spawn(async move {
            while let Some(frame) = outgoing.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("encoding frame failed: {e}");
                        continue;
                    }
                };
                if sender.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });
        debug!(user = %self.me.id, "realtime socket open");

        loop {
            tokio::select! {
                incoming = receiver.next() => {
                    let Some(Ok(incoming)) = incoming else {
                        break;
                    };
                    match incoming {
                        WsMessage::Text(text) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                            Ok(frame) => self.handle(frame, &out).await,
                            Err(e) => {
                                let _ = out.send(ServerFrame::error(None, format!("bad frame: {e}"))).await;
                            }
                        },
                        WsMessage::Close(_) => break,
                        _ => {}
                    }
                }
                query = self.search.settled() => {
                    let frame = match directory::search_users(&self.db, self.me.id, &query).await {
                        Ok(results) => ServerFrame::SearchResults { query, results },
                        Err(e) => {
                            error!("search failed: {e}");
                            ServerFrame::error(None, "search failed")
                        }
                    };
                    let _ = out.send(frame).await;
                }
                Some(insert) = inboxes.inserts.recv() => {
                    if let Some(frame) = self.on_insert(insert) {
                        let _ = out.send(frame).await;
                    }
                }
                Some(loaded) = inboxes.loads.recv() => {
                    if let Some(frame) = self.finish_load(loaded) {
                        let _ = out.send(frame).await;
                    }
                }
                _ = &mut writer => break,
            }
        }

        for (_, joined) in self.topics.drain() {
            joined.task.abort();
        }
        writer.abort();
        debug!(user = %self.me.id, "realtime socket closed");
    }

    async fn handle(&mut self, frame: ClientFrame, out: &mpsc::Sender<ServerFrame>) {
        let reply = match frame {
            ClientFrame::Join { topic } => self.join(topic, out).await,
            ClientFrame::Leave { topic } => {
                if let Some(joined) = self.topics.remove(&topic) {
                    // the task exits once its command queue is closed
                    drop(joined.commands);
                }
                None
            }
            ClientFrame::Track { topic } => {
                if topic != presence::topic(self.me.id) {
                    Some(ServerFrame::error(Some(&topic), "you can only track your own presence"))
                } else {
                    self.command(&topic, Command::Track).await
                }
            }
            ClientFrame::Untrack { topic } => self.command(&topic, Command::Untrack).await,
            ClientFrame::Heartbeat => {
                for joined in self.topics.values() {
                    let _ = joined.commands.send(Command::Heartbeat).await;
                }
                None
            }
            ClientFrame::Search { query } => match self.search.input(&query) {
                Keystroke::Cleared => Some(ServerFrame::SearchResults {
                    query,
                    results: Vec::new(),
                }),
                Keystroke::Scheduled => None,
            },
            ClientFrame::Open { conversation_id } => self.open_thread(conversation_id, out).await,
            ClientFrame::Close => {
                self.navigation.navigate();
                self.release_thread();
                None
            }
            ClientFrame::Send { conversation_id, content } => self.send(conversation_id, content).await,
        };

        if let Some(reply) = reply {
            let _ = out.send(reply).await;
        }
    }

    async fn open_thread(&mut self, conversation_id: Uuid, out: &mpsc::Sender<ServerFrame>) -> Option<ServerFrame> {
        let ticket = self.navigation.navigate();
        if self.thread.conversation_id() != Some(conversation_id) {
            self.release_thread();
        }

        let reply = self.join(thread::topic(conversation_id), out).await;
        if matches!(reply, Some(ServerFrame::Error { .. })) {
            self.thread = Thread::Closed;
            return reply;
        }

        self.thread = Thread::Loading {
            conversation_id,
            buffered: Vec::new(),
        };
        let (db, me, loads) = (self.db.clone(), self.me.id, self.loads.clone());
        tokio::spawn(async move {
            let result = ThreadView::load(&db, me, conversation_id).await;
            let _ = loads.send(Loaded { ticket, result }).await;
        });
        reply
    }

    fn release_thread(&mut self) {
        if let Some(id) = self.thread.conversation_id() {
            if let Some(joined) = self.topics.remove(&thread::topic(id)) {
                drop(joined.commands);
            }
        }
        self.thread = Thread::Closed;
    }

    fn finish_load(&mut self, Loaded { ticket, result }: Loaded) -> Option<ServerFrame> {
        if !self.navigation.is_current(ticket) {
            debug!(user = %self.me.id, "dropping a thread load the viewer navigated away from");
            return None;
        }
        if !matches!(self.thread, Thread::Loading { .. }) {
            return None;
        }
        let Thread::Loading { conversation_id, buffered } = mem::replace(&mut self.thread, Thread::Closed) else {
            return None;
        };

        let topic = thread::topic(conversation_id);
        let mut view = match result {
            Ok(view) => view,
            Err(e) => {
                warn!(user = %self.me.id, %topic, "thread load failed: {e}");
                self.topics.remove(&topic);
                return Some(ServerFrame::error(Some(&topic), "conversation not found"));
            }
        };

        for message in buffered {
            view.apply_insert(message);
        }
        let frame = ServerFrame::Thread {
            conversation_id,
            messages: view.messages().iter().map(ShownMessage::from).collect(),
            scroll_to: view.scroll_target(),
        };
        self.thread = Thread::Open(view);
        Some(frame)
    }

    /// Inserts for the shown thread go through its view, which drops repeats.
    fn on_insert(&mut self, Insert { topic, record }: Insert) -> Option<ServerFrame> {
        let message = match serde_json::from_value::<Message>(record.clone()) {
            Ok(message) => message,
            Err(e) => {
                warn!(%topic, "undecodable message row: {e}");
                return Some(ServerFrame::Insert {
                    topic,
                    record,
                    html: None,
                    scroll_to: None,
                });
            }
        };

        match &mut self.thread {
            Thread::Open(view) if view.conversation().id == message.conversation_id => {
                let html = msg::message_html(view.apply_insert(message)?);
                let scroll_to = view.scroll_target();
                Some(ServerFrame::Insert {
                    topic,
                    record,
                    html: Some(html),
                    scroll_to,
                })
            }
            Thread::Loading { conversation_id, buffered } if *conversation_id == message.conversation_id => {
                buffered.push(message);
                None
            }
            _ => Some(ServerFrame::Insert {
                topic,
                record,
                html: None,
                scroll_to: None,
            }),
        }
    }

    /// The draft is kept on failure; `sent` tells the browser to clear it.
    async fn send(&mut self, conversation_id: Uuid, content: String) -> Option<ServerFrame> {
        let topic = thread::topic(conversation_id);
        let view = match &mut self.thread {
            Thread::Open(view) if view.conversation().id == conversation_id => view,
            _ => return Some(ServerFrame::error(Some(&topic), "open the conversation first")),
        };

        view.set_draft(content);
        Some(match view.send(&self.db).await {
            Ok(Some(message)) => ServerFrame::Sent {
                conversation_id,
                message_id: message.id,
            },
            Ok(None) => ServerFrame::error(Some(&topic), "message is empty"),
            Err(e) => {
                error!(%topic, "sending failed: {e}");
                ServerFrame::error(Some(&topic), "message not sent")
            }
        })
    }

    async fn command(&self, topic: &str, command: Command) -> Option<ServerFrame> {
        match self.topics.get(topic) {
            Some(joined) => {
                let _ = joined.commands.send(command).await;
                None
            }
            None => Some(ServerFrame::error(Some(topic), "join the topic first")),
        }
    }

    async fn join(&mut self, topic: String, out: &mpsc::Sender<ServerFrame>) -> Option<ServerFrame> {
        if self.topics.get(&topic).is_some_and(|joined| !joined.task.is_finished()) {
            return Some(ServerFrame::Subscribed { topic });
        }

        let (kind, channel) = match self.open(&topic).await {
            Ok(opened) => opened,
            Err(message) => {
                warn!(user = %self.me.id, %topic, "join refused: {message}");
                return Some(ServerFrame::error(Some(&topic), message));
            }
        };

        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let task = TopicTask {
            topic: topic.clone(),
            kind,
            channel,
            tracker: None,
            realtime: self.realtime.clone(),
            me: self.me.clone(),
            out: out.clone(),
            inserts: self.inserts.clone(),
            commands: command_rx,
        };

        // the topic's first event is its presence sync, so this lands first
        let _ = out.send(ServerFrame::Subscribed { topic: topic.clone() }).await;
        self.topics.insert(
            topic,
            Joined {
                commands,
                task: tokio::spawn(task.run()),
            },
        );
        None
    }

    /// Checks that the caller may see `topic` and subscribes to it.
    async fn open(&self, topic: &str) -> Result<(TopicKind, Channel), String> {
        if let Some(id) = topic.strip_prefix("messages:") {
            let id: Uuid = id.parse().map_err(|_| "bad conversation id".to_owned())?;
            self.db
                .conversation(id)
                .await
                .map_err(|e| e.to_string())?
                .filter(|c| c.includes(self.me.id))
                .ok_or_else(|| "conversation not found".to_owned())?;

            let channel = self
                .realtime
                .channel(topic)
                .on_insert(ChangeFilter::eq("messages", "conversation_id", id))
                .subscribe();
            return Ok((TopicKind::Messages, channel));
        }

        if let Some(id) = topic.strip_prefix("presence:") {
            let _: Uuid = id.parse().map_err(|_| "bad user id".to_owned())?;
            return Ok((TopicKind::Presence, self.realtime.channel(topic).subscribe()));
        }

        Err("unknown topic".to_owned())
    }
}

enum TopicKind {
    Messages,
    Presence,
}

struct TopicTask {
    topic: String,
    kind: TopicKind,
    channel: Channel,
    tracker: Option<PresenceTracker>,
    realtime: Realtime,
    me: Profile,
    out: mpsc::Sender<ServerFrame>,
    inserts: mpsc::Sender<Insert>,
    commands: mpsc::Receiver<Command>,
}

impl TopicTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.channel.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    if !self.deliver(event).await {
                        break;
                    }
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    if let Some(frame) = self.command(command) {
                        let _ = self.out.send(frame).await;
                    }
                }
            }
        }

        if let Some(tracker) = self.tracker.take() {
            tracker.leave();
        }
        self.channel.close();
    }

    fn command(&mut self, command: Command) -> Option<ServerFrame> {
        let result = match command {
            Command::Track if self.tracker.is_none() => {
                PresenceTracker::join(&self.realtime, &self.me).map(|tracker| self.tracker = Some(tracker))
            }
            Command::Track => Ok(()),
            Command::Untrack => {
                if let Some(tracker) = self.tracker.take() {
                    tracker.leave();
                }
                Ok(())
            }
            Command::Heartbeat => match &mut self.tracker {
                Some(tracker) => tracker.heartbeat(),
                None => Ok(()),
            },
        };

        result.err().map(|e| {
            warn!(topic = %self.topic, "presence failed: {e}");
            ServerFrame::error(Some(&self.topic), e.to_string())
        })
    }

    /// False once nobody is listening any more.
    async fn deliver(&self, event: ChannelEvent) -> bool {
        let topic = self.topic.clone();
        match (&self.kind, event) {
            (TopicKind::Messages, ChannelEvent::Insert(change)) => self
                .inserts
                .send(Insert {
                    topic,
                    record: change.record,
                })
                .await
                .is_ok(),
            (TopicKind::Presence, ChannelEvent::Presence(event)) => {
                let frame = match event {
                    PresenceEvent::Sync { state } => ServerFrame::PresenceSync { topic, state },
                    PresenceEvent::Join { key, presences } => ServerFrame::PresenceJoin { topic, key, presences },
                    PresenceEvent::Leave { key, presences } => ServerFrame::PresenceLeave { topic, key, presences },
                };
                self.out.send(frame).await.is_ok()
            }
            _ => true,
        }
    }
}
