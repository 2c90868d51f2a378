use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ids::ClientId;

/// Capacity of each connection's outbound queue.
pub const CONNECTION_BUFFER: usize = 64;

/// How long a final chat chunk waits for room in a full queue.
const FINAL_CHUNK_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Room {
    User(Uuid),
    File(Uuid),
    Chat(Uuid),
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::User(id) => write!(f, "user:{id}"),
            Room::File(id) => write!(f, "file:{id}"),
            Room::Chat(id) => write!(f, "chat:{id}"),
        }
    }
}

/// Messages pushed from the server to WebSocket clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        connection_id: Uuid,
        user_id: Uuid,
    },
    RoomJoined {
        room: String,
    },
    RoomLeft {
        room: String,
    },
    Pong,
    FileStatusUpdate {
        file_id: Uuid,
        status: String,
        progress: Option<u8>,
        metadata: Option<Value>,
        timestamp: String,
    },
    ProcessingProgress {
        file_id: Uuid,
        stage: String,
        progress: u8,
        message: String,
        timestamp: String,
    },
    ChatResponseChunk {
        chat_session_id: Uuid,
        chunk: String,
        is_final: bool,
        metadata: Option<Value>,
        timestamp: String,
    },
    Error {
        error_type: String,
        message: String,
        file_id: Option<Uuid>,
        chat_session_id: Option<Uuid>,
        timestamp: String,
    },
}

impl ServerEvent {
    pub fn file_status(
        file_id: Uuid,
        status: &str,
        progress: Option<u8>,
        metadata: Option<Value>,
    ) -> Self {
        ServerEvent::FileStatusUpdate {
            file_id,
            status: status.to_string(),
            progress: progress.map(|p| p.min(100)),
            metadata,
            timestamp: now(),
        }
    }

    pub fn processing_progress(file_id: Uuid, stage: &str, progress: u8, message: &str) -> Self {
        ServerEvent::ProcessingProgress {
            file_id,
            stage: stage.to_string(),
            progress: progress.min(100),
            message: message.to_string(),
            timestamp: now(),
        }
    }

    pub fn chat_chunk(
        chat_session_id: Uuid,
        chunk: String,
        is_final: bool,
        metadata: Option<Value>,
    ) -> Self {
        ServerEvent::ChatResponseChunk {
            chat_session_id,
            chunk,
            is_final,
            metadata,
            timestamp: now(),
        }
    }

    pub fn error(
        error_type: &str,
        message: impl Into<String>,
        file_id: Option<Uuid>,
        chat_session_id: Option<Uuid>,
    ) -> Self {
        ServerEvent::Error {
            error_type: error_type.to_string(),
            message: message.into(),
            file_id,
            chat_session_id,
            timestamp: now(),
        }
    }
}

/// Messages received from WebSocket clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinFileRoom { file_id: Uuid },
    LeaveFileRoom { file_id: Uuid },
    JoinChatRoom { chat_session_id: ClientId },
    LeaveChatRoom { chat_session_id: ClientId },
    Ping,
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

struct Connection {
    user_id: Uuid,
    rooms: HashSet<Room>,
    sender: mpsc::Sender<ServerEvent>,
}

/// Tracks live WebSocket connections and the rooms they listen to.
#[derive(Default)]
pub struct EventHub {
    connections: DashMap<Uuid, Connection>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection; it starts out in its owner's user room.
    pub fn register(&self, user_id: Uuid, sender: mpsc::Sender<ServerEvent>) -> Uuid {
        let connection_id = Uuid::new_v4();
        let mut rooms = HashSet::new();
        rooms.insert(Room::User(user_id));
        self.connections.insert(
            connection_id,
            Connection {
                user_id,
                rooms,
                sender,
            },
        );
        debug!(%connection_id, %user_id, "websocket connection registered");
        connection_id
    }

    pub fn unregister(&self, connection_id: Uuid) {
        if let Some((_, connection)) = self.connections.remove(&connection_id) {
            debug!(%connection_id, user_id = %connection.user_id, "websocket connection removed");
        }
    }

    pub fn join(&self, connection_id: Uuid, room: Room) -> bool {
        match self.connections.get_mut(&connection_id) {
            Some(mut connection) => {
                connection.rooms.insert(room);
                true
            }
            None => false,
        }
    }

    pub fn leave(&self, connection_id: Uuid, room: Room) -> bool {
        match self.connections.get_mut(&connection_id) {
            Some(mut connection) => connection.rooms.remove(&room),
            None => false,
        }
    }

    pub fn send_to(&self, connection_id: Uuid, event: ServerEvent) -> bool {
        match self.connections.get(&connection_id) {
            Some(connection) => deliver(connection_id, &connection, event, false),
            None => false,
        }
    }

    /// Sends `event` once to every connection that joined at least one of `rooms`.
    pub fn emit(&self, rooms: &[Room], event: ServerEvent) -> usize {
        self.fan_out(rooms, event, false)
    }

    fn fan_out(&self, rooms: &[Room], event: ServerEvent, must_arrive: bool) -> usize {
        let mut delivered = 0;
        for entry in self.connections.iter() {
            if rooms.iter().any(|room| entry.rooms.contains(room))
                && deliver(*entry.key(), entry.value(), event.clone(), must_arrive)
            {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn emit_file_status(
        &self,
        owner_id: Uuid,
        file_id: Uuid,
        status: &str,
        progress: Option<u8>,
        metadata: Option<Value>,
    ) -> usize {
        self.emit(
            &[Room::User(owner_id), Room::File(file_id)],
            ServerEvent::file_status(file_id, status, progress, metadata),
        )
    }

    pub fn emit_processing_progress(
        &self,
        owner_id: Uuid,
        file_id: Uuid,
        stage: &str,
        progress: u8,
        message: &str,
    ) -> usize {
        self.emit(
            &[Room::User(owner_id), Room::File(file_id)],
            ServerEvent::processing_progress(file_id, stage, progress, message),
        )
    }

    pub fn emit_chat_chunk(
        &self,
        session_id: Uuid,
        chunk: String,
        is_final: bool,
        metadata: Option<Value>,
    ) -> usize {
        // The final chunk closes the reply on the client, so it is never dropped.
        self.fan_out(
            &[Room::Chat(session_id)],
            ServerEvent::chat_chunk(session_id, chunk, is_final, metadata),
            is_final,
        )
    }

    pub fn emit_error(
        &self,
        owner_id: Uuid,
        error_type: &str,
        message: &str,
        file_id: Option<Uuid>,
        chat_session_id: Option<Uuid>,
    ) -> usize {
        let mut rooms = vec![Room::User(owner_id)];
        rooms.extend(file_id.map(Room::File));
        rooms.extend(chat_session_id.map(Room::Chat));
        self.emit(
            &rooms,
            ServerEvent::error(error_type, message, file_id, chat_session_id),
        )
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connected_users(&self) -> Vec<Uuid> {
        let mut users: Vec<Uuid> = self
            .connections
            .iter()
            .map(|entry| entry.user_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        users.sort();
        users
    }

    pub fn is_user_connected(&self, user_id: Uuid) -> bool {
        self.connections
            .iter()
            .any(|entry| entry.user_id == user_id)
    }
}

fn deliver(
    connection_id: Uuid,
    connection: &Connection,
    event: ServerEvent,
    must_arrive: bool,
) -> bool {
    match connection.sender.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(event)) if must_arrive => {
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                warn!(%connection_id, "no runtime to queue event for slow websocket client");
                return false;
            };
            let sender = connection.sender.clone();
            runtime.spawn(async move {
                match tokio::time::timeout(FINAL_CHUNK_WAIT, sender.send(event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => debug!(%connection_id, "websocket closed before event was queued"),
                    Err(_) => warn!(%connection_id, "gave up waiting on slow websocket client"),
                }
            });
            true
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(%connection_id, "dropping event for slow websocket client");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}
