use axum::{
    extract::{
        ws::{Message, WebSocket},
        Json, Path, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::access::{authorize, load_document, load_session};
use crate::auth::{resolve_principal, AuthenticatedUser, Principal};
use crate::error::{AppError, AppResult};
use crate::events::{ClientEvent, Room, ServerEvent, CONNECTION_BUFFER};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ConnectQuery {
    pub token: Option<String>,
}

#[derive(Deserialize)]
pub struct FileStatusEmit {
    pub user_id: Uuid,
    pub file_id: Uuid,
    pub status: String,
    pub progress: Option<u8>,
    pub metadata: Option<Value>,
}

#[derive(Deserialize)]
pub struct ProcessingProgressEmit {
    pub user_id: Uuid,
    pub file_id: Uuid,
    pub stage: String,
    pub progress: u8,
    #[serde(default)]
    pub message: String,
}

#[derive(Deserialize)]
pub struct ChatResponseEmit {
    pub chat_session_id: Uuid,
    pub chunk: String,
    #[serde(default)]
    pub is_final: bool,
    pub metadata: Option<Value>,
}

#[derive(Deserialize)]
pub struct ErrorEmit {
    pub user_id: Uuid,
    pub error_type: String,
    pub message: String,
    pub file_id: Option<Uuid>,
    pub chat_session_id: Option<Uuid>,
}

#[derive(Serialize)]
pub struct EmitResponse {
    pub status: &'static str,
    pub recipients: usize,
}

#[derive(Serialize)]
pub struct HubStatusResponse {
    pub connected_users: usize,
    pub connections: usize,
}

#[derive(Serialize)]
pub struct UserStatusResponse {
    pub user_id: Uuid,
    pub connected: bool,
}

pub async fn connect(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
) -> AppResult<Response> {
    let token = query
        .token
        .filter(|token| !token.is_empty())
        .ok_or_else(AppError::unauthorized)?;
    let user = match resolve_principal(&state, &token)? {
        Principal::User(user) => user,
        Principal::Service => return Err(AppError::forbidden()),
    };

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user)))
}

async fn handle_socket(socket: WebSocket, state: AppState, user: AuthenticatedUser) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(CONNECTION_BUFFER);
    let connection_id = state.events.register(user.user_id, tx);
    info!(%connection_id, user_id = %user.user_id, "websocket client connected");

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "failed to encode websocket event");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    state.events.send_to(
        connection_id,
        ServerEvent::Connected {
            connection_id,
            user_id: user.user_id,
        },
    );

    let principal = Principal::User(user);
    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => handle_client_event(&state, &principal, connection_id, event),
                Err(err) => {
                    debug!(%connection_id, error = %err, "unrecognized websocket message");
                    state.events.send_to(
                        connection_id,
                        ServerEvent::error("invalid_message", err.to_string(), None, None),
                    );
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.events.unregister(connection_id);
    send_task.abort();
    info!(%connection_id, "websocket client disconnected");
}

fn handle_client_event(
    state: &AppState,
    principal: &Principal,
    connection_id: Uuid,
    event: ClientEvent,
) {
    let (room, joining) = match event {
        ClientEvent::Ping => {
            state.events.send_to(connection_id, ServerEvent::Pong);
            return;
        }
        ClientEvent::JoinFileRoom { file_id } => (Room::File(file_id), true),
        ClientEvent::LeaveFileRoom { file_id } => (Room::File(file_id), false),
        ClientEvent::JoinChatRoom { chat_session_id } => {
            (Room::Chat(chat_session_id.into_uuid()), true)
        }
        ClientEvent::LeaveChatRoom { chat_session_id } => {
            (Room::Chat(chat_session_id.into_uuid()), false)
        }
    };

    if !joining {
        state.events.leave(connection_id, room);
        state.events.send_to(
            connection_id,
            ServerEvent::RoomLeft {
                room: room.to_string(),
            },
        );
        return;
    }

    match check_room_access(state, principal, room) {
        Ok(()) => {
            state.events.join(connection_id, room);
            state.events.send_to(
                connection_id,
                ServerEvent::RoomJoined {
                    room: room.to_string(),
                },
            );
        }
        Err(err) => {
            warn!(%connection_id, %room, error = %err.message(), "room join refused");
            let (file_id, chat_session_id) = match room {
                Room::File(id) => (Some(id), None),
                Room::Chat(id) => (None, Some(id)),
                Room::User(_) => (None, None),
            };
            state.events.send_to(
                connection_id,
                ServerEvent::error("join_denied", err.message(), file_id, chat_session_id),
            );
        }
    }
}

/// Room membership follows the same row policy as the REST routes.
fn check_room_access(state: &AppState, principal: &Principal, room: Room) -> AppResult<()> {
    let mut conn = state.db()?;
    match room {
        Room::File(file_id) => load_document(&mut conn, principal, file_id).map(|_| ()),
        Room::Chat(session_id) => load_session(&mut conn, principal, session_id).map(|_| ()),
        Room::User(user_id) => authorize(principal, user_id),
    }
}

pub async fn emit_file_status(
    State(state): State<AppState>,
    principal: Principal,
    Json(payload): Json<FileStatusEmit>,
) -> AppResult<Json<EmitResponse>> {
    principal.require_service()?;
    let recipients = state.events.emit_file_status(
        payload.user_id,
        payload.file_id,
        &payload.status,
        payload.progress,
        payload.metadata,
    );
    Ok(Json(EmitResponse {
        status: "sent",
        recipients,
    }))
}

pub async fn emit_processing_progress(
    State(state): State<AppState>,
    principal: Principal,
    Json(payload): Json<ProcessingProgressEmit>,
) -> AppResult<Json<EmitResponse>> {
    principal.require_service()?;
    let recipients = state.events.emit_processing_progress(
        payload.user_id,
        payload.file_id,
        &payload.stage,
        payload.progress,
        &payload.message,
    );
    Ok(Json(EmitResponse {
        status: "sent",
        recipients,
    }))
}

pub async fn emit_chat_response(
    State(state): State<AppState>,
    principal: Principal,
    Json(payload): Json<ChatResponseEmit>,
) -> AppResult<Json<EmitResponse>> {
    principal.require_service()?;
    let recipients = state.events.emit_chat_chunk(
        payload.chat_session_id,
        payload.chunk,
        payload.is_final,
        payload.metadata,
    );
    Ok(Json(EmitResponse {
        status: "sent",
        recipients,
    }))
}

pub async fn emit_error(
    State(state): State<AppState>,
    principal: Principal,
    Json(payload): Json<ErrorEmit>,
) -> AppResult<Json<EmitResponse>> {
    principal.require_service()?;
    let recipients = state.events.emit_error(
        payload.user_id,
        &payload.error_type,
        &payload.message,
        payload.file_id,
        payload.chat_session_id,
    );
    Ok(Json(EmitResponse {
        status: "sent",
        recipients,
    }))
}

pub async fn hub_status(
    State(state): State<AppState>,
    _principal: Principal,
) -> Json<HubStatusResponse> {
    Json(HubStatusResponse {
        connected_users: state.events.connected_users().len(),
        connections: state.events.connection_count(),
    })
}

pub async fn user_status(
    State(state): State<AppState>,
    principal: Principal,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<UserStatusResponse>> {
    authorize(&principal, user_id)?;
    Ok(Json(UserStatusResponse {
        user_id,
        connected: state.events.is_user_connected(user_id),
    }))
}
