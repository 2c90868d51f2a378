use std::collections::{HashMap, HashSet};

use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use chrono::{Duration as ChronoDuration, NaiveDateTime, SubsecRound, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use super::{to_iso, usage::record_usage};
use crate::access::{dedup_ids, ensure_attachable, load_session};
use crate::auth::{AuthenticatedUser, Principal};
use crate::chat::{
    stream_chunks, suggestions_for, ChatReply, ChatRequest, ChatTurn, DocumentRef,
};
use crate::error::{AppError, AppResult};
use crate::ids::normalize_client_id;
use crate::models::{
    ChatMessage, ChatSession, Document, NewChatMessage, NewChatSession, NewSessionDocument,
    ROLE_ASSISTANT, ROLE_USER,
};
use crate::schema::{chat_messages, chat_sessions, documents, session_documents, users};
use crate::state::AppState;

pub const DEFAULT_SESSION_NAME: &str = "New Chat";
/// Width of `chat_sessions.name`.
const MAX_SESSION_NAME_CHARS: usize = 255;
const HISTORY_TURNS: i64 = 20;

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub name: Option<String>,
    #[serde(default)]
    pub document_ids: Vec<Uuid>,
}

#[derive(Deserialize)]
pub struct RenameSessionRequest {
    pub name: String,
}

#[derive(Deserialize)]
pub struct SessionDocumentsRequest {
    pub document_ids: Vec<Uuid>,
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub message: String,
    #[serde(default)]
    pub use_agent: bool,
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub session_id: Uuid,
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
    pub last_message_at: Option<String>,
    pub document_ids: Vec<Uuid>,
}

impl SessionResponse {
    fn new(session: ChatSession, document_ids: Vec<Uuid>) -> Self {
        Self {
            session_id: session.id,
            name: session.name,
            created_at: to_iso(session.created_at),
            updated_at: to_iso(session.updated_at),
            last_message_at: session.last_message_at.map(to_iso),
            document_ids,
        }
    }
}

#[derive(Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionResponse>,
}

#[derive(Serialize)]
pub struct DeleteSessionResponse {
    pub session_id: Uuid,
    pub status: &'static str,
    pub message: String,
}

#[derive(Serialize)]
pub struct SessionDocumentIdsResponse {
    pub session_id: Uuid,
    pub document_ids: Vec<Uuid>,
}

#[derive(Serialize)]
pub struct AddDocumentsResponse {
    pub session_id: Uuid,
    pub document_ids: Vec<Uuid>,
    pub added_document_ids: Vec<Uuid>,
    pub updated_at: String,
}

#[derive(Serialize)]
pub struct RemoveDocumentResponse {
    pub session_id: Uuid,
    pub document_ids: Vec<Uuid>,
    pub removed_document_id: Uuid,
    pub updated_at: String,
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub id: Uuid,
    pub role: String,
    pub content: String,
    pub timestamp: String,
    pub metadata: Value,
}

impl From<ChatMessage> for MessageResponse {
    fn from(message: ChatMessage) -> Self {
        Self {
            id: message.id,
            role: message.role,
            content: message.content,
            timestamp: to_iso(message.created_at),
            metadata: message.metadata,
        }
    }
}

#[derive(Serialize)]
pub struct MessageListResponse {
    pub messages: Vec<MessageResponse>,
}

#[derive(Serialize, Clone)]
pub struct SourceResponse {
    pub document_id: Uuid,
    pub file_name: String,
    pub file_type: String,
}

#[derive(Serialize)]
pub struct ChatResponse {
    pub message_id: Uuid,
    pub session_id: Uuid,
    pub response: String,
    pub sources: Vec<SourceResponse>,
    pub chart_data: Option<Value>,
    pub timestamp: String,
}

#[derive(Serialize)]
pub struct SuggestionsResponse {
    pub suggestions: Vec<String>,
}

/// Resolves a session id from the path, accepting legacy non-UUID identifiers.
fn check_session_name(name: &str) -> AppResult<()> {
    if name.chars().count() > MAX_SESSION_NAME_CHARS {
        return Err(AppError::bad_request(format!(
            "name must be at most {MAX_SESSION_NAME_CHARS} characters"
        )));
    }
    Ok(())
}

pub(crate) fn parse_session_id(raw: &str) -> AppResult<Uuid> {
    normalize_client_id(raw).ok_or_else(|| AppError::bad_request("session id is required"))
}

pub(crate) fn attached_document_ids(
    conn: &mut PgConnection,
    session_id: Uuid,
) -> QueryResult<Vec<Uuid>> {
    session_documents::table
        .filter(session_documents::session_id.eq(session_id))
        .order((
            session_documents::added_at.asc(),
            session_documents::document_id.asc(),
        ))
        .select(session_documents::document_id)
        .load(conn)
}

/// Links `document_ids` to the session and returns the ids that were newly added.
///
/// Callers must run [`ensure_attachable`] first.
pub(crate) fn attach_documents(
    conn: &mut PgConnection,
    session_id: Uuid,
    document_ids: &[Uuid],
) -> QueryResult<Vec<Uuid>> {
    let existing: HashSet<Uuid> = attached_document_ids(conn, session_id)?
        .into_iter()
        .collect();
    let added: Vec<Uuid> = dedup_ids(document_ids)
        .into_iter()
        .filter(|id| !existing.contains(id))
        .collect();
    if added.is_empty() {
        return Ok(added);
    }

    // Spread insert times so listing order follows request order.
    let base = Utc::now().naive_utc().trunc_subsecs(6);
    let rows: Vec<NewSessionDocument> = added
        .iter()
        .enumerate()
        .map(|(offset, document_id)| NewSessionDocument {
            session_id,
            document_id: *document_id,
            added_at: base + ChronoDuration::microseconds(offset as i64),
        })
        .collect();

    diesel::insert_into(session_documents::table)
        .values(&rows)
        .on_conflict_do_nothing()
        .execute(conn)?;
    touch_session(conn, session_id, base)?;
    Ok(added)
}

pub(crate) fn create_session_row(
    conn: &mut PgConnection,
    id: Uuid,
    owner_id: Uuid,
    name: &str,
) -> QueryResult<ChatSession> {
    diesel::insert_into(chat_sessions::table)
        .values(&NewChatSession {
            id,
            user_id: owner_id,
            name: name.to_string(),
        })
        .get_result(conn)
}

fn touch_session(conn: &mut PgConnection, session_id: Uuid, at: NaiveDateTime) -> QueryResult<()> {
    diesel::update(chat_sessions::table.find(session_id))
        .set(chat_sessions::updated_at.eq(at))
        .execute(conn)?;
    Ok(())
}

fn attached_documents(conn: &mut PgConnection, session_id: Uuid) -> QueryResult<Vec<Document>> {
    session_documents::table
        .inner_join(documents::table)
        .filter(session_documents::session_id.eq(session_id))
        .order((
            session_documents::added_at.asc(),
            session_documents::document_id.asc(),
        ))
        .select(documents::all_columns)
        .load(conn)
}

fn document_refs(documents: &[Document]) -> Vec<DocumentRef> {
    documents
        .iter()
        .map(|doc| DocumentRef {
            id: doc.id,
            file_name: doc.file_name.clone(),
            file_type: doc.file_type.clone(),
            preview: doc
                .metadata
                .get("preview_text")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
        .collect()
}

pub(crate) struct Exchange {
    pub assistant: ChatMessage,
    pub reply: ChatReply,
    pub sources: Vec<SourceResponse>,
}

/// Runs one user turn against the chat engine and stores both messages.
pub(crate) async fn converse(
    state: &AppState,
    session: &ChatSession,
    message: &str,
    use_agent: bool,
) -> AppResult<Exchange> {
    let received_at = Utc::now().naive_utc().trunc_subsecs(6);

    let (plan, history, documents) = {
        let mut conn = state.db()?;
        let plan: String = users::table
            .find(session.user_id)
            .select(users::subscription_tier)
            .first(&mut conn)?;
        let mut recent: Vec<ChatMessage> = chat_messages::table
            .filter(chat_messages::session_id.eq(session.id))
            .order((chat_messages::created_at.desc(), chat_messages::id.desc()))
            .limit(HISTORY_TURNS)
            .load(&mut conn)?;
        recent.reverse();
        let history = recent
            .into_iter()
            .map(|m| ChatTurn {
                role: m.role,
                content: m.content,
            })
            .collect::<Vec<_>>();
        (plan, history, attached_documents(&mut conn, session.id)?)
    };

    let sources: Vec<SourceResponse> = documents
        .iter()
        .map(|doc| SourceResponse {
            document_id: doc.id,
            file_name: doc.file_name.clone(),
            file_type: doc.file_type.clone(),
        })
        .collect();

    debug!(session_id = %session.id, %plan, use_agent, "requesting chat reply");
    let reply = state
        .chat
        .reply(ChatRequest {
            message: message.to_string(),
            history,
            documents: document_refs(&documents),
            plan,
            use_agent,
        })
        .await?;

    let replied_at = Utc::now()
        .naive_utc()
        .trunc_subsecs(6)
        .max(received_at + ChronoDuration::microseconds(1));

    let assistant = {
        let mut conn = state.db()?;
        conn.transaction(|conn| {
            diesel::insert_into(chat_messages::table)
                .values(&NewChatMessage {
                    id: Uuid::new_v4(),
                    session_id: session.id,
                    role: ROLE_USER.to_string(),
                    content: message.to_string(),
                    metadata: json!({ "use_agent": use_agent }),
                    created_at: received_at,
                })
                .execute(conn)?;

            let assistant: ChatMessage = diesel::insert_into(chat_messages::table)
                .values(&NewChatMessage {
                    id: Uuid::new_v4(),
                    session_id: session.id,
                    role: ROLE_ASSISTANT.to_string(),
                    content: reply.content.clone(),
                    metadata: json!({
                        "model": reply.model,
                        "tokens_used": reply.tokens_used,
                        "chart_data": reply.chart_data,
                        "sources": sources,
                    }),
                    created_at: replied_at,
                })
                .get_result(conn)?;

            diesel::update(chat_sessions::table.find(session.id))
                .set((
                    chat_sessions::last_message_at.eq(Some(replied_at)),
                    chat_sessions::updated_at.eq(replied_at),
                ))
                .execute(conn)?;

            record_usage(conn, session.user_id, &reply.model, reply.tokens_used, replied_at)?;
            Ok::<ChatMessage, diesel::result::Error>(assistant)
        })?
    };

    stream_reply(state, session.id, &assistant, &reply);

    Ok(Exchange {
        assistant,
        reply,
        sources,
    })
}

fn stream_reply(state: &AppState, session_id: Uuid, assistant: &ChatMessage, reply: &ChatReply) {
    let chunks = stream_chunks(&reply.content);
    let last = chunks.len().saturating_sub(1);
    for (index, chunk) in chunks.into_iter().enumerate() {
        let metadata = (index == last).then(|| {
            json!({
                "message_id": assistant.id,
                "chart_data": reply.chart_data,
            })
        });
        state
            .events
            .emit_chat_chunk(session_id, chunk, index == last, metadata);
    }
}

pub async fn create_session(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateSessionRequest>,
) -> AppResult<(StatusCode, Json<SessionResponse>)> {
    let name = payload
        .name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_SESSION_NAME.to_string());
    check_session_name(&name)?;
    let document_ids = dedup_ids(&payload.document_ids);
    let principal = Principal::User(user.clone());

    let mut conn = state.db()?;
    let (session, attached) = conn.transaction(|conn| {
        let session = create_session_row(conn, Uuid::new_v4(), user.user_id, &name)?;
        ensure_attachable(conn, &principal, &session, &document_ids)?;
        attach_documents(conn, session.id, &document_ids)?;
        let attached = attached_document_ids(conn, session.id)?;
        let session: ChatSession = chat_sessions::table.find(session.id).first(conn)?;
        Ok::<_, AppError>((session, attached))
    })?;

    info!(session_id = %session.id, documents = attached.len(), "chat session created");
    Ok((
        StatusCode::CREATED,
        Json(SessionResponse::new(session, attached)),
    ))
}

pub async fn list_sessions(
    State(state): State<AppState>,
    principal: Principal,
) -> AppResult<Json<SessionListResponse>> {
    let mut conn = state.db()?;
    let mut query = chat_sessions::table.into_boxed();
    if let Some(user_id) = principal.user_id() {
        query = query.filter(chat_sessions::user_id.eq(user_id));
    }
    let mut sessions: Vec<ChatSession> = query.load(&mut conn)?;
    sessions.sort_by(|a, b| {
        let a_at = a.last_message_at.unwrap_or(a.updated_at);
        let b_at = b.last_message_at.unwrap_or(b.updated_at);
        b_at.cmp(&a_at).then_with(|| b.created_at.cmp(&a.created_at))
    });

    let session_ids: Vec<Uuid> = sessions.iter().map(|s| s.id).collect();
    let links: Vec<(Uuid, Uuid)> = session_documents::table
        .filter(session_documents::session_id.eq_any(&session_ids))
        .order((
            session_documents::added_at.asc(),
            session_documents::document_id.asc(),
        ))
        .select((session_documents::session_id, session_documents::document_id))
        .load(&mut conn)?;
    let mut by_session: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (session_id, document_id) in links {
        by_session.entry(session_id).or_default().push(document_id);
    }

    let sessions = sessions
        .into_iter()
        .map(|session| {
            let ids = by_session.remove(&session.id).unwrap_or_default();
            SessionResponse::new(session, ids)
        })
        .collect();
    Ok(Json(SessionListResponse { sessions }))
}

pub async fn get_session(
    State(state): State<AppState>,
    principal: Principal,
    Path(raw_id): Path<String>,
) -> AppResult<Json<SessionResponse>> {
    let session_id = parse_session_id(&raw_id)?;
    let mut conn = state.db()?;
    let session = load_session(&mut conn, &principal, session_id)?;
    let ids = attached_document_ids(&mut conn, session.id)?;
    Ok(Json(SessionResponse::new(session, ids)))
}

pub async fn rename_session(
    State(state): State<AppState>,
    principal: Principal,
    Path(raw_id): Path<String>,
    Json(payload): Json<RenameSessionRequest>,
) -> AppResult<Json<SessionResponse>> {
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(AppError::bad_request("name must not be empty"));
    }
    check_session_name(name)?;
    let session_id = parse_session_id(&raw_id)?;
    let mut conn = state.db()?;
    load_session(&mut conn, &principal, session_id)?;

    let session: ChatSession = diesel::update(chat_sessions::table.find(session_id))
        .set((
            chat_sessions::name.eq(name),
            chat_sessions::updated_at.eq(Utc::now().naive_utc()),
        ))
        .get_result(&mut conn)?;
    let ids = attached_document_ids(&mut conn, session.id)?;
    Ok(Json(SessionResponse::new(session, ids)))
}

pub async fn delete_session(
    State(state): State<AppState>,
    principal: Principal,
    Path(raw_id): Path<String>,
) -> AppResult<Json<DeleteSessionResponse>> {
    let session_id = parse_session_id(&raw_id)?;
    let mut conn = state.db()?;
    let session = load_session(&mut conn, &principal, session_id)?;
    diesel::delete(chat_sessions::table.find(session.id)).execute(&mut conn)?;

    info!(session_id = %session.id, "chat session deleted");
    Ok(Json(DeleteSessionResponse {
        session_id: session.id,
        status: "deleted",
        message: format!("chat session '{}' was deleted", session.name),
    }))
}

pub async fn get_session_documents(
    State(state): State<AppState>,
    principal: Principal,
    Path(raw_id): Path<String>,
) -> AppResult<Json<SessionDocumentIdsResponse>> {
    let session_id = parse_session_id(&raw_id)?;
    let mut conn = state.db()?;
    let session = load_session(&mut conn, &principal, session_id)?;
    Ok(Json(SessionDocumentIdsResponse {
        session_id: session.id,
        document_ids: attached_document_ids(&mut conn, session.id)?,
    }))
}

pub async fn add_session_documents(
    State(state): State<AppState>,
    principal: Principal,
    Path(raw_id): Path<String>,
    Json(payload): Json<SessionDocumentsRequest>,
) -> AppResult<Json<AddDocumentsResponse>> {
    let session_id = parse_session_id(&raw_id)?;
    let requested = dedup_ids(&payload.document_ids);

    let mut conn = state.db()?;
    let (added, session, document_ids) = conn.transaction(|conn| {
        let session = load_session(conn, &principal, session_id)?;
        ensure_attachable(conn, &principal, &session, &requested)?;
        let added = attach_documents(conn, session.id, &requested)?;
        let session: ChatSession = chat_sessions::table.find(session.id).first(conn)?;
        let document_ids = attached_document_ids(conn, session.id)?;
        Ok::<_, AppError>((added, session, document_ids))
    })?;

    info!(session_id = %session.id, added = added.len(), "documents attached to session");
    Ok(Json(AddDocumentsResponse {
        session_id: session.id,
        document_ids,
        added_document_ids: added,
        updated_at: to_iso(session.updated_at),
    }))
}

pub async fn remove_session_document(
    State(state): State<AppState>,
    principal: Principal,
    Path((raw_id, document_id)): Path<(String, Uuid)>,
) -> AppResult<Json<RemoveDocumentResponse>> {
    let session_id = parse_session_id(&raw_id)?;
    let mut conn = state.db()?;
    let session = load_session(&mut conn, &principal, session_id)?;

    let removed = diesel::delete(
        session_documents::table
            .filter(session_documents::session_id.eq(session.id))
            .filter(session_documents::document_id.eq(document_id)),
    )
    .execute(&mut conn)?;
    if removed == 0 {
        return Err(AppError::new(
            StatusCode::NOT_FOUND,
            format!("document {document_id} is not attached to this session"),
        ));
    }

    let now = Utc::now().naive_utc();
    touch_session(&mut conn, session.id, now)?;
    Ok(Json(RemoveDocumentResponse {
        session_id: session.id,
        document_ids: attached_document_ids(&mut conn, session.id)?,
        removed_document_id: document_id,
        updated_at: to_iso(now),
    }))
}

pub async fn list_messages(
    State(state): State<AppState>,
    principal: Principal,
    Path(raw_id): Path<String>,
) -> AppResult<Json<MessageListResponse>> {
    let session_id = parse_session_id(&raw_id)?;
    let mut conn = state.db()?;
    let session = load_session(&mut conn, &principal, session_id)?;
    let messages: Vec<ChatMessage> = chat_messages::table
        .filter(chat_messages::session_id.eq(session.id))
        .order((chat_messages::created_at.asc(), chat_messages::id.asc()))
        .load(&mut conn)?;

    Ok(Json(MessageListResponse {
        messages: messages.into_iter().map(Into::into).collect(),
    }))
}

pub async fn send_message(
    State(state): State<AppState>,
    principal: Principal,
    Path(raw_id): Path<String>,
    Json(payload): Json<SendMessageRequest>,
) -> AppResult<Json<ChatResponse>> {
    let message = payload.message.trim();
    if message.is_empty() {
        return Err(AppError::bad_request("message must not be empty"));
    }
    let session_id = parse_session_id(&raw_id)?;
    let session = {
        let mut conn = state.db()?;
        load_session(&mut conn, &principal, session_id)?
    };

    let exchange = converse(&state, &session, message, payload.use_agent).await?;
    Ok(Json(ChatResponse {
        message_id: exchange.assistant.id,
        session_id: session.id,
        response: exchange.assistant.content,
        sources: exchange.sources,
        chart_data: exchange.reply.chart_data,
        timestamp: to_iso(exchange.assistant.created_at),
    }))
}

pub async fn get_suggestions(
    State(state): State<AppState>,
    principal: Principal,
    Path(raw_id): Path<String>,
) -> AppResult<Json<SuggestionsResponse>> {
    let session_id = parse_session_id(&raw_id)?;
    let mut conn = state.db()?;
    let session = load_session(&mut conn, &principal, session_id)?;
    let documents = attached_documents(&mut conn, session.id)?;
    Ok(Json(SuggestionsResponse {
        suggestions: suggestions_for(&document_refs(&documents)),
    }))
}
