use axum::extract::{Json, State};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use super::sessions::{attach_documents, converse, create_session_row};
use super::to_iso;
use crate::access::{authorize, dedup_ids, ensure_attachable};
use crate::auth::Principal;
use crate::error::{AppError, AppResult};
use crate::ids::ClientId;
use crate::models::{ChatSession, ROLE_ASSISTANT};
use crate::schema::chat_sessions;
use crate::state::AppState;

const SESSION_NAME_CHARS: usize = 50;

#[derive(Deserialize)]
pub struct AgentRequest {
    pub content: String,
    #[serde(default)]
    pub file_ids: Vec<Uuid>,
    pub session_id: Option<ClientId>,
}

#[derive(Serialize)]
pub struct AgentResponse {
    pub id: Uuid,
    pub role: &'static str,
    pub content: String,
    pub created_at: String,
    pub file_ids: Vec<Uuid>,
    pub session_id: Uuid,
    pub chart_data: Option<Value>,
}

fn session_name_from(content: &str) -> String {
    let line = content.lines().next().unwrap_or_default().trim();
    let mut name: String = line.chars().take(SESSION_NAME_CHARS).collect();
    if line.chars().count() > SESSION_NAME_CHARS {
        name.push_str("...");
    }
    name
}

pub async fn process(
    State(state): State<AppState>,
    principal: Principal,
    Json(payload): Json<AgentRequest>,
) -> AppResult<Json<AgentResponse>> {
    let content = payload.content.trim();
    if content.is_empty() {
        return Err(AppError::bad_request("content must not be empty"));
    }
    let file_ids = dedup_ids(&payload.file_ids);
    let session_id = payload
        .session_id
        .map(ClientId::into_uuid)
        .unwrap_or_else(Uuid::new_v4);

    let session = {
        let mut conn = state.db()?;
        conn.transaction(|conn| {
            let existing: Option<ChatSession> = chat_sessions::table
                .find(session_id)
                .first(conn)
                .optional()?;
            let session = match existing {
                Some(session) => {
                    authorize(&principal, session.user_id)?;
                    session
                }
                None => {
                    let owner = principal.require_user()?;
                    info!(%session_id, "creating chat session for agent request");
                    create_session_row(conn, session_id, owner.user_id, &session_name_from(content))?
                }
            };
            ensure_attachable(conn, &principal, &session, &file_ids)?;
            attach_documents(conn, session.id, &file_ids)?;
            Ok::<ChatSession, AppError>(session)
        })?
    };

    let exchange = converse(&state, &session, content, true).await?;
    Ok(Json(AgentResponse {
        id: exchange.assistant.id,
        role: ROLE_ASSISTANT,
        content: exchange.assistant.content,
        created_at: to_iso(exchange.assistant.created_at),
        file_ids,
        session_id: session.id,
        chart_data: exchange.reply.chart_data,
    }))
}
