//! Row-level access policy.
//!
//! Every user-scoped row is reachable only by its owner or by the service
//! principal. Child rows (messages, session documents) inherit the owner of
//! their chat session. A missing row is reported as 404, a row owned by
//! someone else as 403.

use std::collections::HashSet;

use diesel::prelude::*;
use diesel::PgConnection;
use tracing::warn;
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::{AppError, AppResult};
use crate::models::{ChatSession, Document};
use crate::schema::{chat_sessions, documents};

pub fn authorize(principal: &Principal, owner_id: Uuid) -> AppResult<()> {
    if principal.can_access(owner_id) {
        Ok(())
    } else {
        warn!(
            principal = ?principal.user_id(),
            owner = %owner_id,
            "row access denied"
        );
        Err(AppError::forbidden())
    }
}

pub fn load_document(
    conn: &mut PgConnection,
    principal: &Principal,
    document_id: Uuid,
) -> AppResult<Document> {
    let document: Document = documents::table.find(document_id).first(conn)?;
    authorize(principal, document.user_id)?;
    Ok(document)
}

pub fn load_session(
    conn: &mut PgConnection,
    principal: &Principal,
    session_id: Uuid,
) -> AppResult<ChatSession> {
    let session: ChatSession = chat_sessions::table.find(session_id).first(conn)?;
    authorize(principal, session.user_id)?;
    Ok(session)
}

/// Verifies that every document may be linked to `session`.
///
/// A user principal must own the session and each document. The service
/// principal may link any existing document to any session.
pub fn ensure_attachable(
    conn: &mut PgConnection,
    principal: &Principal,
    session: &ChatSession,
    document_ids: &[Uuid],
) -> AppResult<()> {
    authorize(principal, session.user_id)?;
    if document_ids.is_empty() {
        return Ok(());
    }

    let found: Vec<(Uuid, Uuid)> = documents::table
        .filter(documents::id.eq_any(document_ids))
        .select((documents::id, documents::user_id))
        .load(conn)?;

    let known: HashSet<Uuid> = found.iter().map(|(id, _)| *id).collect();
    if let Some(missing) = document_ids.iter().find(|id| !known.contains(id)) {
        return Err(AppError::new(
            axum::http::StatusCode::NOT_FOUND,
            format!("document {missing} not found"),
        ));
    }

    found
        .into_iter()
        .try_for_each(|(_, owner_id)| authorize(principal, owner_id))
}

/// Removes duplicates while keeping first-seen order.
pub fn dedup_ids(ids: &[Uuid]) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}
