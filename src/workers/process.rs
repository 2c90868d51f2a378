use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tokio::task;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::extract::{document_text, pdf_page_count};
use super::{JobExecution, JobHandler};
use crate::{
    jobs::{JOB_PROCESS_DOCUMENT, MAX_ATTEMPTS},
    models::{Document, Job, STATUS_FAILED, STATUS_PROCESSED, STATUS_PROCESSING},
    schema::documents,
    state::AppState,
};

pub const PREVIEW_CHARS: usize = 1_000;
const RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ProcessPayload {
    document_id: Uuid,
}

pub struct ProcessDocumentJob;

impl ProcessDocumentJob {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ProcessDocumentJob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for ProcessDocumentJob {
    fn job_type(&self) -> &'static str {
        JOB_PROCESS_DOCUMENT
    }

    async fn handle(&self, state: Arc<AppState>, job: Job) -> JobExecution {
        let payload: ProcessPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                return JobExecution::Failed {
                    error: format!("invalid process payload: {err}"),
                }
            }
        };

        match process_document(&state, payload.document_id).await {
            Ok(()) => JobExecution::Success,
            Err(err) => {
                let message = format!("{err:#}");
                if job.attempts >= MAX_ATTEMPTS {
                    record_failure(&state, payload.document_id, &message);
                    JobExecution::Failed { error: message }
                } else {
                    warn!(job_id = %job.id, attempts = job.attempts, error = %message, "document processing will retry");
                    JobExecution::Retry {
                        delay: RETRY_DELAY,
                        error: message,
                    }
                }
            }
        }
    }
}

async fn process_document(state: &AppState, document_id: Uuid) -> anyhow::Result<()> {
    let document = {
        let mut conn = state.db().map_err(|err| anyhow!(err.message().to_string()))?;
        let found: Option<Document> = documents::table
            .find(document_id)
            .first(&mut conn)
            .optional()?;
        let Some(document) = found else {
            info!(%document_id, "document no longer exists; nothing to process");
            return Ok(());
        };

        diesel::update(documents::table.find(document_id))
            .set((
                documents::status.eq(STATUS_PROCESSING),
                documents::error_message.eq::<Option<String>>(None),
                documents::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(&mut conn)?;
        document
    };

    let owner = document.user_id;
    state
        .events
        .emit_file_status(owner, document_id, STATUS_PROCESSING, Some(0), None);
    state.events.emit_processing_progress(
        owner,
        document_id,
        "downloading",
        10,
        "Downloading document",
    );

    let bytes = state
        .storage
        .get_object(&document.s3_key)
        .await
        .with_context(|| format!("failed to fetch {}", document.s3_key))?;

    let checksum = hex::encode(Sha256::digest(&bytes));
    if checksum != document.checksum {
        return Err(anyhow!(
            "checksum mismatch for document {document_id}: expected {}, got {checksum}",
            document.checksum
        ));
    }

    state.events.emit_processing_progress(
        owner,
        document_id,
        "analyzing",
        50,
        "Extracting document details",
    );

    let mut metadata = match document.metadata {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let file_type = document.file_type.clone();
    let extracted = task::spawn_blocking(move || extract_metadata(&file_type, &bytes))
        .await
        .context("metadata extraction task failed")?;
    metadata.extend(extracted);
    let metadata = Value::Object(metadata);

    let now = Utc::now().naive_utc();
    let mut conn = state.db().map_err(|err| anyhow!(err.message().to_string()))?;
    diesel::update(documents::table.find(document_id))
        .set((
            documents::status.eq(STATUS_PROCESSED),
            documents::metadata.eq(&metadata),
            documents::processed_at.eq(Some(now)),
            documents::updated_at.eq(now),
        ))
        .execute(&mut conn)?;

    state.events.emit_file_status(
        owner,
        document_id,
        STATUS_PROCESSED,
        Some(100),
        Some(metadata),
    );
    info!(%document_id, "document processed");
    Ok(())
}

fn record_failure(state: &AppState, document_id: Uuid, message: &str) {
    let owner = match state.db() {
        Ok(mut conn) => diesel::update(documents::table.find(document_id))
            .set((
                documents::status.eq(STATUS_FAILED),
                documents::error_message.eq(Some(message)),
                documents::updated_at.eq(Utc::now().naive_utc()),
            ))
            .returning(documents::user_id)
            .get_result::<Uuid>(&mut conn)
            .optional(),
        Err(err) => {
            error!(%document_id, error = %err.message(), "cannot record processing failure");
            return;
        }
    };

    match owner {
        Ok(Some(owner)) => {
            state
                .events
                .emit_file_status(owner, document_id, STATUS_FAILED, None, None);
            state.events.emit_error(
                owner,
                "processing_failed",
                message,
                Some(document_id),
                None,
            );
        }
        Ok(None) => {}
        Err(err) => error!(%document_id, error = %err, "failed to mark document as failed"),
    }
}

/// Lightweight details derived from a document's bytes. Extraction failures
/// are recorded in the metadata rather than failing the document.
pub fn extract_metadata(file_type: &str, bytes: &[u8]) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("byte_size".into(), json!(bytes.len()));

    match document_text(file_type, bytes) {
        Ok(Some(text)) => {
            let preview: String = text.chars().take(PREVIEW_CHARS).collect();
            metadata.insert("preview_text".into(), json!(preview.trim()));
            metadata.insert("word_count".into(), json!(text.split_whitespace().count()));
            metadata.insert("line_count".into(), json!(text.lines().count()));
            if file_type == "csv" {
                let columns = text
                    .lines()
                    .next()
                    .map(|header| header.split(',').count())
                    .unwrap_or(0);
                metadata.insert("column_count".into(), json!(columns));
            }
        }
        Ok(None) => {}
        Err(err) => {
            warn!(file_type, error = %err, "text extraction failed");
            metadata.insert("extraction_error".into(), json!(err.to_string()));
        }
    }

    if file_type == "pdf" {
        match pdf_page_count(bytes) {
            Ok(pages) => {
                metadata.insert("page_count".into(), json!(pages));
            }
            Err(err) => warn!(error = %err, "could not count pdf pages"),
        }
    }

    metadata.insert("extracted_at".into(), json!(Utc::now().to_rfc3339()));
    metadata
}
