use std::time::Duration;

use axum::extract::{Json, Multipart, Path, State};
use axum::http::StatusCode;
use diesel::prelude::*;
use diesel::PgConnection;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::to_iso;
use crate::access::load_document;
use crate::auth::{AuthenticatedUser, Principal};
use crate::error::{AppError, AppResult};
use crate::jobs::enqueue_document_processing;
use crate::models::{Document, NewDocument, STATUS_PENDING};
use crate::schema::documents;
use crate::state::AppState;
use crate::storage::document_key;

const PRESIGNED_URL_EXPIRY_SECONDS: u64 = 300;
/// Column widths of `documents.file_name` and `documents.content_type`.
const MAX_FILE_NAME_CHARS: usize = 255;
const MAX_CONTENT_TYPE_CHARS: usize = 100;

fn inline_content_disposition(filename: &str) -> Option<String> {
    if filename.is_empty() {
        return None;
    }

    let sanitized: String = filename
        .chars()
        .map(|ch| match ch {
            '"' | '\\' => '_',
            _ => ch,
        })
        .collect();

    let encoded =
        percent_encoding::utf8_percent_encode(&sanitized, percent_encoding::NON_ALPHANUMERIC);
    Some(format!(
        "inline; filename=\"{sanitized}\"; filename*=UTF-8''{encoded}"
    ))
}

/// Lowercased extension of `file_name`, if it has one.
pub(crate) fn file_extension(file_name: &str) -> Option<String> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[derive(Serialize, Clone)]
pub struct DocumentResponse {
    pub id: Uuid,
    pub file_id: Uuid,
    pub user_id: Uuid,
    pub file_name: String,
    pub file_type: String,
    pub content_type: Option<String>,
    pub file_size: i64,
    pub status: String,
    pub metadata: Value,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub processed_at: Option<String>,
}

impl From<Document> for DocumentResponse {
    fn from(document: Document) -> Self {
        Self {
            id: document.id,
            file_id: document.id,
            user_id: document.user_id,
            file_name: document.file_name,
            file_type: document.file_type,
            content_type: document.content_type,
            file_size: document.file_size,
            status: document.status,
            metadata: document.metadata,
            error_message: document.error_message,
            created_at: to_iso(document.created_at),
            updated_at: to_iso(document.updated_at),
            processed_at: document.processed_at.map(to_iso),
        }
    }
}

#[derive(Serialize)]
pub struct DocumentListResponse {
    pub documents: Vec<DocumentResponse>,
    pub total: usize,
}

#[derive(Serialize)]
pub struct DocumentPreviewResponse {
    pub file_id: Uuid,
    pub file_name: String,
    pub file_type: String,
    pub status: String,
    pub preview_text: Option<String>,
}

#[derive(Serialize)]
pub struct DownloadResponse {
    pub file_id: Uuid,
    pub file_name: String,
    pub url: String,
    pub expires_in: u64,
}

#[derive(Serialize)]
pub struct DeleteDocumentResponse {
    pub file_id: Uuid,
    pub file_name: String,
    pub file_type: String,
    pub status: &'static str,
    pub message: String,
}

struct UploadedFile {
    bytes: Vec<u8>,
    file_name: String,
    content_type: Option<String>,
}

pub async fn upload_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<DocumentResponse>)> {
    let mut upload: Option<UploadedFile> = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::new(err.status(), format!("invalid multipart data: {}", err.body_text()))
    })? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| AppError::bad_request("filename is required"))?;
        let content_type = field.content_type().map(|mime| mime.to_string());
        let data = field.bytes().await.map_err(|err| {
            error!(error = %err, "failed to read file bytes");
            AppError::new(err.status(), format!("failed to read file: {}", err.body_text()))
        })?;
        upload = Some(UploadedFile {
            bytes: data.to_vec(),
            file_name,
            content_type,
        });
    }

    let upload = upload.ok_or_else(|| AppError::bad_request("file field is required"))?;
    if upload.file_name.chars().count() > MAX_FILE_NAME_CHARS {
        return Err(AppError::bad_request(format!(
            "filename must be at most {MAX_FILE_NAME_CHARS} characters"
        )));
    }
    if upload
        .content_type
        .as_ref()
        .is_some_and(|mime| mime.chars().count() > MAX_CONTENT_TYPE_CHARS)
    {
        return Err(AppError::bad_request(format!(
            "content type must be at most {MAX_CONTENT_TYPE_CHARS} characters"
        )));
    }
    if upload.bytes.is_empty() {
        return Err(AppError::bad_request("file must not be empty"));
    }
    if upload.bytes.len() > state.config.max_upload_bytes {
        return Err(AppError::payload_too_large(format!(
            "file exceeds the {} byte upload limit",
            state.config.max_upload_bytes
        )));
    }

    let extension = file_extension(&upload.file_name)
        .filter(|ext| state.config.extension_allowed(ext))
        .ok_or_else(|| {
            AppError::bad_request(format!(
                "unsupported file type; allowed: {}",
                state.config.allowed_extensions.join(", ")
            ))
        })?;

    let checksum = hex::encode(Sha256::digest(&upload.bytes));

    {
        let mut conn = state.db()?;
        if let Some(existing) = find_by_checksum(&mut conn, user.user_id, &checksum)? {
            info!(document_id = %existing.id, %checksum, "upload matched an existing document");
            return Ok((StatusCode::OK, Json(existing.into())));
        }
    }

    let document_id = Uuid::new_v4();
    let s3_key = document_key(user.user_id, document_id, &extension);
    let content_type = upload.content_type.clone().or_else(|| {
        mime_guess::from_ext(&extension)
            .first()
            .map(|mime| mime.to_string())
    });

    state
        .storage
        .put_object(
            &s3_key,
            upload.bytes.clone(),
            content_type.clone(),
            inline_content_disposition(&upload.file_name),
        )
        .await
        .map_err(|err| {
            error!(error = %err, key = %s3_key, "failed to store document");
            AppError::internal(format!("failed to store document: {err}"))
        })?;

    let inserted: Option<Document> = {
        let mut conn = state.db()?;
        conn.transaction(|conn| {
            let document: Option<Document> = diesel::insert_into(documents::table)
                .values(&NewDocument {
                    id: document_id,
                    user_id: user.user_id,
                    file_name: upload.file_name.clone(),
                    file_type: extension.clone(),
                    content_type: content_type.clone(),
                    file_size: upload.bytes.len() as i64,
                    status: STATUS_PENDING.to_string(),
                    s3_key: s3_key.clone(),
                    checksum: checksum.clone(),
                    metadata: Value::Object(Default::default()),
                })
                .on_conflict((documents::user_id, documents::checksum))
                .do_nothing()
                .get_result(conn)
                .optional()?;
            if document.is_some() {
                enqueue_document_processing(conn, document_id).map_err(|err| {
                    AppError::internal(format!("failed to enqueue processing: {err}"))
                })?;
            }
            Ok::<Option<Document>, AppError>(document)
        })?
    };

    // A concurrent upload of the same content won the insert.
    let Some(document) = inserted else {
        if let Err(err) = state.storage.delete_object(&s3_key).await {
            warn!(error = %err, key = %s3_key, "failed to remove duplicate upload object");
        }
        let mut conn = state.db()?;
        let existing = find_by_checksum(&mut conn, user.user_id, &checksum)?
            .ok_or_else(|| AppError::internal("duplicate document vanished during upload"))?;
        info!(document_id = %existing.id, %checksum, "concurrent upload matched an existing document");
        return Ok((StatusCode::OK, Json(existing.into())));
    };

    state
        .events
        .emit_file_status(user.user_id, document.id, STATUS_PENDING, Some(0), None);
    info!(
        document_id = %document.id,
        file_name = %document.file_name,
        size = document.file_size,
        "document uploaded"
    );

    Ok((StatusCode::CREATED, Json(document.into())))
}

fn find_by_checksum(
    conn: &mut PgConnection,
    user_id: Uuid,
    checksum: &str,
) -> QueryResult<Option<Document>> {
    documents::table
        .filter(documents::user_id.eq(user_id))
        .filter(documents::checksum.eq(checksum))
        .first(conn)
        .optional()
}

pub async fn list_documents(
    State(state): State<AppState>,
    principal: Principal,
) -> AppResult<Json<DocumentListResponse>> {
    let mut conn = state.db()?;
    let mut query = documents::table
        .order(documents::created_at.desc())
        .into_boxed();
    if let Some(user_id) = principal.user_id() {
        query = query.filter(documents::user_id.eq(user_id));
    }

    let rows: Vec<Document> = query.load(&mut conn)?;
    let documents: Vec<DocumentResponse> = rows.into_iter().map(Into::into).collect();
    Ok(Json(DocumentListResponse {
        total: documents.len(),
        documents,
    }))
}

pub async fn get_document(
    State(state): State<AppState>,
    principal: Principal,
    Path(document_id): Path<Uuid>,
) -> AppResult<Json<DocumentResponse>> {
    let mut conn = state.db()?;
    let document = load_document(&mut conn, &principal, document_id)?;
    Ok(Json(document.into()))
}

pub async fn preview_document(
    State(state): State<AppState>,
    principal: Principal,
    Path(document_id): Path<Uuid>,
) -> AppResult<Json<DocumentPreviewResponse>> {
    let mut conn = state.db()?;
    let document = load_document(&mut conn, &principal, document_id)?;
    let preview_text = document
        .metadata
        .get("preview_text")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(Json(DocumentPreviewResponse {
        file_id: document.id,
        file_name: document.file_name,
        file_type: document.file_type,
        status: document.status,
        preview_text,
    }))
}

pub async fn download_document(
    State(state): State<AppState>,
    principal: Principal,
    Path(document_id): Path<Uuid>,
) -> AppResult<Json<DownloadResponse>> {
    let document = {
        let mut conn = state.db()?;
        load_document(&mut conn, &principal, document_id)?
    };

    let url = state
        .storage
        .presign_get_object(
            &document.s3_key,
            Duration::from_secs(PRESIGNED_URL_EXPIRY_SECONDS),
        )
        .await
        .map_err(|err| AppError::internal(format!("failed to sign download url: {err}")))?;

    Ok(Json(DownloadResponse {
        file_id: document.id,
        file_name: document.file_name,
        url,
        expires_in: PRESIGNED_URL_EXPIRY_SECONDS,
    }))
}

pub async fn delete_document(
    State(state): State<AppState>,
    principal: Principal,
    Path(document_id): Path<Uuid>,
) -> AppResult<Json<DeleteDocumentResponse>> {
    let document = {
        let mut conn = state.db()?;
        let document = load_document(&mut conn, &principal, document_id)?;
        diesel::delete(documents::table.find(document.id)).execute(&mut conn)?;
        document
    };

    if let Err(err) = state.storage.delete_object(&document.s3_key).await {
        warn!(document_id = %document.id, key = %document.s3_key, error = %err, "stored object was not removed");
    }

    state
        .events
        .emit_file_status(document.user_id, document.id, "deleted", None, None);
    info!(document_id = %document.id, "document deleted");

    Ok(Json(DeleteDocumentResponse {
        file_id: document.id,
        message: format!("{} was deleted", document.file_name),
        file_name: document.file_name,
        file_type: document.file_type,
        status: "deleted",
    }))
}
