mod common;

use anyhow::Result;
use axum::http::StatusCode;
use common::{acquire_db_lock, read_json, sample_pdf, TestApp};
use docchat::jobs::{JOB_PROCESS_DOCUMENT, STATUS_QUEUED, STATUS_SUCCEEDED};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

#[derive(Deserialize)]
struct DocumentBody {
    id: Uuid,
    file_id: Uuid,
    user_id: Uuid,
    file_name: String,
    file_type: String,
    status: String,
    metadata: Value,
    processed_at: Option<String>,
}

#[derive(Deserialize)]
struct DocumentList {
    documents: Vec<DocumentBody>,
    total: usize,
}

#[derive(Deserialize)]
struct PreviewBody {
    file_id: Uuid,
    status: String,
    preview_text: Option<String>,
}

#[derive(Deserialize)]
struct DownloadBody {
    url: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct DeletedBody {
    file_id: Uuid,
    status: String,
}

#[tokio::test]
async fn upload_process_preview_and_delete() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let user = app.register_user("owner@example.com").await?;

    let text = "Quarterly revenue grew.\nCosts were flat.\n";
    let response = app
        .upload_document("report.txt", "text/plain", text.as_bytes(), &user.token)
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let uploaded: DocumentBody = read_json(response).await?;
    assert_eq!(uploaded.id, uploaded.file_id);
    assert_eq!(uploaded.user_id, user.id);
    assert_eq!(uploaded.file_name, "report.txt");
    assert_eq!(uploaded.file_type, "txt");
    assert_eq!(uploaded.status, "pending");
    assert_eq!(app.storage().object_count().await, 1);

    let jobs = app.jobs_by_type(JOB_PROCESS_DOCUMENT).await?;
    assert_eq!(jobs.len(), 1);

    assert_eq!(app.run_jobs().await?, 1);
    let jobs = app.jobs_by_type(JOB_PROCESS_DOCUMENT).await?;
    assert_eq!(jobs[0].status, STATUS_SUCCEEDED);

    let response = app
        .get(&format!("/api/documents/{}", uploaded.id), Some(&user.token))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let processed: DocumentBody = read_json(response).await?;
    assert_eq!(processed.status, "processed");
    assert!(processed.processed_at.is_some());
    assert_eq!(processed.metadata["word_count"], 6);
    assert_eq!(processed.metadata["line_count"], 2);

    let response = app
        .get(
            &format!("/api/documents/{}/preview", uploaded.id),
            Some(&user.token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let preview: PreviewBody = read_json(response).await?;
    assert_eq!(preview.file_id, uploaded.id);
    assert_eq!(preview.status, "processed");
    assert_eq!(preview.preview_text.as_deref(), Some(text.trim_end()));

    let response = app
        .get(
            &format!("/api/documents/{}/download", uploaded.id),
            Some(&user.token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let download: DownloadBody = read_json(response).await?;
    assert!(download.url.starts_with("https://fake-storage/"));
    assert_eq!(download.expires_in, 300);

    let response = app
        .delete(&format!("/api/documents/{}", uploaded.id), Some(&user.token))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let deleted: DeletedBody = read_json(response).await?;
    assert_eq!(deleted.file_id, uploaded.id);
    assert_eq!(deleted.status, "deleted");
    assert_eq!(app.storage().object_count().await, 0);

    let response = app
        .get(&format!("/api/documents/{}", uploaded.id), Some(&user.token))
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn identical_uploads_are_deduplicated_per_user() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let alice = app.register_user("alice@example.com").await?;
    let bob = app.register_user("bob@example.com").await?;

    let bytes = b"name,value\na,1\nb,2\n";
    let first = app
        .upload_document("data.csv", "text/csv", bytes, &alice.token)
        .await?;
    assert_eq!(first.status(), StatusCode::CREATED);
    let first: DocumentBody = read_json(first).await?;

    let again = app
        .upload_document("copy.csv", "text/csv", bytes, &alice.token)
        .await?;
    assert_eq!(again.status(), StatusCode::OK);
    let again: DocumentBody = read_json(again).await?;
    assert_eq!(again.id, first.id);

    let other_user = app
        .upload_document("data.csv", "text/csv", bytes, &bob.token)
        .await?;
    assert_eq!(other_user.status(), StatusCode::CREATED);

    let response = app.get("/api/documents/list", Some(&alice.token)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let list: DocumentList = read_json(response).await?;
    assert_eq!(list.total, 1);
    assert_eq!(list.documents[0].id, first.id);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn concurrent_identical_uploads_store_one_document() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let user = app.register_user("alice@example.com").await?;

    let bytes = b"region,total\nnorth,7\n";
    let (first, second) = tokio::join!(
        app.upload_document("north.csv", "text/csv", bytes, &user.token),
        app.upload_document("north-copy.csv", "text/csv", bytes, &user.token),
    );
    let mut statuses = vec![first?.status(), second?.status()];
    statuses.sort();
    assert_eq!(statuses, vec![StatusCode::OK, StatusCode::CREATED]);

    let response = app.get("/api/documents", Some(&user.token)).await?;
    let list: DocumentList = read_json(response).await?;
    assert_eq!(list.total, 1);
    assert_eq!(app.storage().object_count().await, 1);
    assert_eq!(app.jobs_by_type(JOB_PROCESS_DOCUMENT).await?.len(), 1);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn pdf_uploads_get_pages_and_preview_text() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let user = app.register_user("owner@example.com").await?;

    let pdf = sample_pdf(&["Revenue grew in Q3", "Outlook remains steady"]);
    let response = app
        .upload_document("board.pdf", "application/pdf", &pdf, &user.token)
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let uploaded: DocumentBody = read_json(response).await?;
    assert_eq!(uploaded.file_type, "pdf");

    assert_eq!(app.run_jobs().await?, 1);

    let response = app
        .get(&format!("/api/documents/{}", uploaded.id), Some(&user.token))
        .await?;
    let processed: DocumentBody = read_json(response).await?;
    assert_eq!(processed.status, "processed");
    assert_eq!(processed.metadata["page_count"], 2);

    let response = app
        .get(
            &format!("/api/documents/{}/preview", uploaded.id),
            Some(&user.token),
        )
        .await?;
    let preview: PreviewBody = read_json(response).await?;
    let text = preview.preview_text.unwrap_or_default();
    assert!(text.contains("Revenue grew in Q3"), "{text:?}");
    assert!(text.contains("Outlook remains steady"), "{text:?}");

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn rejects_unsupported_and_empty_uploads() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let user = app.register_user("owner@example.com").await?;

    let response = app
        .upload_document("malware.exe", "application/octet-stream", b"MZ", &user.token)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .upload_document("empty.txt", "text/plain", b"", &user.token)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let oversized = vec![b'a'; 1024 * 1024 + 1];
    let response = app
        .upload_document("big.txt", "text/plain", &oversized, &user.token)
        .await?;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let long_name = format!("{}.txt", "a".repeat(300));
    let response = app
        .upload_document(&long_name, "text/plain", b"hello", &user.token)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let long_type = format!("text/plain; charset=utf-8; x-note={}", "b".repeat(100));
    let response = app
        .upload_document("notes.txt", &long_type, b"hello", &user.token)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert_eq!(app.storage().object_count().await, 0);

    let widest_name = format!("{}.txt", "a".repeat(251));
    let response = app
        .upload_document(&widest_name, "text/plain", b"hello", &user.token)
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let stored: DocumentBody = read_json(response).await?;
    assert_eq!(stored.file_name, widest_name);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn corrupted_objects_are_retried_not_processed() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let user = app.register_user("owner@example.com").await?;

    let document_id = app.upload_text("notes.md", "# Notes", &user.token).await?;
    app.storage().overwrite_all(b"tampered").await;

    assert_eq!(app.run_jobs().await?, 1);

    let jobs = app.jobs_by_type(JOB_PROCESS_DOCUMENT).await?;
    assert_eq!(jobs[0].status, STATUS_QUEUED);
    assert_eq!(jobs[0].attempts, 1);
    assert!(jobs[0]
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("checksum mismatch"));

    let response = app
        .get(&format!("/api/documents/{document_id}"), Some(&user.token))
        .await?;
    let document: DocumentBody = read_json(response).await?;
    assert_eq!(document.status, "processing");
    assert!(document.processed_at.is_none());

    app.cleanup().await?;
    Ok(())
}
