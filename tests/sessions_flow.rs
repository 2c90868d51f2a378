mod common;

use anyhow::Result;
use axum::http::StatusCode;
use common::{acquire_db_lock, read_json, TestApp, FAKE_FREE_MODEL, FAKE_MODEL, FAKE_TOKENS};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Deserialize)]
struct SessionBody {
    session_id: Uuid,
    name: String,
    last_message_at: Option<String>,
    document_ids: Vec<Uuid>,
}

#[derive(Deserialize)]
struct SessionList {
    sessions: Vec<SessionBody>,
}

#[derive(Deserialize)]
struct AddedBody {
    session_id: Uuid,
    document_ids: Vec<Uuid>,
    added_document_ids: Vec<Uuid>,
}

#[derive(Deserialize)]
struct RemovedBody {
    document_ids: Vec<Uuid>,
    removed_document_id: Uuid,
}

#[derive(Deserialize)]
struct SourceBody {
    document_id: Uuid,
}

#[derive(Deserialize)]
struct ChatBody {
    message_id: Uuid,
    session_id: Uuid,
    response: String,
    sources: Vec<SourceBody>,
    chart_data: Option<Value>,
    timestamp: String,
}

#[derive(Deserialize)]
struct MessageBody {
    id: Uuid,
    role: String,
    content: String,
    timestamp: String,
}

#[derive(Deserialize)]
struct MessageList {
    messages: Vec<MessageBody>,
}

#[derive(Deserialize)]
struct Suggestions {
    suggestions: Vec<String>,
}

#[derive(Deserialize)]
struct UsageEntry {
    model: String,
    tokens_used: i64,
}

#[derive(Deserialize)]
struct UsageBody {
    usage: Vec<UsageEntry>,
}

#[tokio::test]
async fn create_session_echoes_document_ids() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let user = app.register_user("analyst@example.com").await?;

    let first = app.upload_text("a.txt", "first document", &user.token).await?;
    let second = app.upload_text("b.txt", "second document", &user.token).await?;

    let response = app
        .post_json(
            "/api/chat/sessions",
            &json!({ "name": "Research Analysis", "document_ids": [first, second] }),
            Some(&user.token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let session: SessionBody = read_json(response).await?;
    assert_eq!(session.name, "Research Analysis");
    assert_eq!(session.document_ids, vec![first, second]);
    assert!(session.last_message_at.is_none());

    let response = app
        .get(
            &format!("/api/chat/sessions/{}", session.session_id),
            Some(&user.token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let fetched: SessionBody = read_json(response).await?;
    assert_eq!(fetched.session_id, session.session_id);
    assert_eq!(fetched.document_ids, vec![first, second]);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn adding_documents_reports_union_and_added() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let user = app.register_user("analyst@example.com").await?;

    let first = app.upload_text("a.txt", "alpha", &user.token).await?;
    let second = app.upload_text("b.txt", "beta", &user.token).await?;
    let third = app.upload_text("c.txt", "gamma", &user.token).await?;

    let response = app
        .post_json(
            "/api/chat/sessions",
            &json!({ "name": "Union", "document_ids": [first, second] }),
            Some(&user.token),
        )
        .await?;
    let session: SessionBody = read_json(response).await?;

    let response = app
        .post_json(
            &format!("/api/chat/sessions/{}/documents", session.session_id),
            &json!({ "document_ids": [third] }),
            Some(&user.token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let added: AddedBody = read_json(response).await?;
    assert_eq!(added.session_id, session.session_id);
    assert_eq!(added.document_ids, vec![first, second, third]);
    assert_eq!(added.added_document_ids, vec![third]);

    // Re-adding through PUT is idempotent.
    let response = app
        .put_json(
            &format!("/api/chat/sessions/{}/documents", session.session_id),
            &json!({ "document_ids": [first, third] }),
            Some(&user.token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let again: AddedBody = read_json(response).await?;
    assert_eq!(again.document_ids, vec![first, second, third]);
    assert!(again.added_document_ids.is_empty());

    let response = app
        .delete(
            &format!(
                "/api/chat/sessions/{}/documents/{}",
                session.session_id, second
            ),
            Some(&user.token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let removed: RemovedBody = read_json(response).await?;
    assert_eq!(removed.removed_document_id, second);
    assert_eq!(removed.document_ids, vec![first, third]);

    let response = app
        .delete(
            &format!(
                "/api/chat/sessions/{}/documents/{}",
                session.session_id, second
            ),
            Some(&user.token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn messages_are_persisted_in_order_and_metered() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let user = app.register_user("analyst@example.com").await?;
    let document = app.upload_text("q.txt", "quarterly numbers", &user.token).await?;

    let response = app
        .post_json(
            "/api/chat/sessions",
            &json!({ "document_ids": [document] }),
            Some(&user.token),
        )
        .await?;
    let session: SessionBody = read_json(response).await?;
    assert_eq!(session.name, "New Chat");

    let path = format!("/api/chat/sessions/{}/messages", session.session_id);
    let response = app
        .post_json(&path, &json!({ "message": "Summarize it" }), Some(&user.token))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let reply: ChatBody = read_json(response).await?;
    assert_eq!(reply.session_id, session.session_id);
    assert_eq!(reply.response, "Answer to 'Summarize it' using 1 document(s)");
    assert_eq!(reply.sources.len(), 1);
    assert_eq!(reply.sources[0].document_id, document);
    assert!(reply.chart_data.is_none());

    let request = app.chat().last_request().await;
    assert_eq!(request.map(|r| r.plan), Some("free".to_string()));

    let response = app
        .post_json(
            &path,
            &json!({ "message": "Draw a chart", "use_agent": true }),
            Some(&user.token),
        )
        .await?;
    let charted: ChatBody = read_json(response).await?;
    assert!(charted.chart_data.is_some());
    let history = app
        .chat()
        .last_request()
        .await
        .map(|r| r.history.len())
        .unwrap_or_default();
    assert_eq!(history, 2);

    let response = app.get(&path, Some(&user.token)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let list: MessageList = read_json(response).await?;
    let roles: Vec<&str> = list.messages.iter().map(|m| m.role.as_str()).collect();
    assert_eq!(roles, vec!["user", "assistant", "user", "assistant"]);
    assert_eq!(list.messages[0].content, "Summarize it");
    assert_eq!(list.messages[1].id, reply.message_id);
    assert_eq!(list.messages[1].timestamp, reply.timestamp);
    assert_eq!(list.messages[3].id, charted.message_id);
    assert!(list.messages[0].timestamp < list.messages[1].timestamp);

    let response = app.get("/api/chat/sessions", Some(&user.token)).await?;
    let sessions: SessionList = read_json(response).await?;
    assert_eq!(sessions.sessions.len(), 1);
    assert_eq!(
        sessions.sessions[0].last_message_at.as_deref(),
        Some(charted.timestamp.as_str())
    );

    let response = app.get("/api/users/me/usage", Some(&user.token)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let usage: UsageBody = read_json(response).await?;
    assert_eq!(usage.usage.len(), 1);
    assert_eq!(usage.usage[0].model, FAKE_FREE_MODEL);
    assert_eq!(usage.usage[0].tokens_used, FAKE_TOKENS * 2);

    app.set_plan(user.id, "pro").await?;
    app.post_json(&path, &json!({ "message": "One more" }), Some(&user.token))
        .await?;
    let response = app.get("/api/users/me/usage", Some(&user.token)).await?;
    let usage: UsageBody = read_json(response).await?;
    assert_eq!(usage.usage.len(), 2);
    assert!(usage.usage.iter().any(|entry| entry.model == FAKE_MODEL));

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn suggestions_follow_attached_documents() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let user = app.register_user("analyst@example.com").await?;

    let response = app
        .post_json("/api/chat/sessions", &json!({}), Some(&user.token))
        .await?;
    let session: SessionBody = read_json(response).await?;
    let path = format!("/api/chat/sessions/{}/suggestions", session.session_id);

    let response = app.get(&path, Some(&user.token)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let defaults: Suggestions = read_json(response).await?;
    assert_eq!(defaults.suggestions.len(), 5);
    assert_eq!(defaults.suggestions[0], "Can you summarize this document?");

    let sales = app
        .upload_document("sales.csv", "text/csv", b"month,total\njan,3\n", &user.token)
        .await?;
    #[derive(Deserialize)]
    struct Uploaded {
        file_id: Uuid,
    }
    let sales: Uploaded = read_json(sales).await?;
    app.post_json(
        &format!("/api/chat/sessions/{}/documents", session.session_id),
        &json!({ "document_ids": [sales.file_id] }),
        Some(&user.token),
    )
    .await?;

    let response = app.get(&path, Some(&user.token)).await?;
    let tailored: Suggestions = read_json(response).await?;
    assert!(tailored.suggestions.len() <= 5);
    assert_eq!(tailored.suggestions[0], "Can you summarize sales.csv?");
    assert!(tailored
        .suggestions
        .iter()
        .any(|s| s == "Create a chart from the data in sales.csv"));

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn rename_and_delete_session() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let user = app.register_user("analyst@example.com").await?;

    let response = app
        .post_json(
            "/api/chat/sessions",
            &json!({ "name": "Draft" }),
            Some(&user.token),
        )
        .await?;
    let session: SessionBody = read_json(response).await?;
    let path = format!("/api/chat/sessions/{}", session.session_id);

    let response = app
        .put_json(&path, &json!({ "name": "  Final  " }), Some(&user.token))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let renamed: SessionBody = read_json(response).await?;
    assert_eq!(renamed.name, "Final");

    let response = app
        .put_json(&path, &json!({ "name": "   " }), Some(&user.token))
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let too_long = "n".repeat(256);
    let response = app
        .put_json(&path, &json!({ "name": too_long }), Some(&user.token))
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .post_json(
            "/api/chat/sessions",
            &json!({ "name": too_long }),
            Some(&user.token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .put_json(&path, &json!({ "name": "n".repeat(255) }), Some(&user.token))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.delete(&path, Some(&user.token)).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.get(&path, Some(&user.token)).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    app.cleanup().await?;
    Ok(())
}
