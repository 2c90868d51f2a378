use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::MigrationHarness;
use docchat::auth::jwt::JwtService;
use docchat::chat::{ChatEngine, ChatError, ChatReply, ChatRequest};
use docchat::config::AppConfig;
use docchat::db::{self, PgPool, MIGRATIONS};
use docchat::models::Job;
use docchat::state::AppState;
use docchat::storage::ObjectStorage;
use docchat::{create_router, default_handlers, Worker};
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use uuid::Uuid;

pub const SERVICE_KEY: &str = "test-service-key";
pub const DEFAULT_PASSWORD: &str = "correct-horse";
pub const FAKE_MODEL: &str = "fake-model";
pub const FAKE_FREE_MODEL: &str = "fake-free-model";
pub const FAKE_TOKENS: i64 = 42;

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[derive(Default)]
pub struct FakeStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _content_type: Option<String>,
        _content_disposition: Option<String>,
    ) -> Result<()> {
        let mut guard = self.objects.lock().await;
        guard.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn presign_get_object(&self, key: &str, expires_in: Duration) -> Result<String> {
        let guard = self.objects.lock().await;
        ensure!(guard.contains_key(key), "object {key} missing");
        Ok(format!(
            "https://fake-storage/{key}?expires_in={}",
            expires_in.as_secs()
        ))
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let guard = self.objects.lock().await;
        guard
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("object {key} missing"))
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let mut guard = self.objects.lock().await;
        guard.remove(key);
        Ok(())
    }
}

impl FakeStorage {
    #[allow(dead_code)]
    pub async fn overwrite_all(&self, bytes: &[u8]) {
        let mut guard = self.objects.lock().await;
        for stored in guard.values_mut() {
            *stored = bytes.to_vec();
        }
    }

    #[allow(dead_code)]
    pub async fn object_count(&self) -> usize {
        let guard = self.objects.lock().await;
        guard.len()
    }
}

/// Answers every message with a canned reply. Messages mentioning "chart"
/// get a chart payload back.
#[derive(Default)]
pub struct FakeChatEngine {
    requests: Mutex<Vec<ChatRequest>>,
}

#[async_trait]
impl ChatEngine for FakeChatEngine {
    async fn reply(&self, request: ChatRequest) -> Result<ChatReply, ChatError> {
        let chart_data = request.message.to_lowercase().contains("chart").then(|| {
            json!({
                "type": "bar",
                "labels": ["Q1", "Q2"],
                "datasets": [{ "label": "Revenue", "data": [10, 20] }],
            })
        });
        let model = if request.plan == "free" {
            FAKE_FREE_MODEL
        } else {
            FAKE_MODEL
        };
        let reply = ChatReply {
            content: format!(
                "Answer to '{}' using {} document(s)",
                request.message,
                request.documents.len()
            ),
            chart_data,
            model: model.to_string(),
            tokens_used: FAKE_TOKENS,
        };
        self.requests.lock().await.push(request);
        Ok(reply)
    }
}

impl FakeChatEngine {
    #[allow(dead_code)]
    pub async fn last_request(&self) -> Option<ChatRequest> {
        self.requests.lock().await.last().cloned()
    }
}

#[derive(Debug, Clone)]
pub struct TestUser {
    pub id: Uuid,
    pub token: String,
}

pub struct TestApp {
    pub state: AppState,
    router: Router,
    storage: Arc<FakeStorage>,
    chat: Arc<FakeChatEngine>,
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        Self::with_config(|_| {}).await
    }

    /// Builds the app after letting the caller adjust the test configuration.
    pub async fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Result<Self> {
        let database_url = env::var("TEST_DATABASE_URL")
            .context("TEST_DATABASE_URL must be set for integration tests")?;

        let mut config = AppConfig {
            database_url,
            database_max_pool_size: db::DEFAULT_MAX_POOL_SIZE,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            environment: "test".to_string(),
            jwt_secret: "test-secret".to_string(),
            jwt_issuer: "test-issuer".to_string(),
            jwt_audience: "test-audience".to_string(),
            jwt_expiry_minutes: 60,
            refresh_token_expiry_days: 30,
            refresh_cookie_secure: false,
            refresh_cookie_domain: None,
            cors_allowed_origin: None,
            service_role_key: Some(SERVICE_KEY.to_string()),
            s3_endpoint: None,
            s3_access_key: None,
            s3_secret_key: None,
            s3_region: "us-east-1".to_string(),
            s3_bucket: "test-bucket".to_string(),
            openai_api_key: None,
            openai_base_url: "http://localhost:0".to_string(),
            default_model: FAKE_MODEL.to_string(),
            free_model: FAKE_FREE_MODEL.to_string(),
            max_upload_bytes: 1024 * 1024,
            allowed_extensions: ["pdf", "txt", "csv", "md", "docx"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            login_rate_limit: 10_000,
            login_rate_limit_window_secs: 60,
            api_rate_limit: 10_000,
            api_rate_limit_window_secs: 60,
            worker_enabled: false,
            worker_poll_interval_secs: 1,
        };
        adjust(&mut config);

        let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
        prepare_database(&pool).await?;

        let storage = Arc::new(FakeStorage::default());
        let storage_for_state: Arc<dyn ObjectStorage> = storage.clone();
        let chat = Arc::new(FakeChatEngine::default());
        let chat_for_state: Arc<dyn ChatEngine> = chat.clone();
        let jwt = JwtService::from_config(&config)?;
        let state = AppState::new(pool, config, storage_for_state, jwt, chat_for_state);
        let router = create_router(state.clone());

        Ok(Self {
            state,
            router,
            storage,
            chat,
        })
    }

    pub async fn cleanup(&self) -> Result<()> {
        self.with_conn(truncate_all).await
    }

    #[allow(dead_code)]
    pub fn storage(&self) -> Arc<FakeStorage> {
        self.storage.clone()
    }

    #[allow(dead_code)]
    pub fn chat(&self) -> Arc<FakeChatEngine> {
        self.chat.clone()
    }

    /// Registers through the API and logs in, returning the user's id and access token.
    pub async fn register_user(&self, email: &str) -> Result<TestUser> {
        let response = self
            .post_json(
                "/api/auth/register",
                &json!({ "email": email, "password": DEFAULT_PASSWORD }),
                None,
            )
            .await?;
        ensure!(
            response.status() == StatusCode::CREATED,
            "register failed with status {}",
            response.status()
        );

        #[derive(Deserialize)]
        struct LoginResponse {
            id: Uuid,
            access_token: String,
        }

        let response = self
            .post_json(
                "/api/auth/login",
                &json!({ "email": email, "password": DEFAULT_PASSWORD }),
                None,
            )
            .await?;
        ensure!(
            response.status() == StatusCode::OK,
            "login failed with status {}",
            response.status()
        );
        let parsed: LoginResponse = read_json(response).await?;
        Ok(TestUser {
            id: parsed.id,
            token: parsed.access_token,
        })
    }

    #[allow(dead_code)]
    pub async fn set_plan(&self, user_id: Uuid, plan: &str) -> Result<()> {
        let plan = plan.to_string();
        self.with_conn(move |conn| {
            use docchat::schema::users;
            diesel::update(users::table.find(user_id))
                .set(users::subscription_tier.eq(plan))
                .execute(conn)
                .context("failed to update plan")?;
            Ok(())
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn jobs_by_type(&self, ty: &str) -> Result<Vec<Job>> {
        let ty = ty.to_string();
        self.with_conn(move |conn| {
            use docchat::schema::jobs;
            let rows = jobs::table
                .filter(jobs::job_type.eq(&ty))
                .load::<Job>(conn)
                .context("failed to load jobs")?;
            Ok(rows)
        })
        .await
    }

    /// Drains the job queue with an in-process worker. Returns how many jobs ran.
    #[allow(dead_code)]
    pub async fn run_jobs(&self) -> Result<usize> {
        let worker = Worker::new(
            Arc::new(self.state.clone()),
            default_handlers(),
            Duration::from_millis(10),
        );
        let mut ran = 0;
        while worker.run_once().await? {
            ran += 1;
        }
        Ok(ran)
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.send_json(Method::POST, path, payload, token).await
    }

    #[allow(dead_code)]
    pub async fn put_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.send_json(Method::PUT, path, payload, token).await
    }

    #[allow(dead_code)]
    pub async fn post_with_cookie(&self, path: &str, cookie: &str) -> Result<hyper::Response<Body>> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("cookie", cookie)
            .body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        self.send(Method::GET, path, token).await
    }

    #[allow(dead_code)]
    pub async fn delete(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        self.send(Method::DELETE, path, token).await
    }

    #[allow(dead_code)]
    pub async fn upload_document(
        &self,
        filename: &str,
        content_type: &str,
        data: &[u8],
        token: &str,
    ) -> Result<hyper::Response<Body>> {
        let boundary = format!("boundary-{}", Uuid::new_v4());
        let mut body = Vec::new();
        body.extend(format!("--{boundary}\r\n").as_bytes());
        body.extend(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n",
                filename
            )
            .as_bytes(),
        );
        body.extend(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
        body.extend(data);
        body.extend(b"\r\n");
        body.extend(format!("--{boundary}--\r\n").as_bytes());

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/documents/upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    /// Uploads a text file and returns the new document id.
    #[allow(dead_code)]
    pub async fn upload_text(&self, filename: &str, text: &str, token: &str) -> Result<Uuid> {
        let response = self
            .upload_document(filename, "text/plain", text.as_bytes(), token)
            .await?;
        ensure!(
            response.status() == StatusCode::CREATED,
            "upload failed with status {}",
            response.status()
        );
        #[derive(Deserialize)]
        struct Uploaded {
            file_id: Uuid,
        }
        let uploaded: Uploaded = read_json(response).await?;
        Ok(uploaded.file_id)
    }

    async fn send_json<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

/// Builds a PDF with one line of Courier text per page.
#[allow(dead_code)]
pub fn sample_pdf(pages: &[&str]) -> Vec<u8> {
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Document, Object, Stream};

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::new();
    for text in pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 18.into()]),
                Operation::new("Td", vec![72.into(), 700.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let encoded = content.encode().expect("encode page content");
        let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.compress();

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("serialize pdf");
    bytes
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

pub async fn read_json<T: DeserializeOwned>(response: hyper::Response<Body>) -> Result<T> {
    let body = body_to_vec(response.into_body()).await?;
    serde_json::from_slice(&body).context("failed to decode response body")
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE session_documents, chat_messages, chat_sessions, user_usage, jobs, \
         documents, refresh_tokens, users RESTART IDENTITY CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}
