use axum::http::{header, HeaderName, HeaderValue};
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::{auth::Principal, rate_limit::rate_limit_middleware, state::AppState};

pub mod agent;
pub mod auth;
pub mod documents;
pub mod health;
pub mod sessions;
pub mod usage;
pub mod ws;

/// Multipart framing allowance on top of the configured file size limit.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

const CONTENT_SECURITY_POLICY: &str = "default-src 'self'; script-src 'self'; \
    style-src 'self' 'unsafe-inline'; img-src 'self' data: blob:; font-src 'self'; \
    connect-src 'self' https://*.openai.com; frame-src 'self'; object-src 'none'; \
    base-uri 'self'";
const PERMISSIONS_POLICY: &str = "camera=(), microphone=(), geolocation=(), payment=()";
const HSTS: &str = "max-age=31536000; includeSubDomains";

pub(crate) fn to_iso(dt: NaiveDateTime) -> String {
    DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc).to_rfc3339()
}

fn cors_layer(state: &AppState) -> CorsLayer {
    let allow_origin = match state.config.cors_allowed_origin.as_ref() {
        Some(origins) => {
            let headers: Vec<HeaderValue> = origins
                .split(',')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .filter_map(|value| match value.parse::<HeaderValue>() {
                    Ok(header) => Some(header),
                    Err(_) => {
                        warn!(origin = %value, "ignoring invalid CORS origin");
                        None
                    }
                })
                .collect();
            AllowOrigin::list(headers)
        }
        None => AllowOrigin::mirror_request(),
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

fn security_headers(router: Router<()>, production: bool) -> Router<()> {
    let headers: [(HeaderName, &'static str); 6] = [
        (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        (header::REFERRER_POLICY, "strict-origin-when-cross-origin"),
        (header::X_FRAME_OPTIONS, "SAMEORIGIN"),
        (header::X_XSS_PROTECTION, "1; mode=block"),
        (HeaderName::from_static("permissions-policy"), PERMISSIONS_POLICY),
        (header::CONTENT_SECURITY_POLICY, CONTENT_SECURITY_POLICY),
    ];

    let mut router = router;
    for (name, value) in headers {
        router = router.layer(SetResponseHeaderLayer::overriding(
            name,
            HeaderValue::from_static(value),
        ));
    }
    if production {
        router = router.layer(SetResponseHeaderLayer::overriding(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static(HSTS),
        ));
    }
    router
}

pub fn create_router(state: AppState) -> Router<()> {
    let auth_routes = Router::new()
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .route("/refresh", post(auth::refresh))
        .route("/logout", post(auth::logout))
        .route("/me", get(auth::me));

    let documents_routes = Router::new()
        .route("/", get(documents::list_documents))
        .route("/list", get(documents::list_documents))
        .route("/upload", post(documents::upload_document))
        .route(
            "/:id",
            get(documents::get_document).delete(documents::delete_document),
        )
        .route("/:id/preview", get(documents::preview_document))
        .route("/:id/download", get(documents::download_document));

    let sessions_routes = Router::new()
        .route(
            "/",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route(
            "/:id",
            get(sessions::get_session)
                .put(sessions::rename_session)
                .delete(sessions::delete_session),
        )
        .route(
            "/:id/documents",
            get(sessions::get_session_documents)
                .post(sessions::add_session_documents)
                .put(sessions::add_session_documents),
        )
        .route(
            "/:id/documents/:document_id",
            delete(sessions::remove_session_document),
        )
        .route(
            "/:id/messages",
            get(sessions::list_messages).post(sessions::send_message),
        )
        .route("/:id/suggestions", get(sessions::get_suggestions));

    let ws_admin_routes = Router::new()
        .route("/file-status", post(ws::emit_file_status))
        .route("/processing-progress", post(ws::emit_processing_progress))
        .route("/chat-response", post(ws::emit_chat_response))
        .route("/error", post(ws::emit_error))
        .route("/status", get(ws::hub_status))
        .route("/user/:user_id/status", get(ws::user_status));

    let protected_state = state.clone();
    let protected_routes = Router::new()
        .nest("/api/documents", documents_routes)
        .nest("/api/chat/sessions", sessions_routes)
        .nest("/api/ws", ws_admin_routes)
        .route("/api/agent/process", post(agent::process))
        .route("/api/users/me/usage", get(usage::my_usage))
        .layer(middleware::from_extractor_with_state::<Principal, _>(
            protected_state,
        ));

    let production = !state.config.is_development();
    let body_limit = state.config.max_upload_bytes + MULTIPART_OVERHEAD_BYTES;
    let cors = cors_layer(&state);

    let router = Router::new()
        .merge(protected_routes)
        .nest("/api/auth", auth_routes)
        .route("/api/ws", get(ws::connect))
        .route("/api/health", get(health::health_check))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .with_state(state)
        .layer(cors)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http());

    security_headers(router, production)
}
