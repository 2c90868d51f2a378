use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use tracing::warn;

use crate::{error::AppError, state::AppState};

const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";

/// Sliding-window request counter keyed by client.
pub struct RateLimiter {
    hits: DashMap<String, VecDeque<Instant>>,
    limit: u32,
    window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed { remaining: u32 },
    Limited,
}

impl RateLimiter {
    pub fn new(limit: u32, window_secs: u64) -> Self {
        Self {
            hits: DashMap::new(),
            limit,
            window: Duration::from_secs(window_secs),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window_secs(&self) -> u64 {
        self.window.as_secs()
    }

    pub fn check(&self, key: &str) -> Decision {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Decision {
        let mut hits = self.hits.entry(key.to_string()).or_default();
        while let Some(oldest) = hits.front() {
            if now.duration_since(*oldest) >= self.window {
                hits.pop_front();
            } else {
                break;
            }
        }

        if hits.len() as u32 >= self.limit {
            return Decision::Limited;
        }

        hits.push_back(now);
        Decision::Allowed {
            remaining: self.limit.saturating_sub(hits.len() as u32),
        }
    }

    /// Drops keys whose window has fully elapsed.
    pub fn purge_idle(&self) {
        let now = Instant::now();
        self.hits.retain(|_, hits| {
            hits.back()
                .map(|last| now.duration_since(*last) < self.window)
                .unwrap_or(false)
        });
    }
}

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let client_ip = client_ip(&request);
    let path = request.uri().path().to_string();

    let (limiter, key) = if is_credential_path(&path) {
        (&state.login_limiter, format!("{client_ip}:{path}"))
    } else {
        (&state.api_limiter, client_ip.clone())
    };

    match limiter.check(&key) {
        Decision::Limited => {
            warn!(client_ip = %client_ip, path = %path, "rate limit exceeded");
            let mut response = AppError::too_many_requests(limiter.window_secs()).into_response();
            set_limit_headers(response.headers_mut(), limiter, 0);
            response
        }
        Decision::Allowed { remaining } => {
            if rand::random::<u8>() < 4 {
                limiter.purge_idle();
            }
            let mut response = next.run(request).await;
            set_limit_headers(response.headers_mut(), limiter, remaining);
            response
        }
    }
}

fn is_credential_path(path: &str) -> bool {
    path.starts_with("/api/auth/login") || path.starts_with("/api/auth/register")
}

fn client_ip(request: &Request) -> String {
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }

    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn set_limit_headers(headers: &mut HeaderMap, limiter: &RateLimiter, remaining: u32) {
    let reset = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|now| now.as_secs())
        .unwrap_or_default()
        + limiter.window_secs();

    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limiter.limit()));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset));
}
