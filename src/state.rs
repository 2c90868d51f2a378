use std::sync::Arc;

use diesel::{
    pg::PgConnection,
    r2d2::{ConnectionManager, PooledConnection},
};

use crate::{
    auth::jwt::JwtService,
    chat::ChatEngine,
    config::AppConfig,
    db::PgPool,
    error::{AppError, AppResult},
    events::EventHub,
    rate_limit::RateLimiter,
    storage::ObjectStorage,
};

type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub storage: Arc<dyn ObjectStorage>,
    pub jwt: JwtService,
    pub chat: Arc<dyn ChatEngine>,
    pub events: Arc<EventHub>,
    pub login_limiter: Arc<RateLimiter>,
    pub api_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: AppConfig,
        storage: Arc<dyn ObjectStorage>,
        jwt: JwtService,
        chat: Arc<dyn ChatEngine>,
    ) -> Self {
        let login_limiter = Arc::new(RateLimiter::new(
            config.login_rate_limit,
            config.login_rate_limit_window_secs,
        ));
        let api_limiter = Arc::new(RateLimiter::new(
            config.api_rate_limit,
            config.api_rate_limit_window_secs,
        ));
        Self {
            pool,
            config: Arc::new(config),
            storage,
            jwt,
            chat,
            events: Arc::new(EventHub::new()),
            login_limiter,
            api_limiter,
        }
    }

    pub fn db(&self) -> AppResult<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))
    }
}
