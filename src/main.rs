use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{net::TcpListener, signal};
use tracing::{info, warn};

use docchat::{
    auth::jwt::JwtService, chat::engine_from_config, config::AppConfig, create_router, db,
    default_handlers, init_tracing, state::AppState, storage::S3Storage, Worker,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    info!(
        component = "server",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        s3_bucket = %config.s3_bucket,
        environment = %config.environment,
        chat_enabled = config.openai_api_key.is_some(),
        worker_enabled = config.worker_enabled,
        "loaded configuration"
    );

    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    let applied = db::run_migrations(&pool)?;
    if applied > 0 {
        info!(applied, "database migrations applied");
    }

    let storage = Arc::new(S3Storage::connect(&config).await?);
    let jwt = JwtService::from_config(&config)?;
    let chat = engine_from_config(&config);
    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port).parse()?;
    let worker_enabled = config.worker_enabled;
    let poll_interval = Duration::from_secs(config.worker_poll_interval_secs.max(1));

    let state = AppState::new(pool, config, storage, jwt, chat);

    if worker_enabled {
        let worker = Worker::new(Arc::new(state.clone()), default_handlers(), poll_interval);
        tokio::spawn(async move { worker.run().await });
    } else {
        warn!("document worker disabled; uploads will stay pending");
    }

    let app = create_router(state);
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}
