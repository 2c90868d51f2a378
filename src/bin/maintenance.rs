use std::{env, time::Duration};

use anyhow::{bail, Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use diesel::prelude::*;

use docchat::{config::AppConfig, db, init_tracing, jobs::requeue_stale_jobs, schema::refresh_tokens};

const USAGE: &str = "Usage: maintenance <purge-refresh-tokens | requeue-stale-jobs <minutes>>";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("purge-refresh-tokens") => purge_refresh_tokens(),
        Some("requeue-stale-jobs") => {
            let minutes: u64 = args
                .next()
                .context(USAGE)?
                .parse()
                .context("minutes must be a positive integer")?;
            requeue_stale(minutes)
        }
        Some(cmd) => bail!("unknown command: {cmd}\n{USAGE}"),
        None => bail!(USAGE),
    }
}

fn connect() -> Result<db::PgPool> {
    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        "loaded configuration"
    );
    db::init_pool_with_size(&config.database_url, 1)
}

fn purge_refresh_tokens() -> Result<()> {
    let pool = connect()?;
    let mut conn = pool.get().context("failed to get database connection")?;
    let now = Utc::now().naive_utc();
    let revoked_cutoff = now - ChronoDuration::days(1);

    let deleted = diesel::delete(
        refresh_tokens::table.filter(
            refresh_tokens::expires_at
                .le(now)
                .or(refresh_tokens::revoked_at.le(revoked_cutoff)),
        ),
    )
    .execute(&mut conn)
    .context("failed to delete refresh tokens")?;

    println!("Removed {deleted} expired or revoked refresh tokens.");
    Ok(())
}

fn requeue_stale(minutes: u64) -> Result<()> {
    let pool = connect()?;
    let mut conn = pool.get().context("failed to get database connection")?;
    let requeued = requeue_stale_jobs(&mut conn, Duration::from_secs(minutes * 60))
        .context("failed to requeue jobs")?;
    println!("Requeued {requeued} jobs stuck for more than {minutes} minutes.");
    Ok(())
}
