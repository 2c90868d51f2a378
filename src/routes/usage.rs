use axum::extract::{Json, State};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel::PgConnection;
use serde::Serialize;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::AppResult;
use crate::models::{NewUserUsage, UserUsage};
use crate::schema::user_usage;
use crate::state::AppState;

#[derive(Serialize)]
pub struct UsageEntry {
    pub month: String,
    pub model: String,
    pub tokens_used: i64,
}

#[derive(Serialize)]
pub struct UsageResponse {
    pub usage: Vec<UsageEntry>,
}

/// Billing bucket for a point in time, e.g. `2025-01`.
pub(crate) fn usage_month(at: NaiveDateTime) -> String {
    at.format("%Y-%m").to_string()
}

/// Adds `tokens` to the user's counter for the month of `at`.
pub(crate) fn record_usage(
    conn: &mut PgConnection,
    user_id: Uuid,
    model: &str,
    tokens: i64,
    at: NaiveDateTime,
) -> QueryResult<()> {
    if tokens <= 0 {
        return Ok(());
    }

    diesel::insert_into(user_usage::table)
        .values(&NewUserUsage {
            user_id,
            month: usage_month(at),
            model: model.to_string(),
            tokens_used: tokens,
        })
        .on_conflict((user_usage::user_id, user_usage::month, user_usage::model))
        .do_update()
        .set((
            user_usage::tokens_used.eq(user_usage::tokens_used + excluded(user_usage::tokens_used)),
            user_usage::updated_at.eq(at),
        ))
        .execute(conn)?;
    Ok(())
}

pub async fn my_usage(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<UsageResponse>> {
    let mut conn = state.db()?;
    let rows: Vec<UserUsage> = user_usage::table
        .filter(user_usage::user_id.eq(user.user_id))
        .order((user_usage::month.desc(), user_usage::model.asc()))
        .load(&mut conn)?;

    Ok(Json(UsageResponse {
        usage: rows
            .into_iter()
            .map(|row| UsageEntry {
                month: row.month,
                model: row.model,
                tokens_used: row.tokens_used,
            })
            .collect(),
    }))
}
