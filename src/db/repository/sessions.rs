//! Active stream session (lease) repository

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::db::models::SessionRow;
use crate::models::NewSession;

const SESSION_COLUMNS: &str = "id, user_id, stream_id, credential_id, session_token, \
                               started_at, last_heartbeat, ip_address";

pub async fn find_by_user_stream(
    pool: &PgPool,
    user_id: i64,
    stream_id: &str,
) -> Result<Option<SessionRow>, sqlx::Error> {
    sqlx::query_as::<_, SessionRow>(&format!(
        "SELECT {} FROM active_stream_sessions WHERE user_id = $1 AND stream_id = $2",
        SESSION_COLUMNS
    ))
    .bind(user_id)
    .bind(stream_id)
    .fetch_optional(pool)
    .await
}

pub async fn find_by_token(pool: &PgPool, token: &str) -> Result<Option<SessionRow>, sqlx::Error> {
    sqlx::query_as::<_, SessionRow>(&format!(
        "SELECT {} FROM active_stream_sessions WHERE session_token = $1",
        SESSION_COLUMNS
    ))
    .bind(token)
    .fetch_optional(pool)
    .await
}

/// Sessions on a credential whose heartbeat is not older than `cutoff`
pub async fn count_fresh_for_credential(
    pool: &PgPool,
    credential_id: i64,
    cutoff: DateTime<Utc>,
) -> Result<i64, sqlx::Error> {
    let count: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM active_stream_sessions WHERE credential_id = $1 AND last_heartbeat >= $2",
    )
    .bind(credential_id)
    .bind(cutoff)
    .fetch_one(pool)
    .await?;

    Ok(count.0)
}

/// Insert a lease only while the credential is below `max_connections`.
///
/// The count and the insert run in one transaction holding an advisory lock
/// keyed by the credential id, so concurrent admissions on other server
/// instances cannot both take the last slot. Returns `None` when full. A
/// duplicate `(user_id, stream_id)` is not swallowed: it fails on the unique
/// key (23505), which `AppError` maps to `AlreadyExists`.
pub async fn insert_if_below_capacity(
    pool: &PgPool,
    session: &NewSession,
    max_connections: i32,
    cutoff: DateTime<Utc>,
) -> Result<Option<SessionRow>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(session.credential_id)
        .execute(&mut *tx)
        .await?;

    let row = sqlx::query_as::<_, SessionRow>(&format!(
        r#"
        INSERT INTO active_stream_sessions (user_id, stream_id, credential_id, session_token, ip_address)
        SELECT $1, $2, $3, $4, $5
        WHERE (
            SELECT COUNT(*) FROM active_stream_sessions
            WHERE credential_id = $3 AND last_heartbeat >= $7
        ) < $6
        RETURNING {}
        "#,
        SESSION_COLUMNS
    ))
    .bind(session.user_id)
    .bind(&session.stream_id)
    .bind(session.credential_id)
    .bind(&session.session_token)
    .bind(&session.ip_address)
    .bind(i64::from(max_connections))
    .bind(cutoff)
    .fetch_optional(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(row)
}

/// Refresh a heartbeat. Rows already older than `cutoff` are left for the sweep.
pub async fn touch(
    pool: &PgPool,
    token: &str,
    at: DateTime<Utc>,
    cutoff: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE active_stream_sessions SET last_heartbeat = $2 \
         WHERE session_token = $1 AND last_heartbeat >= $3",
    )
    .bind(token)
    .bind(at)
    .bind(cutoff)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn delete_by_token(pool: &PgPool, token: &str) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM active_stream_sessions WHERE session_token = $1")
        .bind(token)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

pub async fn get_by_credential(
    pool: &PgPool,
    credential_id: i64,
) -> Result<Vec<SessionRow>, sqlx::Error> {
    sqlx::query_as::<_, SessionRow>(&format!(
        "SELECT {} FROM active_stream_sessions WHERE credential_id = $1 ORDER BY started_at",
        SESSION_COLUMNS
    ))
    .bind(credential_id)
    .fetch_all(pool)
    .await
}

/// Delete sessions whose heartbeat is older than `cutoff`, returning them
pub async fn delete_stale(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<SessionRow>, sqlx::Error> {
    sqlx::query_as::<_, SessionRow>(&format!(
        "DELETE FROM active_stream_sessions WHERE last_heartbeat < $1 RETURNING {}",
        SESSION_COLUMNS
    ))
    .bind(cutoff)
    .fetch_all(pool)
    .await
}

pub async fn delete_by_credential(pool: &PgPool, credential_id: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM active_stream_sessions WHERE credential_id = $1")
        .bind(credential_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}
