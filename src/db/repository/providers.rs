//! Provider repository

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::db::models::ProviderRow;
use crate::models::{HealthStatus, NewProvider};

const PROVIDER_COLUMNS: &str =
    "id, name, kind, base_url, is_active, health_status, last_health_check";

pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<ProviderRow>, sqlx::Error> {
    sqlx::query_as::<_, ProviderRow>(&format!(
        "SELECT {} FROM providers WHERE id = $1",
        PROVIDER_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn list_all(pool: &PgPool) -> Result<Vec<ProviderRow>, sqlx::Error> {
    sqlx::query_as::<_, ProviderRow>(&format!(
        "SELECT {} FROM providers ORDER BY id",
        PROVIDER_COLUMNS
    ))
    .fetch_all(pool)
    .await
}

pub async fn insert(pool: &PgPool, provider: &NewProvider) -> Result<ProviderRow, sqlx::Error> {
    sqlx::query_as::<_, ProviderRow>(&format!(
        r#"
        INSERT INTO providers (name, kind, base_url, is_active)
        VALUES ($1, $2, $3, $4)
        RETURNING {}
        "#,
        PROVIDER_COLUMNS
    ))
    .bind(&provider.name)
    .bind(provider.kind.to_string())
    .bind(&provider.base_url)
    .bind(provider.is_active)
    .fetch_one(pool)
    .await
}

pub async fn update(
    pool: &PgPool,
    id: i64,
    provider: &NewProvider,
) -> Result<Option<ProviderRow>, sqlx::Error> {
    sqlx::query_as::<_, ProviderRow>(&format!(
        r#"
        UPDATE providers
        SET name = $2, kind = $3, base_url = $4, is_active = $5
        WHERE id = $1
        RETURNING {}
        "#,
        PROVIDER_COLUMNS
    ))
    .bind(id)
    .bind(&provider.name)
    .bind(provider.kind.to_string())
    .bind(&provider.base_url)
    .bind(provider.is_active)
    .fetch_optional(pool)
    .await
}

/// Delete a provider; credentials, channels, mappings and sessions cascade
pub async fn delete(pool: &PgPool, id: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM providers WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

pub async fn set_health(
    pool: &PgPool,
    id: i64,
    status: HealthStatus,
    checked_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE providers SET health_status = $2, last_health_check = $3 WHERE id = $1")
        .bind(id)
        .bind(status.to_string())
        .bind(checked_at)
        .execute(pool)
        .await?;

    Ok(())
}
