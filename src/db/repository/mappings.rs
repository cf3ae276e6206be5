//! Channel mapping (failover edge) repository

use sqlx::PgPool;

use crate::db::models::MappingRow;

const MAPPING_COLUMNS: &str =
    "id, primary_channel_id, backup_channel_id, priority, is_active, created_at";

pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<MappingRow>, sqlx::Error> {
    sqlx::query_as::<_, MappingRow>(&format!(
        "SELECT {} FROM channel_mappings WHERE id = $1",
        MAPPING_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Mappings of a primary channel in try-order
pub async fn get_by_primary(
    pool: &PgPool,
    primary_channel_id: i64,
) -> Result<Vec<MappingRow>, sqlx::Error> {
    sqlx::query_as::<_, MappingRow>(&format!(
        "SELECT {} FROM channel_mappings WHERE primary_channel_id = $1 ORDER BY priority, id",
        MAPPING_COLUMNS
    ))
    .bind(primary_channel_id)
    .fetch_all(pool)
    .await
}

pub async fn list_all(pool: &PgPool) -> Result<Vec<MappingRow>, sqlx::Error> {
    sqlx::query_as::<_, MappingRow>(&format!(
        "SELECT {} FROM channel_mappings ORDER BY primary_channel_id, priority, id",
        MAPPING_COLUMNS
    ))
    .fetch_all(pool)
    .await
}

pub async fn insert(
    pool: &PgPool,
    primary_channel_id: i64,
    backup_channel_id: i64,
    priority: i32,
) -> Result<MappingRow, sqlx::Error> {
    sqlx::query_as::<_, MappingRow>(&format!(
        r#"
        INSERT INTO channel_mappings (primary_channel_id, backup_channel_id, priority)
        VALUES ($1, $2, $3)
        RETURNING {}
        "#,
        MAPPING_COLUMNS
    ))
    .bind(primary_channel_id)
    .bind(backup_channel_id)
    .bind(priority)
    .fetch_one(pool)
    .await
}

pub async fn update(
    pool: &PgPool,
    id: i64,
    priority: Option<i32>,
    is_active: Option<bool>,
) -> Result<Option<MappingRow>, sqlx::Error> {
    sqlx::query_as::<_, MappingRow>(&format!(
        r#"
        UPDATE channel_mappings
        SET priority = COALESCE($2, priority), is_active = COALESCE($3, is_active)
        WHERE id = $1
        RETURNING {}
        "#,
        MAPPING_COLUMNS
    ))
    .bind(id)
    .bind(priority)
    .bind(is_active)
    .fetch_optional(pool)
    .await
}

pub async fn delete(pool: &PgPool, id: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM channel_mappings WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}
