//! Credential repository

use sqlx::PgPool;

use crate::db::models::CredentialRow;
use crate::models::{HealthStatus, NewCredential};

const CREDENTIAL_COLUMNS: &str =
    "id, provider_id, server_url, username, password, max_connections, is_active, health_status";

pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<CredentialRow>, sqlx::Error> {
    sqlx::query_as::<_, CredentialRow>(&format!(
        "SELECT {} FROM credentials WHERE id = $1",
        CREDENTIAL_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// All credentials, optionally restricted to one provider
pub async fn list(
    pool: &PgPool,
    provider_id: Option<i64>,
) -> Result<Vec<CredentialRow>, sqlx::Error> {
    match provider_id {
        Some(pid) => {
            sqlx::query_as::<_, CredentialRow>(&format!(
                "SELECT {} FROM credentials WHERE provider_id = $1 ORDER BY id",
                CREDENTIAL_COLUMNS
            ))
            .bind(pid)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, CredentialRow>(&format!(
                "SELECT {} FROM credentials ORDER BY id",
                CREDENTIAL_COLUMNS
            ))
            .fetch_all(pool)
            .await
        }
    }
}

/// Active credentials of a provider in insertion order
pub async fn active_for_provider(
    pool: &PgPool,
    provider_id: i64,
) -> Result<Vec<CredentialRow>, sqlx::Error> {
    sqlx::query_as::<_, CredentialRow>(&format!(
        "SELECT {} FROM credentials WHERE provider_id = $1 AND is_active = TRUE ORDER BY id",
        CREDENTIAL_COLUMNS
    ))
    .bind(provider_id)
    .fetch_all(pool)
    .await
}

pub async fn insert(
    pool: &PgPool,
    credential: &NewCredential,
) -> Result<CredentialRow, sqlx::Error> {
    sqlx::query_as::<_, CredentialRow>(&format!(
        r#"
        INSERT INTO credentials (provider_id, server_url, username, password, max_connections, is_active)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {}
        "#,
        CREDENTIAL_COLUMNS
    ))
    .bind(credential.provider_id)
    .bind(&credential.server_url)
    .bind(&credential.username)
    .bind(&credential.password)
    .bind(credential.max_connections)
    .bind(credential.is_active)
    .fetch_one(pool)
    .await
}

pub async fn update(
    pool: &PgPool,
    id: i64,
    credential: &NewCredential,
) -> Result<Option<CredentialRow>, sqlx::Error> {
    sqlx::query_as::<_, CredentialRow>(&format!(
        r#"
        UPDATE credentials
        SET provider_id = $2, server_url = $3, username = $4, password = $5,
            max_connections = $6, is_active = $7
        WHERE id = $1
        RETURNING {}
        "#,
        CREDENTIAL_COLUMNS
    ))
    .bind(id)
    .bind(credential.provider_id)
    .bind(&credential.server_url)
    .bind(&credential.username)
    .bind(&credential.password)
    .bind(credential.max_connections)
    .bind(credential.is_active)
    .fetch_optional(pool)
    .await
}

/// Delete a credential; its sessions cascade
pub async fn delete(pool: &PgPool, id: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM credentials WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

pub async fn set_health(pool: &PgPool, id: i64, status: HealthStatus) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE credentials SET health_status = $2 WHERE id = $1")
        .bind(id)
        .bind(status.to_string())
        .execute(pool)
        .await?;

    Ok(())
}
