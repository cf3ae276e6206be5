//! Channel repository

use sqlx::PgPool;

use crate::db::models::ChannelRow;
use crate::models::NewChannel;

const CHANNEL_COLUMNS: &str = "id, provider_id, stream_id, name, logo, category_id, \
                               category_name, epg_channel_id, is_enabled";

pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<ChannelRow>, sqlx::Error> {
    sqlx::query_as::<_, ChannelRow>(&format!(
        "SELECT {} FROM channels WHERE id = $1",
        CHANNEL_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn get_by_provider(
    pool: &PgPool,
    provider_id: i64,
) -> Result<Vec<ChannelRow>, sqlx::Error> {
    sqlx::query_as::<_, ChannelRow>(&format!(
        "SELECT {} FROM channels WHERE provider_id = $1 ORDER BY name, id",
        CHANNEL_COLUMNS
    ))
    .bind(provider_id)
    .fetch_all(pool)
    .await
}

/// All channels (any provider) carrying this upstream stream id
pub async fn find_by_stream_id(
    pool: &PgPool,
    stream_id: &str,
) -> Result<Vec<ChannelRow>, sqlx::Error> {
    sqlx::query_as::<_, ChannelRow>(&format!(
        "SELECT {} FROM channels WHERE stream_id = $1 ORDER BY id",
        CHANNEL_COLUMNS
    ))
    .bind(stream_id)
    .fetch_all(pool)
    .await
}

/// Insert or refresh channels of a provider, keyed by `(provider_id, stream_id)`.
///
/// `is_enabled` of existing rows is left alone so admin choices survive a sync.
pub async fn upsert_many(
    pool: &PgPool,
    provider_id: i64,
    channels: &[NewChannel],
) -> Result<usize, sqlx::Error> {
    if channels.is_empty() {
        return Ok(0);
    }

    let mut tx = pool.begin().await?;
    let mut count = 0;

    for channel in channels {
        sqlx::query(
            r#"
            INSERT INTO channels (provider_id, stream_id, name, logo, category_id, category_name, epg_channel_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (provider_id, stream_id) DO UPDATE SET
                name = EXCLUDED.name,
                logo = EXCLUDED.logo,
                category_id = EXCLUDED.category_id,
                category_name = EXCLUDED.category_name,
                epg_channel_id = EXCLUDED.epg_channel_id
            "#,
        )
        .bind(provider_id)
        .bind(&channel.stream_id)
        .bind(&channel.name)
        .bind(&channel.logo)
        .bind(&channel.category_id)
        .bind(&channel.category_name)
        .bind(&channel.epg_channel_id)
        .execute(&mut *tx)
        .await?;
        count += 1;
    }

    tx.commit().await?;
    Ok(count)
}
