//! Subscriber catalog endpoints

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::{CatalogCategory, CatalogChannel};
use crate::routes::{user_id_from, ApiResult};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ChannelsQuery {
    pub category_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EpgQuery {
    pub limit: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsResponse {
    pub total: usize,
    pub channels: Vec<CatalogChannel>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoriesResponse {
    pub total: usize,
    pub categories: Vec<CatalogCategory>,
}

/// GET /api/catalog/channels?category_id=
pub async fn list_channels(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ChannelsQuery>,
) -> ApiResult<impl IntoResponse> {
    let user_id = user_id_from(&headers)?;
    let category = query.category_id.as_deref().filter(|c| !c.is_empty());
    let channels = state.resolver.get_merged_channels(user_id, category).await?;

    Ok(Json(ChannelsResponse {
        total: channels.len(),
        channels,
    }))
}

/// GET /api/catalog/categories
pub async fn list_categories(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let user_id = user_id_from(&headers)?;
    let categories = state.resolver.get_categories(user_id).await?;

    Ok(Json(CategoriesResponse {
        total: categories.len(),
        categories,
    }))
}

/// GET /api/catalog/channels/:stream_id/epg?limit=
pub async fn channel_epg(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(stream_id): Path<String>,
    Query(query): Query<EpgQuery>,
) -> ApiResult<impl IntoResponse> {
    let user_id = user_id_from(&headers)?;
    let epg = state
        .resolver
        .get_short_epg(user_id, &stream_id, query.limit)
        .await?;
    Ok(Json(epg))
}
