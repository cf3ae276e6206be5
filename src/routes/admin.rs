//! Admin/Management endpoints: providers, credentials, failover mappings

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::AppError;
use crate::models::{
    CatalogChannel, Credential, HealthStatus, NewChannel, NewCredential, NewMapping, NewProvider,
    ProtocolKind, Provider,
};
use crate::routes::{api_error, is_http_url, ApiResult};
use crate::services::failover::{BulkOutcome, DEFAULT_SUGGESTION_LIMIT};
use crate::AppState;

/// Query params for admin operations
#[derive(Debug, Deserialize)]
pub struct AdminQuery {
    /// Admin key for authorization (simple protection)
    pub key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CredentialListQuery {
    pub key: Option<String>,
    pub provider_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SuggestionQuery {
    pub key: Option<String>,
    pub limit: Option<usize>,
    pub provider_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRequest {
    pub name: String,
    pub kind: ProtocolKind,
    pub base_url: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRequest {
    pub provider_id: Option<i64>,
    /// Legacy credentials carry their own server
    pub server_url: Option<String>,
    pub username: String,
    pub password: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingUpdateRequest {
    pub priority: Option<i32>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct BulkMappingRequest {
    pub mappings: Vec<NewMapping>,
}

#[derive(Debug, Deserialize)]
pub struct TestModeRequest {
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> i32 {
    1
}

/// Response for delete operations
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResponse {
    pub success: bool,
    pub message: String,
    pub released_sessions: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    pub channels: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upserted: Option<usize>,
}

/// Validate admin key
fn validate_admin_key(state: &AppState, provided_key: Option<&str>) -> ApiResult<()> {
    match provided_key {
        Some(key) if !state.config.admin_key.is_empty() && key == state.config.admin_key => Ok(()),
        _ => Err(api_error(StatusCode::UNAUTHORIZED, "Invalid or missing admin key")),
    }
}

async fn require_provider(state: &AppState, id: i64) -> ApiResult<Provider> {
    state
        .store
        .get_provider(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Provider {} not found", id)).into())
}

async fn require_credential(state: &AppState, id: i64) -> ApiResult<Credential> {
    state
        .store
        .get_credential(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Credential {} not found", id)).into())
}

// ============================================================================
// Providers
// ============================================================================

fn encrypt_provider(state: &AppState, request: ProviderRequest) -> ApiResult<NewProvider> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("Provider name is required".to_string()).into());
    }
    if !is_http_url(&request.base_url) {
        return Err(AppError::Validation("baseUrl must be an http(s) URL".to_string()).into());
    }
    let base_url = request.base_url.trim_end_matches('/');
    Ok(NewProvider {
        name: name.to_string(),
        kind: request.kind,
        base_url: state.credentials.codec().encrypt(base_url)?,
        is_active: request.is_active,
    })
}

/// GET /api/admin/providers
pub async fn list_providers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AdminQuery>,
) -> ApiResult<impl IntoResponse> {
    validate_admin_key(&state, query.key.as_deref())?;
    let providers = state.store.list_providers().await?;
    Ok(Json(providers))
}

/// POST /api/admin/providers
pub async fn create_provider(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AdminQuery>,
    Json(request): Json<ProviderRequest>,
) -> ApiResult<impl IntoResponse> {
    validate_admin_key(&state, query.key.as_deref())?;
    let new_provider = encrypt_provider(&state, request)?;
    let provider = state.store.create_provider(&new_provider).await?;

    tracing::info!(provider_id = provider.id, kind = %provider.kind, "Admin: provider created");
    Ok((StatusCode::CREATED, Json(provider)))
}

/// PUT /api/admin/providers/:id
pub async fn update_provider(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<AdminQuery>,
    Json(request): Json<ProviderRequest>,
) -> ApiResult<impl IntoResponse> {
    validate_admin_key(&state, query.key.as_deref())?;
    let new_provider = encrypt_provider(&state, request)?;
    let provider = state
        .store
        .update_provider(id, &new_provider)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Provider {} not found", id)))?;

    // Base URL or activity may have changed under cached clients
    state.credentials.invalidate_provider(id).await;

    tracing::info!(provider_id = id, "Admin: provider updated");
    Ok(Json(provider))
}

/// DELETE /api/admin/providers/:id
pub async fn delete_provider(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<AdminQuery>,
) -> ApiResult<impl IntoResponse> {
    validate_admin_key(&state, query.key.as_deref())?;
    require_provider(&state, id).await?;

    let mut released = 0;
    for credential in state.store.list_credentials(Some(id)).await? {
        released += state.admission.release_credential(credential.id).await?;
    }
    state.credentials.invalidate_provider(id).await;
    state.store.delete_provider(id).await?;

    tracing::info!(provider_id = id, released, "Admin: provider deleted");
    Ok(Json(DeleteResponse {
        success: true,
        message: format!("Provider {} deleted", id),
        released_sessions: released,
    }))
}

/// POST /api/admin/providers/:id/sync
/// Refresh the upstream catalog through the first usable credential and
/// upsert it into the channel table.
pub async fn sync_provider(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<AdminQuery>,
) -> ApiResult<impl IntoResponse> {
    validate_admin_key(&state, query.key.as_deref())?;
    let provider = require_provider(&state, id).await?;
    if provider.kind == ProtocolKind::M3u {
        return Err(AppError::Validation("M3U providers cannot be synced".to_string()).into());
    }

    let mut last_error = None;
    for credential in state.store.active_credentials_for_provider(id).await? {
        let client = match state.credentials.get_client(credential.id).await {
            Ok(c) => c,
            Err(e) => {
                last_error = Some(e);
                continue;
            }
        };
        match client.refresh().await {
            Ok(catalog) => {
                let rows: Vec<NewChannel> = catalog.channels.iter().map(to_new_channel).collect();
                let upserted = state.store.upsert_channels(id, &rows).await?;
                state.credentials.user_catalogs().invalidate_all().await;
                tracing::info!(
                    provider_id = id,
                    credential_id = credential.id,
                    channels = rows.len(),
                    "Admin: provider catalog synced"
                );
                return Ok(Json(SyncResponse {
                    success: true,
                    channels: rows.len(),
                    upserted: Some(upserted),
                }));
            }
            Err(e) => {
                tracing::warn!(credential_id = credential.id, "Sync through credential failed: {}", e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| AppError::Validation("Provider has no active credential".to_string()))
        .into())
}

fn to_new_channel(channel: &CatalogChannel) -> NewChannel {
    NewChannel {
        stream_id: channel.stream_id.clone(),
        name: channel.name.clone(),
        logo: channel.logo.clone(),
        category_id: channel.category_id.clone(),
        category_name: channel.category_name.clone(),
        epg_channel_id: channel.epg_channel_id.clone(),
    }
}

/// POST /api/admin/providers/:id/health-check
pub async fn health_check_provider(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<AdminQuery>,
) -> ApiResult<impl IntoResponse> {
    validate_admin_key(&state, query.key.as_deref())?;
    let report = state.health.check_provider_by_id(id).await?;
    Ok(Json(report))
}

// ============================================================================
// Credentials
// ============================================================================

async fn encrypt_credential(
    state: &AppState,
    request: CredentialRequest,
) -> ApiResult<NewCredential> {
    if request.username.trim().is_empty() || request.password.is_empty() {
        return Err(AppError::Validation("username and password are required".to_string()).into());
    }
    if request.max_connections < 1 {
        return Err(AppError::Validation("maxConnections must be at least 1".to_string()).into());
    }
    match (request.provider_id, request.server_url.as_deref()) {
        (Some(provider_id), _) => {
            require_provider(state, provider_id).await?;
        }
        (None, Some(url)) if is_http_url(url) => {}
        _ => {
            return Err(AppError::Validation(
                "Either providerId or an http(s) serverUrl is required".to_string(),
            )
            .into())
        }
    }

    let codec = state.credentials.codec();
    let server_url = match request.server_url.as_deref() {
        Some(url) => Some(codec.encrypt(url.trim_end_matches('/'))?),
        None => None,
    };
    Ok(NewCredential {
        provider_id: request.provider_id,
        server_url,
        username: codec.encrypt(request.username.trim())?,
        password: codec.encrypt(&request.password)?,
        max_connections: request.max_connections,
        is_active: request.is_active,
    })
}

/// GET /api/admin/credentials?provider_id=
pub async fn list_credentials(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CredentialListQuery>,
) -> ApiResult<impl IntoResponse> {
    validate_admin_key(&state, query.key.as_deref())?;
    let credentials = state.store.list_credentials(query.provider_id).await?;
    Ok(Json(credentials))
}

/// POST /api/admin/credentials
pub async fn create_credential(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AdminQuery>,
    Json(request): Json<CredentialRequest>,
) -> ApiResult<impl IntoResponse> {
    validate_admin_key(&state, query.key.as_deref())?;
    let new_credential = encrypt_credential(&state, request).await?;
    let credential = state.store.create_credential(&new_credential).await?;

    // New plan membership changes merged catalogs
    state.credentials.reload_credential(credential.id).await?;

    tracing::info!(credential_id = credential.id, "Admin: credential created");
    Ok((StatusCode::CREATED, Json(credential)))
}

/// PUT /api/admin/credentials/:id
pub async fn update_credential(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<AdminQuery>,
    Json(request): Json<CredentialRequest>,
) -> ApiResult<impl IntoResponse> {
    validate_admin_key(&state, query.key.as_deref())?;
    let new_credential = encrypt_credential(&state, request).await?;
    let credential = state
        .store
        .update_credential(id, &new_credential)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Credential {} not found", id)))?;

    if !credential.is_active {
        state.admission.release_credential(id).await?;
    }
    state.credentials.reload_credential(id).await?;

    tracing::info!(credential_id = id, "Admin: credential updated");
    Ok(Json(credential))
}

/// DELETE /api/admin/credentials/:id
pub async fn delete_credential(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<AdminQuery>,
) -> ApiResult<impl IntoResponse> {
    validate_admin_key(&state, query.key.as_deref())?;
    require_credential(&state, id).await?;

    let released = state.admission.release_credential(id).await?;
    state.store.delete_credential(id).await?;
    state.credentials.remove_credential(id).await;

    tracing::info!(credential_id = id, released, "Admin: credential deleted");
    Ok(Json(DeleteResponse {
        success: true,
        message: format!("Credential {} deleted", id),
        released_sessions: released,
    }))
}

/// POST /api/admin/credentials/:id/sync
pub async fn sync_credential(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<AdminQuery>,
) -> ApiResult<impl IntoResponse> {
    validate_admin_key(&state, query.key.as_deref())?;
    let client = state.credentials.get_client(id).await?;
    let catalog = client.refresh().await?;
    state.credentials.user_catalogs().invalidate_all().await;

    Ok(Json(SyncResponse {
        success: true,
        channels: catalog.channels.len(),
        upserted: None,
    }))
}

/// POST /api/admin/credentials/:id/test
pub async fn test_credential(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<AdminQuery>,
) -> ApiResult<impl IntoResponse> {
    validate_admin_key(&state, query.key.as_deref())?;
    let client = state.credentials.get_client(id).await?;

    match client.authenticate().await {
        Ok(account) => {
            state
                .store
                .set_credential_health(id, HealthStatus::Healthy)
                .await?;
            Ok(Json(serde_json::json!({ "success": true, "account": account })))
        }
        Err(e @ (AppError::Auth(_) | AppError::UpstreamUnavailable(_))) => {
            state
                .store
                .set_credential_health(id, HealthStatus::Unhealthy)
                .await?;
            tracing::warn!(credential_id = id, "Credential test failed: {}", e);
            Ok(Json(serde_json::json!({ "success": false, "error": e.to_string() })))
        }
        Err(e) => Err(e.into()),
    }
}

/// GET /api/admin/credentials/:id/sessions
pub async fn credential_sessions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<AdminQuery>,
) -> ApiResult<impl IntoResponse> {
    validate_admin_key(&state, query.key.as_deref())?;
    let credential = require_credential(&state, id).await?;
    let sessions = state.admission.active_streams_for_credential(id).await?;
    let cutoff = state.admission.cutoff();
    let active = sessions.iter().filter(|s| s.is_fresh(cutoff)).count();

    Ok(Json(serde_json::json!({
        "credentialId": id,
        "maxConnections": credential.max_connections,
        "active": active,
        "sessions": sessions,
    })))
}

// ============================================================================
// Failover mappings
// ============================================================================

/// GET /api/admin/mappings
pub async fn list_mappings(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AdminQuery>,
) -> ApiResult<impl IntoResponse> {
    validate_admin_key(&state, query.key.as_deref())?;
    Ok(Json(state.failover.list_mappings().await?))
}

/// POST /api/admin/mappings
pub async fn create_mapping(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AdminQuery>,
    Json(request): Json<NewMapping>,
) -> ApiResult<impl IntoResponse> {
    validate_admin_key(&state, query.key.as_deref())?;
    let mapping = state
        .failover
        .create_mapping(
            request.primary_channel_id,
            request.backup_channel_id,
            request.priority,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(mapping)))
}

/// PUT /api/admin/mappings/:id
pub async fn update_mapping(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<AdminQuery>,
    Json(request): Json<MappingUpdateRequest>,
) -> ApiResult<impl IntoResponse> {
    validate_admin_key(&state, query.key.as_deref())?;
    let mapping = state
        .failover
        .update_mapping(id, request.priority, request.is_active)
        .await?;
    Ok(Json(mapping))
}

/// DELETE /api/admin/mappings/:id
pub async fn delete_mapping(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<AdminQuery>,
) -> ApiResult<impl IntoResponse> {
    validate_admin_key(&state, query.key.as_deref())?;
    state.failover.delete_mapping(id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

/// GET /api/admin/channels/:id/backups
pub async fn channel_backups(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<AdminQuery>,
) -> ApiResult<impl IntoResponse> {
    validate_admin_key(&state, query.key.as_deref())?;
    Ok(Json(state.failover.get_backup_channels(id).await?))
}

/// GET /api/admin/mappings/suggestions/:channel_id?limit=&provider_id=
pub async fn mapping_suggestions(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<i64>,
    Query(query): Query<SuggestionQuery>,
) -> ApiResult<impl IntoResponse> {
    validate_admin_key(&state, query.key.as_deref())?;
    let limit = query.limit.unwrap_or(DEFAULT_SUGGESTION_LIMIT);
    let suggestions = match query.provider_id {
        Some(provider_id) => {
            state
                .failover
                .suggest_mappings_for_provider(channel_id, provider_id, limit)
                .await?
        }
        None => state.failover.suggest_mappings(channel_id, limit).await?,
    };
    Ok(Json(suggestions))
}

/// POST /api/admin/mappings/bulk
pub async fn bulk_create_mappings(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AdminQuery>,
    Json(request): Json<BulkMappingRequest>,
) -> ApiResult<impl IntoResponse> {
    validate_admin_key(&state, query.key.as_deref())?;
    let results = state.failover.bulk_create_mappings(&request.mappings).await;
    let created = results
        .iter()
        .filter(|r| matches!(r.outcome, BulkOutcome::Created { .. }))
        .count();

    tracing::info!(requested = request.mappings.len(), created, "Admin: bulk mapping create");
    Ok(Json(serde_json::json!({
        "created": created,
        "results": results,
    })))
}

/// POST /api/admin/failover/:stream_id/test
/// Diagnostics only: nothing is leased.
pub async fn test_failover(
    State(state): State<Arc<AppState>>,
    Path(stream_id): Path<String>,
    Query(query): Query<AdminQuery>,
) -> ApiResult<impl IntoResponse> {
    validate_admin_key(&state, query.key.as_deref())?;
    let primary = state.failover.find_primary_channel(&stream_id).await?;
    let decision = state.failover.resolve_failover(&primary).await?;
    let credential = match decision.selected.as_ref() {
        Some(selected) => {
            state
                .admission
                .select_credential_for_backup_stream(&selected.stream_id)
                .await?
        }
        None => None,
    };

    Ok(Json(serde_json::json!({
        "decision": decision,
        "credential": credential,
    })))
}

/// POST /api/admin/failover/:stream_id/test-mode
pub async fn set_test_mode(
    State(state): State<Arc<AppState>>,
    Path(stream_id): Path<String>,
    Query(query): Query<AdminQuery>,
    Json(request): Json<TestModeRequest>,
) -> ApiResult<impl IntoResponse> {
    validate_admin_key(&state, query.key.as_deref())?;
    state.failover.set_test_mode(&stream_id, request.enabled);
    Ok(Json(serde_json::json!({
        "streamId": stream_id,
        "testMode": request.enabled,
    })))
}

/// GET /api/admin/failover/test-mode
pub async fn list_test_mode(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AdminQuery>,
) -> ApiResult<impl IntoResponse> {
    validate_admin_key(&state, query.key.as_deref())?;
    Ok(Json(state.failover.test_mode_streams()))
}
