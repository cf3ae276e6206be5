mod config;
mod db;
mod error;
mod metrics;
mod models;
mod routes;
mod services;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::db::{create_pool, run_migrations, PgStore, Store};
use crate::services::{
    admission::AdmissionController,
    cache::CatalogDiskCache,
    catalog::{CatalogResolver, UserCatalogCache},
    cleanup::{start_cleanup_task, CleanupConfig, CleanupTargets},
    crypto::SecretsCodec,
    failover::FailoverEngine,
    health::{start_health_task, HealthMonitor},
    playback::{HttpProber, PlaybackSelector, StreamProber},
    pool::{http_api_factory, CredentialPool},
    streaming::StreamingService,
};
use sqlx::PgPool;

/// Application state shared across handlers
pub struct AppState {
    pub config: Config,
    pub pool: PgPool,
    pub store: Arc<dyn Store>,
    pub credentials: Arc<CredentialPool>,
    pub resolver: CatalogResolver,
    pub admission: Arc<AdmissionController>,
    pub failover: Arc<FailoverEngine>,
    pub playback: Arc<PlaybackSelector>,
    pub streaming: Arc<StreamingService>,
    pub health: Arc<HealthMonitor>,
    /// Client for proxied media
    pub http: reqwest::Client,
    pub start_time: Instant,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing/logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "xtreamhub_server=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // Load configuration
    let config = Config::from_env();
    let port = config.port;

    tracing::info!("Starting XtreamHub Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Environment: {}", config.node_env);

    let codec = SecretsCodec::from_hex_key(&config.secrets_key)
        .map_err(|e| anyhow::anyhow!("SECRETS_KEY is unusable: {}", e))?;

    // Initialize PostgreSQL connection pool
    let pool = create_pool(&config).await?;
    tracing::info!("PostgreSQL connected");

    if config.run_migrations {
        run_migrations(&pool).await?;
        tracing::info!("Database migrations completed");
    }

    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));

    // Catalog snapshots survive restarts; secrets never reach the disk
    let disk = CatalogDiskCache::new(&config.catalog_cache_dir).await?;
    tracing::info!("Catalog disk cache initialized: {}", config.catalog_cache_dir);

    let user_catalogs = Arc::new(UserCatalogCache::new(config.user_catalog_ttl()));
    let factory = http_api_factory(
        Duration::from_millis(config.upstream_timeout_ms),
        config.user_agent.clone(),
    );
    let mut credential_pool = CredentialPool::new(store.clone(), codec, factory, user_catalogs)
        .with_disk_cache(disk.clone())
        .with_timeouts(
            config.catalog_ttl(),
            Duration::from_millis(config.auth_timeout_ms),
        );
    if let Some((server, username, password)) = config.default_credential() {
        credential_pool = credential_pool.with_default_credential(&server, &username, &password)?;
    }
    let credentials = Arc::new(credential_pool);

    match credentials.warm().await {
        Ok(count) => tracing::info!("Credential pool warmed: {} clients", count),
        Err(e) => tracing::warn!("Credential pool warm-up failed: {}", e),
    }

    let admission = Arc::new(AdmissionController::new(
        credentials.clone(),
        config.session_stale_after(),
    ));
    let failover = Arc::new(FailoverEngine::new(credentials.clone()));

    let prober: Option<Arc<dyn StreamProber>> = match &config.probe_url {
        Some(url) => {
            let prober: Arc<dyn StreamProber> = Arc::new(HttpProber::new(
                url,
                Duration::from_millis(config.probe_timeout_ms),
            )?);
            tracing::info!("Stream probe enabled");
            Some(prober)
        }
        None => {
            tracing::info!("No PROBE_URL configured, playback decisions use defaults");
            None
        }
    };
    let playback = Arc::new(PlaybackSelector::new(
        prober,
        Duration::from_secs(config.probe_cache_ttl_secs),
        config.probe_cache_entries,
    ));

    let streaming = Arc::new(StreamingService::new(
        credentials.clone(),
        admission.clone(),
        failover.clone(),
        playback.clone(),
        &config.base_url,
        config.probe_url.clone(),
    ));
    let health = Arc::new(HealthMonitor::new(credentials.clone()));

    // Start stale session sweep (runs in background)
    tokio::spawn(start_cleanup_task(
        CleanupTargets {
            admission: admission.clone(),
            streaming: streaming.clone(),
            disk: Some(disk),
        },
        CleanupConfig {
            interval_secs: config.session_sweep_interval_secs,
            stale_after: config.session_stale_after(),
            ..CleanupConfig::default()
        },
    ));
    tracing::info!(
        "Session sweep started (every {}s)",
        config.session_sweep_interval_secs
    );

    tokio::spawn(start_health_task(
        health.clone(),
        config.health_check_interval_secs,
    ));

    let http = routes::proxy::build_proxy_client(config.stream_proxy_timeout_ms, &config.user_agent)?;

    // Build application state
    let state = Arc::new(AppState {
        resolver: CatalogResolver::new(credentials.clone()),
        config,
        pool,
        store,
        credentials,
        admission,
        failover,
        playback,
        streaming,
        health,
        http,
        start_time: Instant::now(),
    });

    // Build router
    let app = Router::new()
        // Health endpoints
        .route("/", get(routes::health::root))
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::health::metrics))
        .route("/ready", get(routes::health::ready))
        .route("/live", get(routes::health::live))
        // Subscriber catalog
        .route("/api/catalog/channels", get(routes::catalog::list_channels))
        .route(
            "/api/catalog/categories",
            get(routes::catalog::list_categories),
        )
        .route(
            "/api/catalog/channels/:stream_id/epg",
            get(routes::catalog::channel_epg),
        )
        // Stream sessions
        .route(
            "/api/streams/:stream_id/start",
            post(routes::streams::start_stream),
        )
        .route(
            "/api/sessions/:token/heartbeat",
            post(routes::streams::heartbeat),
        )
        .route(
            "/api/sessions/:token",
            delete(routes::streams::release),
        )
        // Proxy
        .route(
            "/api/proxy/session/:token",
            get(routes::proxy::session_proxy),
        )
        .route("/api/proxy/stream", get(routes::proxy::stream_proxy))
        // Admin endpoints (protected by ADMIN_KEY)
        .route(
            "/api/admin/providers",
            get(routes::admin::list_providers).post(routes::admin::create_provider),
        )
        .route(
            "/api/admin/providers/:id",
            put(routes::admin::update_provider).delete(routes::admin::delete_provider),
        )
        .route(
            "/api/admin/providers/:id/sync",
            post(routes::admin::sync_provider),
        )
        .route(
            "/api/admin/providers/:id/health-check",
            post(routes::admin::health_check_provider),
        )
        .route(
            "/api/admin/credentials",
            get(routes::admin::list_credentials).post(routes::admin::create_credential),
        )
        .route(
            "/api/admin/credentials/:id",
            put(routes::admin::update_credential).delete(routes::admin::delete_credential),
        )
        .route(
            "/api/admin/credentials/:id/sync",
            post(routes::admin::sync_credential),
        )
        .route(
            "/api/admin/credentials/:id/test",
            post(routes::admin::test_credential),
        )
        .route(
            "/api/admin/credentials/:id/sessions",
            get(routes::admin::credential_sessions),
        )
        .route(
            "/api/admin/mappings",
            get(routes::admin::list_mappings).post(routes::admin::create_mapping),
        )
        .route(
            "/api/admin/mappings/bulk",
            post(routes::admin::bulk_create_mappings),
        )
        .route(
            "/api/admin/mappings/suggestions/:channel_id",
            get(routes::admin::mapping_suggestions),
        )
        .route(
            "/api/admin/mappings/:id",
            put(routes::admin::update_mapping).delete(routes::admin::delete_mapping),
        )
        .route(
            "/api/admin/channels/:id/backups",
            get(routes::admin::channel_backups),
        )
        .route(
            "/api/admin/failover/test-mode",
            get(routes::admin::list_test_mode),
        )
        .route(
            "/api/admin/failover/:stream_id/test",
            post(routes::admin::test_failover),
        )
        .route(
            "/api/admin/failover/:stream_id/test-mode",
            post(routes::admin::set_test_mode),
        )
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
