use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Clone)]
pub struct Config {
    // Server
    pub port: u16,
    pub node_env: String,
    pub base_url: String,

    // PostgreSQL
    pub database_url: String,
    pub db_max_connections: u32,
    pub run_migrations: bool,

    // Security
    pub secrets_key: String,
    pub admin_key: String,

    // Catalog caching
    pub catalog_cache_dir: String,
    pub catalog_ttl_secs: u64,
    pub user_catalog_ttl_secs: u64,

    // Upstream
    pub upstream_timeout_ms: u64,
    pub auth_timeout_ms: u64,

    // Sessions
    pub session_stale_secs: u64,
    pub session_sweep_interval_secs: u64,

    // Health monitor
    pub health_check_interval_secs: u64,

    // Probe
    pub probe_url: Option<String>,
    pub probe_timeout_ms: u64,
    pub probe_cache_ttl_secs: u64,
    pub probe_cache_entries: usize,

    // Stream proxy
    pub stream_proxy_timeout_ms: u64,

    // Environment default credential (not capacity tracked)
    pub default_server_url: Option<String>,
    pub default_username: Option<String>,
    pub default_password: Option<String>,

    // Misc
    pub user_agent: String,
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self {
            // Server
            port: parse_or("PORT", 3001),
            node_env: env::var("NODE_ENV").unwrap_or_else(|_| "development".to_string()),
            base_url: env::var("BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3001".to_string()),

            // PostgreSQL
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/xtreamhub".to_string()),
            db_max_connections: parse_or("DB_MAX_CONNECTIONS", 15),
            run_migrations: parse_or("RUN_MIGRATIONS", true),

            // Security
            secrets_key: env::var("SECRETS_KEY").unwrap_or_default(),
            admin_key: env::var("ADMIN_KEY").unwrap_or_else(|_| "admin123".to_string()),

            // Catalog caching
            catalog_cache_dir: env::var("CATALOG_CACHE_DIR")
                .unwrap_or_else(|_| ".catalog-cache".to_string()),
            catalog_ttl_secs: parse_or("CATALOG_TTL_SECS", 1800), // 30 minutes
            user_catalog_ttl_secs: parse_or("USER_CATALOG_TTL_SECS", 1800),

            // Upstream
            upstream_timeout_ms: parse_or("UPSTREAM_TIMEOUT_MS", 30_000),
            auth_timeout_ms: parse_or("AUTH_TIMEOUT_MS", 10_000),

            // Sessions
            session_stale_secs: parse_or("SESSION_STALE_SECS", 90),
            session_sweep_interval_secs: parse_or("SESSION_SWEEP_INTERVAL_SECS", 30),

            // Health monitor
            health_check_interval_secs: parse_or("HEALTH_CHECK_INTERVAL_SECS", 300),

            // Probe
            probe_url: non_empty("PROBE_URL"),
            probe_timeout_ms: parse_or("PROBE_TIMEOUT_MS", 5_000),
            probe_cache_ttl_secs: parse_or("PROBE_CACHE_TTL_SECS", 300),
            probe_cache_entries: parse_or("PROBE_CACHE_ENTRIES", 1024),

            // Stream proxy
            stream_proxy_timeout_ms: parse_or("STREAM_PROXY_TIMEOUT_MS", 15_000),

            // Environment default credential
            default_server_url: non_empty("XTREAM_SERVER_URL"),
            default_username: non_empty("XTREAM_USERNAME"),
            default_password: non_empty("XTREAM_PASSWORD"),

            // Misc - Use VLC user agent to avoid IPTV server blocks
            user_agent: env::var("USER_AGENT")
                .unwrap_or_else(|_| "VLC/3.0.20 LibVLC/3.0.20".to_string()),
        }
    }

    pub fn catalog_ttl(&self) -> Duration {
        Duration::from_secs(self.catalog_ttl_secs)
    }

    pub fn user_catalog_ttl(&self) -> Duration {
        Duration::from_secs(self.user_catalog_ttl_secs)
    }

    pub fn session_stale_after(&self) -> Duration {
        Duration::from_secs(self.session_stale_secs)
    }

    /// Environment default credential, only when all three parts are set
    pub fn default_credential(&self) -> Option<(String, String, String)> {
        match (
            &self.default_server_url,
            &self.default_username,
            &self.default_password,
        ) {
            (Some(server), Some(user), Some(pass)) => {
                Some((server.clone(), user.clone(), pass.clone()))
            }
            _ => None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("node_env", &self.node_env)
            .field("base_url", &self.base_url)
            .field("db_max_connections", &self.db_max_connections)
            .field("catalog_cache_dir", &self.catalog_cache_dir)
            .field("secrets_key", &"[REDACTED]")
            .field("admin_key", &"[REDACTED]")
            .field("default_credential", &self.default_server_url.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
