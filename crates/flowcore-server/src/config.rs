//! Environment-based configuration, matching the teacher's
//! `Config::from_env` posture: every variable has a sane default, a
//! typo'd or missing numeric value falls back rather than panicking.

use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    /// Directory scanned for `*.yaml`/`*.yml` workflow files.
    pub workflow_dir: String,

    /// Default workflow timeout applied when a workflow doesn't set
    /// `timeout_sec` itself.
    pub default_timeout_sec: u64,

    /// `postgres://...` or `sqlite://...`; empty disables the query step
    /// collaborator (query steps then fail at execution time).
    pub database_url: String,

    /// Upstash-style REST cache endpoint + bearer token; empty disables
    /// step/trigger caching (steps execute uncached).
    pub cache_rest_url: String,
    pub cache_rest_token: String,

    /// Whether to trust `X-Forwarded-For`/`X-Real-IP` when resolving the
    /// client IP (§6).
    pub trust_proxy_headers: bool,

    /// Echoed as `X-Server-Version` when non-empty.
    pub server_version: String,
}

impl Config {
    pub fn from_env() -> Self {
        let host = env::var("FLOWCORE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("FLOWCORE_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);
        let workflow_dir = env::var("FLOWCORE_WORKFLOW_DIR").unwrap_or_else(|_| "./workflows".to_string());
        let default_timeout_sec = env::var("FLOWCORE_DEFAULT_TIMEOUT_SEC")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);
        let database_url = env::var("DATABASE_URL").unwrap_or_default();
        let cache_rest_url = env::var("FLOWCORE_CACHE_REST_URL")
            .or_else(|_| env::var("UPSTASH_REDIS_REST_URL"))
            .unwrap_or_default();
        let cache_rest_token = env::var("FLOWCORE_CACHE_REST_TOKEN")
            .or_else(|_| env::var("UPSTASH_REDIS_REST_TOKEN"))
            .unwrap_or_default();
        let trust_proxy_headers = env::var("FLOWCORE_TRUST_PROXY_HEADERS")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let server_version = env::var("FLOWCORE_SERVER_VERSION").unwrap_or_default();

        Self {
            host,
            port,
            workflow_dir,
            default_timeout_sec,
            database_url,
            cache_rest_url,
            cache_rest_token,
            trust_proxy_headers,
            server_version,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
