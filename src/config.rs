//! Runner and fetcher configuration.
//!
//! Everything is loaded from environment variables with defaults, the same
//! way the rest of the deployment configures its services. Config values
//! are plain structs passed in at construction time; there is no global
//! config state and no runtime file watching.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_SIGNALS_PATH: &str = "/api/third-party/signals";

/// How the API key is presented to the signal provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// `Authorization: Bearer <token>` (a pre-prefixed token is passed through).
    Bearer,
    /// `X-API-KEY: <token>`.
    XApiKey,
    /// Configurable header name and prefix.
    Header,
    /// Configurable query parameter.
    Query,
    /// No authentication.
    None,
}

impl AuthMode {
    fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "bearer" | "" => AuthMode::Bearer,
            "x_api_key" => AuthMode::XApiKey,
            "header" => AuthMode::Header,
            "query" => AuthMode::Query,
            _ => AuthMode::None,
        }
    }
}

/// Signal provider fetch settings.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub signals_url: Option<String>,
    pub api_key: Option<String>,
    pub auth_mode: AuthMode,
    pub auth_header_name: String,
    pub auth_header_prefix: String,
    pub auth_query_param: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub page_size: usize,
    pub page_param: String,
    pub page_size_param: String,
    /// Hard cap on pages per cycle, a safety bound against runaway pagination.
    pub max_pages: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            signals_url: None,
            api_key: None,
            auth_mode: AuthMode::Bearer,
            auth_header_name: "Authorization".to_string(),
            auth_header_prefix: "Bearer ".to_string(),
            auth_query_param: "api_key".to_string(),
            timeout: Duration::from_secs(15),
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
            page_size: 200,
            page_param: "page".to_string(),
            page_size_param: "limit".to_string(),
            max_pages: 50,
        }
    }
}

impl FetchConfig {
    /// Load fetch settings from the environment. Unset or unparseable
    /// values fall back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            signals_url: env_string("SIGNALS_URL").map(|url| normalize_signals_url(&url)),
            api_key: env_string("SIGNALS_API_KEY"),
            auth_mode: env_string("SIGNALS_AUTH_MODE")
                .map(|v| AuthMode::parse(&v))
                .unwrap_or(defaults.auth_mode),
            auth_header_name: env_string("SIGNALS_AUTH_HEADER_NAME")
                .unwrap_or(defaults.auth_header_name),
            auth_header_prefix: std::env::var("SIGNALS_AUTH_HEADER_PREFIX")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.auth_header_prefix),
            auth_query_param: env_string("SIGNALS_AUTH_QUERY_PARAM")
                .unwrap_or(defaults.auth_query_param),
            timeout: env_f64("SIGNALS_TIMEOUT_SECONDS")
                .map(Duration::from_secs_f64)
                .unwrap_or(defaults.timeout),
            max_retries: env_u32("SIGNALS_MAX_RETRIES").unwrap_or(defaults.max_retries),
            base_backoff: env_f64("SIGNALS_BACKOFF_SECONDS")
                .map(Duration::from_secs_f64)
                .unwrap_or(defaults.base_backoff),
            page_size: env_u32("SIGNALS_PAGE_SIZE")
                .map(|v| v as usize)
                .unwrap_or(defaults.page_size),
            page_param: env_string("SIGNALS_PAGE_PARAM").unwrap_or(defaults.page_param),
            page_size_param: env_string("SIGNALS_PAGE_SIZE_PARAM")
                .unwrap_or(defaults.page_size_param),
            max_pages: env_u32("SIGNALS_MAX_PAGES").unwrap_or(defaults.max_pages),
        }
    }
}

/// Where each cycle's signals come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    Api,
    File,
}

impl SignalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalSource::Api => "api",
            SignalSource::File => "file",
        }
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub poll_interval: Duration,
    /// Fail-safe expiry applied to every published row.
    pub active_ttl_seconds: i64,
    pub source: SignalSource,
    pub file_path: Option<PathBuf>,
    pub database_url: String,
    pub status_path: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            active_ttl_seconds: 30,
            source: SignalSource::Api,
            file_path: None,
            database_url: "sqlite://automation.db?mode=rwc".to_string(),
            status_path: PathBuf::from("automation_status.json"),
        }
    }
}

impl RunnerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let source = match env_string("RUNNER_SOURCE").as_deref() {
            Some("file") => SignalSource::File,
            _ => SignalSource::Api,
        };
        let file_path = env_string("RUNNER_FILE_PATH").map(PathBuf::from);

        if source == SignalSource::File && file_path.is_none() {
            anyhow::bail!("RUNNER_FILE_PATH is required when RUNNER_SOURCE=file");
        }

        let poll_seconds = env_u32("RUNNER_POLL_SECONDS").unwrap_or(10).max(1);
        let active_ttl_seconds = env_u32("RUNNER_ACTIVE_TTL_SECONDS").unwrap_or(30).max(5);

        Ok(Self {
            poll_interval: Duration::from_secs(u64::from(poll_seconds)),
            active_ttl_seconds: i64::from(active_ttl_seconds),
            source,
            file_path,
            database_url: env_string("DATABASE_URL").unwrap_or(defaults.database_url),
            status_path: env_string("RUNNER_STATUS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.status_path),
        })
    }
}

/// A URL configured as host-only (empty or "/" path) gets the default API
/// path appended, so operators can point at a bare host.
pub fn normalize_signals_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Ok(parsed) = url::Url::parse(trimmed) {
        if parsed.path().is_empty() || parsed.path() == "/" {
            let default_path = env_string("SIGNALS_PATH")
                .map(|p| {
                    if p.starts_with('/') {
                        p
                    } else {
                        format!("/{p}")
                    }
                })
                .unwrap_or_else(|| DEFAULT_SIGNALS_PATH.to_string());
            return format!("{}{}", trimmed.trim_end_matches('/'), default_path);
        }
    }
    trimmed.to_string()
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u32(name: &str) -> Option<u32> {
    env_string(name)?.parse().ok()
}

fn env_f64(name: &str) -> Option<f64> {
    env_string(name)?.parse().ok()
}
