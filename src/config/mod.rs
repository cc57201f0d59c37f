use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Value shipped in sample `.env` files; treated as "not configured".
pub const PLACEHOLDER_API_KEY: &str = "your_anthropic_api_key_here";

/// Worksheet used when the client does not name one.
pub const DEFAULT_SHEET_NAME: &str = "COA i-Kcal";

/// Process-wide settings, loaded once at startup and read-only afterwards.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Directory holding staged inputs and produced artifacts (default: "uploads")
    pub upload_dir: PathBuf,

    /// Maximum total request body size in bytes (default: 16 MB)
    pub max_upload_bytes: usize,

    /// Lower-case file extensions accepted for either upload (default: pdf, xlsx, xls)
    pub allowed_extensions: BTreeSet<String>,

    /// Credential for the classification service. No default.
    pub anthropic_api_key: Option<String>,

    /// Model requested from the classification service
    pub anthropic_model: String,

    /// Base URL of the classification service API
    pub anthropic_base_url: String,

    /// Upper bound for a single classification call in seconds (default: 120)
    pub classifier_timeout_secs: u64,

    /// Token budget for the classification response (default: 4096)
    pub classifier_max_tokens: u32,

    /// Listen address (default: 0.0.0.0)
    pub host: String,

    /// Listen port (default: 10000)
    pub port: u16,

    /// Runtime worker threads (default: 4)
    pub workers: usize,

    /// In-flight requests allowed per worker (default: 3)
    pub threads_per_worker: usize,

    /// Per-request handling timeout in seconds (default: 30)
    pub request_timeout_secs: u64,

    /// Age after which files in the upload directory are purged; 0 disables (default: 24)
    pub output_retention_hours: u64,

    /// Interval between retention sweeps in seconds (default: 3600)
    pub retention_sweep_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("uploads"),
            max_upload_bytes: 16 * 1024 * 1024, // 16 MB
            allowed_extensions: ["pdf", "xlsx", "xls"]
                .into_iter()
                .map(String::from)
                .collect(),
            anthropic_api_key: None,
            anthropic_model: "claude-3-5-sonnet-latest".to_string(),
            anthropic_base_url: "https://api.anthropic.com/v1".to_string(),
            classifier_timeout_secs: 120,
            classifier_max_tokens: 4096,
            host: "0.0.0.0".to_string(),
            port: 10000,
            workers: 4,
            threads_per_worker: 3,
            request_timeout_secs: 30,
            output_retention_hours: 24,
            retention_sweep_interval_secs: 3600,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            upload_dir: env::var("UPLOAD_FOLDER")
                .map(PathBuf::from)
                .unwrap_or(default.upload_dir),

            max_upload_bytes: env::var("MAX_CONTENT_LENGTH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_upload_bytes),

            allowed_extensions: env::var("ALLOWED_EXTENSIONS")
                .ok()
                .map(|v| parse_extensions(&v))
                .filter(|set| !set.is_empty())
                .unwrap_or(default.allowed_extensions),

            anthropic_api_key: env::var("ANTHROPIC_API_KEY").ok(),

            anthropic_model: env::var("ANTHROPIC_MODEL").unwrap_or(default.anthropic_model),

            anthropic_base_url: env::var("ANTHROPIC_BASE_URL")
                .unwrap_or(default.anthropic_base_url),

            classifier_timeout_secs: env::var("CLASSIFIER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.classifier_timeout_secs),

            classifier_max_tokens: env::var("CLASSIFIER_MAX_TOKENS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.classifier_max_tokens),

            host: env::var("HOST").unwrap_or(default.host),

            port: env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.port),

            workers: env::var("WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(default.workers),

            threads_per_worker: env::var("THREADS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(default.threads_per_worker),

            request_timeout_secs: env::var("TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.request_timeout_secs),

            output_retention_hours: env::var("OUTPUT_RETENTION_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.output_retention_hours),

            retention_sweep_interval_secs: env::var("RETENTION_SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &u64| *n > 0)
                .unwrap_or(default.retention_sweep_interval_secs),
        }
    }

    /// The classifier credential, if one is configured and is not the sample placeholder.
    pub fn classifier_credential(&self) -> Option<&str> {
        usable_credential(self.anthropic_api_key.as_deref())
    }

    pub fn max_concurrent_requests(&self) -> usize {
        self.workers.saturating_mul(self.threads_per_worker).max(1)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn output_retention(&self) -> Option<Duration> {
        match self.output_retention_hours {
            0 => None,
            hours => Some(Duration::from_secs(hours.saturating_mul(3600))),
        }
    }
}

pub fn usable_credential(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim)
        .filter(|key| !key.is_empty() && *key != PLACEHOLDER_API_KEY)
}

fn parse_extensions(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect()
}
