use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::constants::{DEFAULT_WAYBACK_BASE_URL, EMPTY_BODY_SHA256};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("failed to parse {name} as number: {source}")]
    ParseFloat {
        name: String,
        #[source]
        source: std::num::ParseFloatError,
    },
    #[error("failed to parse {name} as boolean: {value}")]
    ParseBool { name: String, value: String },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Source
    pub source_id: String,
    pub input_path: Option<PathBuf>,

    // Output
    pub output_dir: PathBuf,
    pub manifest_filename: String,
    pub manifest_flush_every: usize,

    // Workers
    pub worker_concurrency: usize,
    pub queue_capacity: usize,
    pub shutdown_grace: Duration,

    // Rate limiting
    pub requests_per_second: f64,
    pub rate_burst: u32,

    // Retry
    pub max_retry_attempts: u32,
    pub retry_base: Duration,
    pub retry_max_backoff: Duration,
    pub retry_jitter: Duration,
    pub request_timeout: Duration,

    // Policy
    pub resume_enabled: bool,
    pub recovery_enabled: bool,

    // Wayback Machine
    pub wayback_base_url: String,
    pub max_snapshots_per_lookup: usize,

    // Placeholder detection
    pub placeholder_min_bytes: u64,
    pub placeholder_hashes: HashSet<String>,

    // Response cache
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Source
            source_id: required_env("SOURCE_ID")?,
            input_path: optional_env("INPUT_PATH").map(PathBuf::from),

            // Output
            output_dir: PathBuf::from(env_or_default("OUTPUT_DIR", "./archive")),
            manifest_filename: env_or_default("MANIFEST_FILENAME", "manifest.json"),
            manifest_flush_every: parse_env_usize("MANIFEST_FLUSH_EVERY", 1)?,

            // Workers
            worker_concurrency: parse_env_usize("WORKER_CONCURRENCY", 4)?,
            queue_capacity: parse_env_usize("QUEUE_CAPACITY", 64)?,
            shutdown_grace: Duration::from_secs(parse_env_u64("SHUTDOWN_GRACE_SECS", 10)?),

            // Rate limiting
            requests_per_second: parse_env_f64("REQUESTS_PER_SECOND", 2.0)?,
            rate_burst: parse_env_u32("RATE_BURST", 4)?,

            // Retry
            max_retry_attempts: parse_env_u32("MAX_RETRY_ATTEMPTS", 5)?,
            retry_base: Duration::from_millis(parse_env_u64("RETRY_BASE_MS", 1000)?),
            retry_max_backoff: Duration::from_millis(parse_env_u64("RETRY_MAX_BACKOFF_MS", 32_000)?),
            retry_jitter: Duration::from_millis(parse_env_u64("RETRY_JITTER_MS", 500)?),
            request_timeout: Duration::from_secs(parse_env_u64("REQUEST_TIMEOUT_SECS", 60)?),

            // Policy
            resume_enabled: parse_env_bool("RESUME_ENABLED", true)?,
            recovery_enabled: parse_env_bool("RECOVERY_ENABLED", true)?,

            // Wayback Machine
            wayback_base_url: env_or_default("WAYBACK_BASE_URL", DEFAULT_WAYBACK_BASE_URL),
            max_snapshots_per_lookup: parse_env_usize("MAX_SNAPSHOTS_PER_LOOKUP", 5)?,

            // Placeholder detection
            placeholder_min_bytes: parse_env_u64("PLACEHOLDER_MIN_BYTES", 128)?,
            placeholder_hashes: parse_hash_list(&env_or_default("PLACEHOLDER_HASHES", "")),

            // Response cache
            cache_capacity: parse_env_usize("CACHE_CAPACITY", 256)?,
            cache_ttl: Duration::from_secs(parse_env_u64("CACHE_TTL_SECS", 3600)?),
        })
    }

    /// Configuration suitable for tests: fast retries, generous rate budget,
    /// and no real network endpoints.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            source_id: "test-blog".to_string(),
            input_path: None,
            output_dir: PathBuf::from("./target/test-archive"),
            manifest_filename: "manifest.json".to_string(),
            manifest_flush_every: 1,
            worker_concurrency: 2,
            queue_capacity: 8,
            shutdown_grace: Duration::from_secs(2),
            requests_per_second: 1000.0,
            rate_burst: 100,
            max_retry_attempts: 3,
            retry_base: Duration::from_millis(1),
            retry_max_backoff: Duration::from_millis(10),
            retry_jitter: Duration::ZERO,
            request_timeout: Duration::from_secs(5),
            resume_enabled: true,
            recovery_enabled: true,
            wayback_base_url: "http://127.0.0.1:9".to_string(),
            max_snapshots_per_lookup: 5,
            placeholder_min_bytes: 8,
            placeholder_hashes: parse_hash_list(""),
            cache_capacity: 32,
            cache_ttl: Duration::from_secs(60),
        }
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_id.trim().is_empty() {
            return Err(invalid("SOURCE_ID", "cannot be empty"));
        }
        if self.worker_concurrency == 0 {
            return Err(invalid("WORKER_CONCURRENCY", "must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("QUEUE_CAPACITY", "must be at least 1"));
        }
        if !self.requests_per_second.is_finite() || self.requests_per_second <= 0.0 {
            return Err(invalid("REQUESTS_PER_SECOND", "must be a positive number"));
        }
        if self.rate_burst == 0 {
            return Err(invalid("RATE_BURST", "must be at least 1"));
        }
        if self.max_retry_attempts == 0 {
            return Err(invalid("MAX_RETRY_ATTEMPTS", "must be at least 1"));
        }
        if self.retry_max_backoff < self.retry_base {
            return Err(invalid(
                "RETRY_MAX_BACKOFF_MS",
                "must be greater than or equal to RETRY_BASE_MS",
            ));
        }
        if self.max_snapshots_per_lookup == 0 {
            return Err(invalid("MAX_SNAPSHOTS_PER_LOOKUP", "must be at least 1"));
        }
        if self.manifest_flush_every == 0 {
            return Err(invalid("MANIFEST_FLUSH_EVERY", "must be at least 1"));
        }
        if self.cache_capacity == 0 {
            return Err(invalid("CACHE_CAPACITY", "must be at least 1"));
        }
        if self.manifest_filename.is_empty()
            || self.manifest_filename.contains('/')
            || self.manifest_filename.contains('\\')
        {
            return Err(invalid(
                "MANIFEST_FILENAME",
                "must be a plain file name without directories",
            ));
        }
        if url::Url::parse(&self.wayback_base_url).is_err() {
            return Err(invalid("WAYBACK_BASE_URL", "must be an absolute URL"));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(invalid("OUTPUT_DIR", "cannot be empty"));
        }
        Ok(())
    }

    /// Path of the manifest file, which lives alongside the downloaded media.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.output_dir.join(&self.manifest_filename)
    }
}

fn invalid(name: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        message: message.to_string(),
    }
}

fn required_env(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_u32(name: &str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_f64(name: &str, default: f64) -> Result<f64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseFloat {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => match val.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::ParseBool {
                name: name.to_string(),
                value: val,
            }),
        },
        _ => Ok(default),
    }
}

/// Parse a comma-separated list of hex SHA-256 digests. The empty-body digest
/// is always included.
fn parse_hash_list(value: &str) -> HashSet<String> {
    let mut hashes: HashSet<String> = value
        .split(',')
        .map(|h| h.trim().to_ascii_lowercase())
        .map(|h| h.strip_prefix("sha256:").map(str::to_string).unwrap_or(h))
        .filter(|h| h.len() == 64 && h.chars().all(|c| c.is_ascii_hexdigit()))
        .collect();
    hashes.insert(EMPTY_BODY_SHA256.to_string());
    hashes
}
