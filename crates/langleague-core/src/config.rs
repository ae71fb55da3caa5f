//! Transport configuration.
//!
//! Values default to what the LangLeague backend expects. Only the base URL
//! is required; `TransportConfig::from_env` reads it together with the
//! optional overrides from `LANGLEAGUE_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::ApiError;

/// Environment variable holding the backend base URL
pub const ENV_API_URL: &str = "LANGLEAGUE_API_URL";

/// Environment variable overriding the request timeout, in seconds
pub const ENV_TIMEOUT_SECS: &str = "LANGLEAGUE_TIMEOUT_SECS";

/// Environment variable enabling the development network fallback
pub const ENV_DEV_MODE: &str = "LANGLEAGUE_DEV_MODE";

/// HTTP request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Storage key the bearer credential is kept under.
pub const DEFAULT_CREDENTIAL_KEY: &str = "authToken";

/// Header marking a request as silent on the wire.
pub const DEFAULT_SILENT_HEADER: &str = "X-Silent-Request";

/// Maximum number of retries for rate-limited (429) requests.
const DEFAULT_MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub base_url: String,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub credential_key: String,
    /// Paths that must work without a session; no bearer token is attached.
    pub token_exempt_paths: Vec<String>,
    /// Paths whose 401 is the final word on session validity.
    pub auth_check_paths: Vec<String>,
    /// Revalidation target ("who am I").
    pub account_path: String,
    pub silent_header: String,
    pub dev_mode: bool,
    pub forward_cookies: bool,
    pub max_rate_limit_retries: u32,
    #[serde(with = "duration_millis")]
    pub initial_backoff: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            credential_key: DEFAULT_CREDENTIAL_KEY.to_string(),
            token_exempt_paths: vec!["/api/authenticate".into(), "/api/register".into()],
            auth_check_paths: vec!["/api/account".into(), "/api/authenticate".into()],
            account_path: "/api/account".to_string(),
            silent_header: DEFAULT_SILENT_HEADER.to_string(),
            dev_mode: false,
            forward_cookies: true,
            max_rate_limit_retries: DEFAULT_MAX_RATE_LIMIT_RETRIES,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
        }
    }
}

impl TransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Build a config from `LANGLEAGUE_*` environment variables.
    pub fn from_env() -> Result<Self, ApiError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Apply the optional `LANGLEAGUE_*` overrides to a config whose base
    /// URL came from elsewhere.
    pub fn with_env_overrides(self) -> Result<Self, ApiError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ApiError> {
        let base_url = lookup(ENV_API_URL)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ApiError::Config(format!("{ENV_API_URL} is not set")))?;

        Self::new(base_url.trim()).with_overrides_from(lookup)
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ApiError> {
        if let Some(raw) = lookup(ENV_TIMEOUT_SECS) {
            let secs: u64 = raw
                .trim()
                .parse()
                .map_err(|_| ApiError::Config(format!("{ENV_TIMEOUT_SECS} must be a number, got {raw:?}")))?;
            self.timeout = Duration::from_secs(secs);
        }

        if let Some(raw) = lookup(ENV_DEV_MODE) {
            self.dev_mode = matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ApiError> {
        if self.base_url.trim().is_empty() {
            return Err(ApiError::Config("base URL is required".into()));
        }
        if self.credential_key.is_empty() {
            return Err(ApiError::Config("credential key must not be empty".into()));
        }
        Ok(())
    }

    /// Join a request path onto the base URL. Absolute URLs pass through.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn is_token_exempt(&self, path: &str) -> bool {
        self.token_exempt_paths.iter().any(|p| path.contains(p.as_str()))
    }

    pub fn is_auth_check(&self, path: &str) -> bool {
        self.auth_check_paths.iter().any(|p| path.contains(p.as_str()))
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
