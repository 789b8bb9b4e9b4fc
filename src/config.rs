//! Configuration management.
//!
//! Two layers:
//! - [`SigningConfig`]: the explicit options a [`SigningService`](crate::SigningService)
//!   is constructed with
//! - [`Config`]: process configuration loaded from environment variables
//!   with the `envy` crate, converted into a `SigningConfig`

use serde::Deserialize;

use crate::error::{Result, SigningError};
use crate::services::key_generator::DEFAULT_BYTE_LEN;
use crate::services::rate_limiter::{DEFAULT_INTERVAL_SECS, DEFAULT_MAX_CALLS, RateLimitPolicy};

/// Largest accepted key length; 500 bytes hex-encode to 1000 characters.
pub const MAX_BYTE_LEN: usize = 500;

/// What `write_key` does when no lifetime (or a zero lifetime) is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpirationPolicy {
    /// The key never expires
    #[default]
    NoExpiry,
    /// The key expires after this many hours
    DefaultHours(u32),
    /// The request is rejected with `InvalidRequest`
    Reject,
}

/// Options for a signing service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningConfig {
    /// Random bytes per signature
    pub byte_len: usize,

    /// Verification rate limit, `None` disables rate limiting
    pub rate_limit: Option<RateLimitPolicy>,

    pub expiration_policy: ExpirationPolicy,

    /// Refuse to rotate keys that are inactive or already rotated
    pub safe_mode: bool,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            byte_len: DEFAULT_BYTE_LEN,
            rate_limit: Some(RateLimitPolicy::default()),
            expiration_policy: ExpirationPolicy::default(),
            safe_mode: true,
        }
    }
}

impl SigningConfig {
    pub fn with_byte_len(mut self, byte_len: usize) -> Self {
        self.byte_len = byte_len;
        self
    }

    pub fn with_rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit = Some(policy);
        self
    }

    pub fn without_rate_limit(mut self) -> Self {
        self.rate_limit = None;
        self
    }

    pub fn with_expiration_policy(mut self, policy: ExpirationPolicy) -> Self {
        self.expiration_policy = policy;
        self
    }

    pub fn with_safe_mode(mut self, safe_mode: bool) -> Self {
        self.safe_mode = safe_mode;
        self
    }

    /// Check every option is in range.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest`: byte length outside `1..=MAX_BYTE_LEN`, a rate
    ///   limit interval outside `1..=MAX_INTERVAL_SECS` seconds, or a zero
    ///   default lifetime
    pub fn validate(&self) -> Result<()> {
        if self.byte_len == 0 || self.byte_len > MAX_BYTE_LEN {
            return Err(SigningError::InvalidRequest(format!(
                "Key byte length must be between 1 and {MAX_BYTE_LEN}, got {}",
                self.byte_len
            )));
        }

        if let Some(policy) = self.rate_limit {
            policy.validate()?;
        }

        if self.expiration_policy == ExpirationPolicy::DefaultHours(0) {
            return Err(SigningError::InvalidRequest(
                "Default expiration must be at least one hour".to_string(),
            ));
        }

        Ok(())
    }
}

/// Application configuration loaded from environment variables.
///
/// # Environment Variables
///
/// - `DATABASE_URL` (required): PostgreSQL connection string
/// - `MAX_CONNECTIONS` (optional): pool size, defaults to 5
/// - `KEY_BYTE_LEN` (optional): random bytes per key, defaults to 24
/// - `RATE_LIMIT` (optional): verifications per window, defaults to 2
/// - `RATE_LIMIT_INTERVAL_SECS` (optional): window length, defaults to 5
/// - `RATE_LIMITING_ENABLED` (optional): defaults to true
/// - `DEFAULT_EXPIRATION_HOURS` (optional): lifetime for keys written without one
/// - `REJECT_MISSING_EXPIRATION` (optional): refuse keys written without a lifetime
/// - `SAFE_MODE` (optional): defaults to true
/// - `ROTATION_WINDOW_HOURS` (optional): rotate keys expiring within this window, defaults to 1
/// - `ROTATION_SWEEP_SECS` (optional): pause between rotation sweeps, defaults to 300
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_key_byte_len")]
    pub key_byte_len: usize,

    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,

    #[serde(default = "default_rate_limit_interval_secs")]
    pub rate_limit_interval_secs: i64,

    #[serde(default = "default_true")]
    pub rate_limiting_enabled: bool,

    #[serde(default)]
    pub default_expiration_hours: Option<u32>,

    #[serde(default)]
    pub reject_missing_expiration: bool,

    #[serde(default = "default_true")]
    pub safe_mode: bool,

    #[serde(default = "default_rotation_window_hours")]
    pub rotation_window_hours: u32,

    #[serde(default = "default_rotation_sweep_secs")]
    pub rotation_sweep_secs: u64,
}

fn default_max_connections() -> u32 {
    5
}

fn default_key_byte_len() -> usize {
    DEFAULT_BYTE_LEN
}

fn default_rate_limit() -> u32 {
    DEFAULT_MAX_CALLS
}

fn default_rate_limit_interval_secs() -> i64 {
    DEFAULT_INTERVAL_SECS
}

fn default_true() -> bool {
    true
}

fn default_rotation_window_hours() -> u32 {
    1
}

fn default_rotation_sweep_secs() -> u64 {
    300
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// This method first attempts to load a `.env` file (which is optional),
    /// then reads environment variables and deserializes them into a Config struct.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Required environment variables are missing (e.g., DATABASE_URL)
    /// - Environment variable values cannot be parsed into expected types
    pub fn from_env() -> std::result::Result<Self, envy::Error> {
        // Try to load .env file if it exists (does nothing if not found)
        dotenvy::dotenv().ok();

        // Field names are automatically converted: database_url -> DATABASE_URL
        envy::from_env::<Config>()
    }

    /// Build the validated options for a signing service.
    ///
    /// `REJECT_MISSING_EXPIRATION` takes precedence over `DEFAULT_EXPIRATION_HOURS`.
    pub fn signing_config(&self) -> Result<SigningConfig> {
        let rate_limit = self
            .rate_limiting_enabled
            .then(|| RateLimitPolicy::per_seconds(self.rate_limit, self.rate_limit_interval_secs))
            .transpose()?;

        let expiration_policy = match (self.reject_missing_expiration, self.default_expiration_hours)
        {
            (true, _) => ExpirationPolicy::Reject,
            (false, Some(hours)) => ExpirationPolicy::DefaultHours(hours),
            (false, None) => ExpirationPolicy::NoExpiry,
        };

        let config = SigningConfig {
            byte_len: self.key_byte_len,
            rate_limit,
            expiration_policy,
            safe_mode: self.safe_mode,
        };
        config.validate()?;

        Ok(config)
    }
}
