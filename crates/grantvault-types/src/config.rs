//! Configuration types for a GrantVault node.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{Result, VaultError, constants};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Directory for the durable journals. `None` keeps everything in memory.
    pub data_dir: Option<String>,
    /// Hex-encoded secret shared with the merge event source.
    pub signal_secret_hex: String,
    /// Wallets allowed to approve early refunds.
    pub admins: Vec<String>,
    pub token: TokenConfig,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimitConfig,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            signal_secret_hex: String::new(),
            admins: Vec::new(),
            token: TokenConfig::default(),
            retry: RetryPolicy::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl VaultConfig {
    /// Parse and validate a JSON configuration document.
    ///
    /// # Errors
    /// `Configuration` if the document is malformed or fails validation.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| VaultError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    ///
    /// # Errors
    /// `Io` if the file cannot be read, `Configuration` if it is invalid.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Decoded signal secret.
    ///
    /// # Errors
    /// `Configuration` if the secret is not valid hex.
    pub fn signal_secret(&self) -> Result<Vec<u8>> {
        hex::decode(&self.signal_secret_hex)
            .map_err(|e| VaultError::Configuration(format!("signal_secret_hex: {e}")))
    }

    /// Reject settings that would break the settlement guarantees.
    ///
    /// # Errors
    /// `Configuration` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.token.ttl_secs <= 0 || self.token.ttl_secs > constants::MAX_TOKEN_TTL_SECS {
            return Err(VaultError::Configuration(format!(
                "token.ttl_secs must be in 1..={}",
                constants::MAX_TOKEN_TTL_SECS
            )));
        }
        if self.retry.transfer_attempts == 0 {
            return Err(VaultError::Configuration(
                "retry.transfer_attempts must be > 0".into(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(VaultError::Configuration(
                "retry.base_delay_ms exceeds retry.max_delay_ms".into(),
            ));
        }
        self.rate_limit.validate()?;
        let secret = self.signal_secret()?;
        if !self.signal_secret_hex.is_empty() && secret.len() < 16 {
            return Err(VaultError::Configuration(
                "signal secret must be at least 16 bytes".into(),
            ));
        }
        for dest in &self.token.allowed_redirects {
            if dest.is_empty() {
                return Err(VaultError::Configuration(
                    "token.allowed_redirects contains an empty entry".into(),
                ));
            }
        }
        Ok(())
    }
}

/// One-time token settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub ttl_secs: i64,
    /// Redirect destinations (absolute origins or path prefixes) a login
    /// token may carry.
    pub allowed_redirects: Vec<String>,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            ttl_secs: constants::DEFAULT_TOKEN_TTL_SECS,
            allowed_redirects: vec!["/".to_string()],
        }
    }
}

impl TokenConfig {
    #[must_use]
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_secs)
    }
}

/// Bounded retry settings for backend transfers and signal redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Transfer attempts inside one ledger transition.
    pub transfer_attempts: u32,
    /// Redelivery attempts by the scheduler.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            transfer_attempts: constants::DEFAULT_TRANSFER_ATTEMPTS,
            max_attempts: constants::DEFAULT_REDELIVERY_ATTEMPTS,
            base_delay_ms: constants::DEFAULT_RETRY_BASE_DELAY_MS,
            max_delay_ms: constants::DEFAULT_RETRY_MAX_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff before redelivery `attempt` (1-based), capped at
    /// `max_delay_ms`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let delay = self.base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Anti-abuse limits on funding operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_secs: i64,
    pub max_operations: usize,
    pub cooldown_secs: i64,
}

impl RateLimitConfig {
    /// # Errors
    /// `Configuration` for a non-positive window or operation count, or a
    /// negative cooldown.
    pub fn validate(&self) -> Result<()> {
        if self.max_operations == 0 || self.window_secs <= 0 {
            return Err(VaultError::Configuration(
                "rate_limit window and max_operations must be positive".into(),
            ));
        }
        if self.cooldown_secs < 0 {
            return Err(VaultError::Configuration(
                "rate_limit.cooldown_secs must not be negative".into(),
            ));
        }
        Ok(())
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: constants::DEFAULT_RATE_WINDOW_SECS,
            max_operations: constants::DEFAULT_RATE_MAX_OPERATIONS,
            cooldown_secs: constants::DEFAULT_COOLDOWN_SECS,
        }
    }
}
