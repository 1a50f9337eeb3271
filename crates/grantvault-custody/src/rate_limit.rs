//! Anti-abuse limits on funding operations.
//!
//! Each funder gets a sliding window of recent operations plus a minimum
//! cooldown between two consecutive ones. Whitelisted funders bypass both.
//!
//! [`FundingLimiter::check`] and [`FundingLimiter::record`] are separate so
//! only operations that went through count against the quota. Funders with
//! no operation inside the window or cooldown are forgotten.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use grantvault_types::{RateLimitConfig, Result, VaultError, WalletAddress};
use parking_lot::{Mutex, RwLock};

/// Per-funder sliding-window and cooldown limiter.
pub struct FundingLimiter {
    config: RwLock<RateLimitConfig>,
    /// `funder → timestamps of recent operations` (monotonically increasing)
    windows: Mutex<HashMap<WalletAddress, VecDeque<DateTime<Utc>>>>,
    whitelist: RwLock<HashSet<WalletAddress>>,
}

impl FundingLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: RwLock::new(config),
            windows: Mutex::new(HashMap::new()),
            whitelist: RwLock::new(HashSet::new()),
        }
    }

    /// Check whether `funder` may fund at `now`. Nothing is recorded.
    ///
    /// # Errors
    /// - `CooldownActive` if the previous operation was too recent
    /// - `RateLimitExceeded` if the window is full
    pub fn check(&self, funder: &WalletAddress, now: DateTime<Utc>) -> Result<()> {
        if self.whitelist.read().contains(funder) {
            return Ok(());
        }
        let config = self.config.read().clone();

        let mut windows = self.windows.lock();
        let Some(window) = windows.get_mut(funder) else {
            return Ok(());
        };
        Self::slide(window, now - Duration::seconds(config.window_secs));

        if let Some(&last) = window.back() {
            let ready_at = last + Duration::seconds(config.cooldown_secs);
            if now < ready_at {
                let remaining_secs = (ready_at - now).num_seconds().max(1);
                tracing::warn!(funder = %funder, remaining_secs, "funding cooldown active");
                return Err(VaultError::CooldownActive { remaining_secs });
            }
        }

        if window.len() >= config.max_operations {
            tracing::warn!(funder = %funder, count = window.len(), "funding rate limit hit");
            return Err(VaultError::RateLimitExceeded {
                reason: format!(
                    "{funder} made {} funding operations in {}s window (limit: {})",
                    window.len(),
                    config.window_secs,
                    config.max_operations
                ),
            });
        }
        Ok(())
    }

    /// Count a completed funding operation by `funder` at `now`.
    pub fn record(&self, funder: &WalletAddress, now: DateTime<Utc>) {
        if self.whitelist.read().contains(funder) {
            return;
        }
        let config = self.config.read().clone();
        let horizon = now - Duration::seconds(config.window_secs.max(config.cooldown_secs));

        let mut windows = self.windows.lock();
        windows.retain(|_, window| window.back().is_some_and(|&last| last > horizon));
        windows.entry(funder.clone()).or_default().push_back(now);
    }

    fn slide(window: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) {
        while window.front().is_some_and(|&front| front <= cutoff) {
            window.pop_front();
        }
    }

    /// Add or remove a funder from the whitelist.
    pub fn set_whitelisted(&self, funder: &WalletAddress, whitelisted: bool) {
        let mut list = self.whitelist.write();
        if whitelisted {
            list.insert(funder.clone());
        } else {
            list.remove(funder);
        }
    }

    #[must_use]
    pub fn is_whitelisted(&self, funder: &WalletAddress) -> bool {
        self.whitelist.read().contains(funder)
    }

    /// Replace the limits. Recorded history is kept.
    ///
    /// # Errors
    /// `Configuration` if the new limits are invalid; the old ones stay.
    pub fn update_config(&self, config: RateLimitConfig) -> Result<()> {
        config.validate()?;
        tracing::info!(
            window_secs = config.window_secs,
            max_operations = config.max_operations,
            cooldown_secs = config.cooldown_secs,
            "funding limits updated"
        );
        *self.config.write() = config;
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> RateLimitConfig {
        self.config.read().clone()
    }
}
