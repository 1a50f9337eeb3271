//! Redelivery of merge signals whose release came back `Retryable`.
//!
//! Each delivery runs on the blocking pool (ledger transitions may wait on
//! the funding backend). Between deliveries the task sleeps with exponential
//! backoff from [`RetryPolicy::delay_for`]. `Released` and `Rejected` end the
//! loop immediately.

use std::sync::Arc;

use grantvault_types::{
    MergeSignal, ReleaseOutcome, ReleaseReport, ReleaseStage, RetryPolicy,
};

use crate::vault::GrantVault;

pub struct Redelivery {
    vault: Arc<GrantVault>,
    policy: RetryPolicy,
}

impl Redelivery {
    #[must_use]
    pub fn new(vault: Arc<GrantVault>, policy: RetryPolicy) -> Self {
        Self { vault, policy }
    }

    /// Deliver `signal` until it reaches a terminal outcome or the attempt
    /// budget runs out. Returns the last report.
    pub async fn deliver(&self, signal: MergeSignal, authorization: String) -> ReleaseReport {
        let signal = Arc::new(signal);
        let authorization: Arc<str> = authorization.into();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let report = self.attempt(signal.clone(), authorization.clone()).await;
            if report.outcome.is_terminal() {
                return report;
            }
            if attempt >= max_attempts {
                tracing::warn!(
                    signal = %signal.id,
                    attempts = attempt,
                    "redelivery budget exhausted"
                );
                return report;
            }

            let delay = self.policy.delay_for(attempt);
            tracing::debug!(
                signal = %signal.id,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "scheduling redelivery"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt(&self, signal: Arc<MergeSignal>, authorization: Arc<str>) -> ReleaseReport {
        let vault = self.vault.clone();
        let task_signal = signal.clone();
        match tokio::task::spawn_blocking(move || {
            vault.process_merge(&task_signal, &authorization)
        })
        .await
        {
            Ok(report) => report,
            Err(err) => {
                tracing::error!(signal = %signal.id, error = %err, "delivery task failed");
                ReleaseReport {
                    signal_id: signal.id.clone(),
                    outcome: ReleaseOutcome::Retryable {
                        cause: err.to_string(),
                        stage: ReleaseStage::Received,
                    },
                    duplicate: false,
                }
            }
        }
    }
}
