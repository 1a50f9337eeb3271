//! Custody conservation invariant.
//!
//! ```text
//! Σ(locked escrow) == Σ(collected) - Σ(released) - Σ(refunded)
//! ```
//!
//! The ledger keeps these flow totals alongside its records and checks them
//! against a quiescent snapshot. A mismatch means value was created or lost
//! inside the vault and is reported as a critical alert.

use grantvault_types::{EscrowRecord, EscrowState, Result, VaultError};
use rust_decimal::Decimal;

/// Running totals of value moved in and out of custody.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CustodyConservation {
    pub collected: Decimal,
    pub released: Decimal,
    pub refunded: Decimal,
}

impl CustodyConservation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild totals from restored records.
    #[must_use]
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a EscrowRecord>) -> Self {
        let mut totals = Self::new();
        for record in records {
            totals.record_collected(record.amount);
            match record.state {
                EscrowState::Locked => {}
                EscrowState::Released => totals.record_released(record.amount),
                EscrowState::Refunded => totals.record_refunded(record.amount),
            }
        }
        totals
    }

    pub fn record_collected(&mut self, amount: Decimal) {
        self.collected += amount;
    }

    pub fn record_released(&mut self, amount: Decimal) {
        self.released += amount;
    }

    pub fn record_refunded(&mut self, amount: Decimal) {
        self.refunded += amount;
    }

    /// What the ledger should hold in `Locked` records.
    #[must_use]
    pub fn expected_locked(&self) -> Decimal {
        self.collected - self.released - self.refunded
    }

    /// Compare against the ledger's actual locked total.
    ///
    /// # Errors
    /// `ConservationViolation` on any mismatch.
    pub fn check(&self, actual_locked: Decimal) -> Result<()> {
        let expected = self.expected_locked();
        if expected != actual_locked {
            tracing::error!(
                expected = %expected,
                actual = %actual_locked,
                collected = %self.collected,
                released = %self.released,
                refunded = %self.refunded,
                "CUSTODY CONSERVATION VIOLATED"
            );
            return Err(VaultError::ConservationViolation {
                reason: format!(
                    "locked {actual_locked} != collected {} - released {} - refunded {}",
                    self.collected, self.released, self.refunded
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use grantvault_types::{BountyId, EscrowId, RefundReason, TransitionRequest, WalletAddress};

    fn locked(amount: i64) -> EscrowRecord {
        EscrowRecord::locked(
            EscrowId::new(),
            BountyId::new(),
            WalletAddress::new("f"),
            Decimal::new(amount, 0),
            Utc::now(),
        )
    }

    #[test]
    fn balanced_flows_pass() {
        let mut totals = CustodyConservation::new();
        totals.record_collected(Decimal::new(1000, 0));
        totals.record_released(Decimal::new(300, 0));
        totals.record_refunded(Decimal::new(200, 0));
        totals.check(Decimal::new(500, 0)).unwrap();
    }

    #[test]
    fn mismatch_is_violation() {
        let mut totals = CustodyConservation::new();
        totals.record_collected(Decimal::new(100, 0));
        let err = totals.check(Decimal::new(101, 0)).unwrap_err();
        assert!(matches!(err, VaultError::ConservationViolation { .. }));
    }

    #[test]
    fn rebuilt_from_records() {
        let open = locked(100);
        let mut refunded = locked(50);
        refunded
            .apply(
                TransitionRequest::Refund {
                    reason: RefundReason::DeadlineElapsed,
                },
                Utc::now(),
            )
            .unwrap();

        let totals = CustodyConservation::from_records([&open, &refunded]);
        assert_eq!(totals.collected, Decimal::new(150, 0));
        assert_eq!(totals.refunded, Decimal::new(50, 0));
        totals.check(Decimal::new(100, 0)).unwrap();
    }
}
