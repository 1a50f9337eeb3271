//! Funding backend: the value-transfer capability behind the escrow ledger.
//!
//! The ledger never moves value itself. It asks a [`FundingBackend`] to
//! collect funds into the vault on lock and to pay them out on release or
//! refund, and only finalizes custody state after the backend confirms.
//!
//! Backends must treat `reference` as an idempotency key: repeating a call
//! with a reference that already succeeded returns the original
//! confirmation without moving value again. The ledger relies on this when it
//! retries after an ambiguous failure.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use grantvault_types::{Result, VaultError, WalletAddress};
use parking_lot::Mutex;
use rust_decimal::Decimal;

/// Confirmation of a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub reference: String,
    pub counterparty: WalletAddress,
    pub amount: Decimal,
    pub confirmed_at: DateTime<Utc>,
}

/// Value-transfer capability consumed by the escrow ledger.
///
/// Transient unavailability is reported as [`VaultError::Retryable`].
pub trait FundingBackend: Send + Sync {
    /// Move `amount` from `from` into the vault.
    fn collect(&self, from: &WalletAddress, amount: Decimal, reference: &str)
    -> Result<TransferReceipt>;

    /// Move `amount` out of the vault to `to`.
    fn transfer(&self, to: &WalletAddress, amount: Decimal, reference: &str)
    -> Result<TransferReceipt>;
}

#[derive(Debug, Default)]
struct WalletState {
    balances: HashMap<WalletAddress, Decimal>,
    vault: Decimal,
    /// Completed transfers by reference, for idempotent replays.
    completed: HashMap<String, TransferReceipt>,
    /// Calls left to fail with `Retryable` (simulated outage).
    outage: u32,
}

/// In-process backend with per-address balances and a vault account.
///
/// All mutations are atomic: either the full operation succeeds or no
/// balance changes.
#[derive(Debug, Default)]
pub struct InMemoryWallet {
    state: Mutex<WalletState>,
}

impl InMemoryWallet {
    /// Create an empty wallet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit an external address (e.g. fund a program owner).
    pub fn deposit(&self, address: &WalletAddress, amount: Decimal) {
        let mut state = self.state.lock();
        *state.balances.entry(address.clone()).or_default() += amount;
    }

    /// Balance of an external address.
    #[must_use]
    pub fn balance(&self, address: &WalletAddress) -> Decimal {
        self.state
            .lock()
            .balances
            .get(address)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Value currently held by the vault.
    #[must_use]
    pub fn vault_balance(&self) -> Decimal {
        self.state.lock().vault
    }

    /// Number of distinct transfers executed (collects included).
    #[must_use]
    pub fn transfer_count(&self) -> usize {
        self.state.lock().completed.len()
    }

    fn take_outage(state: &mut WalletState) -> Result<()> {
        if state.outage > 0 {
            state.outage -= 1;
            return Err(VaultError::retryable("funding backend unavailable"));
        }
        Ok(())
    }
}

#[cfg(any(test, feature = "test-helpers"))]
impl InMemoryWallet {
    /// Make the next `calls` backend calls fail with `Retryable`.
    pub fn fail_next(&self, calls: u32) {
        self.state.lock().outage = calls;
    }
}

impl FundingBackend for InMemoryWallet {
    fn collect(
        &self,
        from: &WalletAddress,
        amount: Decimal,
        reference: &str,
    ) -> Result<TransferReceipt> {
        let mut state = self.state.lock();
        Self::take_outage(&mut state)?;
        if let Some(done) = state.completed.get(reference) {
            return Ok(done.clone());
        }

        let available = state.balances.get(from).copied().unwrap_or(Decimal::ZERO);
        if available < amount {
            return Err(VaultError::InvalidAmount {
                reason: format!("{from} holds {available}, cannot lock {amount}"),
            });
        }
        state.balances.insert(from.clone(), available - amount);
        state.vault += amount;

        let receipt = TransferReceipt {
            reference: reference.to_string(),
            counterparty: from.clone(),
            amount,
            confirmed_at: Utc::now(),
        };
        state.completed.insert(reference.to_string(), receipt.clone());
        Ok(receipt)
    }

    fn transfer(
        &self,
        to: &WalletAddress,
        amount: Decimal,
        reference: &str,
    ) -> Result<TransferReceipt> {
        let mut state = self.state.lock();
        Self::take_outage(&mut state)?;
        if let Some(done) = state.completed.get(reference) {
            return Ok(done.clone());
        }

        if state.vault < amount {
            return Err(VaultError::Internal(format!(
                "vault holds {}, cannot pay {amount}",
                state.vault
            )));
        }
        state.vault -= amount;
        *state.balances.entry(to.clone()).or_default() += amount;

        let receipt = TransferReceipt {
            reference: reference.to_string(),
            counterparty: to.clone(),
            amount,
            confirmed_at: Utc::now(),
        };
        state.completed.insert(reference.to_string(), receipt.clone());
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> WalletAddress {
        WalletAddress::new(s)
    }

    #[test]
    fn collect_moves_into_vault() {
        let wallet = InMemoryWallet::new();
        wallet.deposit(&addr("funder"), Decimal::new(1000, 0));

        wallet
            .collect(&addr("funder"), Decimal::new(400, 0), "lock-1")
            .unwrap();
        assert_eq!(wallet.balance(&addr("funder")), Decimal::new(600, 0));
        assert_eq!(wallet.vault_balance(), Decimal::new(400, 0));
    }

    #[test]
    fn collect_insufficient_changes_nothing() {
        let wallet = InMemoryWallet::new();
        wallet.deposit(&addr("funder"), Decimal::new(100, 0));

        let err = wallet
            .collect(&addr("funder"), Decimal::new(200, 0), "lock-1")
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidAmount { .. }));
        assert_eq!(wallet.balance(&addr("funder")), Decimal::new(100, 0));
        assert_eq!(wallet.vault_balance(), Decimal::ZERO);
    }

    #[test]
    fn transfer_is_idempotent_per_reference() {
        let wallet = InMemoryWallet::new();
        wallet.deposit(&addr("funder"), Decimal::new(500, 0));
        wallet
            .collect(&addr("funder"), Decimal::new(500, 0), "lock-1")
            .unwrap();

        let first = wallet
            .transfer(&addr("dev"), Decimal::new(500, 0), "release-1")
            .unwrap();
        let again = wallet
            .transfer(&addr("dev"), Decimal::new(500, 0), "release-1")
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(wallet.balance(&addr("dev")), Decimal::new(500, 0));
        assert_eq!(wallet.vault_balance(), Decimal::ZERO);
    }

    #[test]
    fn outage_is_retryable_and_transient() {
        let wallet = InMemoryWallet::new();
        wallet.deposit(&addr("funder"), Decimal::new(10, 0));
        wallet.fail_next(1);

        let err = wallet
            .collect(&addr("funder"), Decimal::new(10, 0), "lock-1")
            .unwrap_err();
        assert!(err.is_retryable());
        wallet
            .collect(&addr("funder"), Decimal::new(10, 0), "lock-1")
            .unwrap();
    }

    #[test]
    fn vault_cannot_overpay() {
        let wallet = InMemoryWallet::new();
        let err = wallet
            .transfer(&addr("dev"), Decimal::ONE, "release-1")
            .unwrap_err();
        assert!(matches!(err, VaultError::Internal(_)));
    }
}
