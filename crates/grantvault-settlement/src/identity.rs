//! Identity resolution: code-host account → verified contributor.

use std::collections::HashMap;

use grantvault_types::{Beneficiary, ExternalAccount, IdentityId, Result, WalletAddress};
use parking_lot::RwLock;

/// Result of an identity lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityStatus {
    /// The account belongs to a verified contributor with a payout wallet.
    Verified(Beneficiary),
    /// The account is unknown or has not completed verification.
    Unverified,
}

/// External identity service.
///
/// Implementations report transient unavailability as `Retryable`.
pub trait IdentityProvider: Send + Sync {
    fn verify(&self, account: &ExternalAccount) -> Result<IdentityStatus>;
}

/// In-memory provider backed by an explicit account table.
#[derive(Debug, Default)]
pub struct StaticIdentityProvider {
    accounts: RwLock<HashMap<ExternalAccount, Beneficiary>>,
}

impl StaticIdentityProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify `account` with a fresh identity paying to `wallet`.
    pub fn register(&self, account: ExternalAccount, wallet: WalletAddress) -> Beneficiary {
        let beneficiary = Beneficiary {
            identity: IdentityId::new(),
            account: account.clone(),
            wallet,
        };
        self.accounts.write().insert(account, beneficiary.clone());
        beneficiary
    }

    /// Withdraw verification for `account`.
    pub fn revoke(&self, account: &ExternalAccount) -> bool {
        self.accounts.write().remove(account).is_some()
    }
}

impl IdentityProvider for StaticIdentityProvider {
    fn verify(&self, account: &ExternalAccount) -> Result<IdentityStatus> {
        Ok(self
            .accounts
            .read()
            .get(account)
            .cloned()
            .map_or(IdentityStatus::Unverified, IdentityStatus::Verified))
    }
}
