//! # Escrow custody record
//!
//! One [`EscrowRecord`] exists per bounty, created only when funds are
//! locked. There is no uninitialized state.
//!
//! ## State Machine
//!
//! ```text
//!   ┌────────┐  merge verified  ┌──────────┐
//!   │ LOCKED ├─────────────────▶│ RELEASED │
//!   └───┬────┘                  └──────────┘
//!       │ refund
//!       ▼
//!   ┌──────────┐
//!   │ REFUNDED │
//!   └──────────┘
//! ```
//!
//! Both terminal states are absorbing. Every request against them fails,
//! including same-state requests: a second release is an error, never a
//! silent success.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    BountyId, EscrowId, ExternalAccount, IdentityId, ReceiptId, Result, VaultError, WalletAddress,
};

/// The custody state of an escrow record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EscrowState {
    /// Funds are held by the vault.
    Locked,
    /// Funds were transferred to the beneficiary. **Terminal.**
    Released,
    /// Funds were returned to the funder. **Terminal.**
    Refunded,
}

impl EscrowState {
    /// Validate a requested transition against the custody matrix.
    ///
    /// | from \ to | Locked          | Released         | Refunded         |
    /// |-----------|-----------------|------------------|------------------|
    /// | Locked    | `AlreadyLocked` | ok               | ok               |
    /// | Released  | `AlreadyLocked` | `FundsNotLocked` | `FundsNotLocked` |
    /// | Refunded  | `AlreadyLocked` | `FundsNotLocked` | `FundsNotLocked` |
    ///
    /// # Errors
    /// Returns the matrix error for every illegal cell.
    pub fn check_transition(self, target: Self, bounty: BountyId) -> Result<()> {
        match (self, target) {
            (_, Self::Locked) => Err(VaultError::AlreadyLocked(bounty)),
            (Self::Locked, Self::Released | Self::Refunded) => Ok(()),
            (Self::Released | Self::Refunded, _) => Err(VaultError::FundsNotLocked {
                bounty,
                state: self,
            }),
        }
    }

    /// Whether this state is absorbing.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Locked)
    }
}

impl std::fmt::Display for EscrowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Locked => write!(f, "LOCKED"),
            Self::Released => write!(f, "RELEASED"),
            Self::Refunded => write!(f, "REFUNDED"),
        }
    }
}

/// The identity authorized to receive released funds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Beneficiary {
    /// Verified internal identity.
    pub identity: IdentityId,
    /// The code-host account that merged the work.
    pub account: ExternalAccount,
    /// Where the funds go.
    pub wallet: WalletAddress,
}

/// Why an escrow was refunded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundReason {
    /// The bounty deadline elapsed without a qualifying merge.
    DeadlineElapsed,
    /// An administrator approved an early refund.
    Approved { approver: WalletAddress },
    /// Funds were locked but the bounty could not be registered.
    RegistrationFailed,
}

impl std::fmt::Display for RefundReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeadlineElapsed => write!(f, "deadline elapsed"),
            Self::Approved { approver } => write!(f, "approved by {approver}"),
            Self::RegistrationFailed => write!(f, "registration failed"),
        }
    }
}

/// What caused the record to leave `Locked`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionCause {
    /// Released; the receipt proving it.
    Receipt(ReceiptId),
    /// Refunded, and why.
    Refund(RefundReason),
}

/// A request against the ledger's single mutation entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionRequest {
    /// Lock funds from `funder`.
    Lock { funder: WalletAddress, amount: Decimal },
    /// Release the locked amount to `beneficiary`.
    Release {
        beneficiary: Beneficiary,
        receipt: ReceiptId,
    },
    /// Return the locked amount to the funder.
    Refund { reason: RefundReason },
}

impl TransitionRequest {
    /// The state this request asks for.
    #[must_use]
    pub fn target(&self) -> EscrowState {
        match self {
            Self::Lock { .. } => EscrowState::Locked,
            Self::Release { .. } => EscrowState::Released,
            Self::Refund { .. } => EscrowState::Refunded,
        }
    }
}

/// Custody record for one bounty. Owned exclusively by the escrow ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowRecord {
    pub id: EscrowId,
    pub bounty_id: BountyId,
    pub state: EscrowState,
    /// Immutable once locked.
    pub amount: Decimal,
    /// Wallet the funds were collected from; refunds go back here.
    pub funder: WalletAddress,
    /// Set on release, absent before.
    pub beneficiary: Option<Beneficiary>,
    pub locked_at: DateTime<Utc>,
    /// When the current state was entered.
    pub entered_at: DateTime<Utc>,
    pub cause: Option<TransitionCause>,
}

impl EscrowRecord {
    /// A freshly locked record. This is the only constructor.
    #[must_use]
    pub fn locked(
        id: EscrowId,
        bounty_id: BountyId,
        funder: WalletAddress,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            bounty_id,
            state: EscrowState::Locked,
            amount,
            funder,
            beneficiary: None,
            locked_at: at,
            entered_at: at,
            cause: None,
        }
    }

    /// Where the funds go if `request` is applied.
    #[must_use]
    pub fn payee<'a>(&'a self, request: &'a TransitionRequest) -> Option<&'a WalletAddress> {
        match request {
            TransitionRequest::Release { beneficiary, .. } => Some(&beneficiary.wallet),
            TransitionRequest::Refund { .. } => Some(&self.funder),
            TransitionRequest::Lock { .. } => None,
        }
    }

    /// Apply a validated outbound transition.
    ///
    /// Validation happens before any field is touched, so a rejected request
    /// leaves the record byte-identical.
    ///
    /// # Errors
    /// Returns the matrix error from [`EscrowState::check_transition`].
    pub fn apply(&mut self, request: TransitionRequest, at: DateTime<Utc>) -> Result<()> {
        self.state.check_transition(request.target(), self.bounty_id)?;
        match request {
            TransitionRequest::Release {
                beneficiary,
                receipt,
            } => {
                self.state = EscrowState::Released;
                self.beneficiary = Some(beneficiary);
                self.cause = Some(TransitionCause::Receipt(receipt));
            }
            TransitionRequest::Refund { reason } => {
                self.state = EscrowState::Refunded;
                self.cause = Some(TransitionCause::Refund(reason));
            }
            // check_transition rejects every Lock request.
            TransitionRequest::Lock { .. } => {
                return Err(VaultError::AlreadyLocked(self.bounty_id));
            }
        }
        self.entered_at = at;
        Ok(())
    }
}

#[cfg(any(test, feature = "test-helpers"))]
impl Beneficiary {
    /// Dummy beneficiary for unit tests. **Never use in production.**
    pub fn dummy(login: &str) -> Self {
        Self {
            identity: IdentityId::new(),
            account: ExternalAccount::new(login),
            wallet: WalletAddress::new(format!("wallet:{login}")),
        }
    }
}
