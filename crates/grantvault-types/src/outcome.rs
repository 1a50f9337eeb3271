//! Release attempt stages and outcomes.
//!
//! Each merge signal drives one release attempt through
//! `Received → IdentityResolved → AuthorizationConsumed → LedgerTransitioned
//! → ReceiptRecorded`. The outcome log persists, per signal ID, either the
//! last durable checkpoint or the terminal outcome.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Beneficiary, BountyId, EscrowState, PayoutReceipt, ReceiptId, SignalId, VaultError};

/// Stage reached by a release attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReleaseStage {
    Received,
    IdentityResolved,
    AuthorizationConsumed,
    LedgerTransitioned,
    ReceiptRecorded,
}

impl fmt::Display for ReleaseStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Received => write!(f, "RECEIVED"),
            Self::IdentityResolved => write!(f, "IDENTITY_RESOLVED"),
            Self::AuthorizationConsumed => write!(f, "AUTHORIZATION_CONSUMED"),
            Self::LedgerTransitioned => write!(f, "LEDGER_TRANSITIONED"),
            Self::ReceiptRecorded => write!(f, "RECEIPT_RECORDED"),
        }
    }
}

/// The single taxonomy reason behind a rejected release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    InvalidSignature,
    NoMatch { detail: String },
    DeadlineExceeded {
        deadline: DateTime<Utc>,
        merged_at: DateTime<Utc>,
    },
    ExpiredOrInvalid,
    AlreadyLocked,
    FundsNotLocked { state: EscrowState },
    EscrowNotFound,
    /// Terminal failure outside the settlement taxonomy (bad config, corrupt
    /// data). Surfaced for manual review.
    Internal { detail: String },
}

impl RejectReason {
    /// Classify a terminal error. Returns `None` for retryable errors.
    #[must_use]
    pub fn from_error(err: &VaultError) -> Option<Self> {
        if err.is_retryable() {
            return None;
        }
        Some(match err {
            VaultError::InvalidSignature => Self::InvalidSignature,
            VaultError::NoMatch { reason } => Self::NoMatch {
                detail: reason.clone(),
            },
            VaultError::BountyNotFound(id) => Self::NoMatch {
                detail: format!("{id} not registered"),
            },
            VaultError::DeadlineExceeded {
                deadline,
                merged_at,
            } => Self::DeadlineExceeded {
                deadline: *deadline,
                merged_at: *merged_at,
            },
            VaultError::ExpiredOrInvalid | VaultError::RedirectNotAllowed { .. } => {
                Self::ExpiredOrInvalid
            }
            VaultError::AlreadyLocked(_) => Self::AlreadyLocked,
            VaultError::FundsNotLocked { state, .. } => Self::FundsNotLocked { state: *state },
            VaultError::EscrowNotFound(_) => Self::EscrowNotFound,
            other => Self::Internal {
                detail: other.to_string(),
            },
        })
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSignature => write!(f, "INVALID_SIGNATURE"),
            Self::NoMatch { detail } => write!(f, "NO_MATCH({detail})"),
            Self::DeadlineExceeded { .. } => write!(f, "DEADLINE_EXCEEDED"),
            Self::ExpiredOrInvalid => write!(f, "EXPIRED_OR_INVALID"),
            Self::AlreadyLocked => write!(f, "ALREADY_LOCKED"),
            Self::FundsNotLocked { state } => write!(f, "FUNDS_NOT_LOCKED({state})"),
            Self::EscrowNotFound => write!(f, "ESCROW_NOT_FOUND"),
            Self::Internal { detail } => write!(f, "INTERNAL({detail})"),
        }
    }
}

/// Result of one release attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseOutcome {
    /// Funds released and receipt recorded. **Terminal.**
    Released {
        bounty_id: BountyId,
        receipt_id: ReceiptId,
    },
    /// The signal does not authorize a release. **Terminal**, never retried.
    Rejected {
        reason: RejectReason,
        stage: ReleaseStage,
    },
    /// Transient failure; eligible for redelivery.
    Retryable { cause: String, stage: ReleaseStage },
}

impl ReleaseOutcome {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Retryable { .. })
    }
}

/// The last durable point of an unfinished release attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub stage: ReleaseStage,
    pub bounty_id: Option<BountyId>,
    /// Set once the release token has been consumed.
    pub beneficiary: Option<Beneficiary>,
    /// Set once the ledger has transitioned.
    pub receipt: Option<PayoutReceipt>,
}

impl Checkpoint {
    #[must_use]
    pub fn received() -> Self {
        Self {
            stage: ReleaseStage::Received,
            bounty_id: None,
            beneficiary: None,
            receipt: None,
        }
    }
}

/// What the outcome log holds for one signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeState {
    InFlight(Checkpoint),
    Terminal(ReleaseOutcome),
}

/// A persisted outcome-log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub signal_id: SignalId,
    pub state: OutcomeState,
    pub updated_at: DateTime<Utc>,
}

/// What the orchestrator reports upstream for one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseReport {
    pub signal_id: SignalId,
    pub outcome: ReleaseOutcome,
    /// The signal had already reached a terminal outcome; nothing was done.
    pub duplicate: bool,
}
