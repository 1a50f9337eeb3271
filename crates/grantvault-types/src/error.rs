//! Error types for the GrantVault settlement core.
//!
//! All errors use the `GV_ERR_` prefix convention for easy grepping in logs.
//! Error codes are grouped by subsystem:
//! - 1xx: Escrow ledger errors
//! - 2xx: Authorization token errors
//! - 3xx: Registry / grant program errors
//! - 4xx: Orchestration errors
//! - 5xx: Anti-abuse errors
//! - 9xx: Infrastructure / internal errors

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::{BountyId, EscrowState, IssueRef, ProgramId, SignalId};

/// Central error enum for all GrantVault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    // =================================================================
    // Escrow Ledger Errors (1xx)
    // =================================================================
    /// A lock was requested for a bounty that already has an escrow record.
    #[error("GV_ERR_100: Escrow already locked for {0}")]
    AlreadyLocked(BountyId),

    /// A release or refund was requested from a terminal state.
    #[error("GV_ERR_101: Funds not locked for {bounty} (state {state})")]
    FundsNotLocked { bounty: BountyId, state: EscrowState },

    /// No escrow record exists for the bounty.
    #[error("GV_ERR_102: Escrow not found for {0}")]
    EscrowNotFound(BountyId),

    /// The amount is zero, negative, or otherwise unusable.
    #[error("GV_ERR_103: Invalid amount: {reason}")]
    InvalidAmount { reason: String },

    // =================================================================
    // Authorization Token Errors (2xx)
    // =================================================================
    /// The token is unknown, malformed, expired, or already consumed.
    #[error("GV_ERR_200: Authorization token expired or invalid")]
    ExpiredOrInvalid,

    /// A redirect destination is not on the allow-list.
    #[error("GV_ERR_201: Redirect destination not allowed: {destination}")]
    RedirectNotAllowed { destination: String },

    // =================================================================
    // Registry / Program Errors (3xx)
    // =================================================================
    /// The merge signal does not authorize a release for this bounty.
    #[error("GV_ERR_300: Signal does not match bounty: {reason}")]
    NoMatch { reason: String },

    /// The merge happened after the bounty deadline.
    #[error("GV_ERR_301: Deadline exceeded: merged at {merged_at}, deadline {deadline}")]
    DeadlineExceeded {
        deadline: DateTime<Utc>,
        merged_at: DateTime<Utc>,
    },

    /// A bounty with this ID is already registered.
    #[error("GV_ERR_302: Bounty already exists: {0}")]
    BountyExists(BountyId),

    /// The issue is already linked to another bounty.
    #[error("GV_ERR_303: Issue already funded: {0}")]
    IssueAlreadyFunded(IssueRef),

    /// The bounty is not registered.
    #[error("GV_ERR_304: Bounty not found: {0}")]
    BountyNotFound(BountyId),

    /// A deadline value was rejected (e.g. extension not later than current).
    #[error("GV_ERR_305: Invalid deadline: {reason}")]
    InvalidDeadline { reason: String },

    /// The caller is not allowed to perform this operation.
    #[error("GV_ERR_306: Not authorized: {reason}")]
    NotAuthorized { reason: String },

    /// The grant program is not registered.
    #[error("GV_ERR_307: Program not found: {0}")]
    ProgramNotFound(ProgramId),

    /// A grant program with this ID already exists.
    #[error("GV_ERR_308: Program already exists: {0}")]
    ProgramExists(ProgramId),

    /// The program's remaining balance cannot cover the allocation.
    #[error("GV_ERR_309: Insufficient program funds: need {needed}, remaining {remaining}")]
    InsufficientProgramFunds { needed: Decimal, remaining: Decimal },

    /// A refund was requested before the deadline without an approval.
    #[error("GV_ERR_310: Refund not eligible for {bounty}: {reason}")]
    RefundNotEligible { bounty: BountyId, reason: String },

    // =================================================================
    // Orchestration Errors (4xx)
    // =================================================================
    /// The merge signal's authenticity proof did not verify.
    #[error("GV_ERR_400: Merge signal authenticity proof invalid")]
    InvalidSignature,

    /// Another delivery of the same signal is currently being processed.
    #[error("GV_ERR_401: Signal already in flight: {0}")]
    InFlight(SignalId),

    /// Custody conservation invariant violated: critical safety alert.
    #[error("GV_ERR_402: Custody conservation violation: {reason}")]
    ConservationViolation { reason: String },

    // =================================================================
    // Anti-Abuse Errors (5xx)
    // =================================================================
    /// Too many operations within the sliding window.
    #[error("GV_ERR_500: Rate limit exceeded: {reason}")]
    RateLimitExceeded { reason: String },

    /// The caller must wait before the next operation.
    #[error("GV_ERR_501: Operation in cooldown period: {remaining_secs}s remaining")]
    CooldownActive { remaining_secs: i64 },

    // =================================================================
    // Infrastructure / Internal (9xx)
    // =================================================================
    /// Transient infrastructure failure (backend or collaborator unavailable).
    #[error("GV_ERR_900: Retryable failure: {cause}")]
    Retryable { cause: String },

    /// Unrecoverable internal error.
    #[error("GV_ERR_901: Internal error: {0}")]
    Internal(String),

    /// Serialization / deserialization error.
    #[error("GV_ERR_902: Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid config file, missing fields, etc.).
    #[error("GV_ERR_903: Configuration error: {0}")]
    Configuration(String),

    /// I/O error (journal storage).
    #[error("GV_ERR_904: I/O error: {0}")]
    Io(String),
}

impl VaultError {
    /// Shorthand for [`VaultError::Retryable`].
    pub fn retryable(cause: impl Into<String>) -> Self {
        Self::Retryable {
            cause: cause.into(),
        }
    }

    /// Whether this failure is transient and eligible for redelivery.
    ///
    /// Storage I/O counts as transient: the journal being unavailable is the
    /// canonical "try again later" condition.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. } | Self::Io(_) | Self::InFlight(_))
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, VaultError>;

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_contains_prefix() {
        let err = VaultError::EscrowNotFound(BountyId::new());
        let msg = format!("{err}");
        assert!(msg.starts_with("GV_ERR_102"), "Got: {msg}");
    }

    #[test]
    fn funds_not_locked_mentions_state() {
        let err = VaultError::FundsNotLocked {
            bounty: BountyId::new(),
            state: EscrowState::Released,
        };
        let msg = format!("{err}");
        assert!(msg.contains("GV_ERR_101"));
        assert!(msg.contains("RELEASED"));
    }

    #[test]
    fn retryable_classification() {
        assert!(VaultError::retryable("backend down").is_retryable());
        assert!(VaultError::Io("disk full".into()).is_retryable());
        assert!(VaultError::InFlight(SignalId::new("pr:a/b#1")).is_retryable());
        assert!(!VaultError::ExpiredOrInvalid.is_retryable());
        assert!(!VaultError::AlreadyLocked(BountyId::new()).is_retryable());
        assert!(!VaultError::InvalidSignature.is_retryable());
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::other("journal unavailable");
        let err: VaultError = io.into();
        assert!(matches!(err, VaultError::Io(_)));
    }

    #[test]
    fn all_errors_have_gv_err_prefix() {
        let errors: Vec<Box<dyn std::error::Error>> = vec![
            Box::new(VaultError::ExpiredOrInvalid),
            Box::new(VaultError::InvalidSignature),
            Box::new(VaultError::CooldownActive { remaining_secs: 3 }),
            Box::new(VaultError::Internal("test".into())),
            Box::new(VaultError::InsufficientProgramFunds {
                needed: Decimal::new(10, 0),
                remaining: Decimal::ONE,
            }),
        ];
        for err in errors {
            let msg = format!("{err}");
            assert!(
                msg.starts_with("GV_ERR_"),
                "Error missing GV_ERR_ prefix: {msg}"
            );
        }
    }
}
