//! # grantvault-types
//!
//! Shared types, errors, and configuration for the **GrantVault** settlement
//! core.
//!
//! This crate is the leaf dependency of the workspace. It defines:
//!
//! - **Identifiers**: [`BountyId`], [`EscrowId`], [`IdentityId`], [`SignalId`], [`ReceiptId`], [`ProgramId`], [`IssueRef`]
//! - **Custody model**: [`EscrowRecord`], [`EscrowState`], [`TransitionRequest`], [`Beneficiary`]
//! - **Bounty model**: [`Bounty`], [`BountyTerms`], [`BeneficiaryRule`], [`GrantProgram`]
//! - **Authorization tokens**: [`AuthorizationToken`], [`TokenValue`], [`TokenSubject`], [`TokenPurpose`]
//! - **Signals and proofs**: [`MergeSignal`], [`PayoutReceipt`]
//! - **Outcomes**: [`ReleaseStage`], [`ReleaseOutcome`], [`RejectReason`], [`OutcomeRecord`]
//! - **Configuration**: [`VaultConfig`], [`RetryPolicy`], [`RateLimitConfig`]
//! - **Errors**: [`VaultError`] with `GV_ERR_` prefix codes
//! - **Time**: [`Clock`], [`SystemClock`]

pub mod bounty;
pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod escrow;
pub mod ids;
pub mod outcome;
pub mod receipt;
pub mod signal;
pub mod token;

pub use bounty::*;
pub use clock::*;
pub use config::*;
pub use error::*;
pub use escrow::*;
pub use ids::*;
pub use outcome::*;
pub use receipt::*;
pub use signal::*;
pub use token::*;

// Constants are accessed via `grantvault_types::constants::FOO`
// (not re-exported to avoid name collisions).
