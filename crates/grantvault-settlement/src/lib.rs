//! # grantvault-settlement
//!
//! **Settlement plane**: bounty terms, merge verification, release
//! orchestration and payout receipts.
//!
//! ## Architecture
//!
//! A merge signal enters through [`GrantVault::process_merge`] and the
//! [`ReleaseOrchestrator`]:
//! 1. Consults the [`OutcomeLog`] (a terminal outcome short-circuits)
//! 2. Authenticates the signal ([`SignalAuthenticator`])
//! 3. Resolves the beneficiary against the [`BountyRegistry`] and the
//!    [`IdentityProvider`]
//! 4. Consumes the contributor's one-time release token
//! 5. Releases the escrow through the custody ledger
//! 6. Appends a signed receipt to the [`ProofRecorder`]
//!
//! Each stage is checkpointed, so a redelivered signal resumes where the
//! last attempt stopped. `Retryable` outcomes are redelivered by
//! [`Redelivery`] with exponential backoff.
//!
//! Bounties are funded from [`ProgramBook`] grant programs and refunded
//! through the vault's refund policy.

pub mod identity;
pub mod orchestrator;
pub mod outcome_log;
pub mod program;
pub mod recorder;
pub mod registry;
pub mod scheduler;
pub mod signal_auth;
pub mod telemetry;
pub mod vault;

pub use identity::{IdentityProvider, IdentityStatus, StaticIdentityProvider};
pub use orchestrator::ReleaseOrchestrator;
pub use outcome_log::OutcomeLog;
pub use program::ProgramBook;
pub use recorder::ProofRecorder;
pub use registry::BountyRegistry;
pub use scheduler::Redelivery;
pub use signal_auth::{HmacSignalAuthenticator, SignalAuthenticator};
pub use vault::{GrantVault, RefundEligibility};
