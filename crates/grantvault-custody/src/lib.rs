//! # grantvault-custody
//!
//! **Custody plane**: everything that holds value or grants authority.
//!
//! ## Architecture
//!
//! 1. **EscrowLedger**: sole owner of escrow records; every lock, release and
//!    refund goes through one transition entry point
//! 2. **FundingBackend**: moves value in and out of the vault; the ledger
//!    finalizes state only after a confirmed transfer
//! 3. **TokenStore**: one-time authorization tokens, consumed at most once
//! 4. **FundingLimiter**: per-funder sliding window and cooldown
//! 5. **CustodyConservation**: collected minus paid out equals still locked
//! 6. **Journal**: append-only JSON-lines persistence shared by all of the above
//!
//! ## Release Flow
//!
//! ```text
//! TokenStore.consume() → EscrowLedger.transition(Release)
//!     → FundingBackend.transfer() → Journal.append() → RELEASED
//! ```

pub mod conservation;
pub mod journal;
pub mod ledger;
pub mod rate_limit;
pub mod token_store;
pub mod wallet;

pub use conservation::CustodyConservation;
pub use journal::Journal;
pub use ledger::EscrowLedger;
pub use rate_limit::FundingLimiter;
pub use token_store::{RedirectPolicy, TokenStore};
pub use wallet::{FundingBackend, InMemoryWallet, TransferReceipt};
