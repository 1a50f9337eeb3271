//! System-wide constants for the GrantVault settlement core.

/// Default lifetime of a one-time authorization token (10 minutes).
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 600;

/// Upper bound on a token lifetime the store will accept (1 hour).
pub const MAX_TOKEN_TTL_SECS: i64 = 3600;

/// Attempts at a backend transfer before the ledger gives up with `Retryable`.
pub const DEFAULT_TRANSFER_ATTEMPTS: u32 = 3;

/// Redelivery attempts the scheduler makes for a `Retryable` outcome.
pub const DEFAULT_REDELIVERY_ATTEMPTS: u32 = 8;

/// First redelivery backoff in milliseconds.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;

/// Redelivery backoff ceiling in milliseconds.
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 60_000;

/// Anti-abuse sliding window (1 hour).
pub const DEFAULT_RATE_WINDOW_SECS: i64 = 3600;

/// Funding operations per funder within the window.
pub const DEFAULT_RATE_MAX_OPERATIONS: usize = 10;

/// Minimum gap between two funding operations of one funder.
pub const DEFAULT_COOLDOWN_SECS: i64 = 60;

/// Prefix of a merge signal authenticity proof.
pub const SIGNAL_PROOF_PREFIX: &str = "sha256=";

/// Journal file holding escrow record states.
pub const ESCROW_JOURNAL: &str = "escrow.jsonl";

/// Journal file holding bounty registrations, extensions and approvals.
pub const REGISTRY_JOURNAL: &str = "bounties.jsonl";

/// Journal file holding grant program events.
pub const PROGRAM_JOURNAL: &str = "programs.jsonl";

/// Journal file holding token issue/consume events.
pub const TOKEN_JOURNAL: &str = "tokens.jsonl";

/// Journal file holding the signal outcome log.
pub const OUTCOME_JOURNAL: &str = "outcomes.jsonl";

/// Journal file holding payout receipts.
pub const RECEIPT_JOURNAL: &str = "receipts.jsonl";

/// Version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine name.
pub const ENGINE_NAME: &str = "GrantVault";
