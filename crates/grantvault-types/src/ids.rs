//! Identifiers used throughout GrantVault.
//!
//! Locally minted entity IDs use UUIDv7 for time-ordered sorting. IDs that
//! must be reproducible from external input (signals, receipts) are derived
//! from SHA-256 so every redelivery of the same event maps to the same ID.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// BountyId
// ---------------------------------------------------------------------------

/// Unique bounty identifier. Uses UUIDv7 for time-ordered sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct BountyId(pub Uuid);

impl BountyId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for BountyId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BountyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bounty:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// EscrowId
// ---------------------------------------------------------------------------

/// Identifier of an escrow record. The registry only ever holds this key,
/// never the record itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct EscrowId(pub Uuid);

impl EscrowId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for EscrowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EscrowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "escrow:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// IdentityId
// ---------------------------------------------------------------------------

/// A verified internal identity, as vouched for by the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct IdentityId(pub Uuid);

impl IdentityId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for IdentityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "identity:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// SignalId
// ---------------------------------------------------------------------------

/// Stable identifier of an external merge signal.
///
/// Redeliveries of the same merge carry the same `SignalId`; the outcome log
/// is keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SignalId(pub String);

impl SignalId {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Signal ID for a merged pull request: `pr:<owner/repo>#<number>`.
    #[must_use]
    pub fn pull_request(repository: &str, number: u64) -> Self {
        Self(format!("pr:{repository}#{number}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// ReceiptId
// ---------------------------------------------------------------------------

/// Identifier of a payout receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ReceiptId(pub Uuid);

impl ReceiptId {
    /// Deterministic `ReceiptId` for the release triggered by `signal`.
    ///
    /// A redelivered signal resumes with the exact same receipt ID, which is
    /// what the ledger already recorded as the release cause.
    #[must_use]
    pub fn for_signal(signal: &SignalId) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"grantvault:receipt_id:v1:");
        hasher.update(signal.0.as_bytes());
        let hash = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hash[..16]);
        Self(Uuid::from_bytes(bytes))
    }
}

impl fmt::Display for ReceiptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "receipt:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ProgramId
// ---------------------------------------------------------------------------

/// Human-readable identifier of a grant program (e.g. "stellar-wave-2025").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ProgramId(pub String);

impl ProgramId {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "program:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// IssueRef
// ---------------------------------------------------------------------------

/// A tracked issue on the code host, e.g. `grantvault/core#42`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct IssueRef {
    /// `owner/repo`.
    pub repository: String,
    /// Issue number within the repository.
    pub number: u64,
}

impl IssueRef {
    #[must_use]
    pub fn new(repository: impl Into<String>, number: u64) -> Self {
        Self {
            repository: repository.into(),
            number,
        }
    }
}

impl fmt::Display for IssueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repository, self.number)
    }
}

// ---------------------------------------------------------------------------
// ExternalAccount / WalletAddress
// ---------------------------------------------------------------------------

/// An account on the code host (the merging account of a pull request).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ExternalAccount(pub String);

impl ExternalAccount {
    #[must_use]
    pub fn new(login: impl Into<String>) -> Self {
        Self(login.into())
    }
}

impl fmt::Display for ExternalAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Address on the funding backend that can send or receive value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct WalletAddress(pub String);

impl WalletAddress {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
