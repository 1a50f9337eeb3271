//! Merge signals delivered by the code host.
//!
//! A [`MergeSignal`] is untrusted input until its `proof` has been checked
//! against [`MergeSignal::canonical_payload`]. Delivery is at-least-once and
//! unordered, so every field that feeds the decision is covered by the proof.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::{ExternalAccount, IssueRef, SignalId};

/// A "pull request merged" event tied to an issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSignal {
    /// Stable across redeliveries.
    pub id: SignalId,
    /// The issue the pull request closes.
    pub issue: IssueRef,
    pub pull_request: u64,
    pub merged_by: ExternalAccount,
    pub merged_at: DateTime<Utc>,
    /// Authenticity proof, `sha256=<hex hmac>`.
    pub proof: String,
}

impl MergeSignal {
    /// An unsigned signal for a pull request in the issue's repository.
    #[must_use]
    pub fn new(
        issue: IssueRef,
        pull_request: u64,
        merged_by: ExternalAccount,
        merged_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SignalId::pull_request(&issue.repository, pull_request),
            issue,
            pull_request,
            merged_by,
            merged_at,
            proof: String::new(),
        }
    }

    /// Attach an authenticity proof.
    #[must_use]
    pub fn with_proof(mut self, proof: impl Into<String>) -> Self {
        self.proof = proof.into();
        self
    }

    /// Bytes covered by the authenticity proof.
    ///
    /// Format: `"grantvault:merge:v1:" || id || \n || issue || \n || pr || \n || merged_by || \n || merged_at`
    #[must_use]
    pub fn canonical_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(128);
        payload.extend_from_slice(b"grantvault:merge:v1:");
        payload.extend_from_slice(self.id.0.as_bytes());
        payload.push(b'\n');
        payload.extend_from_slice(self.issue.to_string().as_bytes());
        payload.push(b'\n');
        payload.extend_from_slice(self.pull_request.to_string().as_bytes());
        payload.push(b'\n');
        payload.extend_from_slice(self.merged_by.0.as_bytes());
        payload.push(b'\n');
        payload.extend_from_slice(
            self.merged_at
                .to_rfc3339_opts(SecondsFormat::Millis, true)
                .as_bytes(),
        );
        payload
    }
}
