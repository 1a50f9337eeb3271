//! Merge signal authenticity.
//!
//! The code host signs each delivery with HMAC-SHA256 under a shared secret.
//! The proof travels as `sha256=<hex>` and covers
//! [`MergeSignal::canonical_payload`]. Comparison is constant time.

use grantvault_types::{MergeSignal, Result, VaultError, constants::SIGNAL_PROOF_PREFIX};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Checks that a merge signal came from the trusted event source.
pub trait SignalAuthenticator: Send + Sync {
    /// # Errors
    /// `InvalidSignature` if the proof is missing, malformed or wrong.
    fn authenticate(&self, signal: &MergeSignal) -> Result<()>;
}

/// Shared-secret HMAC-SHA256 authenticator.
pub struct HmacSignalAuthenticator {
    secret: Vec<u8>,
}

impl HmacSignalAuthenticator {
    /// # Errors
    /// `Configuration` for an empty secret.
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(VaultError::Configuration(
                "signal secret must not be empty".into(),
            ));
        }
        Ok(Self { secret })
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| VaultError::Internal(format!("hmac key rejected: {e}")))
    }

    /// Proof string for `signal` under this secret.
    ///
    /// # Errors
    /// `Internal` if the key is rejected by the MAC.
    pub fn sign(&self, signal: &MergeSignal) -> Result<String> {
        let mut mac = self.mac()?;
        mac.update(&signal.canonical_payload());
        Ok(format!(
            "{SIGNAL_PROOF_PREFIX}{}",
            hex::encode(mac.finalize().into_bytes())
        ))
    }
}

impl SignalAuthenticator for HmacSignalAuthenticator {
    fn authenticate(&self, signal: &MergeSignal) -> Result<()> {
        let expected = signal
            .proof
            .strip_prefix(SIGNAL_PROOF_PREFIX)
            .and_then(|h| hex::decode(h).ok())
            .ok_or(VaultError::InvalidSignature)?;

        let mut mac = self.mac()?;
        mac.update(&signal.canonical_payload());
        mac.verify_slice(&expected).map_err(|_| {
            tracing::warn!(signal = %signal.id, "merge signal proof mismatch");
            VaultError::InvalidSignature
        })
    }
}
