//! Payout receipts: the audit trail of every release.
//!
//! A [`PayoutReceipt`] commits to its fields with a SHA-256 content hash and
//! carries an ed25519 signature over that hash from the recorder that
//! appended it. Receipts are append-only; nothing mutates them.

use chrono::{DateTime, SecondsFormat, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Beneficiary, BountyId, EscrowId, ReceiptId, Result, SignalId, VaultError};

/// Proof that a bounty's escrow was released to a beneficiary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutReceipt {
    pub id: ReceiptId,
    pub bounty_id: BountyId,
    pub escrow_id: EscrowId,
    pub amount: Decimal,
    pub beneficiary: Beneficiary,
    /// The merge signal that triggered the release.
    pub signal_id: SignalId,
    pub released_at: DateTime<Utc>,
    /// SHA-256 over every field above.
    pub content_hash: [u8; 32],
    /// Ed25519 signature over `content_hash`. Empty until signed.
    pub signature: Vec<u8>,
    /// Public key of the recorder that signed.
    pub recorder_key: [u8; 32],
}

impl PayoutReceipt {
    /// Build an unsigned receipt with its content hash filled in.
    #[must_use]
    pub fn unsigned(
        id: ReceiptId,
        bounty_id: BountyId,
        escrow_id: EscrowId,
        amount: Decimal,
        beneficiary: Beneficiary,
        signal_id: SignalId,
        released_at: DateTime<Utc>,
    ) -> Self {
        let mut receipt = Self {
            id,
            bounty_id,
            escrow_id,
            amount,
            beneficiary,
            signal_id,
            released_at,
            content_hash: [0u8; 32],
            signature: Vec::new(),
            recorder_key: [0u8; 32],
        };
        receipt.content_hash = receipt.compute_hash();
        receipt
    }

    /// Recompute the content hash from the receipt's fields.
    ///
    /// Format: `"grantvault:receipt:v1:"` followed by each field, newline separated.
    #[must_use]
    pub fn compute_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"grantvault:receipt:v1:");
        for part in [
            self.id.0.to_string(),
            self.bounty_id.0.to_string(),
            self.escrow_id.0.to_string(),
            self.amount.normalize().to_string(),
            self.beneficiary.identity.0.to_string(),
            self.beneficiary.account.0.clone(),
            self.beneficiary.wallet.0.clone(),
            self.signal_id.0.clone(),
            self.released_at
                .to_rfc3339_opts(SecondsFormat::Micros, true),
        ] {
            hasher.update(part.as_bytes());
            hasher.update(b"\n");
        }
        hasher.finalize().into()
    }

    /// Hex form of the content hash, for logs.
    #[must_use]
    pub fn hash_hex(&self) -> String {
        hex::encode(self.content_hash)
    }

    /// Check the content hash and, if signed, the recorder's signature.
    ///
    /// # Errors
    /// Returns `Internal` describing which check failed.
    pub fn verify(&self) -> Result<()> {
        if self.compute_hash() != self.content_hash {
            return Err(VaultError::Internal(format!(
                "receipt {} content hash mismatch",
                self.id
            )));
        }
        if self.signature.is_empty() {
            return Err(VaultError::Internal(format!("receipt {} is unsigned", self.id)));
        }
        let key = VerifyingKey::from_bytes(&self.recorder_key).map_err(|e| {
            VaultError::Internal(format!("receipt {} has invalid recorder key: {e}", self.id))
        })?;
        let signature = Signature::from_slice(&self.signature).map_err(|e| {
            VaultError::Internal(format!("receipt {} has malformed signature: {e}", self.id))
        })?;
        key.verify(&self.content_hash, &signature).map_err(|_| {
            VaultError::Internal(format!("receipt {} signature does not verify", self.id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn receipt() -> PayoutReceipt {
        let signal = SignalId::pull_request("grantvault/core", 3);
        PayoutReceipt::unsigned(
            ReceiptId::for_signal(&signal),
            BountyId::new(),
            EscrowId::new(),
            Decimal::new(500, 0),
            Beneficiary::dummy("octocat"),
            signal,
            Utc::now(),
        )
    }

    fn sign(receipt: &mut PayoutReceipt) {
        let key = SigningKey::from_bytes(&[9u8; 32]);
        receipt.signature = key.sign(&receipt.content_hash).to_bytes().to_vec();
        receipt.recorder_key = key.verifying_key().to_bytes();
    }

    #[test]
    fn hash_is_stable() {
        let r = receipt();
        assert_eq!(r.compute_hash(), r.content_hash);
        assert_eq!(r.hash_hex().len(), 64);
    }

    #[test]
    fn signed_receipt_verifies() {
        let mut r = receipt();
        sign(&mut r);
        r.verify().unwrap();
    }

    #[test]
    fn unsigned_receipt_fails_verification() {
        assert!(receipt().verify().is_err());
    }

    #[test]
    fn tampered_amount_detected() {
        let mut r = receipt();
        sign(&mut r);
        r.amount = Decimal::new(5000, 0);
        assert!(r.verify().is_err());
    }

    #[test]
    fn tampered_beneficiary_detected_even_with_rehash() {
        let mut r = receipt();
        sign(&mut r);
        r.beneficiary.wallet = crate::WalletAddress::new("wallet:mallory");
        r.content_hash = r.compute_hash();
        assert!(r.verify().is_err(), "signature must not cover the new hash");
    }

    #[test]
    fn serde_roundtrip_preserves_validity() {
        let mut r = receipt();
        sign(&mut r);
        let json = serde_json::to_string(&r).unwrap();
        let back: PayoutReceipt = serde_json::from_str(&json).unwrap();
        assert_eq!(r, back);
        back.verify().unwrap();
    }
}
