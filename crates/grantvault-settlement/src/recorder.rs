//! Proof recorder: append-only, signed payout receipts.

use std::{collections::HashMap, path::Path};

use ed25519_dalek::{Signer, SigningKey};
use grantvault_custody::Journal;
use grantvault_types::{BountyId, IdentityId, PayoutReceipt, ReceiptId, Result, VaultError};
use parking_lot::RwLock;
use rust_decimal::Decimal;

#[derive(Debug, Default)]
struct Receipts {
    by_id: HashMap<ReceiptId, PayoutReceipt>,
    /// Append order.
    order: Vec<ReceiptId>,
}

impl Receipts {
    fn insert(&mut self, receipt: PayoutReceipt) {
        if self.by_id.contains_key(&receipt.id) {
            return;
        }
        self.order.push(receipt.id);
        self.by_id.insert(receipt.id, receipt);
    }
}

/// Signs and stores payout receipts.
pub struct ProofRecorder {
    key: SigningKey,
    receipts: RwLock<Receipts>,
    journal: Option<Journal<PayoutReceipt>>,
}

impl ProofRecorder {
    /// In-memory recorder signing with `key`.
    #[must_use]
    pub fn new(key: SigningKey) -> Self {
        Self {
            key,
            receipts: RwLock::new(Receipts::default()),
            journal: None,
        }
    }

    /// Journaled recorder, restored from `path`.
    ///
    /// # Errors
    /// Propagates journal open/replay failures.
    pub fn open(key: SigningKey, path: impl AsRef<Path>) -> Result<Self> {
        let (journal, entries) = Journal::<PayoutReceipt>::open(path)?;
        let mut receipts = Receipts::default();
        for receipt in entries {
            receipts.insert(receipt);
        }
        tracing::info!(receipts = receipts.order.len(), "proof recorder restored");
        Ok(Self {
            key,
            receipts: RwLock::new(receipts),
            journal: Some(journal),
        })
    }

    /// Public key receipts are signed with.
    #[must_use]
    pub fn public_key(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    /// Sign a receipt's content hash with this recorder's key.
    #[must_use]
    pub fn sign(&self, mut receipt: PayoutReceipt) -> PayoutReceipt {
        receipt.content_hash = receipt.compute_hash();
        receipt.recorder_key = self.public_key();
        receipt.signature = self.key.sign(&receipt.content_hash).to_bytes().to_vec();
        receipt
    }

    /// Append a receipt. Unsigned receipts are signed first.
    ///
    /// Recording a receipt id that is already present is a successful no-op
    /// returning the stored receipt.
    ///
    /// # Errors
    /// `Internal` if a signed receipt fails verification; `Io` if storage is
    /// unavailable.
    pub fn record(&self, receipt: PayoutReceipt) -> Result<PayoutReceipt> {
        let receipt = if receipt.signature.is_empty() {
            self.sign(receipt)
        } else {
            receipt
        };
        receipt.verify()?;

        let mut receipts = self.receipts.write();
        if let Some(existing) = receipts.by_id.get(&receipt.id) {
            tracing::debug!(receipt = %receipt.id, "receipt already recorded");
            return Ok(existing.clone());
        }
        if let Some(journal) = &self.journal {
            journal.append(&receipt)?;
        }
        tracing::info!(
            receipt = %receipt.id,
            bounty = %receipt.bounty_id,
            beneficiary = %receipt.beneficiary.account,
            amount = %receipt.amount,
            hash = %receipt.hash_hex(),
            "receipt recorded"
        );
        receipts.insert(receipt.clone());
        Ok(receipt)
    }

    #[must_use]
    pub fn get(&self, id: &ReceiptId) -> Option<PayoutReceipt> {
        self.receipts.read().by_id.get(id).cloned()
    }

    /// Receipts for one bounty, in append order.
    #[must_use]
    pub fn list_by_bounty(&self, bounty_id: &BountyId) -> Vec<PayoutReceipt> {
        self.filtered(|r| &r.bounty_id == bounty_id)
    }

    /// Receipts paid to one identity, in append order.
    #[must_use]
    pub fn list_by_beneficiary(&self, identity: &IdentityId) -> Vec<PayoutReceipt> {
        self.filtered(|r| &r.beneficiary.identity == identity)
    }

    /// Every receipt, in append order.
    #[must_use]
    pub fn all(&self) -> Vec<PayoutReceipt> {
        self.filtered(|_| true)
    }

    /// Sum of all recorded payouts.
    #[must_use]
    pub fn total_paid(&self) -> Decimal {
        self.receipts.read().by_id.values().map(|r| r.amount).sum()
    }

    /// Check a receipt's content hash and signature.
    ///
    /// # Errors
    /// `Internal` naming the failed check, or if the receipt differs from
    /// the stored one with the same id.
    pub fn verify(&self, receipt: &PayoutReceipt) -> Result<()> {
        receipt.verify()?;
        match self.get(&receipt.id) {
            Some(stored) if &stored != receipt => Err(VaultError::Internal(format!(
                "receipt {} differs from the recorded copy",
                receipt.id
            ))),
            _ => Ok(()),
        }
    }

    fn filtered(&self, keep: impl Fn(&PayoutReceipt) -> bool) -> Vec<PayoutReceipt> {
        let receipts = self.receipts.read();
        receipts
            .order
            .iter()
            .filter_map(|id| receipts.by_id.get(id))
            .filter(|r| keep(r))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use grantvault_types::{Beneficiary, EscrowId, SignalId};

    fn receipt(pr: u64, beneficiary: &Beneficiary, bounty: BountyId) -> PayoutReceipt {
        let signal = SignalId::pull_request("org/repo", pr);
        PayoutReceipt::unsigned(
            ReceiptId::for_signal(&signal),
            bounty,
            EscrowId::new(),
            Decimal::new(500, 0),
            beneficiary.clone(),
            signal,
            Utc::now(),
        )
    }

    fn recorder() -> ProofRecorder {
        ProofRecorder::new(SigningKey::from_bytes(&[5u8; 32]))
    }

    #[test]
    fn record_signs_and_lists() {
        let recorder = recorder();
        let dev = Beneficiary::dummy("octocat");
        let bounty = BountyId::new();

        let stored = recorder.record(receipt(1, &dev, bounty)).unwrap();
        assert!(!stored.signature.is_empty());
        assert_eq!(stored.recorder_key, recorder.public_key());
        recorder.verify(&stored).unwrap();

        assert_eq!(recorder.list_by_bounty(&bounty).len(), 1);
        assert_eq!(recorder.list_by_beneficiary(&dev.identity).len(), 1);
        assert!(recorder.list_by_bounty(&BountyId::new()).is_empty());
    }

    #[test]
    fn duplicate_id_is_noop() {
        let recorder = recorder();
        let dev = Beneficiary::dummy("octocat");
        let bounty = BountyId::new();
        let first = recorder.record(receipt(1, &dev, bounty)).unwrap();
        let again = recorder.record(receipt(1, &dev, bounty)).unwrap();

        assert_eq!(first, again);
        assert_eq!(recorder.all().len(), 1);
        assert_eq!(recorder.total_paid(), Decimal::new(500, 0));
    }

    #[test]
    fn tampered_receipt_fails_verification() {
        let recorder = recorder();
        let dev = Beneficiary::dummy("octocat");
        let mut stored = recorder.record(receipt(1, &dev, BountyId::new())).unwrap();
        stored.amount = Decimal::new(5000, 0);
        assert!(recorder.verify(&stored).is_err());

        // Re-hashing does not help without the recorder's key.
        stored.content_hash = stored.compute_hash();
        assert!(recorder.verify(&stored).is_err());
    }

    #[test]
    fn receipts_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("receipts.jsonl");
        let dev = Beneficiary::dummy("octocat");
        let bounty = BountyId::new();
        let id = {
            let recorder = ProofRecorder::open(SigningKey::from_bytes(&[5u8; 32]), &path).unwrap();
            recorder.record(receipt(1, &dev, bounty)).unwrap().id
        };

        let recorder = ProofRecorder::open(SigningKey::from_bytes(&[6u8; 32]), &path).unwrap();
        let stored = recorder.get(&id).unwrap();
        recorder.verify(&stored).unwrap();
        assert_eq!(recorder.list_by_bounty(&bounty).len(), 1);
    }
}
