//! Escrow ledger: exclusive owner of every [`EscrowRecord`].
//!
//! All custody mutations go through [`EscrowLedger::transition`]. Requests
//! for one bounty are serialized by a per-record mutex, so two concurrent
//! release attempts cannot both observe `Locked`. Requests for different
//! bounties never contend beyond a brief map read.
//!
//! Value movement is delegated to a [`FundingBackend`]. A record only leaves
//! `Locked` after the backend confirms the transfer and the new state is
//! journaled. Backend references are derived from the escrow id and target
//! state, so retrying after an ambiguous failure cannot pay twice.
//!
//! If the backend confirms a payout but journaling the new state fails, the
//! record stays `Locked` and the confirmed settlement is pinned: only the same
//! target and payee may retry it, which replays the same backend reference.
//!
//! Flow totals (collected, released, refunded) are kept beside the records.
//! [`EscrowLedger::audit`] waits for in-progress transitions and checks
//! custody conservation against a consistent snapshot.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use grantvault_types::{
    Beneficiary, BountyId, EscrowId, EscrowRecord, EscrowState, ReceiptId, RefundReason, Result,
    TransitionRequest, VaultError, WalletAddress,
};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;

use crate::{
    conservation::CustodyConservation,
    journal::Journal,
    wallet::{FundingBackend, TransferReceipt},
};

/// Owns custody state for every funded bounty.
pub struct EscrowLedger {
    records: RwLock<HashMap<BountyId, Arc<Mutex<EscrowRecord>>>>,
    /// Bounties with a lock in progress.
    locking: Mutex<HashSet<BountyId>>,
    backend: Arc<dyn FundingBackend>,
    transfer_attempts: u32,
    journal: Option<Journal<EscrowRecord>>,
    /// Payouts the backend confirmed but the journal has not recorded.
    unjournaled: Mutex<HashMap<BountyId, (EscrowState, WalletAddress)>>,
    /// Transitions hold this shared; `audit` holds it exclusively.
    gate: RwLock<()>,
    flows: Mutex<CustodyConservation>,
}

/// Releases a lock reservation on drop.
struct Reservation<'a> {
    set: &'a Mutex<HashSet<BountyId>>,
    bounty_id: BountyId,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.bounty_id);
    }
}

impl EscrowLedger {
    /// An in-memory ledger.
    #[must_use]
    pub fn new(backend: Arc<dyn FundingBackend>, transfer_attempts: u32) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            locking: Mutex::new(HashSet::new()),
            backend,
            transfer_attempts: transfer_attempts.max(1),
            journal: None,
            unjournaled: Mutex::new(HashMap::new()),
            gate: RwLock::new(()),
            flows: Mutex::new(CustodyConservation::new()),
        }
    }

    /// A journaled ledger, restored from `path`.
    ///
    /// The last journaled snapshot of each record wins.
    ///
    /// # Errors
    /// Propagates journal open/replay failures.
    pub fn open(
        backend: Arc<dyn FundingBackend>,
        transfer_attempts: u32,
        path: impl AsRef<Path>,
    ) -> Result<Self> {
        let (journal, snapshots) = Journal::<EscrowRecord>::open(path)?;
        let mut latest = HashMap::new();
        for snapshot in snapshots {
            latest.insert(snapshot.bounty_id, snapshot);
        }
        let flows = CustodyConservation::from_records(latest.values());
        tracing::info!(
            records = latest.len(),
            collected = %flows.collected,
            "escrow ledger restored"
        );

        let records = latest
            .into_iter()
            .map(|(id, record)| (id, Arc::new(Mutex::new(record))))
            .collect();
        let mut ledger = Self::new(backend, transfer_attempts);
        ledger.records = RwLock::new(records);
        ledger.flows = Mutex::new(flows);
        ledger.journal = Some(journal);
        Ok(ledger)
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Apply a transition request. The single mutation entry point.
    ///
    /// # Errors
    /// - `AlreadyLocked` for any `Lock` on an existing record
    /// - `EscrowNotFound` for release/refund on an unknown bounty
    /// - `FundsNotLocked` for release/refund on a terminal record
    /// - `Retryable` if the backend stayed unavailable; state is unchanged
    pub fn transition(
        &self,
        bounty_id: BountyId,
        request: TransitionRequest,
        now: DateTime<Utc>,
    ) -> Result<EscrowRecord> {
        let (funder, amount) = match request {
            TransitionRequest::Lock { funder, amount } => (funder, amount),
            outbound => return self.settle(bounty_id, outbound, now),
        };
        self.lock_funds(bounty_id, EscrowId::new(), &funder, amount, now)
    }

    /// Collect `amount` from `funder` and create a `Locked` record.
    ///
    /// # Errors
    /// `InvalidAmount` for a non-positive amount, `AlreadyLocked` if the
    /// bounty already has a record, plus backend failures.
    pub fn lock(
        &self,
        bounty_id: BountyId,
        escrow_id: EscrowId,
        funder: &WalletAddress,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<EscrowRecord> {
        self.lock_funds(bounty_id, escrow_id, funder, amount, now)
    }

    /// Release the locked amount to `beneficiary`.
    ///
    /// # Errors
    /// See [`Self::transition`].
    pub fn release(
        &self,
        bounty_id: BountyId,
        beneficiary: Beneficiary,
        receipt: ReceiptId,
        now: DateTime<Utc>,
    ) -> Result<EscrowRecord> {
        self.transition(
            bounty_id,
            TransitionRequest::Release {
                beneficiary,
                receipt,
            },
            now,
        )
    }

    /// Return the locked amount to the funder.
    ///
    /// # Errors
    /// See [`Self::transition`].
    pub fn refund(
        &self,
        bounty_id: BountyId,
        reason: RefundReason,
        now: DateTime<Utc>,
    ) -> Result<EscrowRecord> {
        self.transition(bounty_id, TransitionRequest::Refund { reason }, now)
    }

    fn lock_funds(
        &self,
        bounty_id: BountyId,
        escrow_id: EscrowId,
        funder: &WalletAddress,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<EscrowRecord> {
        if amount <= Decimal::ZERO {
            return Err(VaultError::InvalidAmount {
                reason: format!("lock amount must be positive, got {amount}"),
            });
        }

        // Reserve before checking the map so a lock finishing concurrently is
        // always observed.
        if !self.locking.lock().insert(bounty_id) {
            return Err(VaultError::AlreadyLocked(bounty_id));
        }
        let _reservation = Reservation {
            set: &self.locking,
            bounty_id,
        };
        if self.records.read().contains_key(&bounty_id) {
            return Err(VaultError::AlreadyLocked(bounty_id));
        }

        let reference = format!("{escrow_id}:{}", EscrowState::Locked);
        self.with_retries(&reference, || {
            self.backend.collect(funder, amount, &reference)
        })?;

        let record = EscrowRecord::locked(escrow_id, bounty_id, funder.clone(), amount, now);
        if let Err(err) = self.persist(&record) {
            // Hand the collected funds back; the lock never happened.
            let undo = format!("{reference}:compensate");
            if let Err(undo_err) = self.with_retries(&undo, || {
                self.backend.transfer(funder, amount, &undo)
            }) {
                tracing::error!(
                    bounty = %bounty_id,
                    error = %undo_err,
                    "failed to return collected funds after journal failure"
                );
            }
            return Err(err);
        }

        {
            let _gate = self.gate.read();
            self.records
                .write()
                .insert(bounty_id, Arc::new(Mutex::new(record.clone())));
            self.flows.lock().record_collected(amount);
        }
        tracing::info!(
            bounty = %bounty_id,
            escrow = %escrow_id,
            funder = %funder,
            amount = %amount,
            "funds locked"
        );
        Ok(record)
    }

    fn settle(
        &self,
        bounty_id: BountyId,
        request: TransitionRequest,
        now: DateTime<Utc>,
    ) -> Result<EscrowRecord> {
        let slot = self
            .records
            .read()
            .get(&bounty_id)
            .cloned()
            .ok_or(VaultError::EscrowNotFound(bounty_id))?;
        let _gate = self.gate.read();
        let mut record = slot.lock();

        let target = request.target();
        if let Err(err) = record.state.check_transition(target, bounty_id) {
            tracing::warn!(
                bounty = %bounty_id,
                state = %record.state,
                target = %target,
                "rejected escrow transition"
            );
            return Err(err);
        }

        let payee = record
            .payee(&request)
            .cloned()
            .ok_or_else(|| VaultError::Internal(format!("no payee for {target}")))?;
        let pinned = self.unjournaled.lock().get(&bounty_id).cloned();
        if let Some((moved, paid)) = pinned {
            if moved != target || paid != payee {
                tracing::warn!(
                    bounty = %bounty_id,
                    settled = %moved,
                    target = %target,
                    "payout already confirmed for another settlement"
                );
                return Err(VaultError::FundsNotLocked {
                    bounty: bounty_id,
                    state: moved,
                });
            }
        }

        let reference = format!("{}:{target}", record.id);
        let amount = record.amount;
        self.with_retries(&reference, || {
            self.backend.transfer(&payee, amount, &reference)
        })?;

        let mut next = record.clone();
        next.apply(request, now)?;
        if let Err(err) = self.persist(&next) {
            tracing::error!(
                bounty = %bounty_id,
                target = %target,
                error = %err,
                "payout confirmed but not journaled"
            );
            self.unjournaled.lock().insert(bounty_id, (target, payee));
            return Err(err);
        }
        self.unjournaled.lock().remove(&bounty_id);
        {
            let mut flows = self.flows.lock();
            match next.state {
                EscrowState::Released => flows.record_released(amount),
                EscrowState::Refunded => flows.record_refunded(amount),
                EscrowState::Locked => {}
            }
        }
        *record = next;

        tracing::info!(
            bounty = %bounty_id,
            escrow = %record.id,
            state = %record.state,
            payee = %payee,
            amount = %amount,
            "escrow settled"
        );
        Ok(record.clone())
    }

    fn with_retries(
        &self,
        reference: &str,
        mut call: impl FnMut() -> Result<TransferReceipt>,
    ) -> Result<TransferReceipt> {
        let mut attempt = 1;
        loop {
            match call() {
                Ok(receipt) => return Ok(receipt),
                Err(err) if err.is_retryable() && attempt < self.transfer_attempts => {
                    tracing::warn!(
                        reference,
                        attempt,
                        error = %err,
                        "funding backend call failed, retrying"
                    );
                    attempt += 1;
                }
                Err(err) if err.is_retryable() => {
                    tracing::warn!(reference, attempts = attempt, "funding backend exhausted");
                    return Err(VaultError::retryable(format!(
                        "transfer {reference} not confirmed after {attempt} attempts: {err}"
                    )));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn persist(&self, record: &EscrowRecord) -> Result<()> {
        match &self.journal {
            Some(journal) => journal.append(record),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Snapshot of one record.
    #[must_use]
    pub fn get(&self, bounty_id: &BountyId) -> Option<EscrowRecord> {
        self.records
            .read()
            .get(bounty_id)
            .map(|slot| slot.lock().clone())
    }

    /// Snapshot of every record.
    #[must_use]
    pub fn records(&self) -> Vec<EscrowRecord> {
        self.records
            .read()
            .values()
            .map(|slot| slot.lock().clone())
            .collect()
    }

    /// Sum of amounts currently in `Locked`.
    #[must_use]
    pub fn total_locked(&self) -> Decimal {
        self.records()
            .iter()
            .filter(|r| r.state == EscrowState::Locked)
            .map(|r| r.amount)
            .sum()
    }

    /// Check custody conservation against a consistent snapshot.
    ///
    /// Waits for transitions in progress to finish; new ones wait for the
    /// audit.
    ///
    /// # Errors
    /// `ConservationViolation` if the flow totals disagree with the records.
    pub fn audit(&self) -> Result<CustodyConservation> {
        let _gate = self.gate.write();
        let flows = *self.flows.lock();
        flows.check(self.total_locked())?;
        Ok(flows)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
