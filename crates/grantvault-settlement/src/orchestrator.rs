//! Release orchestrator: turns an authenticated merge signal plus a one-time
//! release authorization into exactly one escrow release and one receipt.
//!
//! ## Stages
//!
//! ```text
//! Received → IdentityResolved → AuthorizationConsumed → LedgerTransitioned → ReceiptRecorded
//! ```
//!
//! A checkpoint is written to the outcome log after each stage. A redelivered
//! signal resumes after its last checkpoint, so the token is never consumed
//! twice and the ledger is never asked to transition twice. Terminal outcomes
//! short-circuit every later delivery without touching the ledger.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use grantvault_custody::{EscrowLedger, TokenStore};
use grantvault_types::{
    Beneficiary, Bounty, BountyId, Checkpoint, Clock, EscrowRecord, EscrowState, MergeSignal,
    PayoutReceipt, ReceiptId, RejectReason, ReleaseOutcome, ReleaseReport, ReleaseStage, Result,
    TokenPurpose, TokenSubject, TransitionCause, VaultError,
};

use crate::{
    identity::IdentityProvider,
    outcome_log::{Begin, OutcomeLog},
    recorder::ProofRecorder,
    registry::BountyRegistry,
    signal_auth::SignalAuthenticator,
};

/// Collaborators the orchestrator drives.
#[derive(Clone)]
pub struct ReleaseOrchestrator {
    pub registry: Arc<BountyRegistry>,
    pub ledger: Arc<EscrowLedger>,
    pub tokens: Arc<TokenStore>,
    pub recorder: Arc<ProofRecorder>,
    pub outcomes: Arc<OutcomeLog>,
    pub identities: Arc<dyn IdentityProvider>,
    pub authenticator: Arc<dyn SignalAuthenticator>,
    pub clock: Arc<dyn Clock>,
}

impl ReleaseOrchestrator {
    /// Process one delivery of `signal` with the contributor's release token.
    ///
    /// Never panics and never returns an error: every failure is classified
    /// into the returned outcome.
    pub fn handle(&self, signal: &MergeSignal, authorization: &str) -> ReleaseReport {
        let now = self.clock.now();

        let mut checkpoint = match self.outcomes.begin(&signal.id, now) {
            Ok(Begin::Duplicate(outcome)) => {
                tracing::info!(signal = %signal.id, "duplicate merge signal short-circuited");
                return ReleaseReport {
                    signal_id: signal.id.clone(),
                    outcome,
                    duplicate: true,
                };
            }
            Ok(Begin::Resume(checkpoint)) => checkpoint,
            Err(err) => {
                tracing::warn!(signal = %signal.id, error = %err, "merge signal not claimed");
                return ReleaseReport {
                    signal_id: signal.id.clone(),
                    outcome: ReleaseOutcome::Retryable {
                        cause: err.to_string(),
                        stage: ReleaseStage::Received,
                    },
                    duplicate: false,
                };
            }
        };

        if checkpoint.stage > ReleaseStage::Received {
            tracing::info!(signal = %signal.id, stage = %checkpoint.stage, "resuming release");
        }

        let mut outcome = match self.advance(signal, authorization, &mut checkpoint, now) {
            Ok((bounty_id, receipt_id)) => ReleaseOutcome::Released {
                bounty_id,
                receipt_id,
            },
            // Forged signals must not claim the signal id for good.
            Err(VaultError::InvalidSignature) => {
                self.outcomes.abandon(&signal.id);
                tracing::warn!(signal = %signal.id, "merge signal failed authentication");
                return ReleaseReport {
                    signal_id: signal.id.clone(),
                    outcome: ReleaseOutcome::Rejected {
                        reason: RejectReason::InvalidSignature,
                        stage: checkpoint.stage,
                    },
                    duplicate: false,
                };
            }
            Err(err) => Self::classify(&err, checkpoint.stage),
        };

        if let Err(err) = self.outcomes.finish(&signal.id, &outcome, now) {
            tracing::warn!(signal = %signal.id, error = %err, "outcome not persisted");
            outcome = ReleaseOutcome::Retryable {
                cause: err.to_string(),
                stage: checkpoint.stage,
            };
        }

        match &outcome {
            ReleaseOutcome::Released { bounty_id, receipt_id } => tracing::info!(
                signal = %signal.id,
                bounty = %bounty_id,
                receipt = %receipt_id,
                "bounty released"
            ),
            ReleaseOutcome::Rejected { reason, stage } => tracing::warn!(
                signal = %signal.id,
                reason = %reason,
                stage = %stage,
                "release rejected"
            ),
            ReleaseOutcome::Retryable { cause, stage } => tracing::warn!(
                signal = %signal.id,
                cause = %cause,
                stage = %stage,
                "release deferred"
            ),
        }

        ReleaseReport {
            signal_id: signal.id.clone(),
            outcome,
            duplicate: false,
        }
    }

    fn classify(err: &VaultError, stage: ReleaseStage) -> ReleaseOutcome {
        match RejectReason::from_error(err) {
            Some(reason) => ReleaseOutcome::Rejected { reason, stage },
            None => ReleaseOutcome::Retryable {
                cause: err.to_string(),
                stage,
            },
        }
    }

    fn advance(
        &self,
        signal: &MergeSignal,
        authorization: &str,
        cp: &mut Checkpoint,
        now: DateTime<Utc>,
    ) -> Result<(BountyId, ReceiptId)> {
        self.authenticator.authenticate(signal)?;
        let bounty = self.bounty_for(signal, cp)?;

        if cp.stage < ReleaseStage::IdentityResolved {
            let resolved =
                self.registry
                    .resolve_beneficiary(&bounty, signal, self.identities.as_ref())?;
            cp.bounty_id = Some(bounty.id);
            cp.beneficiary = Some(resolved);
            self.save(signal, cp, ReleaseStage::IdentityResolved, now)?;
        }

        if cp.stage < ReleaseStage::AuthorizationConsumed {
            let resolved = Self::beneficiary(cp)?;
            let authorized = self.consume_authorization(authorization, &resolved, now)?;
            cp.beneficiary = Some(authorized);
            self.save(signal, cp, ReleaseStage::AuthorizationConsumed, now)?;
        }

        let receipt_id = ReceiptId::for_signal(&signal.id);
        if cp.stage < ReleaseStage::LedgerTransitioned {
            let beneficiary = Self::beneficiary(cp)?;
            let record = self.release_once(&bounty, beneficiary.clone(), receipt_id, now)?;
            let receipt = self.recorder.sign(PayoutReceipt::unsigned(
                receipt_id,
                bounty.id,
                record.id,
                record.amount,
                beneficiary,
                signal.id.clone(),
                record.entered_at,
            ));
            cp.receipt = Some(receipt);
            self.save(signal, cp, ReleaseStage::LedgerTransitioned, now)?;
        }

        if cp.stage < ReleaseStage::ReceiptRecorded {
            let receipt = cp
                .receipt
                .clone()
                .ok_or_else(|| VaultError::Internal("checkpoint lost its receipt".into()))?;
            self.recorder.record(receipt)?;
            self.save(signal, cp, ReleaseStage::ReceiptRecorded, now)?;
        }

        Ok((bounty.id, receipt_id))
    }

    fn bounty_for(&self, signal: &MergeSignal, cp: &Checkpoint) -> Result<Bounty> {
        let found = match cp.bounty_id {
            Some(id) => self.registry.get(&id),
            None => self.registry.bounty_for_issue(&signal.issue),
        };
        found.ok_or_else(|| VaultError::NoMatch {
            reason: format!("no bounty for {}", signal.issue),
        })
    }

    fn beneficiary(cp: &Checkpoint) -> Result<Beneficiary> {
        cp.beneficiary.clone().ok_or_else(|| {
            VaultError::Internal(format!("checkpoint at {} has no beneficiary", cp.stage))
        })
    }

    /// Consume the release token and check it authorizes `resolved`.
    fn consume_authorization(
        &self,
        authorization: &str,
        resolved: &Beneficiary,
        now: DateTime<Utc>,
    ) -> Result<Beneficiary> {
        let grant = self.tokens.consume(authorization, now)?;
        if grant.purpose != TokenPurpose::ReleaseAuthorization {
            return Err(VaultError::ExpiredOrInvalid);
        }
        let TokenSubject::Release { beneficiary } = grant.subject else {
            return Err(VaultError::ExpiredOrInvalid);
        };
        if beneficiary.identity != resolved.identity || beneficiary.account != resolved.account {
            return Err(VaultError::NoMatch {
                reason: format!(
                    "release token is for {}, merge was by {}",
                    beneficiary.account, resolved.account
                ),
            });
        }
        Ok(beneficiary)
    }

    /// Release the escrow, treating a release already made for this receipt
    /// (a crash before the checkpoint landed) as done.
    fn release_once(
        &self,
        bounty: &Bounty,
        beneficiary: Beneficiary,
        receipt_id: ReceiptId,
        now: DateTime<Utc>,
    ) -> Result<EscrowRecord> {
        match self.ledger.release(bounty.id, beneficiary, receipt_id, now) {
            Err(VaultError::FundsNotLocked {
                state: EscrowState::Released,
                ..
            }) if self.ledger.get(&bounty.id).is_some_and(|r| {
                r.cause == Some(TransitionCause::Receipt(receipt_id))
            }) =>
            {
                tracing::info!(
                    bounty = %bounty.id,
                    receipt = %receipt_id,
                    "release already applied"
                );
                self.ledger
                    .get(&bounty.id)
                    .ok_or(VaultError::EscrowNotFound(bounty.id))
            }
            other => other,
        }
    }

    fn save(
        &self,
        signal: &MergeSignal,
        cp: &mut Checkpoint,
        stage: ReleaseStage,
        now: DateTime<Utc>,
    ) -> Result<()> {
        cp.stage = stage;
        tracing::debug!(signal = %signal.id, stage = %stage, "checkpoint");
        self.outcomes.checkpoint(&signal.id, cp, now)
    }
}
