//! `GrantVault`: the service facade wiring custody and settlement together.
//!
//! Owns one of each component, restores them from `data_dir` journals when
//! configured, and exposes the funding, refund, token and merge operations.
//! Conservation is re-checked after every step that moves value.

use std::{path::Path, sync::Arc};

use ed25519_dalek::SigningKey;
use grantvault_custody::{
    CustodyConservation, EscrowLedger, FundingBackend, FundingLimiter, RedirectPolicy, TokenStore,
};
use grantvault_types::{
    Bounty, BountyId, BountyTerms, Clock, EscrowId, EscrowRecord, EscrowState, ExternalAccount,
    GrantProgram, MergeSignal, ProgramId, RateLimitConfig, RefundApproval, RefundReason,
    ReleaseOutcome, ReleaseReport, Result, TokenPurpose, TokenSubject, TokenValue,
    TransitionCause, VaultConfig, VaultError, WalletAddress, constants,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::{
    identity::{IdentityProvider, IdentityStatus},
    orchestrator::ReleaseOrchestrator,
    outcome_log::OutcomeLog,
    program::ProgramBook,
    recorder::ProofRecorder,
    registry::BountyRegistry,
    signal_auth::HmacSignalAuthenticator,
};

/// Whether a bounty can be refunded right now, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundEligibility {
    pub bounty_id: BountyId,
    pub state: EscrowState,
    pub amount: Decimal,
    pub deadline_passed: bool,
    pub approval: Option<RefundApproval>,
    pub eligible: bool,
}

pub struct GrantVault {
    config: VaultConfig,
    registry: Arc<BountyRegistry>,
    programs: ProgramBook,
    ledger: Arc<EscrowLedger>,
    tokens: Arc<TokenStore>,
    recorder: Arc<ProofRecorder>,
    outcomes: Arc<OutcomeLog>,
    identities: Arc<dyn IdentityProvider>,
    limiter: FundingLimiter,
    orchestrator: ReleaseOrchestrator,
    clock: Arc<dyn Clock>,
    /// Serializes validate → allocate → lock → register.
    funding: Mutex<()>,
}

impl GrantVault {
    /// Build a vault from `config`.
    ///
    /// With `data_dir` set, every component is journaled there and restored
    /// from what it finds; otherwise everything lives in memory.
    ///
    /// # Errors
    /// `Configuration` for an invalid config or empty signal secret; journal
    /// open/replay failures.
    pub fn open(
        config: VaultConfig,
        backend: Arc<dyn FundingBackend>,
        identities: Arc<dyn IdentityProvider>,
        recorder_key: SigningKey,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let authenticator = Arc::new(HmacSignalAuthenticator::new(config.signal_secret()?)?);
        let admins: Vec<WalletAddress> = config.admins.iter().map(WalletAddress::new).collect();
        let redirects = RedirectPolicy::new(config.token.allowed_redirects.clone());
        let attempts = config.retry.transfer_attempts;

        let (registry, programs, ledger, tokens, recorder, outcomes) = match &config.data_dir {
            Some(dir) => {
                let dir = Path::new(dir);
                (
                    BountyRegistry::open(admins, dir.join(constants::REGISTRY_JOURNAL))?,
                    ProgramBook::open(dir.join(constants::PROGRAM_JOURNAL))?,
                    EscrowLedger::open(backend, attempts, dir.join(constants::ESCROW_JOURNAL))?,
                    TokenStore::open(redirects, dir.join(constants::TOKEN_JOURNAL))?,
                    ProofRecorder::open(recorder_key, dir.join(constants::RECEIPT_JOURNAL))?,
                    OutcomeLog::open(dir.join(constants::OUTCOME_JOURNAL))?,
                )
            }
            None => (
                BountyRegistry::new(admins),
                ProgramBook::new(),
                EscrowLedger::new(backend, attempts),
                TokenStore::new(redirects),
                ProofRecorder::new(recorder_key),
                OutcomeLog::new(),
            ),
        };

        let registry = Arc::new(registry);
        let ledger = Arc::new(ledger);
        let tokens = Arc::new(tokens);
        let recorder = Arc::new(recorder);
        let outcomes = Arc::new(outcomes);
        let orchestrator = ReleaseOrchestrator {
            registry: registry.clone(),
            ledger: ledger.clone(),
            tokens: tokens.clone(),
            recorder: recorder.clone(),
            outcomes: outcomes.clone(),
            identities: identities.clone(),
            authenticator,
            clock: clock.clone(),
        };

        tracing::info!(
            engine = constants::ENGINE_NAME,
            version = constants::VERSION,
            persistent = config.data_dir.is_some(),
            bounties = registry.bounties().len(),
            escrows = ledger.len(),
            receipts = recorder.all().len(),
            "vault opened"
        );

        let vault = Self {
            limiter: FundingLimiter::new(config.rate_limit.clone()),
            config,
            registry,
            programs,
            ledger,
            tokens,
            recorder,
            outcomes,
            identities,
            orchestrator,
            clock,
            funding: Mutex::new(()),
        };
        vault.check_conservation("open");
        Ok(vault)
    }

    // ------------------------------------------------------------------
    // Programs and funding
    // ------------------------------------------------------------------

    /// # Errors
    /// `ProgramExists` or `InvalidAmount`.
    pub fn open_program(
        &self,
        id: ProgramId,
        funder: WalletAddress,
        total: Decimal,
    ) -> Result<GrantProgram> {
        self.programs.open_program(id, funder, total, self.clock.now())
    }

    /// # Errors
    /// `ProgramNotFound` or `InvalidAmount`.
    pub fn top_up(&self, id: &ProgramId, amount: Decimal) -> Result<GrantProgram> {
        self.programs.top_up(id, amount)
    }

    /// Fund a bounty from its program and lock the amount in escrow.
    ///
    /// Either the bounty ends up registered with a `Locked` escrow, or
    /// nothing is left behind: a failed lock reverts the allocation and a
    /// failed registration refunds the lock.
    ///
    /// # Errors
    /// Validation errors from the registry, `RateLimitExceeded` /
    /// `CooldownActive`, program errors, and ledger or backend failures.
    pub fn fund_bounty(&self, terms: BountyTerms) -> Result<Bounty> {
        let _funding = self.funding.lock();
        let now = self.clock.now();

        self.registry.validate_terms(&terms, now)?;
        self.limiter.check(&terms.funder, now)?;

        let bounty_id = BountyId::new();
        let escrow_id = EscrowId::new();
        self.programs
            .allocate(&terms.program, &terms.funder, bounty_id, terms.amount, now)?;

        if let Err(err) = self
            .ledger
            .lock(bounty_id, escrow_id, &terms.funder, terms.amount, now)
        {
            if let Err(revert) = self.programs.revert(&terms.program, bounty_id) {
                tracing::error!(bounty = %bounty_id, error = %revert, "allocation not reverted");
            }
            return Err(err);
        }

        let program = terms.program.clone();
        match self.registry.register(bounty_id, escrow_id, terms, now) {
            Ok(bounty) => {
                self.limiter.record(&bounty.funder, now);
                self.check_conservation("fund");
                Ok(bounty)
            }
            Err(err) => {
                tracing::warn!(bounty = %bounty_id, error = %err, "registration failed after lock");
                if let Err(undo) =
                    self.ledger
                        .refund(bounty_id, RefundReason::RegistrationFailed, now)
                {
                    tracing::error!(
                        bounty = %bounty_id,
                        error = %undo,
                        "orphaned lock not refunded"
                    );
                } else if let Err(revert) = self.programs.revert(&program, bounty_id) {
                    tracing::error!(
                        bounty = %bounty_id,
                        error = %revert,
                        "allocation not reverted"
                    );
                }
                self.check_conservation("fund");
                Err(err)
            }
        }
    }

    /// Push a bounty's deadline later. Settled bounties are archival.
    ///
    /// # Errors
    /// `BountyNotFound`, `FundsNotLocked` once the escrow is released or
    /// refunded, `NotAuthorized` or `InvalidDeadline`.
    pub fn extend_deadline(
        &self,
        bounty_id: BountyId,
        requester: &WalletAddress,
        new_deadline: chrono::DateTime<chrono::Utc>,
    ) -> Result<Bounty> {
        let record = self
            .ledger
            .get(&bounty_id)
            .ok_or(VaultError::BountyNotFound(bounty_id))?;
        if record.state.is_terminal() {
            tracing::warn!(
                bounty = %bounty_id,
                state = %record.state,
                "deadline change on settled bounty"
            );
            return Err(VaultError::FundsNotLocked {
                bounty: bounty_id,
                state: record.state,
            });
        }
        self.registry
            .extend_deadline(bounty_id, requester, new_deadline)
    }

    // ------------------------------------------------------------------
    // Refunds
    // ------------------------------------------------------------------

    /// # Errors
    /// `BountyNotFound` or `NotAuthorized`.
    pub fn approve_refund(
        &self,
        bounty_id: BountyId,
        approver: &WalletAddress,
    ) -> Result<RefundApproval> {
        self.registry
            .approve_refund(bounty_id, approver, self.clock.now())
    }

    /// # Errors
    /// `BountyNotFound`, or `EscrowNotFound` if the registry and ledger
    /// disagree.
    pub fn refund_eligibility(&self, bounty_id: BountyId) -> Result<RefundEligibility> {
        let bounty = self
            .registry
            .get(&bounty_id)
            .ok_or(VaultError::BountyNotFound(bounty_id))?;
        let record = self
            .ledger
            .get(&bounty_id)
            .ok_or(VaultError::EscrowNotFound(bounty_id))?;
        let deadline_passed = self.clock.now() > bounty.deadline;
        let approval = self.registry.refund_approval(&bounty_id);
        Ok(RefundEligibility {
            bounty_id,
            state: record.state,
            amount: record.amount,
            deadline_passed,
            eligible: record.state == EscrowState::Locked
                && (deadline_passed || approval.is_some()),
            approval,
        })
    }

    /// Return a bounty's full locked amount to its funder.
    ///
    /// Allowed once the deadline has passed or an administrator approved it.
    /// Only the funder or an administrator may ask.
    ///
    /// # Errors
    /// `NotAuthorized`, `FundsNotLocked` for a settled escrow,
    /// `RefundNotEligible`, or ledger and backend failures.
    pub fn refund(&self, bounty_id: BountyId, requester: &WalletAddress) -> Result<EscrowRecord> {
        let bounty = self
            .registry
            .get(&bounty_id)
            .ok_or(VaultError::BountyNotFound(bounty_id))?;
        if &bounty.funder != requester && !self.is_admin(requester) {
            return Err(VaultError::NotAuthorized {
                reason: format!("{requester} may not refund {bounty_id}"),
            });
        }

        let eligibility = self.refund_eligibility(bounty_id)?;
        if eligibility.state != EscrowState::Locked {
            return Err(VaultError::FundsNotLocked {
                bounty: bounty_id,
                state: eligibility.state,
            });
        }
        let reason = match (eligibility.approval, eligibility.deadline_passed) {
            (Some(approval), _) => RefundReason::Approved {
                approver: approval.approver,
            },
            (None, true) => RefundReason::DeadlineElapsed,
            (None, false) => {
                return Err(VaultError::RefundNotEligible {
                    bounty: bounty_id,
                    reason: format!("deadline {} not reached and no approval", bounty.deadline),
                });
            }
        };

        let record = self.ledger.refund(bounty_id, reason, self.clock.now())?;
        self.check_conservation("refund");
        Ok(record)
    }

    // ------------------------------------------------------------------
    // Tokens
    // ------------------------------------------------------------------

    /// Issue a release authorization for a verified contributor.
    ///
    /// # Errors
    /// `NotAuthorized` if `account` is not verified; provider failures.
    pub fn issue_release_token(&self, account: &ExternalAccount) -> Result<TokenValue> {
        let IdentityStatus::Verified(beneficiary) = self.identities.verify(account)? else {
            return Err(VaultError::NotAuthorized {
                reason: format!("{account} is not a verified contributor"),
            });
        };
        self.tokens.issue(
            TokenSubject::Release { beneficiary },
            TokenPurpose::ReleaseAuthorization,
            self.config.token.ttl(),
            self.clock.now(),
        )
    }

    /// Issue a login token that redirects to `destination` once.
    ///
    /// # Errors
    /// `RedirectNotAllowed` outside the allow-list.
    pub fn issue_login_token(&self, destination: &str) -> Result<TokenValue> {
        self.tokens.issue(
            TokenSubject::Redirect {
                destination: destination.to_string(),
            },
            TokenPurpose::LoginRedirect,
            self.config.token.ttl(),
            self.clock.now(),
        )
    }

    /// Consume a login token and return where to send the user.
    ///
    /// # Errors
    /// `ExpiredOrInvalid` for anything but a live login token;
    /// `RedirectNotAllowed` if the destination left the allow-list.
    pub fn complete_login(&self, raw: &str) -> Result<String> {
        let grant = self.tokens.consume(raw, self.clock.now())?;
        match grant.subject {
            TokenSubject::Redirect { destination }
                if grant.purpose == TokenPurpose::LoginRedirect =>
            {
                Ok(destination)
            }
            _ => Err(VaultError::ExpiredOrInvalid),
        }
    }

    /// Drop spent and expired tokens.
    ///
    /// # Errors
    /// `Io` if the sweep cannot be journaled.
    pub fn sweep_tokens(&self) -> Result<usize> {
        self.tokens.sweep(self.clock.now())
    }

    // ------------------------------------------------------------------
    // Merge signals
    // ------------------------------------------------------------------

    /// Handle one delivery of a merge signal.
    pub fn process_merge(&self, signal: &MergeSignal, authorization: &str) -> ReleaseReport {
        let report = self.orchestrator.handle(signal, authorization);
        if matches!(report.outcome, ReleaseOutcome::Released { .. }) && !report.duplicate {
            self.check_conservation("release");
        }
        report
    }

    // ------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------

    /// Check custody conservation and that every receipt matches a released
    /// escrow of the same amount.
    ///
    /// # Errors
    /// `ConservationViolation` describing the first mismatch.
    pub fn audit(&self) -> Result<CustodyConservation> {
        let flows = self.ledger.audit()?;
        for receipt in self.recorder.all() {
            let record = self.ledger.get(&receipt.bounty_id);
            let consistent = record.as_ref().is_some_and(|r| {
                r.state == EscrowState::Released
                    && r.amount == receipt.amount
                    && r.cause == Some(TransitionCause::Receipt(receipt.id))
            });
            if !consistent {
                tracing::error!(
                    receipt = %receipt.id,
                    bounty = %receipt.bounty_id,
                    "receipt has no matching release"
                );
                return Err(VaultError::ConservationViolation {
                    reason: format!(
                        "receipt {} has no matching release for {}",
                        receipt.id, receipt.bounty_id
                    ),
                });
            }
        }
        Ok(flows)
    }

    fn check_conservation(&self, after: &str) {
        if let Err(err) = self.audit() {
            tracing::error!(step = after, error = %err, "audit failed");
        }
    }

    // ------------------------------------------------------------------
    // Administration and accessors
    // ------------------------------------------------------------------

    pub fn whitelist_funder(&self, funder: &WalletAddress, whitelisted: bool) {
        self.limiter.set_whitelisted(funder, whitelisted);
    }

    /// Replace the funding rate limits. Administrators only; applies to the
    /// next funding attempt.
    ///
    /// # Errors
    /// `NotAuthorized` for a non-administrator, `Configuration` for invalid
    /// limits.
    pub fn update_rate_limits(
        &self,
        requester: &WalletAddress,
        limits: RateLimitConfig,
    ) -> Result<()> {
        if !self.is_admin(requester) {
            return Err(VaultError::NotAuthorized {
                reason: format!("{requester} may not change funding limits"),
            });
        }
        self.limiter.update_config(limits)
    }

    #[must_use]
    pub fn rate_limits(&self) -> RateLimitConfig {
        self.limiter.config()
    }

    fn is_admin(&self, who: &WalletAddress) -> bool {
        self.config.admins.iter().any(|a| a == who.as_str())
    }

    #[must_use]
    pub fn bounty(&self, id: &BountyId) -> Option<Bounty> {
        self.registry.get(id)
    }

    #[must_use]
    pub fn escrow(&self, id: &BountyId) -> Option<EscrowRecord> {
        self.ledger.get(id)
    }

    #[must_use]
    pub fn program(&self, id: &ProgramId) -> Option<GrantProgram> {
        self.programs.program(id)
    }

    #[must_use]
    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &BountyRegistry {
        &self.registry
    }

    #[must_use]
    pub fn ledger(&self) -> &EscrowLedger {
        &self.ledger
    }

    #[must_use]
    pub fn recorder(&self) -> &ProofRecorder {
        &self.recorder
    }

    #[must_use]
    pub fn outcomes(&self) -> &OutcomeLog {
        &self.outcomes
    }

    #[must_use]
    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }
}
