//! End-to-end tests across custody and settlement.
//!
//! These drive the vault facade the way a deployment would: programs fund
//! bounties, contributors receive release tokens, merge signals arrive
//! (sometimes twice, sometimes late), and journals are reopened after a
//! restart.

use std::{
    path::Path,
    sync::{Arc, Barrier},
    thread,
};

use chrono::{DateTime, Duration, TimeZone, Utc};
use ed25519_dalek::SigningKey;
use grantvault_custody::InMemoryWallet;
use grantvault_settlement::{GrantVault, HmacSignalAuthenticator, StaticIdentityProvider};
use grantvault_types::*;
use rust_decimal::Decimal;

const SECRET: &[u8] = b"end-to-end-signal-secret";

fn funder() -> WalletAddress {
    WalletAddress::new("wallet:funder")
}

/// A vault plus the test doubles behind it.
struct World {
    vault: GrantVault,
    wallet: Arc<InMemoryWallet>,
    identities: Arc<StaticIdentityProvider>,
    clock: Arc<ManualClock>,
    auth: HmacSignalAuthenticator,
}

impl World {
    fn new(start: DateTime<Utc>) -> Self {
        Self::build(
            start,
            None,
            Arc::new(InMemoryWallet::new()),
            Arc::new(StaticIdentityProvider::new()),
        )
    }

    fn persistent(start: DateTime<Utc>, dir: &Path) -> Self {
        Self::build(
            start,
            Some(dir),
            Arc::new(InMemoryWallet::new()),
            Arc::new(StaticIdentityProvider::new()),
        )
    }

    fn build(
        start: DateTime<Utc>,
        dir: Option<&Path>,
        wallet: Arc<InMemoryWallet>,
        identities: Arc<StaticIdentityProvider>,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(start));
        let config = VaultConfig {
            data_dir: dir.map(|d| d.display().to_string()),
            signal_secret_hex: hex::encode(SECRET),
            admins: vec!["wallet:admin".into()],
            ..VaultConfig::default()
        };
        let vault = GrantVault::open(
            config,
            wallet.clone(),
            identities.clone(),
            SigningKey::from_bytes(&[42u8; 32]),
            clock.clone(),
        )
        .expect("vault should open");
        vault.whitelist_funder(&funder(), true);
        if vault.program(&ProgramId::new("test-program")).is_none() {
            wallet.deposit(&funder(), Decimal::new(100_000, 0));
            vault
                .open_program(ProgramId::new("test-program"), funder(), Decimal::new(10_000, 0))
                .expect("program should open");
        }
        Self {
            vault,
            wallet,
            identities,
            clock,
            auth: HmacSignalAuthenticator::new(SECRET).expect("secret"),
        }
    }

    /// Reopen on the same journals, backend and identities.
    fn restart(self, dir: &Path) -> Self {
        let now = self.clock.now();
        let (wallet, identities) = (self.wallet.clone(), self.identities.clone());
        drop(self);
        Self::build(now, Some(dir), wallet, identities)
    }

    fn fund(&self, issue: u64, amount: i64, deadline: DateTime<Utc>) -> Bounty {
        self.vault
            .fund_bounty(BountyTerms::dummy(
                IssueRef::new("org/repo", issue),
                Decimal::new(amount, 0),
                deadline,
            ))
            .expect("funding should succeed")
    }

    fn contributor(&self, login: &str) -> Beneficiary {
        self.identities.register(
            ExternalAccount::new(login),
            WalletAddress::new(format!("wallet:{login}")),
        )
    }

    fn token(&self, login: &str) -> String {
        self.vault
            .issue_release_token(&ExternalAccount::new(login))
            .expect("token should issue")
            .expose()
            .to_string()
    }

    fn merge(&self, issue: u64, pr: u64, login: &str, merged_at: DateTime<Utc>) -> MergeSignal {
        let signal = MergeSignal::new(
            IssueRef::new("org/repo", issue),
            pr,
            ExternalAccount::new(login),
            merged_at,
        );
        let proof = self.auth.sign(&signal).expect("sign");
        signal.with_proof(proof)
    }
}

fn jan(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
}

// =========================================================================
// Scenario A: lock, release, then refund is refused
// =========================================================================

#[test]
fn release_then_refund_is_funds_not_locked() {
    let w = World::new(Utc::now());
    let bounty = w.fund(1, 500, w.clock.now() + Duration::days(30));
    let dev = w.contributor("octocat");

    let report = w
        .vault
        .process_merge(&w.merge(1, 10, "octocat", w.clock.now()), &w.token("octocat"));
    let ReleaseOutcome::Released { receipt_id, .. } = report.outcome else {
        panic!("expected release, got {:?}", report.outcome);
    };

    let receipt = w.vault.recorder().get(&receipt_id).unwrap();
    assert_eq!(receipt.amount, Decimal::new(500, 0));
    assert_eq!(receipt.beneficiary.identity, dev.identity);
    w.vault.recorder().verify(&receipt).unwrap();

    // Even with an approval, a released escrow cannot be refunded.
    w.vault
        .approve_refund(bounty.id, &WalletAddress::new("wallet:admin"))
        .unwrap();
    let err = w.vault.refund(bounty.id, &funder()).unwrap_err();
    assert!(matches!(
        err,
        VaultError::FundsNotLocked {
            state: EscrowState::Released,
            ..
        }
    ));

    let record = w.vault.escrow(&bounty.id).unwrap();
    assert_eq!(record.amount, Decimal::new(500, 0));
    assert_eq!(record.beneficiary.as_ref(), Some(&dev));
    assert_eq!(w.wallet.balance(&dev.wallet), Decimal::new(500, 0));
    w.vault.audit().unwrap();
}

// =========================================================================
// Scenario B: merge after the deadline
// =========================================================================

#[test]
fn late_merge_is_deadline_exceeded() {
    let w = World::new(Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap());
    let bounty = w.fund(2, 500, jan(1));
    w.contributor("octocat");
    let token = w.token("octocat");

    let report = w
        .vault
        .process_merge(&w.merge(2, 11, "octocat", jan(2)), &token);
    assert!(matches!(
        report.outcome,
        ReleaseOutcome::Rejected {
            reason: RejectReason::DeadlineExceeded { .. },
            ..
        }
    ));
    assert_eq!(w.vault.escrow(&bounty.id).unwrap().state, EscrowState::Locked);
    assert!(w.vault.recorder().all().is_empty());
}

#[test]
fn merge_exactly_at_deadline_is_accepted() {
    let w = World::new(Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap());
    w.fund(3, 500, jan(1));
    w.contributor("octocat");

    let report = w
        .vault
        .process_merge(&w.merge(3, 12, "octocat", jan(1)), &w.token("octocat"));
    assert!(matches!(report.outcome, ReleaseOutcome::Released { .. }));
}

// =========================================================================
// Scenario C: duplicate delivery
// =========================================================================

#[test]
fn duplicate_delivery_releases_once() {
    let w = World::new(Utc::now());
    let bounty = w.fund(4, 500, w.clock.now() + Duration::days(30));
    let dev = w.contributor("octocat");
    let token = w.token("octocat");
    let signal = w.merge(4, 13, "octocat", w.clock.now());

    let first = w.vault.process_merge(&signal, &token);
    let transfers = w.wallet.transfer_count();
    let second = w.vault.process_merge(&signal, &token);

    assert!(!first.duplicate);
    assert!(second.duplicate);
    assert_eq!(first.outcome, second.outcome);
    assert_eq!(w.wallet.transfer_count(), transfers);
    assert_eq!(w.vault.recorder().list_by_bounty(&bounty.id).len(), 1);
    assert_eq!(w.wallet.balance(&dev.wallet), Decimal::new(500, 0));
}

#[test]
fn concurrent_duplicate_deliveries_release_once() {
    let w = Arc::new(World::new(Utc::now()));
    w.fund(5, 500, w.clock.now() + Duration::days(30));
    let dev = w.contributor("octocat");
    let token = w.token("octocat");
    let signal = w.merge(5, 14, "octocat", w.clock.now());

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let (w, barrier, signal, token) =
                (w.clone(), barrier.clone(), signal.clone(), token.clone());
            thread::spawn(move || {
                barrier.wait();
                w.vault.process_merge(&signal, &token)
            })
        })
        .collect();
    let reports: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let fresh_releases = reports
        .iter()
        .filter(|r| !r.duplicate && matches!(r.outcome, ReleaseOutcome::Released { .. }))
        .count();
    assert_eq!(fresh_releases, 1);
    assert!(reports.iter().all(|r| !matches!(r.outcome, ReleaseOutcome::Rejected { .. })));
    assert_eq!(w.wallet.balance(&dev.wallet), Decimal::new(500, 0));
    assert_eq!(w.vault.recorder().all().len(), 1);
}

// =========================================================================
// Scenario D: one-time token
// =========================================================================

#[test]
fn token_is_single_use_within_ttl() {
    let w = World::new(Utc::now());
    let dev = w.contributor("octocat");
    let token = w
        .vault
        .tokens()
        .issue(
            TokenSubject::Release { beneficiary: dev },
            TokenPurpose::ReleaseAuthorization,
            Duration::minutes(10),
            w.clock.now(),
        )
        .unwrap();

    w.clock.advance(Duration::minutes(5));
    w.vault.tokens().consume(token.expose(), w.clock.now()).unwrap();

    w.clock.advance(Duration::minutes(1));
    let err = w
        .vault
        .tokens()
        .consume(token.expose(), w.clock.now())
        .unwrap_err();
    assert!(matches!(err, VaultError::ExpiredOrInvalid));
}

#[test]
fn expired_token_blocks_release() {
    let w = World::new(Utc::now());
    let bounty = w.fund(6, 500, w.clock.now() + Duration::days(30));
    w.contributor("octocat");
    let token = w.token("octocat");
    w.clock.advance(Duration::minutes(11));

    let report = w
        .vault
        .process_merge(&w.merge(6, 15, "octocat", w.clock.now()), &token);
    assert!(matches!(
        report.outcome,
        ReleaseOutcome::Rejected {
            reason: RejectReason::ExpiredOrInvalid,
            stage: ReleaseStage::IdentityResolved,
        }
    ));
    assert_eq!(w.vault.escrow(&bounty.id).unwrap().state, EscrowState::Locked);
}

// =========================================================================
// Concurrency across bounties
// =========================================================================

#[test]
fn distinct_bounties_settle_concurrently() {
    let w = Arc::new(World::new(Utc::now()));
    let deadline = w.clock.now() + Duration::days(30);
    let work: Vec<_> = (0..8u64)
        .map(|i| {
            let login = format!("dev{i}");
            w.fund(100 + i, 100, deadline);
            w.contributor(&login);
            let token = w.token(&login);
            (w.merge(100 + i, 200 + i, &login, w.clock.now()), token)
        })
        .collect();

    let handles: Vec<_> = work
        .into_iter()
        .map(|(signal, token)| {
            let w = w.clone();
            thread::spawn(move || w.vault.process_merge(&signal, &token))
        })
        .collect();
    for handle in handles {
        let report = handle.join().unwrap();
        assert!(matches!(report.outcome, ReleaseOutcome::Released { .. }));
    }

    assert_eq!(w.vault.recorder().total_paid(), Decimal::new(800, 0));
    assert_eq!(w.vault.ledger().total_locked(), Decimal::ZERO);
    w.vault.audit().unwrap();
}

// =========================================================================
// Restart persistence
// =========================================================================

#[test]
fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let w = World::persistent(Utc::now(), dir.path());
    let released = w.fund(7, 500, w.clock.now() + Duration::days(30));
    let open = w.fund(8, 300, w.clock.now() + Duration::days(30));
    w.contributor("octocat");
    let token = w.token("octocat");
    let spare = w.token("octocat");
    let signal = w.merge(7, 16, "octocat", w.clock.now());
    let first = w.vault.process_merge(&signal, &token);
    assert!(matches!(first.outcome, ReleaseOutcome::Released { .. }));

    let w = w.restart(dir.path());

    assert_eq!(
        w.vault.escrow(&released.id).unwrap().state,
        EscrowState::Released
    );
    assert_eq!(w.vault.escrow(&open.id).unwrap().state, EscrowState::Locked);
    assert_eq!(w.vault.bounty(&open.id).unwrap().amount, Decimal::new(300, 0));
    assert_eq!(
        w.vault.program(&ProgramId::new("test-program")).unwrap().remaining,
        Decimal::new(9_200, 0)
    );
    assert_eq!(w.vault.recorder().all().len(), 1);

    // The outcome log still short-circuits, and the spent token stays spent.
    let again = w.vault.process_merge(&signal, &token);
    assert!(again.duplicate);
    assert_eq!(again.outcome, first.outcome);
    assert!(
        w.vault
            .tokens()
            .consume(&token, w.clock.now())
            .is_err()
    );
    w.vault.tokens().consume(&spare, w.clock.now()).unwrap();
    w.vault.audit().unwrap();
}

// =========================================================================
// Programs, refunds and anti-abuse
// =========================================================================

#[test]
fn allocations_never_exceed_program_total() {
    let w = World::new(Utc::now());
    let deadline = w.clock.now() + Duration::days(30);
    w.fund(20, 6_000, deadline);
    let err = w
        .vault
        .fund_bounty(BountyTerms::dummy(
            IssueRef::new("org/repo", 21),
            Decimal::new(5_000, 0),
            deadline,
        ))
        .unwrap_err();
    assert!(matches!(err, VaultError::InsufficientProgramFunds { .. }));

    w.vault
        .top_up(&ProgramId::new("test-program"), Decimal::new(1_000, 0))
        .unwrap();
    w.fund(21, 5_000, deadline);
    let program = w.vault.program(&ProgramId::new("test-program")).unwrap();
    assert_eq!(program.remaining, Decimal::ZERO);
    assert_eq!(program.allocated(), program.total);
}

#[test]
fn one_bounty_per_issue() {
    let w = World::new(Utc::now());
    let deadline = w.clock.now() + Duration::days(30);
    w.fund(30, 100, deadline);
    let err = w
        .vault
        .fund_bounty(BountyTerms::dummy(
            IssueRef::new("org/repo", 30),
            Decimal::new(100, 0),
            deadline,
        ))
        .unwrap_err();
    assert!(matches!(err, VaultError::IssueAlreadyFunded(_)));
}

#[test]
fn refund_policy_follows_deadline_and_approval() {
    let w = World::new(Utc::now());
    let deadline = w.clock.now() + Duration::days(3);
    let early = w.fund(40, 200, deadline);
    let late = w.fund(41, 300, deadline);
    let before = w.wallet.balance(&funder());

    assert!(matches!(
        w.vault.refund(late.id, &funder()).unwrap_err(),
        VaultError::RefundNotEligible { .. }
    ));
    assert!(matches!(
        w.vault
            .approve_refund(early.id, &funder())
            .unwrap_err(),
        VaultError::NotAuthorized { .. }
    ));
    w.vault
        .approve_refund(early.id, &WalletAddress::new("wallet:admin"))
        .unwrap();
    w.vault.refund(early.id, &funder()).unwrap();

    w.clock.advance(Duration::days(4));
    w.vault.refund(late.id, &funder()).unwrap();

    assert_eq!(w.wallet.balance(&funder()), before + Decimal::new(500, 0));
    assert!(matches!(
        w.vault.refund(late.id, &funder()).unwrap_err(),
        VaultError::FundsNotLocked {
            state: EscrowState::Refunded,
            ..
        }
    ));

    // A merge after refund finds nothing locked.
    w.contributor("octocat");
    let report = w
        .vault
        .process_merge(&w.merge(41, 50, "octocat", deadline), &w.token("octocat"));
    assert!(matches!(
        report.outcome,
        ReleaseOutcome::Rejected {
            reason: RejectReason::FundsNotLocked {
                state: EscrowState::Refunded
            },
            ..
        }
    ));
    w.vault.audit().unwrap();
}

#[test]
fn deadline_extension_reopens_window() {
    let w = World::new(Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap());
    let bounty = w.fund(60, 500, jan(1));
    w.vault
        .extend_deadline(bounty.id, &funder(), jan(5))
        .unwrap();
    w.contributor("octocat");

    let report = w
        .vault
        .process_merge(&w.merge(60, 61, "octocat", jan(2)), &w.token("octocat"));
    assert!(matches!(report.outcome, ReleaseOutcome::Released { .. }));
}

#[test]
fn released_bounty_deadline_cannot_move() {
    let w = World::new(Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap());
    let bounty = w.fund(65, 500, jan(10));
    w.contributor("octocat");

    let report = w
        .vault
        .process_merge(&w.merge(65, 66, "octocat", jan(2)), &w.token("octocat"));
    assert!(matches!(report.outcome, ReleaseOutcome::Released { .. }));

    let err = w
        .vault
        .extend_deadline(bounty.id, &funder(), jan(20))
        .unwrap_err();
    assert!(matches!(
        err,
        VaultError::FundsNotLocked {
            state: EscrowState::Released,
            ..
        }
    ));
    assert_eq!(w.vault.bounty(&bounty.id).unwrap().deadline, jan(10));
}

#[test]
fn funding_is_rate_limited_per_funder() {
    let w = World::new(Utc::now());
    w.vault.whitelist_funder(&funder(), false);
    let deadline = w.clock.now() + Duration::days(30);

    w.fund(70, 10, deadline);
    let err = w
        .vault
        .fund_bounty(BountyTerms::dummy(
            IssueRef::new("org/repo", 71),
            Decimal::new(10, 0),
            deadline,
        ))
        .unwrap_err();
    assert!(matches!(err, VaultError::CooldownActive { .. }));

    w.clock.advance(Duration::seconds(
        constants::DEFAULT_COOLDOWN_SECS + 1,
    ));
    w.fund(71, 10, deadline);
}

#[test]
fn forged_signal_changes_nothing() {
    let w = World::new(Utc::now());
    let bounty = w.fund(80, 500, w.clock.now() + Duration::days(30));
    w.contributor("octocat");
    let token = w.token("octocat");

    let forged = w
        .merge(80, 81, "octocat", w.clock.now())
        .with_proof("sha256=deadbeef");
    let report = w.vault.process_merge(&forged, &token);
    assert!(matches!(
        report.outcome,
        ReleaseOutcome::Rejected {
            reason: RejectReason::InvalidSignature,
            ..
        }
    ));
    assert_eq!(w.vault.escrow(&bounty.id).unwrap().state, EscrowState::Locked);

    // The genuine delivery of the same PR still goes through.
    let genuine = w
        .vault
        .process_merge(&w.merge(80, 81, "octocat", w.clock.now()), &token);
    assert!(matches!(genuine.outcome, ReleaseOutcome::Released { .. }));
}
