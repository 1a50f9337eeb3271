//! Bounty registry: terms, issue links and the rules deciding who may be paid.
//!
//! The registry refers to escrow records only by [`EscrowId`]; custody state
//! lives in the ledger alone.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

use chrono::{DateTime, Utc};
use grantvault_custody::Journal;
use grantvault_types::{
    Beneficiary, Bounty, BountyId, BountyTerms, EscrowId, IssueRef, MergeSignal, RefundApproval,
    Result, VaultError, WalletAddress,
};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::identity::{IdentityProvider, IdentityStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
enum RegistryEvent {
    Registered(Bounty),
    DeadlineExtended {
        bounty_id: BountyId,
        deadline: DateTime<Utc>,
    },
    RefundApproved(RefundApproval),
}

#[derive(Debug, Default)]
struct RegistryState {
    bounties: HashMap<BountyId, Bounty>,
    by_issue: HashMap<IssueRef, BountyId>,
    approvals: HashMap<BountyId, RefundApproval>,
}

impl RegistryState {
    fn apply(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::Registered(bounty) => {
                self.by_issue.insert(bounty.issue.clone(), bounty.id);
                self.bounties.insert(bounty.id, bounty);
            }
            RegistryEvent::DeadlineExtended {
                bounty_id,
                deadline,
            } => {
                if let Some(bounty) = self.bounties.get_mut(&bounty_id) {
                    bounty.deadline = deadline;
                }
            }
            RegistryEvent::RefundApproved(approval) => {
                self.approvals.insert(approval.bounty_id, approval);
            }
        }
    }
}

/// Bounty terms and issue → bounty index.
pub struct BountyRegistry {
    state: RwLock<RegistryState>,
    admins: HashSet<WalletAddress>,
    journal: Option<Journal<RegistryEvent>>,
}

impl BountyRegistry {
    /// An in-memory registry. `admins` may approve early refunds.
    #[must_use]
    pub fn new(admins: impl IntoIterator<Item = WalletAddress>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            admins: admins.into_iter().collect(),
            journal: None,
        }
    }

    /// A journaled registry, restored from `path`.
    ///
    /// # Errors
    /// Propagates journal open/replay failures.
    pub fn open(
        admins: impl IntoIterator<Item = WalletAddress>,
        path: impl AsRef<Path>,
    ) -> Result<Self> {
        let (journal, events) = Journal::<RegistryEvent>::open(path)?;
        let mut registry = Self::new(admins);
        {
            let state = registry.state.get_mut();
            for event in events {
                state.apply(event);
            }
            tracing::info!(bounties = state.bounties.len(), "bounty registry restored");
        }
        registry.journal = Some(journal);
        Ok(registry)
    }

    fn commit(&self, state: &mut RegistryState, event: RegistryEvent) -> Result<()> {
        if let Some(journal) = &self.journal {
            journal.append(&event)?;
        }
        state.apply(event);
        Ok(())
    }

    /// Check that `terms` could be registered now, without registering.
    ///
    /// # Errors
    /// `InvalidAmount`, `InvalidDeadline` or `IssueAlreadyFunded`.
    pub fn validate_terms(&self, terms: &BountyTerms, now: DateTime<Utc>) -> Result<()> {
        if terms.amount <= Decimal::ZERO {
            return Err(VaultError::InvalidAmount {
                reason: format!("bounty amount must be positive, got {}", terms.amount),
            });
        }
        if terms.deadline <= now {
            return Err(VaultError::InvalidDeadline {
                reason: format!("deadline {} is not in the future", terms.deadline),
            });
        }
        if self.state.read().by_issue.contains_key(&terms.issue) {
            return Err(VaultError::IssueAlreadyFunded(terms.issue.clone()));
        }
        Ok(())
    }

    /// Register a bounty whose escrow has been locked.
    ///
    /// # Errors
    /// `BountyExists`, `IssueAlreadyFunded`, or a journal failure.
    pub fn register(
        &self,
        id: BountyId,
        escrow_id: EscrowId,
        terms: BountyTerms,
        now: DateTime<Utc>,
    ) -> Result<Bounty> {
        let mut state = self.state.write();
        if state.bounties.contains_key(&id) {
            return Err(VaultError::BountyExists(id));
        }
        if state.by_issue.contains_key(&terms.issue) {
            return Err(VaultError::IssueAlreadyFunded(terms.issue));
        }

        let bounty = Bounty {
            id,
            escrow_id,
            program: terms.program,
            funder: terms.funder,
            amount: terms.amount,
            issue: terms.issue,
            deadline: terms.deadline,
            rule: terms.rule,
            created_at: now,
        };
        self.commit(&mut state, RegistryEvent::Registered(bounty.clone()))?;
        tracing::info!(
            bounty = %bounty.id,
            issue = %bounty.issue,
            amount = %bounty.amount,
            deadline = %bounty.deadline,
            "bounty registered"
        );
        Ok(bounty)
    }

    #[must_use]
    pub fn get(&self, id: &BountyId) -> Option<Bounty> {
        self.state.read().bounties.get(id).cloned()
    }

    #[must_use]
    pub fn bounty_for_issue(&self, issue: &IssueRef) -> Option<Bounty> {
        let state = self.state.read();
        state
            .by_issue
            .get(issue)
            .and_then(|id| state.bounties.get(id))
            .cloned()
    }

    #[must_use]
    pub fn bounties(&self) -> Vec<Bounty> {
        self.state.read().bounties.values().cloned().collect()
    }

    /// Move a bounty's deadline later. Only the funder may do this.
    ///
    /// # Errors
    /// `BountyNotFound`, `NotAuthorized`, or `InvalidDeadline` if the new
    /// deadline is not strictly later.
    pub fn extend_deadline(
        &self,
        id: BountyId,
        requester: &WalletAddress,
        new_deadline: DateTime<Utc>,
    ) -> Result<Bounty> {
        let mut state = self.state.write();
        let bounty = state
            .bounties
            .get(&id)
            .ok_or(VaultError::BountyNotFound(id))?;
        if &bounty.funder != requester {
            return Err(VaultError::NotAuthorized {
                reason: format!("{requester} is not the funder of {id}"),
            });
        }
        if new_deadline <= bounty.deadline {
            return Err(VaultError::InvalidDeadline {
                reason: format!(
                    "new deadline {new_deadline} is not after current {}",
                    bounty.deadline
                ),
            });
        }

        let previous = bounty.deadline;
        self.commit(
            &mut state,
            RegistryEvent::DeadlineExtended {
                bounty_id: id,
                deadline: new_deadline,
            },
        )?;
        tracing::info!(bounty = %id, from = %previous, to = %new_deadline, "deadline extended");
        state
            .bounties
            .get(&id)
            .cloned()
            .ok_or(VaultError::BountyNotFound(id))
    }

    /// Record an administrator's approval of an early refund.
    ///
    /// # Errors
    /// `BountyNotFound` or `NotAuthorized`.
    pub fn approve_refund(
        &self,
        id: BountyId,
        approver: &WalletAddress,
        now: DateTime<Utc>,
    ) -> Result<RefundApproval> {
        if !self.admins.contains(approver) {
            return Err(VaultError::NotAuthorized {
                reason: format!("{approver} may not approve refunds"),
            });
        }
        let mut state = self.state.write();
        if !state.bounties.contains_key(&id) {
            return Err(VaultError::BountyNotFound(id));
        }

        let approval = RefundApproval {
            bounty_id: id,
            approver: approver.clone(),
            approved_at: now,
        };
        self.commit(&mut state, RegistryEvent::RefundApproved(approval.clone()))?;
        tracing::info!(bounty = %id, approver = %approver, "refund approved");
        Ok(approval)
    }

    #[must_use]
    pub fn refund_approval(&self, id: &BountyId) -> Option<RefundApproval> {
        self.state.read().approvals.get(id).cloned()
    }

    /// Decide who a merge signal pays, if anyone.
    ///
    /// Checks in order: the signal targets this bounty's issue; the merge
    /// happened at or before the deadline (signal timestamp, not wall clock);
    /// the merging account is a verified identity; the beneficiary rule
    /// admits it.
    ///
    /// # Errors
    /// `NoMatch`, `DeadlineExceeded`, or `Retryable` from the provider.
    pub fn resolve_beneficiary(
        &self,
        bounty: &Bounty,
        signal: &MergeSignal,
        identities: &dyn IdentityProvider,
    ) -> Result<Beneficiary> {
        if signal.issue != bounty.issue {
            return Err(VaultError::NoMatch {
                reason: format!("signal targets {}, bounty is for {}", signal.issue, bounty.issue),
            });
        }
        if !bounty.accepts_merge_at(signal.merged_at) {
            return Err(VaultError::DeadlineExceeded {
                deadline: bounty.deadline,
                merged_at: signal.merged_at,
            });
        }

        let beneficiary = match identities.verify(&signal.merged_by)? {
            IdentityStatus::Verified(beneficiary) => beneficiary,
            IdentityStatus::Unverified => {
                return Err(VaultError::NoMatch {
                    reason: format!("{} is not a verified identity", signal.merged_by),
                });
            }
        };
        if !bounty.rule.admits(&beneficiary.account) {
            return Err(VaultError::NoMatch {
                reason: format!("{} is not eligible for {}", beneficiary.account, bounty.id),
            });
        }
        Ok(beneficiary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentityProvider;
    use chrono::{Duration, TimeZone};
    use grantvault_types::{BeneficiaryRule, ExternalAccount};

    fn admin() -> WalletAddress {
        WalletAddress::new("wallet:admin")
    }

    fn registry() -> BountyRegistry {
        BountyRegistry::new([admin()])
    }

    fn terms(deadline: DateTime<Utc>) -> BountyTerms {
        BountyTerms::dummy(IssueRef::new("org/repo", 7), Decimal::new(500, 0), deadline)
    }

    fn registered(
        registry: &BountyRegistry,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Bounty {
        registry
            .register(BountyId::new(), EscrowId::new(), terms(deadline), now)
            .unwrap()
    }

    #[test]
    fn register_and_lookup_by_issue() {
        let registry = registry();
        let now = Utc::now();
        let bounty = registered(&registry, now + Duration::days(7), now);

        assert_eq!(registry.get(&bounty.id), Some(bounty.clone()));
        assert_eq!(
            registry.bounty_for_issue(&IssueRef::new("org/repo", 7)),
            Some(bounty)
        );
        assert!(registry.bounty_for_issue(&IssueRef::new("org/repo", 8)).is_none());
    }

    #[test]
    fn duplicate_issue_rejected() {
        let registry = registry();
        let now = Utc::now();
        registered(&registry, now + Duration::days(7), now);

        let err = registry
            .register(BountyId::new(), EscrowId::new(), terms(now + Duration::days(7)), now)
            .unwrap_err();
        assert!(matches!(err, VaultError::IssueAlreadyFunded(_)));
        assert!(matches!(
            registry.validate_terms(&terms(now + Duration::days(7)), now),
            Err(VaultError::IssueAlreadyFunded(_))
        ));
    }

    #[test]
    fn validate_terms_rejects_past_deadline_and_zero_amount() {
        let registry = registry();
        let now = Utc::now();
        assert!(matches!(
            registry.validate_terms(&terms(now), now),
            Err(VaultError::InvalidDeadline { .. })
        ));
        let mut zero = terms(now + Duration::days(1));
        zero.amount = Decimal::ZERO;
        assert!(matches!(
            registry.validate_terms(&zero, now),
            Err(VaultError::InvalidAmount { .. })
        ));
    }

    #[test]
    fn extend_deadline_rules() {
        let registry = registry();
        let now = Utc::now();
        let deadline = now + Duration::days(7);
        let bounty = registered(&registry, deadline, now);

        let err = registry
            .extend_deadline(
                bounty.id,
                &WalletAddress::new("stranger"),
                deadline + Duration::days(1),
            )
            .unwrap_err();
        assert!(matches!(err, VaultError::NotAuthorized { .. }));

        let err = registry
            .extend_deadline(bounty.id, &bounty.funder, deadline)
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidDeadline { .. }));

        let extended = registry
            .extend_deadline(bounty.id, &bounty.funder, deadline + Duration::days(3))
            .unwrap();
        assert_eq!(extended.deadline, deadline + Duration::days(3));
    }

    #[test]
    fn only_admins_approve_refunds() {
        let registry = registry();
        let now = Utc::now();
        let bounty = registered(&registry, now + Duration::days(7), now);

        assert!(matches!(
            registry.approve_refund(bounty.id, &bounty.funder, now),
            Err(VaultError::NotAuthorized { .. })
        ));
        assert!(registry.refund_approval(&bounty.id).is_none());

        registry.approve_refund(bounty.id, &admin(), now).unwrap();
        assert_eq!(registry.refund_approval(&bounty.id).unwrap().approver, admin());
    }

    #[test]
    fn merge_after_deadline_is_rejected() {
        let registry = registry();
        let deadline = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let bounty = registered(&registry, deadline, deadline - Duration::days(30));
        let identities = StaticIdentityProvider::new();
        identities.register(ExternalAccount::new("octocat"), WalletAddress::new("w"));

        let late = MergeSignal::new(
            bounty.issue.clone(),
            1,
            ExternalAccount::new("octocat"),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        );
        let err = registry
            .resolve_beneficiary(&bounty, &late, &identities)
            .unwrap_err();
        assert!(matches!(err, VaultError::DeadlineExceeded { .. }));

        let on_time = MergeSignal::new(
            bounty.issue.clone(),
            1,
            ExternalAccount::new("octocat"),
            deadline,
        );
        assert!(
            registry
                .resolve_beneficiary(&bounty, &on_time, &identities)
                .is_ok()
        );
    }

    #[test]
    fn unverified_or_ineligible_merger_is_no_match() {
        let registry = registry();
        let now = Utc::now();
        let mut t = terms(now + Duration::days(7));
        t.rule = BeneficiaryRule::AssignedContributor(ExternalAccount::new("alice"));
        let bounty = registry
            .register(BountyId::new(), EscrowId::new(), t, now)
            .unwrap();

        let identities = StaticIdentityProvider::new();
        identities.register(ExternalAccount::new("bob"), WalletAddress::new("w-bob"));
        let alice = identities.register(
            ExternalAccount::new("alice"),
            WalletAddress::new("w-alice"),
        );

        for login in ["ghost", "bob"] {
            let signal =
                MergeSignal::new(bounty.issue.clone(), 3, ExternalAccount::new(login), now);
            assert!(matches!(
                registry.resolve_beneficiary(&bounty, &signal, &identities),
                Err(VaultError::NoMatch { .. })
            ));
        }

        let signal = MergeSignal::new(bounty.issue.clone(), 3, ExternalAccount::new("alice"), now);
        assert_eq!(
            registry.resolve_beneficiary(&bounty, &signal, &identities).unwrap(),
            alice
        );
    }

    #[test]
    fn journal_restores_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bounties.jsonl");
        let now = Utc::now();
        let deadline = now + Duration::days(7);

        let id = {
            let registry = BountyRegistry::open([admin()], &path).unwrap();
            let bounty = registered(&registry, deadline, now);
            registry
                .extend_deadline(bounty.id, &bounty.funder, deadline + Duration::days(1))
                .unwrap();
            registry.approve_refund(bounty.id, &admin(), now).unwrap();
            bounty.id
        };

        let registry = BountyRegistry::open([admin()], &path).unwrap();
        let bounty = registry.get(&id).unwrap();
        assert_eq!(bounty.deadline, deadline + Duration::days(1));
        assert!(registry.refund_approval(&id).is_some());
        assert!(registry.bounty_for_issue(&bounty.issue).is_some());
    }
}
