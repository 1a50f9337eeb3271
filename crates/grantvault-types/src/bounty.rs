//! Bounty terms and grant program types.
//!
//! A [`Bounty`] is carved out of a [`GrantProgram`] by its maintainer. Its
//! terms are fixed once the escrow is locked; only the funder may push the
//! deadline later.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{BountyId, EscrowId, ExternalAccount, IssueRef, ProgramId, WalletAddress};

/// How the beneficiary of a bounty is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeneficiaryRule {
    /// Whoever verifiably merges the linked issue first.
    FirstVerifiedMerger,
    /// Only this account may claim the bounty.
    AssignedContributor(ExternalAccount),
}

impl BeneficiaryRule {
    /// Does the rule admit `account` as beneficiary?
    #[must_use]
    pub fn admits(&self, account: &ExternalAccount) -> bool {
        match self {
            Self::FirstVerifiedMerger => true,
            Self::AssignedContributor(assigned) => assigned == account,
        }
    }
}

/// A funded, issue-linked unit of work.
///
/// The registry owns the terms; the escrow record lives in the ledger and is
/// referenced only through `escrow_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounty {
    pub id: BountyId,
    /// Non-owning key into the escrow ledger.
    pub escrow_id: EscrowId,
    pub program: ProgramId,
    pub funder: WalletAddress,
    pub amount: Decimal,
    pub issue: IssueRef,
    /// Merges strictly after this instant do not qualify.
    pub deadline: DateTime<Utc>,
    pub rule: BeneficiaryRule,
    pub created_at: DateTime<Utc>,
}

impl Bounty {
    /// Whether a merge at `merged_at` is within the deadline (inclusive).
    #[must_use]
    pub fn accepts_merge_at(&self, merged_at: DateTime<Utc>) -> bool {
        merged_at <= self.deadline
    }
}

/// Parameters for funding a new bounty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BountyTerms {
    pub program: ProgramId,
    pub funder: WalletAddress,
    pub amount: Decimal,
    pub issue: IssueRef,
    pub deadline: DateTime<Utc>,
    pub rule: BeneficiaryRule,
}

/// One split of a program's funds into a bounty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub bounty_id: BountyId,
    pub amount: Decimal,
    pub allocated_at: DateTime<Utc>,
}

/// A funder's grant pool from which bounties are split.
///
/// Invariants:
/// - `remaining <= total`
/// - `remaining == total - sum(allocations.amount)`
/// - `allocations` is append-only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantProgram {
    pub id: ProgramId,
    pub funder: WalletAddress,
    pub total: Decimal,
    pub remaining: Decimal,
    pub allocations: Vec<Allocation>,
    pub opened_at: DateTime<Utc>,
}

impl GrantProgram {
    /// Sum of all allocations so far.
    #[must_use]
    pub fn allocated(&self) -> Decimal {
        self.allocations.iter().map(|a| a.amount).sum()
    }
}

/// Administrator approval for refunding a bounty before its deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundApproval {
    pub bounty_id: BountyId,
    pub approver: WalletAddress,
    pub approved_at: DateTime<Utc>,
}

#[cfg(any(test, feature = "test-helpers"))]
impl BountyTerms {
    /// Dummy terms for unit tests. **Never use in production.**
    pub fn dummy(issue: IssueRef, amount: Decimal, deadline: DateTime<Utc>) -> Self {
        Self {
            program: ProgramId::new("test-program"),
            funder: WalletAddress::new("wallet:funder"),
            amount,
            issue,
            deadline,
            rule: BeneficiaryRule::FirstVerifiedMerger,
        }
    }
}
