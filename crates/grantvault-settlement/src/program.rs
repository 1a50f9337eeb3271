//! Grant programs: a funder's pool from which individual bounties are split.
//!
//! `remaining + Σ allocations == total` holds for every program at all times.

use std::{collections::HashMap, path::Path};

use chrono::{DateTime, Utc};
use grantvault_custody::Journal;
use grantvault_types::{
    Allocation, BountyId, GrantProgram, ProgramId, Result, VaultError, WalletAddress,
};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
enum ProgramEvent {
    Opened(GrantProgram),
    ToppedUp {
        program: ProgramId,
        amount: Decimal,
    },
    Allocated {
        program: ProgramId,
        allocation: Allocation,
    },
    /// An allocation whose escrow lock failed.
    Reverted {
        program: ProgramId,
        bounty_id: BountyId,
    },
}

fn apply(programs: &mut HashMap<ProgramId, GrantProgram>, event: ProgramEvent) {
    match event {
        ProgramEvent::Opened(program) => {
            programs.insert(program.id.clone(), program);
        }
        ProgramEvent::ToppedUp { program, amount } => {
            if let Some(p) = programs.get_mut(&program) {
                p.total += amount;
                p.remaining += amount;
            }
        }
        ProgramEvent::Allocated {
            program,
            allocation,
        } => {
            if let Some(p) = programs.get_mut(&program) {
                p.remaining -= allocation.amount;
                p.allocations.push(allocation);
            }
        }
        ProgramEvent::Reverted { program, bounty_id } => {
            if let Some(p) = programs.get_mut(&program) {
                if let Some(idx) = p.allocations.iter().position(|a| a.bounty_id == bounty_id) {
                    let allocation = p.allocations.remove(idx);
                    p.remaining += allocation.amount;
                }
            }
        }
    }
}

/// All grant programs.
pub struct ProgramBook {
    programs: RwLock<HashMap<ProgramId, GrantProgram>>,
    journal: Option<Journal<ProgramEvent>>,
}

impl Default for ProgramBook {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramBook {
    #[must_use]
    pub fn new() -> Self {
        Self {
            programs: RwLock::new(HashMap::new()),
            journal: None,
        }
    }

    /// A journaled book, restored from `path`.
    ///
    /// # Errors
    /// Propagates journal open/replay failures.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (journal, events) = Journal::<ProgramEvent>::open(path)?;
        let mut programs = HashMap::new();
        for event in events {
            apply(&mut programs, event);
        }
        tracing::info!(programs = programs.len(), "program book restored");
        Ok(Self {
            programs: RwLock::new(programs),
            journal: Some(journal),
        })
    }

    fn commit(
        &self,
        programs: &mut HashMap<ProgramId, GrantProgram>,
        event: ProgramEvent,
    ) -> Result<()> {
        if let Some(journal) = &self.journal {
            journal.append(&event)?;
        }
        apply(programs, event);
        Ok(())
    }

    /// Open a program with an initial pool.
    ///
    /// # Errors
    /// `ProgramExists` or `InvalidAmount`.
    pub fn open_program(
        &self,
        id: ProgramId,
        funder: WalletAddress,
        total: Decimal,
        now: DateTime<Utc>,
    ) -> Result<GrantProgram> {
        if total <= Decimal::ZERO {
            return Err(VaultError::InvalidAmount {
                reason: format!("program total must be positive, got {total}"),
            });
        }
        let mut programs = self.programs.write();
        if programs.contains_key(&id) {
            return Err(VaultError::ProgramExists(id));
        }

        let program = GrantProgram {
            id: id.clone(),
            funder,
            total,
            remaining: total,
            allocations: Vec::new(),
            opened_at: now,
        };
        self.commit(&mut programs, ProgramEvent::Opened(program.clone()))?;
        tracing::info!(program = %id, total = %total, "grant program opened");
        Ok(program)
    }

    /// Add funds to a program's pool.
    ///
    /// # Errors
    /// `ProgramNotFound` or `InvalidAmount`.
    pub fn top_up(&self, id: &ProgramId, amount: Decimal) -> Result<GrantProgram> {
        if amount <= Decimal::ZERO {
            return Err(VaultError::InvalidAmount {
                reason: format!("top-up must be positive, got {amount}"),
            });
        }
        let mut programs = self.programs.write();
        if !programs.contains_key(id) {
            return Err(VaultError::ProgramNotFound(id.clone()));
        }
        self.commit(
            &mut programs,
            ProgramEvent::ToppedUp {
                program: id.clone(),
                amount,
            },
        )?;
        tracing::info!(program = %id, amount = %amount, "grant program topped up");
        programs
            .get(id)
            .cloned()
            .ok_or_else(|| VaultError::ProgramNotFound(id.clone()))
    }

    /// Reserve `amount` of the pool for `bounty_id`.
    ///
    /// # Errors
    /// `ProgramNotFound`, `NotAuthorized` if `funder` does not own the
    /// program, or `InsufficientProgramFunds`.
    pub fn allocate(
        &self,
        id: &ProgramId,
        funder: &WalletAddress,
        bounty_id: BountyId,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Allocation> {
        let mut programs = self.programs.write();
        let program = programs
            .get(id)
            .ok_or_else(|| VaultError::ProgramNotFound(id.clone()))?;
        if &program.funder != funder {
            return Err(VaultError::NotAuthorized {
                reason: format!("{funder} does not own {id}"),
            });
        }
        if program.remaining < amount {
            return Err(VaultError::InsufficientProgramFunds {
                needed: amount,
                remaining: program.remaining,
            });
        }

        let allocation = Allocation {
            bounty_id,
            amount,
            allocated_at: now,
        };
        self.commit(
            &mut programs,
            ProgramEvent::Allocated {
                program: id.clone(),
                allocation: allocation.clone(),
            },
        )?;
        tracing::debug!(program = %id, bounty = %bounty_id, amount = %amount, "allocated");
        Ok(allocation)
    }

    /// Undo an allocation whose escrow was never locked.
    ///
    /// # Errors
    /// `ProgramNotFound`, or a journal failure.
    pub fn revert(&self, id: &ProgramId, bounty_id: BountyId) -> Result<()> {
        let mut programs = self.programs.write();
        let allocated = programs
            .get(id)
            .ok_or_else(|| VaultError::ProgramNotFound(id.clone()))?
            .allocations
            .iter()
            .any(|a| a.bounty_id == bounty_id);
        if !allocated {
            return Ok(());
        }
        self.commit(
            &mut programs,
            ProgramEvent::Reverted {
                program: id.clone(),
                bounty_id,
            },
        )?;
        tracing::debug!(program = %id, bounty = %bounty_id, "allocation reverted");
        Ok(())
    }

    #[must_use]
    pub fn program(&self, id: &ProgramId) -> Option<GrantProgram> {
        self.programs.read().get(id).cloned()
    }

    /// # Errors
    /// `ProgramNotFound`.
    pub fn remaining(&self, id: &ProgramId) -> Result<Decimal> {
        self.programs
            .read()
            .get(id)
            .map(|p| p.remaining)
            .ok_or_else(|| VaultError::ProgramNotFound(id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> WalletAddress {
        WalletAddress::new("wallet:foundation")
    }

    fn book_with(total: i64) -> (ProgramBook, ProgramId) {
        let book = ProgramBook::new();
        let id = ProgramId::new("hackathon-2024");
        book.open_program(id.clone(), owner(), Decimal::new(total, 0), Utc::now())
            .unwrap();
        (book, id)
    }

    #[test]
    fn allocations_draw_down_remaining() {
        let (book, id) = book_with(1000);
        book.allocate(&id, &owner(), BountyId::new(), Decimal::new(300, 0), Utc::now())
            .unwrap();
        book.allocate(&id, &owner(), BountyId::new(), Decimal::new(700, 0), Utc::now())
            .unwrap();

        assert_eq!(book.remaining(&id).unwrap(), Decimal::ZERO);
        let program = book.program(&id).unwrap();
        assert_eq!(program.allocated(), program.total);
    }

    #[test]
    fn over_allocation_rejected() {
        let (book, id) = book_with(100);
        let err = book
            .allocate(&id, &owner(), BountyId::new(), Decimal::new(101, 0), Utc::now())
            .unwrap_err();
        assert!(matches!(err, VaultError::InsufficientProgramFunds { .. }));
        assert_eq!(book.remaining(&id).unwrap(), Decimal::new(100, 0));
    }

    #[test]
    fn only_owner_allocates() {
        let (book, id) = book_with(100);
        let err = book
            .allocate(&id, &WalletAddress::new("x"), BountyId::new(), Decimal::ONE, Utc::now())
            .unwrap_err();
        assert!(matches!(err, VaultError::NotAuthorized { .. }));
    }

    #[test]
    fn top_up_and_revert() {
        let (book, id) = book_with(100);
        book.top_up(&id, Decimal::new(50, 0)).unwrap();
        let bounty = BountyId::new();
        book.allocate(&id, &owner(), bounty, Decimal::new(150, 0), Utc::now())
            .unwrap();
        assert_eq!(book.remaining(&id).unwrap(), Decimal::ZERO);

        book.revert(&id, bounty).unwrap();
        assert_eq!(book.remaining(&id).unwrap(), Decimal::new(150, 0));
        assert!(book.program(&id).unwrap().allocations.is_empty());
    }

    #[test]
    fn duplicate_and_unknown_programs() {
        let (book, id) = book_with(100);
        assert!(matches!(
            book.open_program(id, owner(), Decimal::ONE, Utc::now()),
            Err(VaultError::ProgramExists(_))
        ));
        assert!(matches!(
            book.remaining(&ProgramId::new("nope")),
            Err(VaultError::ProgramNotFound(_))
        ));
    }

    #[test]
    fn journal_restores_book() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("programs.jsonl");
        let id = ProgramId::new("p");
        {
            let book = ProgramBook::open(&path).unwrap();
            book.open_program(id.clone(), owner(), Decimal::new(100, 0), Utc::now())
                .unwrap();
            book.allocate(&id, &owner(), BountyId::new(), Decimal::new(40, 0), Utc::now())
                .unwrap();
        }
        let book = ProgramBook::open(&path).unwrap();
        assert_eq!(book.remaining(&id).unwrap(), Decimal::new(60, 0));
    }
}
