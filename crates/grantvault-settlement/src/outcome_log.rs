//! Signal outcome log: prevents double-release on redelivery.
//!
//! Merge signals arrive at-least-once. Each signal id maps to either the last
//! durable checkpoint of an unfinished attempt or its terminal outcome. The
//! log is consulted before anything else: a terminal entry short-circuits the
//! delivery, an in-flight entry resumes it.
//!
//! Entries are never evicted. A bounded cache would let an old signal be
//! processed again once it fell out.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

use chrono::{DateTime, Utc};
use grantvault_custody::Journal;
use grantvault_types::{
    Checkpoint, OutcomeRecord, OutcomeState, ReleaseOutcome, Result, SignalId, VaultError,
};
use parking_lot::Mutex;

/// What [`OutcomeLog::begin`] found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Begin {
    /// The signal already reached a terminal outcome.
    Duplicate(ReleaseOutcome),
    /// The caller now owns the attempt and continues from this checkpoint.
    Resume(Checkpoint),
}

#[derive(Debug, Default)]
struct LogState {
    records: HashMap<SignalId, OutcomeRecord>,
    /// Signals currently claimed by a running attempt.
    active: HashSet<SignalId>,
}

/// Persistent signal id → outcome arena.
pub struct OutcomeLog {
    state: Mutex<LogState>,
    journal: Option<Journal<OutcomeRecord>>,
}

impl Default for OutcomeLog {
    fn default() -> Self {
        Self::new()
    }
}

impl OutcomeLog {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LogState::default()),
            journal: None,
        }
    }

    /// A journaled log, restored from `path`. Last entry per signal wins.
    ///
    /// # Errors
    /// Propagates journal open/replay failures.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (journal, entries) = Journal::<OutcomeRecord>::open(path)?;
        let mut records = HashMap::new();
        for entry in entries {
            records.insert(entry.signal_id.clone(), entry);
        }
        tracing::info!(signals = records.len(), "outcome log restored");
        Ok(Self {
            state: Mutex::new(LogState {
                records,
                active: HashSet::new(),
            }),
            journal: Some(journal),
        })
    }

    /// Claim `signal_id` for processing.
    ///
    /// # Errors
    /// `InFlight` if another attempt holds the claim; `Io` if a new entry
    /// cannot be journaled.
    pub fn begin(&self, signal_id: &SignalId, now: DateTime<Utc>) -> Result<Begin> {
        let mut state = self.state.lock();
        let existing = state.records.get(signal_id).map(|r| r.state.clone());
        let checkpoint = match existing {
            Some(OutcomeState::Terminal(outcome)) => return Ok(Begin::Duplicate(outcome)),
            Some(OutcomeState::InFlight(checkpoint)) => checkpoint,
            None => {
                let record = OutcomeRecord {
                    signal_id: signal_id.clone(),
                    state: OutcomeState::InFlight(Checkpoint::received()),
                    updated_at: now,
                };
                self.append(&record)?;
                state.records.insert(signal_id.clone(), record);
                Checkpoint::received()
            }
        };

        if !state.active.insert(signal_id.clone()) {
            return Err(VaultError::InFlight(signal_id.clone()));
        }
        Ok(Begin::Resume(checkpoint))
    }

    /// Persist progress of a claimed attempt.
    ///
    /// The in-memory checkpoint is updated even if journaling fails, so a
    /// redelivery within this process still resumes past the stage.
    ///
    /// # Errors
    /// `Io` if the checkpoint cannot be journaled.
    pub fn checkpoint(
        &self,
        signal_id: &SignalId,
        checkpoint: &Checkpoint,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let record = OutcomeRecord {
            signal_id: signal_id.clone(),
            state: OutcomeState::InFlight(checkpoint.clone()),
            updated_at: now,
        };
        self.state
            .lock()
            .records
            .insert(signal_id.clone(), record.clone());
        self.append(&record)
    }

    /// Release the claim, recording `outcome` if it is terminal.
    ///
    /// A `Retryable` outcome leaves the last checkpoint in place.
    ///
    /// # Errors
    /// `Io` if a terminal outcome cannot be journaled; the entry then stays
    /// in flight.
    pub fn finish(
        &self,
        signal_id: &SignalId,
        outcome: &ReleaseOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.active.remove(signal_id);
        if !outcome.is_terminal() {
            return Ok(());
        }

        let record = OutcomeRecord {
            signal_id: signal_id.clone(),
            state: OutcomeState::Terminal(outcome.clone()),
            updated_at: now,
        };
        self.append(&record)?;
        state.records.insert(signal_id.clone(), record);
        Ok(())
    }

    /// Release the claim without recording anything.
    pub fn abandon(&self, signal_id: &SignalId) {
        self.state.lock().active.remove(signal_id);
    }

    #[must_use]
    pub fn get(&self, signal_id: &SignalId) -> Option<OutcomeRecord> {
        self.state.lock().records.get(signal_id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append(&self, record: &OutcomeRecord) -> Result<()> {
        match &self.journal {
            Some(journal) => journal.append(record),
            None => Ok(()),
        }
    }
}
