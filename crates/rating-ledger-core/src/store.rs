use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Result};
use ulid::Ulid;

use crate::{
    AchievementDefinition, CommitBatch, DefinitionOrigin, GrantedAchievement, HistoryEntry,
    LedgerState, PendingConfirmation,
};

/// Durable state behind a [`crate::RatingTracker`].
///
/// Implementations must apply [`RatingStore::commit`] and
/// [`RatingStore::reset`] atomically and must refuse a second grant of the
/// same definition name.
pub trait RatingStore {
    /// Creates the rating record at 0 when missing and upserts the standard
    /// catalog definitions.
    #[allow(clippy::missing_errors_doc)]
    fn initialize(&mut self, standard: &[AchievementDefinition]) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn load_state(&self) -> Result<LedgerState>;

    /// Appends the batch's entries and grants and stores its final rating,
    /// returning the entries with their assigned sequence numbers.
    #[allow(clippy::missing_errors_doc)]
    fn commit(&mut self, batch: &CommitBatch) -> Result<Vec<HistoryEntry>>;

    /// Most recent first, at most `limit` entries.
    #[allow(clippy::missing_errors_doc)]
    fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>>;

    #[allow(clippy::missing_errors_doc)]
    fn grants(&self) -> Result<Vec<GrantedAchievement>>;

    #[allow(clippy::missing_errors_doc)]
    fn custom_definitions(&self) -> Result<Vec<AchievementDefinition>>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_custom_definition(&mut self, definition: &AchievementDefinition) -> Result<()>;

    /// Rating back to 0; history, grants, custom definitions and pending
    /// confirmations discarded.
    #[allow(clippy::missing_errors_doc)]
    fn reset(&mut self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn put_pending(&mut self, pending: &PendingConfirmation) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn pending(&self, token: Ulid) -> Result<Option<PendingConfirmation>>;

    #[allow(clippy::missing_errors_doc)]
    fn delete_pending(&mut self, token: Ulid) -> Result<bool>;
}

/// Process-local store. Nothing survives the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    rating: i64,
    history: Vec<HistoryEntry>,
    next_seq: i64,
    standard: Vec<AchievementDefinition>,
    custom: Vec<AchievementDefinition>,
    grants: Vec<GrantedAchievement>,
    pending: BTreeMap<Ulid, PendingConfirmation>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn is_granted(&self, name: &str) -> bool {
        self.grants.iter().any(|grant| grant.definition_name == name)
    }

    fn definition_names(&self) -> BTreeSet<&str> {
        self.standard
            .iter()
            .chain(self.custom.iter())
            .map(|definition| definition.name.as_str())
            .collect()
    }
}

impl RatingStore for MemoryStore {
    fn initialize(&mut self, standard: &[AchievementDefinition]) -> Result<()> {
        self.standard = standard.to_vec();
        Ok(())
    }

    fn load_state(&self) -> Result<LedgerState> {
        Ok(LedgerState {
            rating: self.rating,
            history_count: u64::try_from(self.history.len())?,
            granted: self
                .grants
                .iter()
                .map(|grant| grant.definition_name.clone())
                .collect(),
        })
    }

    fn commit(&mut self, batch: &CommitBatch) -> Result<Vec<HistoryEntry>> {
        batch
            .validate()
            .map_err(|err| anyhow!("commit batch rejected: {err}"))?;

        let history_count = u64::try_from(self.history.len())?;
        if batch.base_history_count != history_count {
            return Err(anyhow!(
                "ledger changed concurrently: batch computed at {} entries, store has {history_count}",
                batch.base_history_count
            ));
        }

        let known = self.definition_names();
        for grant in &batch.grants {
            if self.is_granted(&grant.definition_name) {
                return Err(anyhow!(
                    "achievement {} is already granted",
                    grant.definition_name
                ));
            }
            if !known.contains(grant.definition_name.as_str()) {
                return Err(anyhow!(
                    "grant references unknown definition {}",
                    grant.definition_name
                ));
            }
        }

        let mut committed = Vec::with_capacity(batch.entries.len());
        for entry in &batch.entries {
            self.next_seq += 1;
            committed.push(entry.clone().into_entry(self.next_seq));
        }
        self.history.extend(committed.iter().cloned());
        self.grants.extend(batch.grants.iter().cloned());
        self.rating = batch.final_rating;

        Ok(committed)
    }

    fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        Ok(self.history.iter().rev().take(limit).cloned().collect())
    }

    fn grants(&self) -> Result<Vec<GrantedAchievement>> {
        Ok(self.grants.clone())
    }

    fn custom_definitions(&self) -> Result<Vec<AchievementDefinition>> {
        Ok(self.custom.clone())
    }

    fn insert_custom_definition(&mut self, definition: &AchievementDefinition) -> Result<()> {
        if definition.origin != DefinitionOrigin::Custom {
            return Err(anyhow!("only custom definitions can be inserted at runtime"));
        }
        if self.definition_names().contains(definition.name.as_str()) {
            return Err(anyhow!("definition name {} already exists", definition.name));
        }
        self.custom.push(definition.clone());
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.rating = 0;
        self.history.clear();
        self.custom.clear();
        self.grants.clear();
        self.pending.clear();
        Ok(())
    }

    fn put_pending(&mut self, pending: &PendingConfirmation) -> Result<()> {
        self.pending.insert(pending.token, pending.clone());
        Ok(())
    }

    fn pending(&self, token: Ulid) -> Result<Option<PendingConfirmation>> {
        Ok(self.pending.get(&token).cloned())
    }

    fn delete_pending(&mut self, token: Ulid) -> Result<bool> {
        Ok(self.pending.remove(&token).is_some())
    }
}
