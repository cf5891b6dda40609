use std::collections::BTreeSet;

use time::OffsetDateTime;
use ulid::Ulid;

use crate::{
    apply_clamped, AchievementDefinition, Actor, Catalog, CommitBatch, GrantedAchievement,
    HistoryEntryInput, LedgerState, RatingSnapshot,
};

/// In-memory working copy of the ledger for one user action.
///
/// Every delta appends exactly one history entry and then re-evaluates the
/// catalog, except a penalty recorded with `grant_without_evaluation`. A grant is recorded in `granted` before its impact is applied,
/// so each definition fires at most once and the recursion depth is bounded
/// by the catalog size.
pub(crate) struct Cascade<'a> {
    catalog: &'a Catalog,
    rating: i64,
    history_count: u64,
    granted: BTreeSet<String>,
    recorded_at: OffsetDateTime,
    batch: CommitBatch,
}

impl<'a> Cascade<'a> {
    pub(crate) fn begin(catalog: &'a Catalog, state: LedgerState, now: OffsetDateTime) -> Self {
        Self {
            catalog,
            rating: state.rating,
            history_count: state.history_count,
            granted: state.granted,
            recorded_at: now,
            batch: CommitBatch {
                base_history_count: state.history_count,
                final_rating: state.rating,
                ..CommitBatch::default()
            },
        }
    }

    pub(crate) fn rating(&self) -> i64 {
        self.rating
    }

    pub(crate) fn snapshot(&self) -> RatingSnapshot {
        RatingSnapshot {
            rating: self.rating,
            history_count: self.history_count,
        }
    }

    pub(crate) fn is_granted(&self, name: &str) -> bool {
        self.granted.contains(name)
    }

    /// Applies a clamped delta, records it, and runs the evaluation hook.
    /// Returns the rating after the delta and its cascade.
    pub(crate) fn apply_delta(&mut self, amount: i64, actor: &Actor, reason: &str) -> i64 {
        self.record_delta(amount, actor, reason);
        self.evaluate(actor);
        self.rating
    }

    fn record_delta(&mut self, amount: i64, actor: &Actor, reason: &str) {
        let resulting = apply_clamped(self.rating, amount);
        self.rating = resulting;
        self.history_count += 1;
        self.batch.entries.push(HistoryEntryInput {
            entry_id: Ulid::new(),
            actor_id: actor.id,
            actor_display_name: actor.display_name.clone(),
            delta_amount: amount,
            resulting_rating: resulting,
            reason: reason.to_string(),
            recorded_at: self.recorded_at,
        });
    }

    /// Grants every automatic definition whose condition holds and that has
    /// not been granted yet, in catalog order.
    pub(crate) fn evaluate(&mut self, actor: &Actor) {
        let catalog = self.catalog;
        for definition in catalog.definitions() {
            if !definition.condition.is_automatic() || self.is_granted(&definition.name) {
                continue;
            }
            // The rating may have moved inside a nested grant, so re-read it.
            if definition.condition.is_satisfied(self.snapshot()) {
                self.grant(definition, actor);
            }
        }
    }

    /// Records the grant, then applies its impact. Returns `false` without
    /// touching the rating when the definition was already granted.
    pub(crate) fn grant(&mut self, definition: &AchievementDefinition, actor: &Actor) -> bool {
        if !self.record_grant(definition, actor) {
            return false;
        }
        self.evaluate(actor);
        true
    }

    /// Records the grant and its single history entry without evaluating
    /// the catalog afterwards. Used for penalties, which must not unlock
    /// other achievements.
    pub(crate) fn grant_without_evaluation(
        &mut self,
        definition: &AchievementDefinition,
        actor: &Actor,
    ) -> bool {
        self.record_grant(definition, actor)
    }

    fn record_grant(&mut self, definition: &AchievementDefinition, actor: &Actor) -> bool {
        if !self.granted.insert(definition.name.clone()) {
            return false;
        }

        self.batch.grants.push(GrantedAchievement {
            definition_name: definition.name.clone(),
            origin: definition.origin,
            rating_impact: definition.rating_impact,
            granted_by: actor.id,
            granted_at: self.recorded_at,
        });

        let reason = format!("achievement: {}", definition.name);
        self.record_delta(definition.rating_impact, actor, &reason);
        true
    }

    pub(crate) fn finish(mut self) -> CommitBatch {
        self.batch.final_rating = self.rating;
        self.batch
    }
}
