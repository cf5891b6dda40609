use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::catalog::DEFAULT_SELF_PROMOTION_PENALTY;
use crate::engine::Cascade;
use crate::{
    definition_name_key, level_for, now_utc, parse_impact, AchievementDefinition, Actor, ActorId,
    Catalog, CommitBatch, ConditionKind, ConfirmationAction, DefinitionOrigin, GrantedAchievement,
    HistoryEntry, Level, PendingConfirmation, RatingError, RatingStore, DEFAULT_HISTORY_LIMIT,
    RATING_MAX, RATING_MIN,
};

pub const MAX_HISTORY_LIMIT: usize = 100;
pub const DEFAULT_RESET_TTL_SECS: i64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackerConfig {
    pub target_id: ActorId,
    /// When unset, every actor except the target is an administrator.
    pub admin_id: Option<ActorId>,
    pub self_promotion_penalty: i64,
    pub history_limit: usize,
    pub reset_confirmation_ttl_secs: i64,
}

impl TrackerConfig {
    #[must_use]
    pub fn defaults(target_id: ActorId) -> Self {
        Self {
            target_id,
            admin_id: None,
            self_promotion_penalty: DEFAULT_SELF_PROMOTION_PENALTY,
            history_limit: DEFAULT_HISTORY_LIMIT,
            reset_confirmation_ttl_secs: DEFAULT_RESET_TTL_SECS,
        }
    }

    /// Validates configuration bounds.
    ///
    /// # Errors
    /// Returns [`RatingError::Configuration`] when a value is out of bounds or
    /// the administrator is the target.
    pub fn validate(&self) -> Result<(), RatingError> {
        let span = RATING_MAX - RATING_MIN;
        if !(-span..=0).contains(&self.self_promotion_penalty) {
            return Err(RatingError::Configuration(format!(
                "self_promotion_penalty MUST be in [{}, 0]",
                -span
            )));
        }

        if !(1..=MAX_HISTORY_LIMIT).contains(&self.history_limit) {
            return Err(RatingError::Configuration(format!(
                "history_limit MUST be in [1, {MAX_HISTORY_LIMIT}]"
            )));
        }

        if !(1..=86_400).contains(&self.reset_confirmation_ttl_secs) {
            return Err(RatingError::Configuration(
                "reset_confirmation_ttl_secs MUST be in [1, 86400]".to_string(),
            ));
        }

        if self.admin_id == Some(self.target_id) {
            return Err(RatingError::Configuration(
                "admin_id MUST differ from target_id".to_string(),
            ));
        }

        Ok(())
    }
}

/// Result of one rating-changing action, including its cascade.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeltaOutcome {
    /// Rating right after the triggering delta, before any achievement impact.
    pub rating_after_delta: i64,
    /// Rating after the full cascade.
    pub rating: i64,
    pub new_grants: Vec<GrantedAchievement>,
    pub entries: Vec<HistoryEntry>,
}

impl DeltaOutcome {
    fn from_commit(rating: i64, batch: CommitBatch, entries: Vec<HistoryEntry>) -> Self {
        Self {
            rating_after_delta: entries.first().map_or(rating, |entry| entry.resulting_rating),
            rating,
            new_grants: batch.grants,
            entries,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelfPromotionOutcome {
    /// `true` only on the first attempt ever (per rating generation).
    pub penalty_applied: bool,
    pub rating: i64,
    pub new_grants: Vec<GrantedAchievement>,
}

/// What an "increase" action turned into.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IncreaseOutcome {
    Applied(DeltaOutcome),
    RejectedSelfPromotion(SelfPromotionOutcome),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogEntry {
    pub definition: AchievementDefinition,
    pub grant: Option<GrantedAchievement>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerStatus {
    pub rating: i64,
    pub level: Level,
    pub history_count: u64,
    pub granted_count: usize,
    pub standard_definitions: usize,
    pub custom_definitions: usize,
    pub target_id: ActorId,
    pub admin_id: Option<ActorId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationChoice {
    Confirm,
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResetChallenge {
    pub token: Ulid,
    pub requested_by: ActorId,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub choices: Vec<ConfirmationChoice>,
}

/// Serializes every operation on the ledger behind one lock.
///
/// Each mutation loads the ledger state, computes the delta plus its
/// achievement cascade in memory, and commits the result as one batch, so
/// concurrent callers can neither lose an update nor double-grant.
pub struct RatingTracker<S: RatingStore> {
    store: Mutex<S>,
    catalog: Catalog,
    config: TrackerConfig,
}

impl<S: RatingStore> RatingTracker<S> {
    /// Validates the configuration and prepares the store.
    ///
    /// # Errors
    /// Returns [`RatingError::Configuration`] for invalid configuration and
    /// [`RatingError::StoreUnavailable`] when the store cannot be initialized.
    pub fn new(mut store: S, catalog: Catalog, config: TrackerConfig) -> Result<Self, RatingError> {
        config.validate()?;
        let catalog = catalog.with_self_promotion_penalty(config.self_promotion_penalty);
        store
            .initialize(catalog.definitions())
            .map_err(unavailable)?;

        info!(
            target_id = %config.target_id,
            definitions = catalog.len(),
            "rating tracker initialized"
        );

        Ok(Self {
            store: Mutex::new(store),
            catalog,
            config,
        })
    }

    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    #[must_use]
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    #[must_use]
    pub fn is_target(&self, actor: ActorId) -> bool {
        actor == self.config.target_id
    }

    #[must_use]
    pub fn is_admin(&self, actor: ActorId) -> bool {
        match self.config.admin_id {
            Some(admin) => admin == actor,
            None => !self.is_target(actor),
        }
    }

    /// Applies a clamped delta and runs the achievement cascade.
    ///
    /// # Errors
    /// Returns [`RatingError::Validation`] for a blank reason and
    /// [`RatingError::StoreUnavailable`] when nothing could be committed.
    pub fn apply_delta(
        &self,
        amount: i64,
        actor: &Actor,
        reason: &str,
    ) -> Result<DeltaOutcome, RatingError> {
        if reason.trim().is_empty() {
            return Err(RatingError::Validation(
                "reason MUST be provided for every change".to_string(),
            ));
        }

        let mut store = self.lock()?;
        let (rating, batch, entries) = self.with_cascade(&mut store, |cascade| {
            Ok(cascade.apply_delta(amount, actor, reason))
        })?;

        debug!(actor = %actor.id, amount, rating, reason, "rating delta applied");
        log_grants(&batch.grants);
        Ok(DeltaOutcome::from_commit(rating, batch, entries))
    }

    /// Routes an "increase" action: +1 for everyone except the target, who
    /// receives the one-time self-promotion penalty instead.
    ///
    /// # Errors
    /// Returns [`RatingError::StoreUnavailable`] when nothing could be committed.
    pub fn increase(&self, actor: &Actor) -> Result<IncreaseOutcome, RatingError> {
        if self.is_target(actor.id) {
            return self
                .grant_self_promotion_penalty(actor)
                .map(IncreaseOutcome::RejectedSelfPromotion);
        }
        self.apply_delta(1, actor, "manual increase")
            .map(IncreaseOutcome::Applied)
    }

    /// Applies -1. The target may lower their own rating.
    ///
    /// # Errors
    /// Returns [`RatingError::StoreUnavailable`] when nothing could be committed.
    pub fn decrease(&self, actor: &Actor) -> Result<DeltaOutcome, RatingError> {
        self.apply_delta(-1, actor, "manual decrease")
    }

    /// Administrative delta of any size. The cascade still runs.
    ///
    /// # Errors
    /// Returns [`RatingError::NotPermitted`] for non-administrators, otherwise
    /// as [`Self::apply_delta`].
    pub fn adjust(
        &self,
        actor: &Actor,
        amount: i64,
        reason: &str,
    ) -> Result<DeltaOutcome, RatingError> {
        self.require_admin(actor, "adjust the rating")?;
        self.apply_delta(amount, actor, reason)
    }

    /// # Errors
    /// Returns [`RatingError::StoreUnavailable`] when the store cannot be read.
    pub fn current_rating(&self) -> Result<i64, RatingError> {
        let store = self.lock()?;
        Ok(store.load_state().map_err(unavailable)?.rating)
    }

    /// Most recent first; `None` uses the configured default limit.
    ///
    /// # Errors
    /// Returns [`RatingError::StoreUnavailable`] when the store cannot be read.
    pub fn history(&self, limit: Option<usize>) -> Result<Vec<HistoryEntry>, RatingError> {
        let limit = limit.unwrap_or(self.config.history_limit);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let store = self.lock()?;
        store.history(limit).map_err(unavailable)
    }

    /// Grants every satisfied, not yet granted automatic achievement.
    /// Calling it again without an intervening change grants nothing.
    ///
    /// # Errors
    /// Returns [`RatingError::StoreUnavailable`] when nothing could be committed.
    pub fn evaluate(&self, actor: &Actor) -> Result<Vec<GrantedAchievement>, RatingError> {
        let mut store = self.lock()?;
        let ((), batch, _) = self.with_cascade(&mut store, |cascade| {
            cascade.evaluate(actor);
            Ok(())
        })?;
        log_grants(&batch.grants);
        Ok(batch.grants)
    }

    /// Grants the self-promotion penalty once; later calls change nothing.
    /// No other achievement is evaluated on this path.
    ///
    /// # Errors
    /// Returns [`RatingError::StoreUnavailable`] when nothing could be committed.
    pub fn grant_self_promotion_penalty(
        &self,
        actor: &Actor,
    ) -> Result<SelfPromotionOutcome, RatingError> {
        let Some(definition) = self.catalog.self_promotion() else {
            warn!(actor = %actor.id, "catalog has no self-promotion definition");
            return Ok(SelfPromotionOutcome {
                penalty_applied: false,
                rating: self.current_rating()?,
                new_grants: Vec::new(),
            });
        };

        let mut store = self.lock()?;
        let ((penalty_applied, rating), batch, _) = self.with_cascade(&mut store, |cascade| {
            let applied = cascade.grant_without_evaluation(definition, actor);
            Ok((applied, cascade.rating()))
        })?;

        warn!(actor = %actor.id, penalty_applied, "self-promotion attempt rejected");
        log_grants(&batch.grants);
        Ok(SelfPromotionOutcome {
            penalty_applied,
            rating,
            new_grants: batch.grants,
        })
    }

    /// Defines a custom achievement. It is never granted automatically.
    ///
    /// # Errors
    /// Returns [`RatingError::NotPermitted`] for non-administrators,
    /// [`RatingError::InvalidImpactValue`] when `raw_impact` is not an integer,
    /// [`RatingError::Validation`] for a blank name, and
    /// [`RatingError::DuplicateDefinitionName`] on a name collision.
    pub fn create_custom(
        &self,
        actor: &Actor,
        name: &str,
        description: &str,
        raw_impact: &str,
    ) -> Result<AchievementDefinition, RatingError> {
        self.require_admin(actor, "create achievements")?;
        let rating_impact = parse_impact(raw_impact)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(RatingError::Validation(
                "achievement name MUST NOT be empty".to_string(),
            ));
        }

        let mut store = self.lock()?;
        let custom = store.custom_definitions().map_err(unavailable)?;
        let key = definition_name_key(name);
        if self.catalog.contains_name(name)
            || custom
                .iter()
                .any(|definition| definition_name_key(&definition.name) == key)
        {
            return Err(RatingError::DuplicateDefinitionName(name.to_string()));
        }

        let definition = AchievementDefinition {
            definition_id: Some(Ulid::new()),
            name: name.to_string(),
            description: description.trim().to_string(),
            condition: ConditionKind::Manual,
            rating_impact,
            origin: DefinitionOrigin::Custom,
            created_by: Some(actor.id),
            created_at: Some(now_utc()),
        };
        store
            .insert_custom_definition(&definition)
            .map_err(unavailable)?;

        info!(
            actor = %actor.id,
            name = %definition.name,
            rating_impact,
            "custom achievement created"
        );
        Ok(definition)
    }

    /// Grants a custom achievement by id, bypassing condition evaluation.
    ///
    /// # Errors
    /// Returns [`RatingError::NotPermitted`] for non-administrators,
    /// [`RatingError::UnknownDefinition`] when no custom definition has this
    /// id, and [`RatingError::AlreadyGranted`] on a repeated grant.
    pub fn grant_custom(
        &self,
        definition_id: Ulid,
        granted_by: &Actor,
    ) -> Result<DeltaOutcome, RatingError> {
        self.require_admin(granted_by, "grant achievements")?;

        let mut store = self.lock()?;
        let definition = store
            .custom_definitions()
            .map_err(unavailable)?
            .into_iter()
            .find(|definition| definition.definition_id == Some(definition_id))
            .ok_or_else(|| RatingError::UnknownDefinition(definition_id.to_string()))?;

        let (rating, batch, entries) = self.with_cascade(&mut store, |cascade| {
            if !cascade.grant(&definition, granted_by) {
                return Err(RatingError::AlreadyGranted {
                    name: definition.name.clone(),
                });
            }
            Ok(cascade.rating())
        })?;

        log_grants(&batch.grants);
        Ok(DeltaOutcome::from_commit(rating, batch, entries))
    }

    /// Standard definitions in catalog order, then custom ones, each with
    /// its grant if any.
    ///
    /// # Errors
    /// Returns [`RatingError::StoreUnavailable`] when the store cannot be read.
    pub fn list_catalog(&self) -> Result<Vec<CatalogEntry>, RatingError> {
        let store = self.lock()?;
        let mut grants: BTreeMap<String, GrantedAchievement> = store
            .grants()
            .map_err(unavailable)?
            .into_iter()
            .map(|grant| (grant.definition_name.clone(), grant))
            .collect();
        let custom = store.custom_definitions().map_err(unavailable)?;

        Ok(self
            .catalog
            .definitions()
            .iter()
            .cloned()
            .chain(custom)
            .map(|definition| CatalogEntry {
                grant: grants.remove(&definition.name),
                definition,
            })
            .collect())
    }

    /// Granted achievements in grant order.
    ///
    /// # Errors
    /// Returns [`RatingError::StoreUnavailable`] when the store cannot be read.
    pub fn granted(&self) -> Result<Vec<GrantedAchievement>, RatingError> {
        let store = self.lock()?;
        store.grants().map_err(unavailable)
    }

    /// # Errors
    /// Returns [`RatingError::StoreUnavailable`] or [`RatingError::OutOfRange`].
    pub fn level(&self) -> Result<Level, RatingError> {
        level_for(self.current_rating()?)
    }

    /// # Errors
    /// Returns [`RatingError::StoreUnavailable`] or [`RatingError::OutOfRange`].
    pub fn status(&self) -> Result<LedgerStatus, RatingError> {
        let store = self.lock()?;
        let state = store.load_state().map_err(unavailable)?;
        let custom = store.custom_definitions().map_err(unavailable)?;

        Ok(LedgerStatus {
            rating: state.rating,
            level: level_for(state.rating)?,
            history_count: state.history_count,
            granted_count: state.granted.len(),
            standard_definitions: self.catalog.len(),
            custom_definitions: custom.len(),
            target_id: self.config.target_id,
            admin_id: self.config.admin_id,
        })
    }

    /// Unconditional, irreversible reset. Interactive callers go through
    /// [`Self::request_reset`] and [`Self::confirm_reset`] instead.
    ///
    /// # Errors
    /// Returns [`RatingError::StoreUnavailable`] when the reset was not applied.
    pub fn reset(&self) -> Result<(), RatingError> {
        let mut store = self.lock()?;
        store.reset().map_err(unavailable)?;
        info!("rating ledger reset");
        Ok(())
    }

    /// First step of the reset protocol: issues a single-use token.
    ///
    /// # Errors
    /// Returns [`RatingError::NotPermitted`] for non-administrators.
    pub fn request_reset(&self, actor: &Actor) -> Result<ResetChallenge, RatingError> {
        self.require_admin(actor, "reset the rating")?;

        let requested_at = now_utc();
        let pending = PendingConfirmation {
            token: Ulid::new(),
            action: ConfirmationAction::Reset,
            requested_by: actor.id,
            requested_at,
            expires_at: requested_at + Duration::seconds(self.config.reset_confirmation_ttl_secs),
        };

        let mut store = self.lock()?;
        store.put_pending(&pending).map_err(unavailable)?;
        info!(actor = %actor.id, token = %pending.token, "reset requested");

        Ok(ResetChallenge {
            token: pending.token,
            requested_by: pending.requested_by,
            expires_at: pending.expires_at,
            choices: vec![ConfirmationChoice::Confirm, ConfirmationChoice::Cancel],
        })
    }

    /// Confirm path of the reset protocol. Consumes the token.
    ///
    /// # Errors
    /// Returns [`RatingError::Confirmation`] for unknown, used or expired
    /// tokens and [`RatingError::NotPermitted`] when another actor confirms.
    pub fn confirm_reset(&self, actor: &Actor, token: Ulid) -> Result<(), RatingError> {
        let mut store = self.lock()?;
        let pending = Self::pending_for(&*store, actor, token)?;

        if now_utc() > pending.expires_at {
            let _ = store.delete_pending(token).map_err(unavailable)?;
            return Err(RatingError::Confirmation(format!(
                "reset token {token} has expired"
            )));
        }

        store.reset().map_err(unavailable)?;
        info!(actor = %actor.id, %token, "rating ledger reset confirmed");
        Ok(())
    }

    /// Cancel path of the reset protocol. Discards the token.
    ///
    /// # Errors
    /// Returns [`RatingError::Confirmation`] for unknown or used tokens and
    /// [`RatingError::NotPermitted`] when another actor cancels.
    pub fn cancel_reset(&self, actor: &Actor, token: Ulid) -> Result<(), RatingError> {
        let mut store = self.lock()?;
        let _ = Self::pending_for(&*store, actor, token)?;
        let _ = store.delete_pending(token).map_err(unavailable)?;
        info!(actor = %actor.id, %token, "reset cancelled");
        Ok(())
    }

    fn pending_for(
        store: &S,
        actor: &Actor,
        token: Ulid,
    ) -> Result<PendingConfirmation, RatingError> {
        let pending = store
            .pending(token)
            .map_err(unavailable)?
            .filter(|pending| pending.action == ConfirmationAction::Reset)
            .ok_or_else(|| {
                RatingError::Confirmation(format!("unknown or already used reset token {token}"))
            })?;

        if pending.requested_by != actor.id {
            warn!(actor = %actor.id, %token, "reset token used by another actor");
            return Err(RatingError::NotPermitted(
                "only the requesting actor can answer this reset".to_string(),
            ));
        }

        Ok(pending)
    }

    fn require_admin(&self, actor: &Actor, action: &str) -> Result<(), RatingError> {
        if self.is_admin(actor.id) {
            return Ok(());
        }
        warn!(actor = %actor.id, action, "administrative action refused");
        Err(RatingError::NotPermitted(format!(
            "actor {} may not {action}",
            actor.id
        )))
    }

    fn lock(&self) -> Result<MutexGuard<'_, S>, RatingError> {
        self.store
            .lock()
            .map_err(|_| RatingError::StoreUnavailable("rating store lock poisoned".to_string()))
    }

    /// Runs `apply` on a fresh cascade and commits whatever it produced.
    fn with_cascade<T>(
        &self,
        store: &mut S,
        apply: impl FnOnce(&mut Cascade<'_>) -> Result<T, RatingError>,
    ) -> Result<(T, CommitBatch, Vec<HistoryEntry>), RatingError> {
        let state = store.load_state().map_err(unavailable)?;
        let mut cascade = Cascade::begin(&self.catalog, state, now_utc());
        let value = apply(&mut cascade)?;
        let batch = cascade.finish();

        let entries = if batch.is_empty() {
            Vec::new()
        } else {
            store.commit(&batch).map_err(unavailable)?
        };

        Ok((value, batch, entries))
    }
}

fn log_grants(grants: &[GrantedAchievement]) {
    for grant in grants {
        info!(
            achievement = %grant.definition_name,
            rating_impact = grant.rating_impact,
            granted_by = %grant.granted_by,
            "achievement granted"
        );
    }
}

#[allow(clippy::needless_pass_by_value)]
fn unavailable(err: anyhow::Error) -> RatingError {
    RatingError::StoreUnavailable(format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use crate::{apply_clamped, MemoryStore};
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    const TARGET: i64 = 1000;

    fn must<T>(result: Result<T, RatingError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn config() -> TrackerConfig {
        TrackerConfig::defaults(ActorId(TARGET))
    }

    fn tracker_with(catalog: Catalog) -> RatingTracker<MemoryStore> {
        must(RatingTracker::new(MemoryStore::new(), catalog, config()))
    }

    fn standard_tracker() -> RatingTracker<MemoryStore> {
        tracker_with(Catalog::default())
    }

    fn empty_tracker() -> RatingTracker<MemoryStore> {
        tracker_with(must(Catalog::new(Vec::new())))
    }

    fn user() -> Actor {
        Actor::new(7, "Masha")
    }

    fn target() -> Actor {
        Actor::new(TARGET, "Andrey")
    }

    fn granted_names(tracker: &RatingTracker<MemoryStore>) -> BTreeSet<String> {
        must(tracker.granted())
            .into_iter()
            .map(|grant| grant.definition_name)
            .collect()
    }

    #[test]
    fn clamps_large_deltas_to_bounds() {
        let tracker = empty_tracker();
        assert_eq!(must(tracker.apply_delta(1000, &user(), "bulk")).rating, 500);
        assert_eq!(must(tracker.current_rating()), 500);

        let tracker = empty_tracker();
        assert_eq!(must(tracker.apply_delta(-1000, &user(), "bulk")).rating, -500);
        let history = must(tracker.history(None));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].delta_amount, -1000);
        assert_eq!(history[0].resulting_rating, -500);
    }

    #[test]
    fn threshold_grant_lands_exactly_once_at_twenty() {
        let tracker = tracker_with(must(Catalog::new(vec![AchievementDefinition::standard(
            "Newcomer",
            "Reach a rating of 10",
            ConditionKind::MinRatingReached(10),
            10,
        )])));

        for _ in 0..9 {
            let _ = must(tracker.apply_delta(1, &user(), "manual increase"));
        }
        assert_eq!(must(tracker.current_rating()), 9);
        assert!(must(tracker.granted()).is_empty());

        let outcome = must(tracker.apply_delta(1, &user(), "manual increase"));
        assert_eq!(outcome.rating_after_delta, 10);
        assert_eq!(outcome.rating, 20);
        assert_eq!(must(tracker.current_rating()), 20);

        let grants = must(tracker.granted());
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].definition_name, "Newcomer");
        assert_eq!(grants[0].granted_by, ActorId(7));
    }

    #[test]
    fn cascade_grants_each_crossed_threshold_once() {
        let tracker = standard_tracker();
        while must(tracker.current_rating()) < 60 {
            let _ = must(tracker.apply_delta(1, &user(), "manual increase"));
        }

        let expected: BTreeSet<String> = ["First Step", "Newcomer", "Chat Star", "Master"]
            .into_iter()
            .map(str::to_string)
            .collect();
        assert_eq!(granted_names(&tracker), expected);
        assert_eq!(must(tracker.granted()).len(), 4);
        assert_eq!(must(tracker.current_rating()), 70);
    }

    #[test]
    fn evaluate_twice_is_idempotent() {
        let tracker = standard_tracker();
        let _ = must(tracker.apply_delta(30, &user(), "bulk"));
        let granted_before = must(tracker.granted());
        let rating_before = must(tracker.current_rating());

        assert!(must(tracker.evaluate(&user())).is_empty());
        assert!(must(tracker.evaluate(&user())).is_empty());
        assert_eq!(must(tracker.granted()), granted_before);
        assert_eq!(must(tracker.current_rating()), rating_before);
    }

    #[test]
    fn evaluate_picks_up_conditions_satisfied_without_a_delta() {
        // Grants recorded by an older catalog are absent; evaluation catches up.
        let mut store = MemoryStore::new();
        must(store.initialize(&[]).map_err(unavailable));
        let mut batch = CommitBatch::default();
        batch.entries.push(crate::HistoryEntryInput {
            entry_id: Ulid::new(),
            actor_id: ActorId(7),
            actor_display_name: "Masha".to_string(),
            delta_amount: 12,
            resulting_rating: 12,
            reason: "imported".to_string(),
            recorded_at: now_utc(),
        });
        batch.final_rating = 12;
        let _ = must(store.commit(&batch).map_err(unavailable));

        let tracker = must(RatingTracker::new(store, Catalog::default(), config()));
        let first = must(tracker.evaluate(&user()));
        let names: BTreeSet<&str> = first
            .iter()
            .map(|grant| grant.definition_name.as_str())
            .collect();
        assert!(names.contains("First Step"));
        assert!(names.contains("Newcomer"));
        assert!(must(tracker.evaluate(&user())).is_empty());
    }

    #[test]
    fn history_is_bounded_and_most_recent_first() {
        let tracker = empty_tracker();
        let mut observed = Vec::new();
        for _ in 0..15 {
            observed.push(must(tracker.apply_delta(1, &user(), "manual increase")).rating);
        }

        let history = must(tracker.history(Some(10)));
        assert_eq!(history.len(), 10);
        let ratings: Vec<i64> = history.iter().map(|entry| entry.resulting_rating).collect();
        let expected: Vec<i64> = observed.iter().rev().take(10).copied().collect();
        assert_eq!(ratings, expected);
        assert!(history
            .windows(2)
            .all(|pair| pair[0].entry_seq > pair[1].entry_seq));
        assert_eq!(must(tracker.history(None)).len(), 10);
        assert!(must(tracker.history(Some(0))).is_empty());
    }

    #[test]
    fn history_denormalizes_display_name_and_reason() {
        let tracker = empty_tracker();
        let _ = must(tracker.apply_delta(-1, &Actor::new(9, ""), "manual decrease"));
        let history = must(tracker.history(None));
        let entry = &history[0];
        assert_eq!(entry.actor_id, ActorId(9));
        assert_eq!(entry.actor_display_name, "");
        assert_eq!(entry.reason, "manual decrease");
    }

    #[test]
    fn blank_reason_is_rejected() {
        let tracker = empty_tracker();
        assert!(matches!(
            tracker.apply_delta(1, &user(), "  "),
            Err(RatingError::Validation(_))
        ));
        assert_eq!(must(tracker.current_rating()), 0);
    }

    #[test]
    fn target_increase_never_raises_and_penalizes_once() {
        let tracker = standard_tracker();

        let first = match must(tracker.increase(&target())) {
            IncreaseOutcome::RejectedSelfPromotion(outcome) => outcome,
            IncreaseOutcome::Applied(_) => panic!("target increase must be rejected"),
        };
        assert!(first.penalty_applied);
        assert_eq!(first.rating, -10);
        assert_eq!(first.new_grants.len(), 1);
        let after_first = must(tracker.current_rating());

        for _ in 0..5 {
            match must(tracker.increase(&target())) {
                IncreaseOutcome::RejectedSelfPromotion(outcome) => {
                    assert!(!outcome.penalty_applied);
                    assert!(outcome.new_grants.is_empty());
                }
                IncreaseOutcome::Applied(_) => panic!("target increase must be rejected"),
            }
        }

        assert_eq!(must(tracker.current_rating()), after_first);
        let clowns = must(tracker.granted())
            .into_iter()
            .filter(|grant| grant.definition_name == "Clown")
            .count();
        assert_eq!(clowns, 1);
    }

    #[test]
    fn target_increase_cannot_trigger_positive_achievements() {
        let tracker = standard_tracker();
        let _ = must(tracker.apply_delta(1, &user(), "manual increase"));
        // First Step: 1 + 5 = 6 with two entries; alternate up to history 9.
        for step in 0..7 {
            let amount = if step % 2 == 0 { 1 } else { -1 };
            let _ = must(tracker.apply_delta(amount, &user(), "nudge"));
        }
        let before = must(tracker.status());
        assert_eq!(before.rating, 7);
        assert_eq!(before.history_count, 9);

        let outcome = match must(tracker.increase(&target())) {
            IncreaseOutcome::RejectedSelfPromotion(outcome) => outcome,
            IncreaseOutcome::Applied(_) => panic!("target increase must be rejected"),
        };
        assert!(outcome.penalty_applied);
        assert_eq!(outcome.rating, -3);
        assert_eq!(
            outcome
                .new_grants
                .iter()
                .map(|grant| grant.definition_name.as_str())
                .collect::<Vec<_>>(),
            vec!["Clown"]
        );

        let after = must(tracker.status());
        assert!(after.rating <= before.rating);
        assert_eq!(after.history_count, 10);
        assert!(!granted_names(&tracker).contains("Chat Star"));

        // The next ordinary change catches up on the pending achievement.
        let next = must(tracker.decrease(&user()));
        assert!(next
            .new_grants
            .iter()
            .any(|grant| grant.definition_name == "Chat Star"));
    }

    #[test]
    fn small_penalty_never_nets_a_gain_on_a_fresh_ledger() {
        let mut config = config();
        config.self_promotion_penalty = -3;
        let tracker = must(RatingTracker::new(
            MemoryStore::new(),
            Catalog::default(),
            config,
        ));

        let _ = must(tracker.increase(&target()));
        assert_eq!(must(tracker.current_rating()), -3);
        assert_eq!(granted_names(&tracker), BTreeSet::from(["Clown".to_string()]));
    }

    #[test]
    fn penalty_magnitude_comes_from_configuration() {
        let mut config = config();
        config.self_promotion_penalty = -3;
        let tracker = must(RatingTracker::new(
            MemoryStore::new(),
            must(Catalog::new(vec![AchievementDefinition::standard(
                "Clown",
                "",
                ConditionKind::SelfPromotionAttempted,
                -10,
            )])),
            config,
        ));

        let outcome = must(tracker.grant_self_promotion_penalty(&target()));
        assert_eq!(outcome.rating, -3);
    }

    #[test]
    fn others_increase_and_target_may_decrease() {
        let tracker = empty_tracker();
        match must(tracker.increase(&user())) {
            IncreaseOutcome::Applied(outcome) => assert_eq!(outcome.rating, 1),
            IncreaseOutcome::RejectedSelfPromotion(_) => panic!("user increase must apply"),
        }
        assert_eq!(must(tracker.decrease(&target())).rating, 0);
    }

    #[test]
    fn adjust_is_reserved_for_administrators() {
        let tracker = empty_tracker();
        assert!(matches!(
            tracker.adjust(&target(), 50, "bonus"),
            Err(RatingError::NotPermitted(_))
        ));
        assert_eq!(must(tracker.adjust(&user(), -42, "penalty")).rating, -42);
    }

    #[test]
    fn custom_achievements_follow_admin_and_uniqueness_rules() {
        let tracker = standard_tracker();

        assert!(matches!(
            tracker.create_custom(&target(), "Hero", "", "5"),
            Err(RatingError::NotPermitted(_))
        ));
        assert_eq!(
            tracker.create_custom(&user(), "Hero", "", "five"),
            Err(RatingError::InvalidImpactValue("five".to_string()))
        );
        assert!(matches!(
            tracker.create_custom(&user(), " newcomer ", "", "5"),
            Err(RatingError::DuplicateDefinitionName(_))
        ));

        let hero = must(tracker.create_custom(&user(), "Hero", "Saved the day", "+25"));
        assert_eq!(hero.origin, DefinitionOrigin::Custom);
        assert_eq!(hero.condition, ConditionKind::Manual);
        assert!(matches!(
            tracker.create_custom(&user(), "HERO", "", "1"),
            Err(RatingError::DuplicateDefinitionName(_))
        ));

        // Evaluation never fires manual definitions.
        let _ = must(tracker.apply_delta(1, &user(), "manual increase"));
        assert!(!granted_names(&tracker).contains("Hero"));

        let Some(hero_id) = hero.definition_id else {
            panic!("custom definition must carry an id");
        };
        let before = must(tracker.current_rating());
        let outcome = must(tracker.grant_custom(hero_id, &user()));
        assert_eq!(outcome.rating_after_delta, before + 25);
        assert_eq!(outcome.new_grants[0].definition_name, "Hero");

        let rating = must(tracker.current_rating());
        assert_eq!(
            tracker.grant_custom(hero_id, &user()),
            Err(RatingError::AlreadyGranted {
                name: "Hero".to_string()
            })
        );
        assert_eq!(must(tracker.current_rating()), rating);
        assert!(matches!(
            tracker.grant_custom(Ulid::new(), &user()),
            Err(RatingError::UnknownDefinition(_))
        ));
        assert!(matches!(
            tracker.grant_custom(hero_id, &target()),
            Err(RatingError::NotPermitted(_))
        ));
    }

    #[test]
    fn catalog_listing_marks_grants() {
        let tracker = standard_tracker();
        let _ = must(tracker.create_custom(&user(), "Hero", "", "1"));
        let _ = must(tracker.apply_delta(1, &user(), "manual increase"));

        let listing = must(tracker.list_catalog());
        assert_eq!(listing.len(), 9);
        assert_eq!(listing[0].definition.name, "First Step");
        assert!(listing[0].grant.is_some());
        assert!(listing[1].grant.is_none());
        assert_eq!(listing[8].definition.name, "Hero");
    }

    #[test]
    fn reset_clears_everything_and_allows_reearning() {
        let tracker = standard_tracker();
        let hero = must(tracker.create_custom(&user(), "Hero", "", "3"));
        let _ = must(tracker.apply_delta(20, &user(), "bulk"));
        if let Some(id) = hero.definition_id {
            let _ = must(tracker.grant_custom(id, &user()));
        }
        assert!(!must(tracker.granted()).is_empty());

        let challenge = must(tracker.request_reset(&user()));
        assert_eq!(
            challenge.choices,
            vec![ConfirmationChoice::Confirm, ConfirmationChoice::Cancel]
        );
        must(tracker.confirm_reset(&user(), challenge.token));

        assert_eq!(must(tracker.current_rating()), 0);
        assert!(must(tracker.history(Some(10))).is_empty());
        assert!(must(tracker.granted()).is_empty());
        assert_eq!(must(tracker.status()).custom_definitions, 0);

        let _ = must(tracker.apply_delta(1, &user(), "manual increase"));
        assert!(granted_names(&tracker).contains("First Step"));
        assert!(must(tracker.create_custom(&user(), "Hero", "", "3")).definition_id.is_some());
    }

    #[test]
    fn reset_protocol_rejects_foreign_cancelled_and_expired_tokens() {
        let tracker = empty_tracker();
        let _ = must(tracker.apply_delta(5, &user(), "bulk"));

        assert!(matches!(
            tracker.request_reset(&target()),
            Err(RatingError::NotPermitted(_))
        ));

        let challenge = must(tracker.request_reset(&user()));
        assert!(matches!(
            tracker.confirm_reset(&Actor::new(8, "Other"), challenge.token),
            Err(RatingError::NotPermitted(_))
        ));
        must(tracker.cancel_reset(&user(), challenge.token));
        assert!(matches!(
            tracker.confirm_reset(&user(), challenge.token),
            Err(RatingError::Confirmation(_))
        ));
        assert_eq!(must(tracker.current_rating()), 5);

        let challenge = must(tracker.request_reset(&user()));
        must(tracker.confirm_reset(&user(), challenge.token));
        assert!(matches!(
            tracker.confirm_reset(&user(), challenge.token),
            Err(RatingError::Confirmation(_))
        ));

        let mut store = MemoryStore::new();
        let token = Ulid::new();
        let requested_at = now_utc() - Duration::hours(1);
        let put = store.put_pending(&PendingConfirmation {
            token,
            action: ConfirmationAction::Reset,
            requested_by: ActorId(7),
            requested_at,
            expires_at: requested_at + Duration::minutes(5),
        });
        must(put.map_err(unavailable));
        let tracker = must(RatingTracker::new(store, Catalog::default(), config()));
        let _ = must(tracker.apply_delta(2, &user(), "bulk"));
        assert!(matches!(
            tracker.confirm_reset(&user(), token),
            Err(RatingError::Confirmation(_))
        ));
        assert!(must(tracker.current_rating()) > 0);
    }

    #[test]
    fn explicit_admin_restricts_administration() {
        let mut config = config();
        config.admin_id = Some(ActorId(1));
        let tracker = must(RatingTracker::new(
            MemoryStore::new(),
            Catalog::default(),
            config,
        ));
        assert!(tracker.is_admin(ActorId(1)));
        assert!(!tracker.is_admin(ActorId(7)));
        assert!(!tracker.is_admin(ActorId(TARGET)));
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let mut config = config();
        config.admin_id = Some(ActorId(TARGET));
        assert!(matches!(
            RatingTracker::new(MemoryStore::new(), Catalog::default(), config).map(|_| ()),
            Err(RatingError::Configuration(_))
        ));

        let mut config = TrackerConfig::defaults(ActorId(TARGET));
        config.history_limit = 0;
        assert!(config.validate().is_err());
        config.history_limit = 10;
        config.self_promotion_penalty = -5000;
        assert!(config.validate().is_err());
        config.self_promotion_penalty = 50;
        assert!(matches!(
            config.validate(),
            Err(RatingError::Configuration(_))
        ));
        config.self_promotion_penalty = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn concurrent_deltas_lose_no_update() {
        let tracker = Arc::new(empty_tracker());
        std::thread::scope(|scope| {
            for worker in 0..8_i64 {
                let tracker = Arc::clone(&tracker);
                scope.spawn(move || {
                    let actor = Actor::new(worker, format!("worker-{worker}"));
                    for _ in 0..25 {
                        let _ = must(tracker.apply_delta(1, &actor, "manual increase"));
                    }
                });
            }
        });

        assert_eq!(must(tracker.current_rating()), 200);
        assert_eq!(must(tracker.status()).history_count, 200);
    }

    #[test]
    fn status_reports_level_and_counts() {
        let tracker = standard_tracker();
        let _ = must(tracker.apply_delta(1, &user(), "manual increase"));
        let status = must(tracker.status());
        assert_eq!(status.rating, 6);
        assert_eq!(status.level.name, "Newcomer");
        assert_eq!(status.history_count, 2);
        assert_eq!(status.granted_count, 1);
        assert_eq!(status.standard_definitions, 8);
        assert_eq!(must(tracker.level()), status.level);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_history_replays_to_current_rating(deltas in prop::collection::vec(-3_i64..=3, 1..60)) {
            let tracker = standard_tracker();
            for delta in &deltas {
                let _ = must(tracker.apply_delta(*delta, &user(), "manual change"));
            }

            let mut chronological = must(tracker.history(Some(MAX_HISTORY_LIMIT)));
            prop_assume!(chronological.len() < MAX_HISTORY_LIMIT);
            chronological.reverse();

            let mut previous = 0_i64;
            let mut sum = 0_i64;
            for entry in &chronological {
                prop_assert_eq!(entry.resulting_rating, apply_clamped(previous, entry.delta_amount));
                previous = entry.resulting_rating;
                sum += entry.delta_amount;
            }

            let current = must(tracker.current_rating());
            prop_assert_eq!(current, previous);
            // Small deltas never reach the clamp bounds, so no amount is lost.
            prop_assert_eq!(current, sum);

            let grants = must(tracker.granted());
            let unique: BTreeSet<&str> = grants.iter().map(|grant| grant.definition_name.as_str()).collect();
            prop_assert_eq!(unique.len(), grants.len());
        }
    }
}
