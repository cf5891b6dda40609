//! Rating ledger domain: a single clamped rating, its append-only history,
//! and the one-shot achievements that feed back into it.
//!
//! The public surface is [`RatingTracker`], which serializes every mutation
//! against a [`RatingStore`] and runs the achievement cascade for each
//! user action inside one committed batch.

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

mod catalog;
mod engine;
mod level;
mod store;
mod tracker;

pub use catalog::{Catalog, DEFAULT_SELF_PROMOTION_PENALTY};
pub use level::{level_for, progress_bar, validate_level_table, Level, LevelTier, LEVEL_TIERS};
pub use store::{MemoryStore, RatingStore};
pub use tracker::{
    CatalogEntry, ConfirmationChoice, DeltaOutcome, IncreaseOutcome, LedgerStatus, RatingTracker,
    ResetChallenge, SelfPromotionOutcome, TrackerConfig, DEFAULT_RESET_TTL_SECS, MAX_HISTORY_LIMIT,
};

pub const RATING_MIN: i64 = -500;
pub const RATING_MAX: i64 = 500;
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RatingError {
    #[error("achievement already granted: {name}")]
    AlreadyGranted { name: String },
    #[error("invalid impact value: {0:?} is not an integer")]
    InvalidImpactValue(String),
    #[error("achievement name already exists: {0}")]
    DuplicateDefinitionName(String),
    #[error("unknown achievement definition: {0}")]
    UnknownDefinition(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("not permitted: {0}")]
    NotPermitted(String),
    #[error("confirmation error: {0}")]
    Confirmation(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("rating {0} is outside the level table")]
    OutOfRange(i64),
}

impl RatingError {
    /// Stable machine-readable code, used in CLI error envelopes.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyGranted { .. } => "rating.already_granted",
            Self::InvalidImpactValue(_) => "rating.invalid_impact_value",
            Self::DuplicateDefinitionName(_) => "rating.duplicate_definition_name",
            Self::UnknownDefinition(_) => "rating.unknown_definition",
            Self::StoreUnavailable(_) => "rating.store_unavailable",
            Self::NotPermitted(_) => "rating.not_permitted",
            Self::Confirmation(_) => "rating.confirmation",
            Self::Validation(_) => "rating.validation",
            Self::Configuration(_) => "rating.configuration",
            Self::OutOfRange(_) => "rating.out_of_range",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ActorId(pub i64);

impl Display for ActorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The person behind an action. The display name is denormalized into
/// every history entry at write time.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Actor {
    pub id: ActorId,
    pub display_name: String,
}

impl Actor {
    #[must_use]
    pub fn new(id: i64, display_name: impl Into<String>) -> Self {
        Self {
            id: ActorId(id),
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionOrigin {
    Standard,
    Custom,
}

impl DefinitionOrigin {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Custom => "custom",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "standard" => Some(Self::Standard),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

/// Unlock condition of an achievement definition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ConditionKind {
    FirstChangeRecorded,
    MinRatingReached(i64),
    MaxRatingReached(i64),
    ExactRatingReached(i64),
    HistoryCountReached(u64),
    /// Fired only through the dedicated self-promotion trigger.
    SelfPromotionAttempted,
    /// Custom definitions; granted only by an administrator.
    Manual,
}

impl ConditionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FirstChangeRecorded => "first_change_recorded",
            Self::MinRatingReached(_) => "min_rating_reached",
            Self::MaxRatingReached(_) => "max_rating_reached",
            Self::ExactRatingReached(_) => "exact_rating_reached",
            Self::HistoryCountReached(_) => "history_count_reached",
            Self::SelfPromotionAttempted => "self_promotion_attempted",
            Self::Manual => "manual",
        }
    }

    /// Numeric parameter of the condition, if it carries one.
    #[must_use]
    pub fn parameter(self) -> Option<i64> {
        match self {
            Self::MinRatingReached(value)
            | Self::MaxRatingReached(value)
            | Self::ExactRatingReached(value) => Some(value),
            Self::HistoryCountReached(count) => Some(i64::try_from(count).unwrap_or(i64::MAX)),
            Self::FirstChangeRecorded | Self::SelfPromotionAttempted | Self::Manual => None,
        }
    }

    /// Rebuilds a condition from its stored `(kind, parameter)` pair.
    #[must_use]
    pub fn from_parts(kind: &str, parameter: Option<i64>) -> Option<Self> {
        match (kind, parameter) {
            ("first_change_recorded", None) => Some(Self::FirstChangeRecorded),
            ("min_rating_reached", Some(value)) => Some(Self::MinRatingReached(value)),
            ("max_rating_reached", Some(value)) => Some(Self::MaxRatingReached(value)),
            ("exact_rating_reached", Some(value)) => Some(Self::ExactRatingReached(value)),
            ("history_count_reached", Some(value)) => {
                u64::try_from(value).ok().map(Self::HistoryCountReached)
            }
            ("self_promotion_attempted", None) => Some(Self::SelfPromotionAttempted),
            ("manual", None) => Some(Self::Manual),
            _ => None,
        }
    }

    /// Whether generic evaluation may ever fire this condition.
    #[must_use]
    pub fn is_automatic(self) -> bool {
        !matches!(self, Self::SelfPromotionAttempted | Self::Manual)
    }

    #[must_use]
    pub fn is_satisfied(self, snapshot: RatingSnapshot) -> bool {
        match self {
            Self::FirstChangeRecorded => snapshot.history_count >= 1,
            Self::MinRatingReached(threshold) => snapshot.rating >= threshold,
            Self::MaxRatingReached(threshold) => snapshot.rating <= threshold,
            Self::ExactRatingReached(value) => snapshot.rating == value,
            Self::HistoryCountReached(count) => snapshot.history_count >= count,
            Self::SelfPromotionAttempted | Self::Manual => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AchievementDefinition {
    pub definition_id: Option<Ulid>,
    pub name: String,
    pub description: String,
    pub condition: ConditionKind,
    pub rating_impact: i64,
    pub origin: DefinitionOrigin,
    pub created_by: Option<ActorId>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
}

impl AchievementDefinition {
    #[must_use]
    pub fn standard(
        name: impl Into<String>,
        description: impl Into<String>,
        condition: ConditionKind,
        rating_impact: i64,
    ) -> Self {
        Self {
            definition_id: None,
            name: name.into(),
            description: description.into(),
            condition,
            rating_impact,
            origin: DefinitionOrigin::Standard,
            created_by: None,
            created_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct GrantedAchievement {
    pub definition_name: String,
    pub origin: DefinitionOrigin,
    pub rating_impact: i64,
    pub granted_by: ActorId,
    #[serde(with = "time::serde::rfc3339")]
    pub granted_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoryEntry {
    pub entry_seq: i64,
    pub entry_id: Ulid,
    pub actor_id: ActorId,
    pub actor_display_name: String,
    pub delta_amount: i64,
    pub resulting_rating: i64,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

/// A history entry before the store has assigned its sequence number.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoryEntryInput {
    pub entry_id: Ulid,
    pub actor_id: ActorId,
    pub actor_display_name: String,
    pub delta_amount: i64,
    pub resulting_rating: i64,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl HistoryEntryInput {
    /// Checks the entry before append.
    ///
    /// # Errors
    /// Returns [`RatingError::Validation`] when the resulting rating is outside
    /// the clamp range or the timestamp is not UTC.
    pub fn validate(&self) -> Result<(), RatingError> {
        if !(RATING_MIN..=RATING_MAX).contains(&self.resulting_rating) {
            return Err(RatingError::Validation(format!(
                "resulting_rating {} MUST be in [{RATING_MIN}, {RATING_MAX}]",
                self.resulting_rating
            )));
        }

        if self.reason.trim().is_empty() {
            return Err(RatingError::Validation(
                "reason MUST be provided for every change".to_string(),
            ));
        }

        if self.recorded_at.offset() != UtcOffset::UTC {
            return Err(RatingError::Validation(
                "recorded_at MUST be UTC (offset Z)".to_string(),
            ));
        }

        Ok(())
    }

    #[must_use]
    pub fn into_entry(self, entry_seq: i64) -> HistoryEntry {
        HistoryEntry {
            entry_seq,
            entry_id: self.entry_id,
            actor_id: self.actor_id,
            actor_display_name: self.actor_display_name,
            delta_amount: self.delta_amount,
            resulting_rating: self.resulting_rating,
            reason: self.reason,
            recorded_at: self.recorded_at,
        }
    }
}

/// The `(rating, history_count)` pair conditions are evaluated against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct RatingSnapshot {
    pub rating: i64,
    pub history_count: u64,
}

/// Everything the engine needs to read before computing a cascade.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct LedgerState {
    pub rating: i64,
    pub history_count: u64,
    pub granted: BTreeSet<String>,
}

/// The writes produced by one user action, committed atomically.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct CommitBatch {
    /// History length the batch was computed from. Stores refuse the batch
    /// when their history has moved since.
    pub base_history_count: u64,
    pub entries: Vec<HistoryEntryInput>,
    pub grants: Vec<GrantedAchievement>,
    pub final_rating: i64,
}

impl CommitBatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.grants.is_empty()
    }

    /// Checks internal consistency before a store applies the batch.
    ///
    /// # Errors
    /// Returns [`RatingError::Validation`] for out-of-range ratings, entries
    /// that fail validation, or a definition granted twice in one batch.
    pub fn validate(&self) -> Result<(), RatingError> {
        if !(RATING_MIN..=RATING_MAX).contains(&self.final_rating) {
            return Err(RatingError::Validation(format!(
                "final_rating {} MUST be in [{RATING_MIN}, {RATING_MAX}]",
                self.final_rating
            )));
        }

        for entry in &self.entries {
            entry.validate()?;
        }

        if let Some(last) = self.entries.last() {
            if last.resulting_rating != self.final_rating {
                return Err(RatingError::Validation(
                    "final_rating MUST match the last entry's resulting_rating".to_string(),
                ));
            }
        }

        let mut names = BTreeSet::new();
        for grant in &self.grants {
            if !names.insert(grant.definition_name.as_str()) {
                return Err(RatingError::AlreadyGranted {
                    name: grant.definition_name.clone(),
                });
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationAction {
    Reset,
}

impl ConfirmationAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reset => "reset",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "reset" => Some(Self::Reset),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PendingConfirmation {
    pub token: Ulid,
    pub action: ConfirmationAction,
    pub requested_by: ActorId,
    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

#[must_use]
pub fn clamp_rating(value: i64) -> i64 {
    value.clamp(RATING_MIN, RATING_MAX)
}

/// `clamp(current + amount)`, saturating so any `i64` amount is accepted.
#[must_use]
pub fn apply_clamped(current: i64, amount: i64) -> i64 {
    clamp_rating(current.saturating_add(amount))
}

/// Parses an administrator-supplied impact value.
///
/// # Errors
/// Returns [`RatingError::InvalidImpactValue`] when the input is not an integer.
pub fn parse_impact(raw: &str) -> Result<i64, RatingError> {
    let trimmed = raw.trim();
    let unsigned = trimmed.strip_prefix('+').unwrap_or(trimmed);
    unsigned
        .parse::<i64>()
        .map_err(|_| RatingError::InvalidImpactValue(raw.to_string()))
}

/// Collision key for definition names: trimmed, case-folded.
#[must_use]
pub fn definition_name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`RatingError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, RatingError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| RatingError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(RatingError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`RatingError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, RatingError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| RatingError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn snapshot(rating: i64, history_count: u64) -> RatingSnapshot {
        RatingSnapshot {
            rating,
            history_count,
        }
    }

    #[test]
    fn clamp_saturates_at_both_bounds() {
        assert_eq!(apply_clamped(0, 1000), 500);
        assert_eq!(apply_clamped(0, -1000), -500);
        assert_eq!(apply_clamped(499, 1), 500);
        assert_eq!(apply_clamped(500, i64::MAX), 500);
        assert_eq!(apply_clamped(-500, i64::MIN), -500);
    }

    #[test]
    fn condition_predicates_follow_snapshot() {
        assert!(!ConditionKind::FirstChangeRecorded.is_satisfied(snapshot(0, 0)));
        assert!(ConditionKind::FirstChangeRecorded.is_satisfied(snapshot(0, 1)));
        assert!(ConditionKind::MinRatingReached(10).is_satisfied(snapshot(10, 3)));
        assert!(!ConditionKind::MinRatingReached(10).is_satisfied(snapshot(9, 3)));
        assert!(ConditionKind::MaxRatingReached(-10).is_satisfied(snapshot(-11, 3)));
        assert!(!ConditionKind::MaxRatingReached(-10).is_satisfied(snapshot(-9, 3)));
        assert!(ConditionKind::ExactRatingReached(77).is_satisfied(snapshot(77, 3)));
        assert!(!ConditionKind::ExactRatingReached(77).is_satisfied(snapshot(78, 3)));
        assert!(ConditionKind::HistoryCountReached(10).is_satisfied(snapshot(0, 10)));
        assert!(!ConditionKind::SelfPromotionAttempted.is_satisfied(snapshot(500, 500)));
        assert!(!ConditionKind::Manual.is_satisfied(snapshot(500, 500)));
    }

    #[test]
    fn condition_parts_round_trip_through_storage_columns() {
        for condition in [
            ConditionKind::FirstChangeRecorded,
            ConditionKind::MinRatingReached(50),
            ConditionKind::MaxRatingReached(-20),
            ConditionKind::ExactRatingReached(77),
            ConditionKind::HistoryCountReached(10),
            ConditionKind::SelfPromotionAttempted,
            ConditionKind::Manual,
        ] {
            assert_eq!(
                ConditionKind::from_parts(condition.as_str(), condition.parameter()),
                Some(condition)
            );
        }
        assert_eq!(ConditionKind::from_parts("min_rating_reached", None), None);
        assert_eq!(ConditionKind::from_parts("history_count_reached", Some(-1)), None);
    }

    #[test]
    fn parse_impact_accepts_signed_integers_only() {
        assert_eq!(must_ok(parse_impact("15")), 15);
        assert_eq!(must_ok(parse_impact(" -7 ")), -7);
        assert_eq!(must_ok(parse_impact("+3")), 3);
        assert_eq!(
            parse_impact("ten"),
            Err(RatingError::InvalidImpactValue("ten".to_string()))
        );
        assert!(parse_impact("1.5").is_err());
        assert!(parse_impact("").is_err());
    }

    #[test]
    fn batch_validation_rejects_double_grant_in_one_batch() {
        let granted_at = must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z"));
        let grant = GrantedAchievement {
            definition_name: "Newcomer".to_string(),
            origin: DefinitionOrigin::Standard,
            rating_impact: 10,
            granted_by: ActorId(1),
            granted_at,
        };
        let batch = CommitBatch {
            grants: vec![grant.clone(), grant],
            ..CommitBatch::default()
        };
        assert!(matches!(
            batch.validate(),
            Err(RatingError::AlreadyGranted { .. })
        ));
    }

    #[test]
    fn entry_validation_requires_utc_and_range() {
        let recorded_at = must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z"));
        let mut entry = HistoryEntryInput {
            entry_id: Ulid::new(),
            actor_id: ActorId(7),
            actor_display_name: String::new(),
            delta_amount: 1,
            resulting_rating: 501,
            reason: "manual increase".to_string(),
            recorded_at,
        };
        assert!(entry.validate().is_err());
        entry.resulting_rating = 1;
        assert!(entry.validate().is_ok());
        entry.recorded_at = recorded_at.to_offset(must_ok(UtcOffset::from_hms(2, 0, 0)));
        assert!(entry.validate().is_err());
    }

    #[test]
    fn parse_rfc3339_rejects_non_utc_offsets() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
        let parsed = must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z"));
        assert_eq!(must_ok(format_rfc3339(parsed)), "2026-02-07T12:00:00Z");
    }
}
