use std::collections::BTreeSet;

use crate::{definition_name_key, AchievementDefinition, ConditionKind, DefinitionOrigin, RatingError};

pub const DEFAULT_SELF_PROMOTION_PENALTY: i64 = -10;

/// Ordered, immutable list of standard achievement definitions.
///
/// Evaluation walks the definitions in this order, so the order is
/// deterministic but carries no further meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    definitions: Vec<AchievementDefinition>,
}

impl Catalog {
    /// Builds a catalog from explicit definitions.
    ///
    /// # Errors
    /// Returns [`RatingError::Configuration`] when a name is blank, a
    /// definition is not standard, or more than one self-promotion penalty is
    /// defined, and [`RatingError::DuplicateDefinitionName`] on name collisions.
    pub fn new(definitions: Vec<AchievementDefinition>) -> Result<Self, RatingError> {
        let mut names = BTreeSet::new();
        let mut self_promotion = 0_usize;

        for definition in &definitions {
            if definition.name.trim().is_empty() {
                return Err(RatingError::Configuration(
                    "achievement name MUST NOT be empty".to_string(),
                ));
            }
            if definition.origin != DefinitionOrigin::Standard {
                return Err(RatingError::Configuration(format!(
                    "catalog definition {} MUST have standard origin",
                    definition.name
                )));
            }
            if matches!(definition.condition, ConditionKind::Manual) {
                return Err(RatingError::Configuration(format!(
                    "catalog definition {} cannot use the manual condition",
                    definition.name
                )));
            }
            if matches!(definition.condition, ConditionKind::SelfPromotionAttempted) {
                self_promotion += 1;
            }
            if !names.insert(definition_name_key(&definition.name)) {
                return Err(RatingError::DuplicateDefinitionName(
                    definition.name.clone(),
                ));
            }
        }

        if self_promotion > 1 {
            return Err(RatingError::Configuration(
                "at most one self-promotion definition is allowed".to_string(),
            ));
        }

        Ok(Self { definitions })
    }

    /// The stock catalog. Only the self-promotion penalty is configurable.
    #[must_use]
    pub fn standard(self_promotion_penalty: i64) -> Self {
        Self {
            definitions: vec![
                AchievementDefinition::standard(
                    "First Step",
                    "Receive the first rating change",
                    ConditionKind::FirstChangeRecorded,
                    5,
                ),
                AchievementDefinition::standard(
                    "Newcomer",
                    "Reach a rating of 10",
                    ConditionKind::MinRatingReached(10),
                    10,
                ),
                AchievementDefinition::standard(
                    "Master",
                    "Reach a rating of 50",
                    ConditionKind::MinRatingReached(50),
                    20,
                ),
                AchievementDefinition::standard(
                    "Fall",
                    "Drop to a rating of -10",
                    ConditionKind::MaxRatingReached(-10),
                    -5,
                ),
                AchievementDefinition::standard(
                    "Clown",
                    "Try to raise your own rating",
                    ConditionKind::SelfPromotionAttempted,
                    self_promotion_penalty,
                ),
                AchievementDefinition::standard(
                    "Chat Star",
                    "Collect 10 rating changes",
                    ConditionKind::HistoryCountReached(10),
                    15,
                ),
                AchievementDefinition::standard(
                    "Unpopular",
                    "Drop to a rating of -20",
                    ConditionKind::MaxRatingReached(-20),
                    -10,
                ),
                AchievementDefinition::standard(
                    "Lucky Sevens",
                    "Land exactly on a rating of 77",
                    ConditionKind::ExactRatingReached(77),
                    7,
                ),
            ],
        }
    }

    /// Replaces the impact of the self-promotion definition, if the catalog
    /// has one.
    #[must_use]
    pub fn with_self_promotion_penalty(mut self, penalty: i64) -> Self {
        for definition in &mut self.definitions {
            if matches!(definition.condition, ConditionKind::SelfPromotionAttempted) {
                definition.rating_impact = penalty;
            }
        }
        self
    }

    #[must_use]
    pub fn definitions(&self) -> &[AchievementDefinition] {
        &self.definitions
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AchievementDefinition> {
        let key = definition_name_key(name);
        self.definitions
            .iter()
            .find(|definition| definition_name_key(&definition.name) == key)
    }

    #[must_use]
    pub fn contains_name(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    #[must_use]
    pub fn self_promotion(&self) -> Option<&AchievementDefinition> {
        self.definitions
            .iter()
            .find(|definition| matches!(definition.condition, ConditionKind::SelfPromotionAttempted))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::standard(DEFAULT_SELF_PROMOTION_PENALTY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_catalog_passes_validation() {
        let catalog = Catalog::standard(-25);
        let rebuilt = Catalog::new(catalog.definitions().to_vec());
        assert_eq!(rebuilt.as_ref().map(Catalog::len), Ok(8));
        assert_eq!(catalog.self_promotion().map(|item| item.rating_impact), Some(-25));
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let catalog = Catalog::default();
        assert!(catalog.contains_name("  newcomer "));
        assert!(!catalog.contains_name("Grandmaster"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let result = Catalog::new(vec![
            AchievementDefinition::standard("Star", "a", ConditionKind::MinRatingReached(5), 1),
            AchievementDefinition::standard("STAR", "b", ConditionKind::MinRatingReached(6), 1),
        ]);
        assert_eq!(
            result,
            Err(RatingError::DuplicateDefinitionName("STAR".to_string()))
        );
    }

    #[test]
    fn manual_conditions_do_not_belong_in_the_catalog() {
        let result = Catalog::new(vec![AchievementDefinition::standard(
            "Hand Picked",
            "granted by hand",
            ConditionKind::Manual,
            3,
        )]);
        assert!(matches!(result, Err(RatingError::Configuration(_))));
    }

    #[test]
    fn only_one_self_promotion_penalty_is_allowed() {
        let result = Catalog::new(vec![
            AchievementDefinition::standard("A", "a", ConditionKind::SelfPromotionAttempted, -1),
            AchievementDefinition::standard("B", "b", ConditionKind::SelfPromotionAttempted, -2),
        ]);
        assert!(matches!(result, Err(RatingError::Configuration(_))));
    }
}
