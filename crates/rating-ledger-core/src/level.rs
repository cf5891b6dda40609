use serde::{Deserialize, Serialize};

use crate::{RatingError, RATING_MAX, RATING_MIN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelTier {
    pub name: &'static str,
    pub min: i64,
    pub max: i64,
}

/// Ordered, contiguous tiers covering the whole clamp range.
pub const LEVEL_TIERS: &[LevelTier] = &[
    LevelTier {
        name: "Outcast",
        min: -500,
        max: -201,
    },
    LevelTier {
        name: "Disgraced",
        min: -200,
        max: -51,
    },
    LevelTier {
        name: "Doubted",
        min: -50,
        max: -1,
    },
    LevelTier {
        name: "Newcomer",
        min: 0,
        max: 49,
    },
    LevelTier {
        name: "Respected",
        min: 50,
        max: 149,
    },
    LevelTier {
        name: "Trusted",
        min: 150,
        max: 299,
    },
    LevelTier {
        name: "Legend",
        min: 300,
        max: 500,
    },
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Level {
    pub name: String,
    pub range_min: i64,
    pub range_max: i64,
    pub progress_percent: u8,
}

/// Maps a rating to its tier and the progress made inside that tier.
///
/// # Errors
/// Returns [`RatingError::OutOfRange`] when no tier covers `rating`. With a
/// clamped rating this indicates a broken tier table.
pub fn level_for(rating: i64) -> Result<Level, RatingError> {
    let tier = LEVEL_TIERS
        .iter()
        .find(|tier| (tier.min..=tier.max).contains(&rating))
        .ok_or(RatingError::OutOfRange(rating))?;

    let progress = if tier.max == tier.min {
        100
    } else {
        100 * (rating - tier.min) / (tier.max - tier.min)
    };

    Ok(Level {
        name: tier.name.to_string(),
        range_min: tier.min,
        range_max: tier.max,
        progress_percent: u8::try_from(progress.clamp(0, 100)).unwrap_or(100),
    })
}

/// Checks that [`LEVEL_TIERS`] is ordered, gap-free and spans the clamp range.
///
/// # Errors
/// Returns [`RatingError::Configuration`] describing the first violation.
pub fn validate_level_table() -> Result<(), RatingError> {
    let mut expected_min = RATING_MIN;
    for tier in LEVEL_TIERS {
        if tier.min != expected_min {
            return Err(RatingError::Configuration(format!(
                "tier {} starts at {} but {expected_min} was expected",
                tier.name, tier.min
            )));
        }
        if tier.max < tier.min {
            return Err(RatingError::Configuration(format!(
                "tier {} has max below min",
                tier.name
            )));
        }
        expected_min = tier.max + 1;
    }

    if expected_min != RATING_MAX + 1 {
        return Err(RatingError::Configuration(format!(
            "tiers end at {} instead of {RATING_MAX}",
            expected_min - 1
        )));
    }

    Ok(())
}

#[must_use]
pub fn progress_bar(percent: u8, width: usize) -> String {
    let percent = usize::from(percent.min(100));
    let filled = width * percent / 100;
    let mut bar = String::with_capacity(width * 3);
    bar.push_str(&"▓".repeat(filled));
    bar.push_str(&"░".repeat(width - filled));
    bar
}
