//! Platform-neutral rendering of user actions.
//!
//! Every action maps to one tracker call and one [`Reply`]. A chat adapter
//! renders `text` as a message and `choices` as inline buttons whose
//! `callback` strings round-trip through [`Action::parse_callback`].

use std::fmt::Write as _;

use rating_ledger_core::{
    format_rfc3339, progress_bar, Actor, GrantedAchievement, HistoryEntry, IncreaseOutcome,
    RatingError, RatingStore, RatingTracker,
};
use ulid::Ulid;

const PROGRESS_BAR_WIDTH: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Increase,
    Decrease,
    Adjust { amount: i64, reason: String },
    ShowRating,
    ShowAchievements,
    ShowCatalog,
    ShowHistory { limit: Option<usize> },
    Evaluate,
    CreateAchievement {
        name: String,
        description: String,
        raw_impact: String,
    },
    GrantAchievement { definition_id: Ulid },
    RequestReset,
    ConfirmReset { token: Ulid },
    CancelReset { token: Ulid },
    Status,
}

impl Action {
    /// Parses the callback payload attached to a [`Choice`].
    #[must_use]
    pub fn parse_callback(raw: &str) -> Option<Self> {
        match raw.split(':').collect::<Vec<_>>().as_slice() {
            ["increase"] => Some(Self::Increase),
            ["decrease"] => Some(Self::Decrease),
            ["rating"] => Some(Self::ShowRating),
            ["achievements"] => Some(Self::ShowAchievements),
            ["catalog"] => Some(Self::ShowCatalog),
            ["history"] => Some(Self::ShowHistory { limit: None }),
            ["reset", "confirm", token] => Ulid::from_string(token)
                .ok()
                .map(|token| Self::ConfirmReset { token }),
            ["reset", "cancel", token] => Ulid::from_string(token)
                .ok()
                .map(|token| Self::CancelReset { token }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub label: String,
    pub callback: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub choices: Vec<Choice>,
}

impl Reply {
    fn text(text: String) -> Self {
        Self {
            text,
            choices: Vec::new(),
        }
    }
}

/// Main menu buttons shown under rating replies.
#[must_use]
pub fn main_menu() -> Vec<Choice> {
    [
        ("👍 Raise", "increase"),
        ("👎 Lower", "decrease"),
        ("🏆 Achievements", "achievements"),
        ("📜 History", "history"),
    ]
    .into_iter()
    .map(|(label, callback)| Choice {
        label: label.to_string(),
        callback: callback.to_string(),
    })
    .collect()
}

#[must_use]
pub fn rating_emoji(rating: i64) -> &'static str {
    match rating {
        r if r > 0 => "🐘",
        r if r < 0 => "🐍",
        _ => "🦒",
    }
}

/// Executes `action` on behalf of `actor` and renders the result.
///
/// # Errors
/// Propagates the tracker's [`RatingError`] unchanged.
pub fn handle<S: RatingStore>(
    tracker: &RatingTracker<S>,
    actor: &Actor,
    action: Action,
) -> Result<Reply, RatingError> {
    match action {
        Action::Increase => match tracker.increase(actor)? {
            IncreaseOutcome::Applied(outcome) => {
                let mut text = format!(
                    "{} raised the rating. Rating: {} {}",
                    display_name(actor),
                    outcome.rating,
                    rating_emoji(outcome.rating)
                );
                push_grants(&mut text, &outcome.new_grants);
                Ok(Reply {
                    text,
                    choices: main_menu(),
                })
            }
            IncreaseOutcome::RejectedSelfPromotion(outcome) => {
                let mut text = "🤡 You cannot raise your own rating!".to_string();
                push_grants(&mut text, &outcome.new_grants);
                Ok(Reply::text(text))
            }
        },
        Action::Decrease => {
            let outcome = tracker.decrease(actor)?;
            let verb = if tracker.is_target(actor.id) {
                "lowered their own rating"
            } else {
                "lowered the rating"
            };
            let mut text = format!(
                "{} {verb}. Rating: {} {}",
                display_name(actor),
                outcome.rating,
                rating_emoji(outcome.rating)
            );
            push_grants(&mut text, &outcome.new_grants);
            Ok(Reply {
                text,
                choices: main_menu(),
            })
        }
        Action::Adjust { amount, reason } => {
            let outcome = tracker.adjust(actor, amount, &reason)?;
            let mut text = format!(
                "Rating adjusted by {amount:+}. Rating: {} {}",
                outcome.rating,
                rating_emoji(outcome.rating)
            );
            push_grants(&mut text, &outcome.new_grants);
            Ok(Reply::text(text))
        }
        Action::ShowRating => {
            let rating = tracker.current_rating()?;
            let level = rating_ledger_core::level_for(rating)?;
            Ok(Reply {
                text: format!(
                    "Rating: {rating} {}\nLevel: {} ({}..{})\n{} {}%",
                    rating_emoji(rating),
                    level.name,
                    level.range_min,
                    level.range_max,
                    progress_bar(level.progress_percent, PROGRESS_BAR_WIDTH),
                    level.progress_percent
                ),
                choices: main_menu(),
            })
        }
        Action::ShowAchievements => {
            let entries = tracker.list_catalog()?;
            let granted: Vec<_> = entries
                .iter()
                .filter(|entry| entry.grant.is_some())
                .collect();
            if granted.is_empty() {
                return Ok(Reply::text("No achievements yet.".to_string()));
            }

            let mut text = "🏆 Achievements:".to_string();
            for entry in granted {
                let _ = write!(
                    text,
                    "\n• {} ({:+}): {}",
                    entry.definition.name,
                    entry.definition.rating_impact,
                    entry.definition.description
                );
            }
            Ok(Reply::text(text))
        }
        Action::ShowCatalog => {
            let mut text = "📖 Catalog:".to_string();
            for entry in tracker.list_catalog()? {
                let marker = if entry.grant.is_some() { "✅" } else { "⬜" };
                let _ = write!(
                    text,
                    "\n{marker} {} ({:+}) [{}]: {}",
                    entry.definition.name,
                    entry.definition.rating_impact,
                    entry.definition.origin.as_str(),
                    entry.definition.description
                );
            }
            Ok(Reply::text(text))
        }
        Action::ShowHistory { limit } => {
            let history = tracker.history(limit)?;
            if history.is_empty() {
                return Ok(Reply::text("History is empty.".to_string()));
            }
            let mut text = "📜 Recent changes:".to_string();
            for entry in &history {
                text.push('\n');
                text.push_str(&history_line(entry));
            }
            Ok(Reply::text(text))
        }
        Action::Evaluate => {
            let grants = tracker.evaluate(actor)?;
            let mut text = if grants.is_empty() {
                "No new achievements.".to_string()
            } else {
                format!("Evaluation granted {} achievement(s).", grants.len())
            };
            push_grants(&mut text, &grants);
            Ok(Reply::text(text))
        }
        Action::CreateAchievement {
            name,
            description,
            raw_impact,
        } => {
            let definition = tracker.create_custom(actor, &name, &description, &raw_impact)?;
            let id = definition
                .definition_id
                .map(|id| id.to_string())
                .unwrap_or_default();
            Ok(Reply::text(format!(
                "Achievement {} created ({:+}). Id: {id}",
                definition.name, definition.rating_impact
            )))
        }
        Action::GrantAchievement { definition_id } => {
            let outcome = tracker.grant_custom(definition_id, actor)?;
            let mut text = format!(
                "Rating: {} {}",
                outcome.rating,
                rating_emoji(outcome.rating)
            );
            push_grants(&mut text, &outcome.new_grants);
            Ok(Reply::text(text))
        }
        Action::RequestReset => {
            let challenge = tracker.request_reset(actor)?;
            let expires_at = format_rfc3339(challenge.expires_at)?;
            Ok(Reply {
                text: format!(
                    "Reset the rating to 0 and erase all history and achievements? \
                     This cannot be undone. The request expires at {expires_at}."
                ),
                choices: vec![
                    Choice {
                        label: "✅ Confirm".to_string(),
                        callback: format!("reset:confirm:{}", challenge.token),
                    },
                    Choice {
                        label: "❌ Cancel".to_string(),
                        callback: format!("reset:cancel:{}", challenge.token),
                    },
                ],
            })
        }
        Action::ConfirmReset { token } => {
            tracker.confirm_reset(actor, token)?;
            Ok(Reply::text("Rating reset to 0. 🦒".to_string()))
        }
        Action::CancelReset { token } => {
            tracker.cancel_reset(actor, token)?;
            Ok(Reply::text("Reset cancelled.".to_string()))
        }
        Action::Status => {
            let status = tracker.status()?;
            let admin = status
                .admin_id
                .map_or_else(|| "anyone but the target".to_string(), |id| id.to_string());
            Ok(Reply::text(format!(
                "Target: {}\nAdministrator: {admin}\nRating: {} {}\nLevel: {}\nHistory entries: {}\nAchievements: {} granted, {} standard, {} custom",
                status.target_id,
                status.rating,
                rating_emoji(status.rating),
                status.level.name,
                status.history_count,
                status.granted_count,
                status.standard_definitions,
                status.custom_definitions
            )))
        }
    }
}

fn display_name(actor: &Actor) -> String {
    if actor.display_name.trim().is_empty() {
        format!("user {}", actor.id)
    } else {
        actor.display_name.clone()
    }
}

fn history_line(entry: &HistoryEntry) -> String {
    let who = if entry.actor_display_name.trim().is_empty() {
        format!("user {}", entry.actor_id)
    } else {
        entry.actor_display_name.clone()
    };
    let at = format_rfc3339(entry.recorded_at).unwrap_or_default();
    format!(
        "{at} {who}: {:+} → {} ({})",
        entry.delta_amount, entry.resulting_rating, entry.reason
    )
}

fn push_grants(text: &mut String, grants: &[GrantedAchievement]) {
    for grant in grants {
        let _ = write!(
            text,
            "\n🏆 Achievement unlocked: {} ({:+})",
            grant.definition_name, grant.rating_impact
        );
    }
}
