//! Command surface for the rating ledger.
//!
//! Hosts embed the ledger through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_rating_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_rating`] for execution against an existing [`RatingTracker`].
//!
//! Text output goes through [`interaction`]; `--json` output is a versioned
//! payload validated by `contracts/v1/schemas`.

pub mod interaction;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use rating_ledger_core::{
    level_for, Actor, ActorId, CatalogEntry, Catalog, DeltaOutcome, GrantedAchievement,
    HistoryEntry, IncreaseOutcome, Level, RatingError, RatingStore, RatingTracker,
    TrackerConfig, DEFAULT_HISTORY_LIMIT, DEFAULT_RESET_TTL_SECS, DEFAULT_SELF_PROMOTION_PENALTY,
};
use rating_ledger_store_sqlite::SqliteRatingStore;
use serde::Serialize;
use tracing::debug;
use ulid::Ulid;

use crate::interaction::{rating_emoji, Action, Reply};

#[derive(Debug, Parser)]
#[command(name = "rl")]
#[command(about = "Rating ledger: one target, one clamped rating, one-shot achievements")]
pub struct Cli {
    #[arg(long, env = "RATING_DB", default_value = "./rating_ledger.sqlite3")]
    db: PathBuf,

    #[command(flatten)]
    config: ConfigArgs,

    /// Id of the user performing the action.
    #[arg(long, env = "RATING_ACTOR_ID", allow_hyphen_values = true)]
    actor: Option<i64>,

    /// Display name recorded in history; may be empty.
    #[arg(long, default_value = "")]
    actor_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[arg(long, env = "TARGET_USER_ID", allow_hyphen_values = true)]
    target_id: i64,
    #[arg(long, env = "ADMIN_USER_ID", allow_hyphen_values = true)]
    admin_id: Option<i64>,
    #[arg(
        long,
        env = "SELF_PROMOTION_PENALTY",
        default_value_t = DEFAULT_SELF_PROMOTION_PENALTY,
        allow_hyphen_values = true
    )]
    self_promotion_penalty: i64,
    #[arg(long, env = "HISTORY_LIMIT", default_value_t = DEFAULT_HISTORY_LIMIT)]
    history_limit: usize,
    #[arg(long, env = "RESET_TTL_SECS", default_value_t = DEFAULT_RESET_TTL_SECS)]
    reset_ttl_secs: i64,
}

impl ConfigArgs {
    #[must_use]
    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            target_id: ActorId(self.target_id),
            admin_id: self.admin_id.map(ActorId),
            self_promotion_penalty: self.self_promotion_penalty,
            history_limit: self.history_limit,
            reset_confirmation_ttl_secs: self.reset_ttl_secs,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Rating {
        #[command(subcommand)]
        command: RatingCommand,
    },
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
    Achievements {
        #[command(subcommand)]
        command: AchievementsCommand,
    },
    Level {
        #[command(subcommand)]
        command: LevelCommand,
    },
    Reset {
        #[command(subcommand)]
        command: ResetCommand,
    },
    Status(JsonArgs),
}

#[derive(Debug, Subcommand)]
pub enum RatingCommand {
    Show(JsonArgs),
    Increase(JsonArgs),
    Decrease(JsonArgs),
    /// Administrative delta of any size.
    Adjust(AdjustArgs),
}

#[derive(Debug, Subcommand)]
pub enum HistoryCommand {
    List(HistoryListArgs),
}

#[derive(Debug, Subcommand)]
pub enum AchievementsCommand {
    /// Granted achievements.
    List(JsonArgs),
    /// Every definition with its grant, if any.
    Catalog(JsonArgs),
    Evaluate(JsonArgs),
    Create(CreateArgs),
    Grant(GrantArgs),
}

#[derive(Debug, Subcommand)]
pub enum LevelCommand {
    Show(LevelShowArgs),
}

#[derive(Debug, Subcommand)]
pub enum ResetCommand {
    Request(JsonArgs),
    Confirm(TokenArgs),
    Cancel(TokenArgs),
}

#[derive(Debug, Args)]
pub struct JsonArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct AdjustArgs {
    #[arg(long, allow_hyphen_values = true)]
    amount: i64,
    #[arg(long, default_value = "manual adjustment")]
    reason: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct HistoryListArgs {
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "")]
    description: String,
    /// Signed integer, e.g. `15` or `-5`.
    #[arg(long, allow_hyphen_values = true)]
    impact: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct GrantArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct LevelShowArgs {
    #[arg(long, allow_hyphen_values = true)]
    rating: Option<i64>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct TokenArgs {
    #[arg(long)]
    token: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct Envelope<T: Serialize> {
    contract_version: &'static str,
    #[serde(flatten)]
    payload: T,
}

#[derive(Debug, Serialize)]
struct RatingView {
    rating: i64,
    emoji: &'static str,
    level: Level,
}

#[derive(Debug, Serialize)]
struct HistoryView {
    entries: Vec<HistoryEntry>,
}

#[derive(Debug, Serialize)]
struct GrantedView {
    granted: Vec<GrantedAchievement>,
}

#[derive(Debug, Serialize)]
struct CatalogView {
    entries: Vec<CatalogEntry>,
}

#[derive(Debug, Serialize)]
struct EvaluationView {
    new_grants: Vec<GrantedAchievement>,
    rating: i64,
}

#[derive(Debug, Serialize)]
struct LevelView {
    rating: i64,
    level: Level,
}

#[derive(Debug, Serialize)]
struct ResetResultView {
    result: &'static str,
    token: Ulid,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the store cannot be opened or initialized, or the
/// command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let actor = cli.actor.map(|id| Actor::new(id, cli.actor_name.clone()));
    run_rating_with_db(&cli.db, cli.config.tracker_config(), actor, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when configuration is invalid, store open/initialize
/// fails, or the requested command fails.
pub fn run_rating_with_db(
    db_path: &Path,
    config: TrackerConfig,
    actor: Option<Actor>,
    command: Command,
) -> Result<()> {
    let store = SqliteRatingStore::open(db_path)?;
    let catalog = Catalog::standard(config.self_promotion_penalty);
    let tracker = RatingTracker::new(store, catalog, config)
        .map_err(domain_error)
        .with_context(|| format!("failed to initialize rating ledger at {}", db_path.display()))?;
    run_rating(command, &tracker, actor.as_ref())
}

/// Executes a parsed command against an existing tracker.
///
/// # Errors
/// Returns an error when a required actor is missing or the tracker rejects
/// the operation. Domain errors carry their stable code as a prefix.
pub fn run_rating<S: RatingStore>(
    command: Command,
    tracker: &RatingTracker<S>,
    actor: Option<&Actor>,
) -> Result<()> {
    debug!(?command, "dispatching command");
    match command {
        Command::Rating { command } => run_rating_command(command, tracker, actor),
        Command::History { command } => match command {
            HistoryCommand::List(args) => {
                let limit = args.limit.or(Some(tracker.config().history_limit));
                if args.json {
                    let entries = tracker.history(limit).map_err(domain_error)?;
                    print_json("history.v1", HistoryView { entries })
                } else {
                    let actor = actor.cloned().unwrap_or_else(|| Actor::new(0, ""));
                    print_reply(tracker, &actor, Action::ShowHistory { limit })
                }
            }
        },
        Command::Achievements { command } => run_achievements(command, tracker, actor),
        Command::Level { command } => match command {
            LevelCommand::Show(args) => {
                let rating = match args.rating {
                    Some(value) => value,
                    None => tracker.current_rating().map_err(domain_error)?,
                };
                let level = level_for(rating).map_err(domain_error)?;
                if args.json {
                    print_json("level.v1", LevelView { rating, level })
                } else {
                    println!(
                        "{} ({}..{}) {} {}%",
                        level.name,
                        level.range_min,
                        level.range_max,
                        rating_ledger_core::progress_bar(level.progress_percent, 10),
                        level.progress_percent
                    );
                    Ok(())
                }
            }
        },
        Command::Reset { command } => run_reset(command, tracker, actor),
        Command::Status(args) => {
            if args.json {
                print_json("status.v1", tracker.status().map_err(domain_error)?)
            } else {
                let actor = actor.cloned().unwrap_or_else(|| Actor::new(0, ""));
                print_reply(tracker, &actor, Action::Status)
            }
        }
    }
}

fn run_rating_command<S: RatingStore>(
    command: RatingCommand,
    tracker: &RatingTracker<S>,
    actor: Option<&Actor>,
) -> Result<()> {
    match command {
        RatingCommand::Show(args) => {
            if args.json {
                let rating = tracker.current_rating().map_err(domain_error)?;
                let level = level_for(rating).map_err(domain_error)?;
                print_json(
                    "rating_view.v1",
                    RatingView {
                        rating,
                        emoji: rating_emoji(rating),
                        level,
                    },
                )
            } else {
                let actor = actor.cloned().unwrap_or_else(|| Actor::new(0, ""));
                print_reply(tracker, &actor, Action::ShowRating)
            }
        }
        RatingCommand::Increase(args) => {
            let actor = require_actor(actor)?;
            if args.json {
                let outcome: IncreaseOutcome = tracker.increase(actor).map_err(domain_error)?;
                print_json("increase_outcome.v1", outcome)
            } else {
                print_reply(tracker, actor, Action::Increase)
            }
        }
        RatingCommand::Decrease(args) => {
            let actor = require_actor(actor)?;
            if args.json {
                let outcome = tracker.decrease(actor).map_err(domain_error)?;
                print_json("delta_outcome.v1", outcome)
            } else {
                print_reply(tracker, actor, Action::Decrease)
            }
        }
        RatingCommand::Adjust(args) => {
            let actor = require_actor(actor)?;
            if args.json {
                let outcome: DeltaOutcome = tracker
                    .adjust(actor, args.amount, &args.reason)
                    .map_err(domain_error)?;
                print_json("delta_outcome.v1", outcome)
            } else {
                print_reply(
                    tracker,
                    actor,
                    Action::Adjust {
                        amount: args.amount,
                        reason: args.reason,
                    },
                )
            }
        }
    }
}

fn run_achievements<S: RatingStore>(
    command: AchievementsCommand,
    tracker: &RatingTracker<S>,
    actor: Option<&Actor>,
) -> Result<()> {
    match command {
        AchievementsCommand::List(args) => {
            if args.json {
                let granted = tracker.granted().map_err(domain_error)?;
                print_json("achievements.v1", GrantedView { granted })
            } else {
                let actor = actor.cloned().unwrap_or_else(|| Actor::new(0, ""));
                print_reply(tracker, &actor, Action::ShowAchievements)
            }
        }
        AchievementsCommand::Catalog(args) => {
            if args.json {
                let entries = tracker.list_catalog().map_err(domain_error)?;
                print_json("catalog.v1", CatalogView { entries })
            } else {
                let actor = actor.cloned().unwrap_or_else(|| Actor::new(0, ""));
                print_reply(tracker, &actor, Action::ShowCatalog)
            }
        }
        AchievementsCommand::Evaluate(args) => {
            let actor = require_actor(actor)?;
            if args.json {
                let new_grants = tracker.evaluate(actor).map_err(domain_error)?;
                let rating = tracker.current_rating().map_err(domain_error)?;
                print_json("evaluation.v1", EvaluationView { new_grants, rating })
            } else {
                print_reply(tracker, actor, Action::Evaluate)
            }
        }
        AchievementsCommand::Create(args) => {
            let actor = require_actor(actor)?;
            if args.json {
                let definition = tracker
                    .create_custom(actor, &args.name, &args.description, &args.impact)
                    .map_err(domain_error)?;
                print_json("custom_definition.v1", definition)
            } else {
                print_reply(
                    tracker,
                    actor,
                    Action::CreateAchievement {
                        name: args.name,
                        description: args.description,
                        raw_impact: args.impact,
                    },
                )
            }
        }
        AchievementsCommand::Grant(args) => {
            let actor = require_actor(actor)?;
            let definition_id = parse_ulid(&args.id, "--id")?;
            if args.json {
                let outcome = tracker
                    .grant_custom(definition_id, actor)
                    .map_err(domain_error)?;
                print_json("delta_outcome.v1", outcome)
            } else {
                print_reply(tracker, actor, Action::GrantAchievement { definition_id })
            }
        }
    }
}

fn run_reset<S: RatingStore>(
    command: ResetCommand,
    tracker: &RatingTracker<S>,
    actor: Option<&Actor>,
) -> Result<()> {
    let actor = require_actor(actor)?;
    match command {
        ResetCommand::Request(args) => {
            if args.json {
                let challenge = tracker.request_reset(actor).map_err(domain_error)?;
                print_json("reset_challenge.v1", challenge)
            } else {
                let reply = interaction::handle(tracker, actor, Action::RequestReset)
                    .map_err(domain_error)?;
                println!("{}", reply.text);
                for choice in &reply.choices {
                    println!("  [{}] {}", choice.label, choice.callback);
                }
                Ok(())
            }
        }
        ResetCommand::Confirm(args) => {
            let token = parse_ulid(&args.token, "--token")?;
            if args.json {
                tracker.confirm_reset(actor, token).map_err(domain_error)?;
                print_json(
                    "reset_result.v1",
                    ResetResultView {
                        result: "reset",
                        token,
                    },
                )
            } else {
                print_reply(tracker, actor, Action::ConfirmReset { token })
            }
        }
        ResetCommand::Cancel(args) => {
            let token = parse_ulid(&args.token, "--token")?;
            if args.json {
                tracker.cancel_reset(actor, token).map_err(domain_error)?;
                print_json(
                    "reset_result.v1",
                    ResetResultView {
                        result: "cancelled",
                        token,
                    },
                )
            } else {
                print_reply(tracker, actor, Action::CancelReset { token })
            }
        }
    }
}

fn print_reply<S: RatingStore>(
    tracker: &RatingTracker<S>,
    actor: &Actor,
    action: Action,
) -> Result<()> {
    let Reply { text, .. } = interaction::handle(tracker, actor, action).map_err(domain_error)?;
    println!("{text}");
    Ok(())
}

fn print_json<T: Serialize>(contract_version: &'static str, payload: T) -> Result<()> {
    let envelope = Envelope {
        contract_version,
        payload,
    };
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}

fn require_actor(actor: Option<&Actor>) -> Result<&Actor> {
    actor.ok_or_else(|| anyhow!("--actor is required for this command"))
}

fn parse_ulid(raw: &str, flag: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID for {flag}: {raw}"))
}

/// Prefixes the stable error code so scripted callers can match on it.
#[allow(clippy::needless_pass_by_value)]
fn domain_error(err: RatingError) -> anyhow::Error {
    anyhow!("{}: {err}", err.code())
}
