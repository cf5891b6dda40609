#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rating_ledger_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, AchievementDefinition, ActorId, CommitBatch,
    ConditionKind, ConfirmationAction, DefinitionOrigin, GrantedAchievement, HistoryEntry,
    LedgerState, PendingConfirmation, RatingError, RatingStore,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;
use ulid::Ulid;

const RATING_MIGRATION_VERSION: i64 = 1;

const SCHEMA_RATING_V1: &str = r"
CREATE TABLE IF NOT EXISTS rating_state (
  singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
  rating INTEGER NOT NULL CHECK (rating BETWEEN -500 AND 500),
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rating_history (
  entry_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id TEXT NOT NULL UNIQUE,
  actor_id INTEGER NOT NULL,
  actor_display_name TEXT NOT NULL,
  delta_amount INTEGER NOT NULL,
  resulting_rating INTEGER NOT NULL CHECK (resulting_rating BETWEEN -500 AND 500),
  reason TEXT NOT NULL,
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_rating_history_no_update
BEFORE UPDATE ON rating_history
BEGIN
  SELECT RAISE(FAIL, 'rating_history is append-only');
END;

CREATE TABLE IF NOT EXISTS achievement_definitions (
  name TEXT PRIMARY KEY COLLATE NOCASE,
  definition_id TEXT UNIQUE,
  description TEXT NOT NULL,
  condition_kind TEXT NOT NULL CHECK (
    condition_kind IN (
      'first_change_recorded',
      'min_rating_reached',
      'max_rating_reached',
      'exact_rating_reached',
      'history_count_reached',
      'self_promotion_attempted',
      'manual'
    )
  ),
  condition_value INTEGER,
  rating_impact INTEGER NOT NULL,
  origin TEXT NOT NULL CHECK (origin IN ('standard', 'custom')),
  created_by INTEGER,
  created_at TEXT
);

CREATE TABLE IF NOT EXISTS achievement_grants (
  definition_name TEXT PRIMARY KEY,
  origin TEXT NOT NULL CHECK (origin IN ('standard', 'custom')),
  rating_impact INTEGER NOT NULL,
  granted_by INTEGER NOT NULL,
  granted_at TEXT NOT NULL,
  FOREIGN KEY (definition_name) REFERENCES achievement_definitions(name)
);

CREATE TABLE IF NOT EXISTS pending_confirmations (
  token TEXT PRIMARY KEY,
  action TEXT NOT NULL CHECK (action IN ('reset')),
  requested_by INTEGER NOT NULL,
  requested_at TEXT NOT NULL,
  expires_at TEXT NOT NULL
);
";

pub struct SqliteRatingStore {
    conn: Connection,
}

impl SqliteRatingStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_RATING_V1)
            .context("failed to apply rating schema")?;

        let now = timestamp(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![RATING_MIGRATION_VERSION, now],
            )
            .context("failed to register rating schema migration")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO rating_state(singleton, rating, updated_at) VALUES (1, 0, ?1)",
                params![now],
            )
            .context("failed to initialize rating state")?;

        Ok(())
    }

    fn history_count(conn: &Connection) -> Result<u64> {
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM rating_history", [], |row| row.get(0))
            .context("failed to count rating history")?;
        u64::try_from(count).with_context(|| format!("invalid history count: {count}"))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl RatingStore for SqliteRatingStore {
    fn initialize(&mut self, standard: &[AchievementDefinition]) -> Result<()> {
        self.migrate()?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start catalog transaction")?;

        for definition in standard {
            if definition.origin != DefinitionOrigin::Standard {
                return Err(anyhow!(
                    "catalog definition {} MUST have standard origin",
                    definition.name
                ));
            }

            tx.execute(
                "INSERT INTO achievement_definitions(
                    name, definition_id, description, condition_kind, condition_value,
                    rating_impact, origin, created_by, created_at
                 ) VALUES (?1, NULL, ?2, ?3, ?4, ?5, 'standard', NULL, NULL)
                 ON CONFLICT(name) DO UPDATE SET
                   description = excluded.description,
                   condition_kind = excluded.condition_kind,
                   condition_value = excluded.condition_value,
                   rating_impact = excluded.rating_impact
                 WHERE achievement_definitions.origin = 'standard'",
                params![
                    definition.name,
                    definition.description,
                    definition.condition.as_str(),
                    definition.condition.parameter(),
                    definition.rating_impact,
                ],
            )
            .with_context(|| format!("failed to upsert definition {}", definition.name))?;
        }

        tx.commit().context("failed to commit catalog transaction")?;
        debug!(definitions = standard.len(), "standard catalog synchronized");
        Ok(())
    }

    fn load_state(&self) -> Result<LedgerState> {
        let rating: i64 = self
            .conn
            .query_row(
                "SELECT rating FROM rating_state WHERE singleton = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read rating state")?
            .ok_or_else(|| anyhow!("rating state missing; initialize the store first"))?;

        let mut stmt = self
            .conn
            .prepare("SELECT definition_name FROM achievement_grants")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let granted = collect_rows(rows)?.into_iter().collect();

        Ok(LedgerState {
            rating,
            history_count: Self::history_count(&self.conn)?,
            granted,
        })
    }

    fn commit(&mut self, batch: &CommitBatch) -> Result<Vec<HistoryEntry>> {
        batch
            .validate()
            .map_err(|err| anyhow!("commit batch rejected: {err}"))?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start commit transaction")?;

        let history_count = Self::history_count(&tx)?;
        if history_count != batch.base_history_count {
            return Err(anyhow!(
                "ledger changed concurrently: batch computed at {} entries, store has {history_count}",
                batch.base_history_count
            ));
        }

        let mut committed = Vec::with_capacity(batch.entries.len());
        for entry in &batch.entries {
            tx.execute(
                "INSERT INTO rating_history(
                    entry_id, actor_id, actor_display_name, delta_amount,
                    resulting_rating, reason, recorded_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.entry_id.to_string(),
                    entry.actor_id.0,
                    entry.actor_display_name,
                    entry.delta_amount,
                    entry.resulting_rating,
                    entry.reason,
                    timestamp(entry.recorded_at)?,
                ],
            )
            .context("failed to append rating history entry")?;
            committed.push(entry.clone().into_entry(tx.last_insert_rowid()));
        }

        for grant in &batch.grants {
            tx.execute(
                "INSERT INTO achievement_grants(
                    definition_name, origin, rating_impact, granted_by, granted_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    grant.definition_name,
                    grant.origin.as_str(),
                    grant.rating_impact,
                    grant.granted_by.0,
                    timestamp(grant.granted_at)?,
                ],
            )
            .with_context(|| format!("failed to record grant of {}", grant.definition_name))?;
        }

        tx.execute(
            "UPDATE rating_state SET rating = ?1, updated_at = ?2 WHERE singleton = 1",
            params![batch.final_rating, timestamp(now_utc())?],
        )
        .context("failed to update rating state")?;

        tx.commit().context("failed to commit rating transaction")?;
        Ok(committed)
    }

    fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let limit = i64::try_from(limit).with_context(|| format!("invalid limit: {limit}"))?;
        let mut stmt = self.conn.prepare(
            "SELECT
                entry_seq, entry_id, actor_id, actor_display_name, delta_amount,
                resulting_rating, reason, recorded_at
             FROM rating_history
             ORDER BY entry_seq DESC
             LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit], parse_history_row)?;
        collect_rows(rows)
    }

    fn grants(&self) -> Result<Vec<GrantedAchievement>> {
        let mut stmt = self.conn.prepare(
            "SELECT definition_name, origin, rating_impact, granted_by, granted_at
             FROM achievement_grants
             ORDER BY rowid ASC",
        )?;

        let rows = stmt.query_map([], parse_grant_row)?;
        collect_rows(rows)
    }

    fn custom_definitions(&self) -> Result<Vec<AchievementDefinition>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                name, definition_id, description, condition_kind, condition_value,
                rating_impact, origin, created_by, created_at
             FROM achievement_definitions
             WHERE origin = 'custom'
             ORDER BY rowid ASC",
        )?;

        let rows = stmt.query_map([], parse_definition_row)?;
        collect_rows(rows)
    }

    fn insert_custom_definition(&mut self, definition: &AchievementDefinition) -> Result<()> {
        if definition.origin != DefinitionOrigin::Custom {
            return Err(anyhow!("only custom definitions can be inserted at runtime"));
        }

        let created_at = definition.created_at.map(timestamp).transpose()?;
        self.conn
            .execute(
                "INSERT INTO achievement_definitions(
                    name, definition_id, description, condition_kind, condition_value,
                    rating_impact, origin, created_by, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'custom', ?7, ?8)",
                params![
                    definition.name,
                    definition.definition_id.map(|id| id.to_string()),
                    definition.description,
                    definition.condition.as_str(),
                    definition.condition.parameter(),
                    definition.rating_impact,
                    definition.created_by.map(|actor| actor.0),
                    created_at,
                ],
            )
            .with_context(|| format!("failed to insert custom definition {}", definition.name))?;

        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start reset transaction")?;

        tx.execute_batch(
            "DELETE FROM achievement_grants;
             DELETE FROM achievement_definitions WHERE origin = 'custom';
             DELETE FROM rating_history;
             DELETE FROM pending_confirmations;",
        )
        .context("failed to clear rating data")?;
        tx.execute(
            "UPDATE rating_state SET rating = 0, updated_at = ?1 WHERE singleton = 1",
            params![timestamp(now_utc())?],
        )
        .context("failed to reset rating state")?;

        tx.commit().context("failed to commit reset transaction")?;
        debug!("rating tables truncated");
        Ok(())
    }

    fn put_pending(&mut self, pending: &PendingConfirmation) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO pending_confirmations(token, action, requested_by, requested_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    pending.token.to_string(),
                    pending.action.as_str(),
                    pending.requested_by.0,
                    timestamp(pending.requested_at)?,
                    timestamp(pending.expires_at)?,
                ],
            )
            .context("failed to store pending confirmation")?;
        Ok(())
    }

    fn pending(&self, token: Ulid) -> Result<Option<PendingConfirmation>> {
        self.conn
            .query_row(
                "SELECT token, action, requested_by, requested_at, expires_at
                 FROM pending_confirmations
                 WHERE token = ?1",
                params![token.to_string()],
                parse_pending_row,
            )
            .optional()
            .context("failed to read pending confirmation")
    }

    fn delete_pending(&mut self, token: Ulid) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM pending_confirmations WHERE token = ?1",
                params![token.to_string()],
            )
            .context("failed to delete pending confirmation")?;
        Ok(removed > 0)
    }
}

fn parse_history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let entry_id_raw: String = row.get(1)?;
    let entry_id = Ulid::from_string(&entry_id_raw).map_err(|_| {
        invalid_column(
            1,
            rusqlite::types::Type::Text,
            format!("invalid entry_id ULID: {entry_id_raw}"),
        )
    })?;

    Ok(HistoryEntry {
        entry_seq: row.get(0)?,
        entry_id,
        actor_id: ActorId(row.get(2)?),
        actor_display_name: row.get(3)?,
        delta_amount: row.get(4)?,
        resulting_rating: row.get(5)?,
        reason: row.get(6)?,
        recorded_at: parse_rfc3339_utc(&row.get::<_, String>(7)?).map_err(to_sql_error)?,
    })
}

fn parse_grant_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GrantedAchievement> {
    let origin_raw: String = row.get(1)?;
    let origin = DefinitionOrigin::parse(&origin_raw).ok_or_else(|| {
        invalid_column(
            1,
            rusqlite::types::Type::Text,
            format!("invalid origin: {origin_raw}"),
        )
    })?;

    Ok(GrantedAchievement {
        definition_name: row.get(0)?,
        origin,
        rating_impact: row.get(2)?,
        granted_by: ActorId(row.get(3)?),
        granted_at: parse_rfc3339_utc(&row.get::<_, String>(4)?).map_err(to_sql_error)?,
    })
}

fn parse_definition_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AchievementDefinition> {
    let definition_id_raw: Option<String> = row.get(1)?;
    let condition_kind_raw: String = row.get(3)?;
    let condition_value: Option<i64> = row.get(4)?;
    let origin_raw: String = row.get(6)?;
    let created_at_raw: Option<String> = row.get(8)?;

    let definition_id = definition_id_raw
        .as_deref()
        .map(|raw| {
            Ulid::from_string(raw).map_err(|_| {
                invalid_column(
                    1,
                    rusqlite::types::Type::Text,
                    format!("invalid definition_id ULID: {raw}"),
                )
            })
        })
        .transpose()?;

    let condition =
        ConditionKind::from_parts(&condition_kind_raw, condition_value).ok_or_else(|| {
            invalid_column(
                3,
                rusqlite::types::Type::Text,
                format!("invalid condition: {condition_kind_raw} {condition_value:?}"),
            )
        })?;

    let origin = DefinitionOrigin::parse(&origin_raw).ok_or_else(|| {
        invalid_column(
            6,
            rusqlite::types::Type::Text,
            format!("invalid origin: {origin_raw}"),
        )
    })?;

    let created_at = created_at_raw
        .as_deref()
        .map(parse_rfc3339_utc)
        .transpose()
        .map_err(to_sql_error)?;

    Ok(AchievementDefinition {
        definition_id,
        name: row.get(0)?,
        description: row.get(2)?,
        condition,
        rating_impact: row.get(5)?,
        origin,
        created_by: row.get::<_, Option<i64>>(7)?.map(ActorId),
        created_at,
    })
}

fn parse_pending_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingConfirmation> {
    let token_raw: String = row.get(0)?;
    let action_raw: String = row.get(1)?;

    let token = Ulid::from_string(&token_raw).map_err(|_| {
        invalid_column(
            0,
            rusqlite::types::Type::Text,
            format!("invalid token ULID: {token_raw}"),
        )
    })?;
    let action = ConfirmationAction::parse(&action_raw).ok_or_else(|| {
        invalid_column(
            1,
            rusqlite::types::Type::Text,
            format!("invalid confirmation action: {action_raw}"),
        )
    })?;

    Ok(PendingConfirmation {
        token,
        action,
        requested_by: ActorId(row.get(2)?),
        requested_at: parse_rfc3339_utc(&row.get::<_, String>(3)?).map_err(to_sql_error)?,
        expires_at: parse_rfc3339_utc(&row.get::<_, String>(4)?).map_err(to_sql_error)?,
    })
}

fn timestamp(value: time::OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

fn invalid_column(index: usize, ty: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        ty,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(err: RatingError) -> rusqlite::Error {
    invalid_column(0, rusqlite::types::Type::Text, err.to_string())
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
