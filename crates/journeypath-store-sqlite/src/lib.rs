#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use journeypath_core::{
    format_date, format_rfc3339, normalize_label, now_utc, parse_date, parse_rfc3339_utc,
    run_attribution, sorted_path_records, AttributionError, AttributionRuleset, DateWindow,
    PathRecord, SessionBatch, SessionRecord, SessionSource,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use time::{Date, OffsetDateTime, UtcOffset};
use tracing::{debug, warn};
use ulid::Ulid;

const ATTRIBUTION_MIGRATION_VERSION: i64 = 1;
const RUN_CONTRACT_VERSION: &str = "attribution_run.v1";

const SCHEMA_ATTRIBUTION_V1: &str = r"
CREATE TABLE IF NOT EXISTS attribution_rulesets (
  ruleset_version INTEGER PRIMARY KEY,
  ruleset_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS session_facts (
  session_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  session_id TEXT NOT NULL UNIQUE,
  user_id TEXT NOT NULL,
  session_date TEXT NOT NULL,
  event_time TEXT NOT NULL,
  membership INTEGER NOT NULL DEFAULT 0 CHECK (membership IN (0, 1)),
  medium TEXT,
  source TEXT,
  campaign TEXT,
  channel_group TEXT,
  engaged INTEGER NOT NULL DEFAULT 1 CHECK (engaged IN (0, 1)),
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_session_facts_no_update
BEFORE UPDATE ON session_facts
BEGIN
  SELECT RAISE(FAIL, 'session_facts is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_session_facts_no_delete
BEFORE DELETE ON session_facts
BEGIN
  SELECT RAISE(FAIL, 'session_facts is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_session_facts_user_order
  ON session_facts(user_id, session_date, event_time, session_seq);
CREATE INDEX IF NOT EXISTS idx_session_facts_window
  ON session_facts(engaged, session_date);

CREATE TABLE IF NOT EXISTS path_summary (
  dimension TEXT NOT NULL,
  path TEXT NOT NULL,
  conversion_count INTEGER NOT NULL CHECK (conversion_count >= 0),
  non_conversion_count INTEGER NOT NULL CHECK (non_conversion_count >= 0),
  run_id TEXT NOT NULL,
  computed_at TEXT NOT NULL,
  PRIMARY KEY (dimension, path)
);

CREATE TABLE IF NOT EXISTS attribution_runs (
  run_id TEXT PRIMARY KEY,
  ruleset_version INTEGER NOT NULL,
  window_start TEXT NOT NULL,
  window_end TEXT NOT NULL,
  lookback_days INTEGER NOT NULL,
  gap_days INTEGER NOT NULL,
  user_count INTEGER NOT NULL,
  session_count INTEGER NOT NULL,
  dropped_records INTEGER NOT NULL,
  distinct_paths INTEGER NOT NULL,
  computed_at TEXT NOT NULL
);
";

pub struct SqliteSessionStore {
    conn: Connection,
}

/// Input for appending one session fact; `session_id` defaults to a
/// fresh ULID.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SessionFactInput {
    pub session_id: Option<Ulid>,
    pub user_id: String,
    pub session_date: Date,
    pub event_time: OffsetDateTime,
    pub membership: bool,
    pub medium: Option<String>,
    pub source: Option<String>,
    pub campaign: Option<String>,
    pub channel_group: Option<String>,
    pub engaged: bool,
}

impl SessionFactInput {
    /// Validates a session fact before append.
    ///
    /// # Errors
    /// Returns [`AttributionError::Validation`] when the user id is
    /// blank or the event time is not UTC.
    pub fn validate(&self) -> Result<(), AttributionError> {
        if self.user_id.trim().is_empty() {
            return Err(AttributionError::Validation(
                "user_id MUST be provided for every session fact".to_string(),
            ));
        }

        if self.event_time.offset() != UtcOffset::UTC {
            return Err(AttributionError::Validation(
                "event_time MUST be UTC (offset Z)".to_string(),
            ));
        }

        Ok(())
    }
}

/// Ledger row describing one published attribution run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct AttributionRunReport {
    pub contract_version: String,
    pub run_id: Ulid,
    pub ruleset_version: u32,
    pub window_start: String,
    pub window_end: String,
    pub lookback_days: u32,
    pub gap_days: u32,
    pub user_count: usize,
    pub session_count: usize,
    pub dropped_records: usize,
    pub distinct_paths: usize,
    pub computed_at: String,
}

struct RawSessionRow {
    session_seq: i64,
    session_id: String,
    user_id: String,
    session_date: String,
    event_time: String,
    membership: i64,
    medium: Option<String>,
    source: Option<String>,
    campaign: Option<String>,
    channel_group: Option<String>,
}

impl SqliteSessionStore {
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
            .execute_batch(SCHEMA_ATTRIBUTION_V1)
            .context("failed to apply attribution schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![ATTRIBUTION_MIGRATION_VERSION, now],
            )
            .context("failed to register attribution schema migration")?;

        self.upsert_ruleset(&AttributionRuleset::v1())?;

        Ok(())
    }

    pub fn upsert_ruleset(&self, ruleset: &AttributionRuleset) -> Result<()> {
        ruleset
            .validate()
            .map_err(|err| anyhow!("invalid ruleset configuration: {err}"))?;

        let payload = serde_json::to_string(ruleset).context("failed to serialize ruleset")?;
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        self.conn
            .execute(
                "INSERT INTO attribution_rulesets(ruleset_version, ruleset_json, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(ruleset_version) DO UPDATE SET
                   ruleset_json = excluded.ruleset_json,
                   created_at = excluded.created_at",
                params![i64::from(ruleset.ruleset_version), payload, now],
            )
            .context("failed to upsert ruleset")?;

        Ok(())
    }

    pub fn get_rulesets(&self) -> Result<BTreeMap<u32, AttributionRuleset>> {
        let mut stmt = self.conn.prepare(
            "SELECT ruleset_version, ruleset_json
             FROM attribution_rulesets
             ORDER BY ruleset_version ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut map = BTreeMap::new();

        while let Some(row) = rows.next()? {
            let version_i64: i64 = row.get(0)?;
            let version = u32::try_from(version_i64)
                .with_context(|| format!("invalid ruleset_version: {version_i64}"))?;
            let json: String = row.get(1)?;
            let value: Value =
                serde_json::from_str(&json).context("invalid stored ruleset JSON")?;
            let ruleset = AttributionRuleset::from_json(&value)
                .map_err(|err| anyhow!("failed to parse ruleset {version}: {err}"))?;
            map.insert(version, ruleset);
        }

        Ok(map)
    }

    pub fn get_ruleset(&self, version: u32) -> Result<AttributionRuleset> {
        let rulesets = self.get_rulesets()?;
        rulesets
            .get(&version)
            .cloned()
            .ok_or_else(|| anyhow!("missing ruleset_version {version} in attribution_rulesets"))
    }

    pub fn append_session(&mut self, input: &SessionFactInput) -> Result<SessionRecord> {
        input
            .validate()
            .map_err(|err| anyhow!("session fact validation failed: {err}"))?;

        let session_id = input.session_id.unwrap_or_else(Ulid::new);
        let recorded_at = now_utc();

        let medium = normalize_label(input.medium.as_deref());
        let source = normalize_label(input.source.as_deref());
        let campaign = normalize_label(input.campaign.as_deref());
        let channel_group = normalize_label(input.channel_group.as_deref());

        let tx = self
            .conn
            .transaction()
            .context("failed to start session fact transaction")?;

        tx.execute(
            "INSERT INTO session_facts(
                session_id, user_id, session_date, event_time, membership,
                medium, source, campaign, channel_group, engaged, recorded_at
             ) VALUES (
                ?1, ?2, ?3, ?4, ?5,
                ?6, ?7, ?8, ?9, ?10, ?11
             )",
            params![
                session_id.to_string(),
                input.user_id,
                format_date(input.session_date).map_err(|err| anyhow!(err.to_string()))?,
                format_rfc3339(input.event_time).map_err(|err| anyhow!(err.to_string()))?,
                i64::from(input.membership),
                medium,
                source,
                campaign,
                channel_group,
                i64::from(input.engaged),
                format_rfc3339(recorded_at).map_err(|err| anyhow!(err.to_string()))?,
            ],
        )
        .context("failed to append session fact")?;

        let session_seq = tx.last_insert_rowid();
        tx.commit()
            .context("failed to commit session fact transaction")?;

        Ok(SessionRecord {
            session_seq,
            session_id,
            user_id: input.user_id.clone(),
            session_date: input.session_date,
            event_time: input.event_time,
            membership: input.membership,
            medium,
            source,
            campaign,
            channel_group,
        })
    }

    pub fn list_sessions_for_user(
        &self,
        user_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<SessionRecord>> {
        let mut query = "SELECT
                session_seq, session_id, user_id, session_date, event_time,
                membership, medium, source, campaign, channel_group
             FROM session_facts
             WHERE user_id = ?1
             ORDER BY session_date ASC, event_time ASC, session_seq ASC"
            .to_string();

        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![user_id], read_raw_session_row)?;

        let mut sessions = Vec::new();
        for row in rows {
            let raw = row?;
            let session = parse_session_row(&raw)
                .map_err(|err| anyhow!("corrupt session fact {}: {err}", raw.session_seq))?;
            sessions.push(session);
        }
        Ok(sessions)
    }

    /// Recomputes and publishes path summaries for the lookback window
    /// ending at `as_of`.
    ///
    /// The publish is one transaction replacing every `path_summary`
    /// row and appending a run ledger entry; failure before commit
    /// leaves the previously published summary untouched.
    pub fn run_attribution(&mut self, as_of: Date, ruleset_version: u32) -> Result<AttributionRunReport> {
        let ruleset = self.get_ruleset(ruleset_version)?;
        self.run_attribution_with_ruleset(as_of, &ruleset)
    }

    /// Same as [`Self::run_attribution`] but with an explicit ruleset,
    /// for callers overriding window or gap parameters ad hoc.
    pub fn run_attribution_with_ruleset(
        &mut self,
        as_of: Date,
        ruleset: &AttributionRuleset,
    ) -> Result<AttributionRunReport> {
        let outcome = run_attribution(&*self, as_of, ruleset)
            .map_err(|err| anyhow!("attribution run failed: {err}"))?;
        let records = sorted_path_records(&outcome.totals);

        let run_id = Ulid::new();
        let computed_at = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let window_start =
            format_date(outcome.window.start).map_err(|err| anyhow!(err.to_string()))?;
        let window_end = format_date(outcome.window.end).map_err(|err| anyhow!(err.to_string()))?;

        debug!(
            run_id = %run_id,
            users = outcome.user_count,
            sessions = outcome.session_count,
            paths = records.len(),
            "publishing attribution run"
        );

        let tx = self
            .conn
            .transaction()
            .context("failed to start attribution publish transaction")?;

        tx.execute("DELETE FROM path_summary", [])
            .context("failed to clear previous path summary")?;

        for record in &records {
            tx.execute(
                "INSERT INTO path_summary(
                    dimension, path, conversion_count, non_conversion_count, run_id, computed_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.dimension,
                    record.path,
                    i64::try_from(record.conversion_count)
                        .context("conversion_count overflows i64")?,
                    i64::try_from(record.non_conversion_count)
                        .context("non_conversion_count overflows i64")?,
                    run_id.to_string(),
                    computed_at,
                ],
            )
            .context("failed to insert path summary row")?;
        }

        tx.execute(
            "INSERT INTO attribution_runs(
                run_id, ruleset_version, window_start, window_end, lookback_days, gap_days,
                user_count, session_count, dropped_records, distinct_paths, computed_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                run_id.to_string(),
                i64::from(ruleset.ruleset_version),
                window_start,
                window_end,
                i64::from(ruleset.lookback_days),
                i64::from(ruleset.gap_days),
                to_sql_count(outcome.user_count)?,
                to_sql_count(outcome.session_count)?,
                to_sql_count(outcome.dropped_records)?,
                to_sql_count(records.len())?,
                computed_at,
            ],
        )
        .context("failed to record attribution run")?;

        tx.commit()
            .context("failed to commit attribution publish transaction")?;

        Ok(AttributionRunReport {
            contract_version: RUN_CONTRACT_VERSION.to_string(),
            run_id,
            ruleset_version: ruleset.ruleset_version,
            window_start,
            window_end,
            lookback_days: ruleset.lookback_days,
            gap_days: ruleset.gap_days,
            user_count: outcome.user_count,
            session_count: outcome.session_count,
            dropped_records: outcome.dropped_records,
            distinct_paths: records.len(),
            computed_at,
        })
    }

    pub fn list_paths(&self, dimension: Option<&str>) -> Result<Vec<PathRecord>> {
        let mut query = "SELECT dimension, path, conversion_count, non_conversion_count
             FROM path_summary"
            .to_string();
        if dimension.is_some() {
            query.push_str(" WHERE dimension = ?1");
        }
        query.push_str(
            " ORDER BY dimension ASC, conversion_count DESC, non_conversion_count DESC, path ASC",
        );

        let mut stmt = self.conn.prepare(&query)?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<PathRecord> {
            let conversion_i64: i64 = row.get(2)?;
            let non_conversion_i64: i64 = row.get(3)?;
            Ok(PathRecord {
                dimension: row.get(0)?,
                path: row.get(1)?,
                conversion_count: u64::try_from(conversion_i64).unwrap_or(0),
                non_conversion_count: u64::try_from(non_conversion_i64).unwrap_or(0),
            })
        };

        let rows = match dimension {
            Some(name) => stmt.query_map(params![name], map_row)?,
            None => stmt.query_map([], map_row)?,
        };

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn latest_run(&self) -> Result<Option<AttributionRunReport>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, ruleset_version, window_start, window_end, lookback_days, gap_days,
                    user_count, session_count, dropped_records, distinct_paths, computed_at
             FROM attribution_runs
             ORDER BY computed_at DESC, run_id DESC
             LIMIT 1",
        )?;

        let row = stmt
            .query_row([], |row| {
                let run_id_raw: String = row.get(0)?;
                let ruleset_i64: i64 = row.get(1)?;
                Ok((
                    run_id_raw,
                    ruleset_i64,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, i64>(9)?,
                    row.get::<_, String>(10)?,
                ))
            })
            .optional()?;

        let Some((
            run_id_raw,
            ruleset_i64,
            window_start,
            window_end,
            lookback_i64,
            gap_i64,
            users_i64,
            sessions_i64,
            dropped_i64,
            paths_i64,
            computed_at,
        )) = row
        else {
            return Ok(None);
        };

        let run_id = Ulid::from_string(&run_id_raw)
            .with_context(|| format!("invalid run_id ULID: {run_id_raw}"))?;

        Ok(Some(AttributionRunReport {
            contract_version: RUN_CONTRACT_VERSION.to_string(),
            run_id,
            ruleset_version: u32::try_from(ruleset_i64)
                .with_context(|| format!("invalid ruleset_version: {ruleset_i64}"))?,
            window_start,
            window_end,
            lookback_days: u32::try_from(lookback_i64)
                .with_context(|| format!("invalid lookback_days: {lookback_i64}"))?,
            gap_days: u32::try_from(gap_i64)
                .with_context(|| format!("invalid gap_days: {gap_i64}"))?,
            user_count: from_sql_count(users_i64)?,
            session_count: from_sql_count(sessions_i64)?,
            dropped_records: from_sql_count(dropped_i64)?,
            distinct_paths: from_sql_count(paths_i64)?,
            computed_at,
        }))
    }

    fn load_raw_rows(&self, window: DateWindow) -> Result<Vec<RawSessionRow>> {
        let start = format_date(window.start).map_err(|err| anyhow!(err.to_string()))?;
        let end = format_date(window.end).map_err(|err| anyhow!(err.to_string()))?;

        let mut stmt = self
            .conn
            .prepare(
                "SELECT
                    session_seq, session_id, user_id, session_date, event_time,
                    membership, medium, source, campaign, channel_group
                 FROM session_facts
                 WHERE engaged = 1 AND session_date >= ?1 AND session_date <= ?2
                 ORDER BY user_id ASC, session_date ASC, event_time ASC, session_seq ASC",
            )
            .context("failed to prepare session window query")?;

        let rows = stmt
            .query_map(params![start, end], read_raw_session_row)
            .context("failed to query session facts")?;

        let mut raw_rows = Vec::new();
        for row in rows {
            raw_rows.push(row.context("failed to read session fact row")?);
        }
        Ok(raw_rows)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl SessionSource for SqliteSessionStore {
    fn load_engaged_sessions(&self, window: DateWindow) -> Result<SessionBatch, AttributionError> {
        let raw_rows = self
            .load_raw_rows(window)
            .map_err(|err| AttributionError::Source(err.to_string()))?;

        let mut batch = SessionBatch::default();
        for raw in raw_rows {
            match parse_session_row(&raw) {
                Ok(session) => {
                    batch
                        .users
                        .entry(session.user_id.clone())
                        .or_default()
                        .push(session);
                }
                Err(err) => {
                    warn!(
                        session_seq = raw.session_seq,
                        reason = %err,
                        "dropping session fact with unresolvable identifiers"
                    );
                    batch.dropped_records += 1;
                }
            }
        }

        Ok(batch)
    }
}

fn read_raw_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSessionRow> {
    Ok(RawSessionRow {
        session_seq: row.get(0)?,
        session_id: row.get(1)?,
        user_id: row.get(2)?,
        session_date: row.get(3)?,
        event_time: row.get(4)?,
        membership: row.get(5)?,
        medium: row.get(6)?,
        source: row.get(7)?,
        campaign: row.get(8)?,
        channel_group: row.get(9)?,
    })
}

fn parse_session_row(raw: &RawSessionRow) -> Result<SessionRecord, AttributionError> {
    if raw.user_id.trim().is_empty() {
        return Err(AttributionError::Validation(
            "missing user_id".to_string(),
        ));
    }

    let session_id = Ulid::from_string(&raw.session_id).map_err(|_| {
        AttributionError::Validation(format!("invalid session_id ULID: {}", raw.session_id))
    })?;
    let session_date = parse_date(&raw.session_date)?;
    let event_time = parse_rfc3339_utc(&raw.event_time)?;

    Ok(SessionRecord {
        session_seq: raw.session_seq,
        session_id,
        user_id: raw.user_id.clone(),
        session_date,
        event_time,
        membership: raw.membership == 1,
        medium: normalize_label(raw.medium.as_deref()),
        source: normalize_label(raw.source.as_deref()),
        campaign: normalize_label(raw.campaign.as_deref()),
        channel_group: normalize_label(raw.channel_group.as_deref()),
    })
}

fn to_sql_count(value: usize) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("count overflows i64: {value}"))
}

fn from_sql_count(value: i64) -> Result<usize> {
    usize::try_from(value).with_context(|| format!("invalid stored count: {value}"))
}

/// Inserts a raw fact row bypassing input validation; intended for
/// data-quality tests that need malformed warehouse rows.
pub fn seed_raw_session_fact(
    conn: &Connection,
    session_id: &str,
    user_id: &str,
    session_date: &str,
    event_time: &str,
    engaged: bool,
) -> Result<()> {
    conn.execute(
        "INSERT INTO session_facts(
            session_id, user_id, session_date, event_time, membership,
            medium, source, campaign, channel_group, engaged, recorded_at
         ) VALUES (?1, ?2, ?3, ?4, 0, NULL, NULL, NULL, NULL, ?5, ?6)",
        params![
            session_id,
            user_id,
            session_date,
            event_time,
            i64::from(engaged),
            event_time,
        ],
    )
    .context("failed to seed raw session fact")?;

    Ok(())
}
