use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ats_verify_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, status_trace, DocumentReuse, IdentityFrequency,
    IngestError, ListUnitsQuery, MarkUsedOutcome, RawSignalRecord, RiskLevel, RiskProfile,
    RiskProfileId, StatusFlipFlop, TrackLookup, TrackedUnit, TrackedUnitDraft, UnitId, UnitPage,
    UpsertAction, UpsertOutcome, UsageFilter, UserId,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

/// SQLite's default bound-parameter ceiling.
pub const MAX_BOUND_PARAMETERS: usize = 32_766;
const LEDGER_COLUMNS: usize = 10;
/// Largest ledger chunk that stays under [`MAX_BOUND_PARAMETERS`].
pub const MAX_LEDGER_CHUNK_ROWS: usize = MAX_BOUND_PARAMETERS / LEDGER_COLUMNS;

/// How often a conflicting upsert re-reads the key before giving up.
const MAX_UPSERT_ATTEMPTS: usize = 4;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS tracked_units (
  id TEXT PRIMARY KEY,
  track_number TEXT NOT NULL UNIQUE CHECK (track_number <> ''),
  marketplace TEXT NOT NULL,
  country TEXT NOT NULL,
  brand TEXT NOT NULL,
  product_name TEXT NOT NULL,
  serial_ref TEXT NOT NULL,
  is_used INTEGER NOT NULL DEFAULT 0 CHECK (is_used IN (0, 1)),
  upload_timestamp TEXT NOT NULL,
  uploader_id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS raw_signal_ledger (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  report_date TEXT NOT NULL,
  application_id TEXT NOT NULL,
  identity_key TEXT NOT NULL CHECK (identity_key <> ''),
  document_ref TEXT NOT NULL,
  user_name TEXT NOT NULL,
  organization TEXT NOT NULL,
  status TEXT NOT NULL,
  reject_flag TEXT NOT NULL,
  reason TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS risk_profiles (
  id TEXT PRIMARY KEY,
  identity_key TEXT NOT NULL UNIQUE,
  risk_level TEXT NOT NULL CHECK (risk_level IN ('green','yellow','red')),
  flagged_by TEXT NOT NULL,
  reason TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

const MIGRATION_002_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_ledger_document_identity
  ON raw_signal_ledger(document_ref, identity_key, report_date);
CREATE INDEX IF NOT EXISTS idx_ledger_identity ON raw_signal_ledger(identity_key);
CREATE INDEX IF NOT EXISTS idx_units_used_created ON tracked_units(is_used, created_at);
";

const UNIT_COLUMNS: &str = "id, track_number, marketplace, country, brand, product_name, \
     serial_ref, is_used, upload_timestamp, uploader_id, created_at, updated_at";

const RISK_PROFILE_COLUMNS: &str =
    "id, identity_key, risk_level, flagged_by, reason, created_at, updated_at";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableCounts {
    pub tracked_units: u64,
    pub raw_signal_ledger: u64,
    pub risk_profiles: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub table_counts: TableCounts,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
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

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// True when the schema is already at [`LATEST_SCHEMA_VERSION`]. Read-only.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_is_current(&self) -> Result<bool> {
        let has_migrations_table: bool = self
            .conn
            .query_row(
                "SELECT EXISTS(
                   SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'
                 )",
                [],
                |row| row.get(0),
            )
            .context("failed to inspect sqlite_master")?;
        if !has_migrations_table {
            return Ok(false);
        }
        Ok(current_schema_version(&self.conn)? == LATEST_SCHEMA_VERSION)
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer
    /// than this build.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        for (target, sql) in [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL)] {
            if version < target {
                self.apply_migration(target, sql)?;
                version = target;
            }
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .with_context(|| format!("failed to start migration {version}"))?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration {version}"))?;
        record_schema_version(&tx, version)?;
        tx.commit().with_context(|| format!("failed to commit migration {version}"))?;
        tracing::debug!(version, "applied schema migration");
        Ok(())
    }

    /// Insert, overwrite, or refuse one tracked unit according to the dedup table.
    ///
    /// The existence check is only a fast path. The insert is conflict-safe and
    /// the overwrite is guarded by `is_used = 0`; when either guarded write
    /// touches no row the key is re-read and the decision is made again.
    ///
    /// # Errors
    /// Returns an error on storage failure or when the key keeps changing underneath.
    pub fn upsert_tracked_unit(&mut self, draft: &TrackedUnitDraft) -> Result<UpsertOutcome> {
        let upload_timestamp = format_rfc3339(draft.upload_timestamp)?;
        let uploader_id = draft.uploader_id.to_string();

        for _ in 0..MAX_UPSERT_ATTEMPTS {
            let existing = self
                .conn
                .query_row(
                    "SELECT is_used FROM tracked_units WHERE track_number = ?1",
                    params![draft.track_number],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
                .with_context(|| format!("failed to look up track {}", draft.track_number))?
                .map(|is_used| is_used != 0);

            let now = format_rfc3339(now_utc())?;
            match UpsertAction::decide(existing) {
                UpsertAction::Insert => {
                    let changed = self
                        .conn
                        .execute(
                            "INSERT INTO tracked_units(
                               id, track_number, marketplace, country, brand, product_name,
                               serial_ref, is_used, upload_timestamp, uploader_id, created_at, updated_at
                             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?10, ?10)
                             ON CONFLICT(track_number) DO NOTHING",
                            params![
                                UnitId::new().to_string(),
                                draft.track_number,
                                draft.marketplace,
                                draft.country,
                                draft.brand,
                                draft.product_name,
                                draft.serial_ref,
                                upload_timestamp,
                                uploader_id,
                                now,
                            ],
                        )
                        .with_context(|| format!("failed to insert track {}", draft.track_number))?;
                    if changed == 1 {
                        return Ok(UpsertOutcome::Inserted);
                    }
                }
                UpsertAction::Overwrite => {
                    let changed = self
                        .conn
                        .execute(
                            "UPDATE tracked_units
                             SET marketplace = ?2, country = ?3, brand = ?4, product_name = ?5,
                                 serial_ref = ?6, upload_timestamp = ?7, uploader_id = ?8,
                                 updated_at = ?9
                             WHERE track_number = ?1 AND is_used = 0",
                            params![
                                draft.track_number,
                                draft.marketplace,
                                draft.country,
                                draft.brand,
                                draft.product_name,
                                draft.serial_ref,
                                upload_timestamp,
                                uploader_id,
                                now,
                            ],
                        )
                        .with_context(|| format!("failed to update track {}", draft.track_number))?;
                    if changed == 1 {
                        return Ok(UpsertOutcome::Updated);
                    }
                }
                UpsertAction::Reject => return Ok(UpsertOutcome::SkippedUsed),
            }
            tracing::debug!(track_number = %draft.track_number, "upsert lost a race; re-deciding");
        }

        Err(anyhow!(
            "track {} changed concurrently {MAX_UPSERT_ATTEMPTS} times; giving up",
            draft.track_number
        ))
    }

    /// Fetch one tracked unit by its exact track number.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored row is malformed.
    pub fn get_tracked_unit(&self, track_number: &str) -> Result<Option<TrackedUnit>> {
        let row = self
            .conn
            .prepare_cached(&format!(
                "SELECT {UNIT_COLUMNS} FROM tracked_units WHERE track_number = ?1"
            ))
            .context("failed to prepare tracked unit lookup")?
            .query_row(params![track_number], UnitRow::from_row)
            .optional()
            .with_context(|| format!("failed to load track {track_number}"))?;
        row.map(UnitRow::into_unit).transpose()
    }

    /// Look up many track numbers at once, preserving input order.
    ///
    /// Inputs are trimmed and blank entries are dropped.
    ///
    /// # Errors
    /// Returns an error when any lookup query fails.
    pub fn bulk_lookup(&self, track_numbers: &[String]) -> Result<Vec<TrackLookup>> {
        let mut out = Vec::with_capacity(track_numbers.len());
        for raw in track_numbers {
            let track_number = raw.trim();
            if track_number.is_empty() {
                continue;
            }
            let unit = self.get_tracked_unit(track_number)?;
            out.push(TrackLookup {
                track_number: track_number.to_string(),
                found: unit.is_some(),
                unit,
            });
        }
        Ok(out)
    }

    /// Flip `is_used` on. Repeating the call is harmless.
    ///
    /// # Errors
    /// Returns [`IngestError::NotFound`] (wrapped) for unknown track numbers.
    pub fn mark_used(&mut self, track_number: &str) -> Result<MarkUsedOutcome> {
        let track_number = track_number.trim();
        let now = format_rfc3339(now_utc())?;
        let changed = self
            .conn
            .execute(
                "UPDATE tracked_units SET is_used = 1, updated_at = ?2
                 WHERE track_number = ?1 AND is_used = 0",
                params![track_number, now],
            )
            .with_context(|| format!("failed to mark track {track_number} as used"))?;
        if changed == 1 {
            return Ok(MarkUsedOutcome::Marked);
        }

        let exists = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM tracked_units WHERE track_number = ?1)",
                params![track_number],
                |row| row.get::<_, i64>(0),
            )
            .with_context(|| format!("failed to check track {track_number}"))?;
        if exists == 1 {
            Ok(MarkUsedOutcome::AlreadyUsed)
        } else {
            Err(IngestError::NotFound(format!("track number `{track_number}`")).into())
        }
    }

    /// List tracked units, newest first, with status filter, search and paging.
    ///
    /// Search is a case-insensitive substring match (ASCII folding) over
    /// track number, product name and brand.
    ///
    /// # Errors
    /// Returns an error when a query fails or a stored row is malformed.
    pub fn list_units(&self, query: &ListUnitsQuery) -> Result<UnitPage> {
        let query = query.clone().normalized();
        let used_filter: Option<i64> = match query.status {
            UsageFilter::All => None,
            UsageFilter::Used => Some(1),
            UsageFilter::Unused => Some(0),
        };
        let pattern = format!("%{}%", escape_like(&query.search));
        let where_clause = r"WHERE (?1 IS NULL OR is_used = ?1)
              AND (?2 = '' OR track_number LIKE ?3 ESCAPE '\'
                   OR product_name LIKE ?3 ESCAPE '\'
                   OR brand LIKE ?3 ESCAPE '\')";

        let total: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM tracked_units {where_clause}"),
                params![used_filter, query.search, pattern],
                |row| row.get(0),
            )
            .context("failed to count tracked units")?;

        let limit = i64::from(query.limit);
        let offset = i64::try_from(query.offset()).context("page offset out of range")?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {UNIT_COLUMNS} FROM tracked_units {where_clause}
                 ORDER BY created_at DESC, id DESC LIMIT ?4 OFFSET ?5"
            ))
            .context("failed to prepare tracked unit listing")?;
        let rows = stmt.query_map(
            params![used_filter, query.search, pattern, limit, offset],
            UnitRow::from_row,
        )?;

        let mut units = Vec::new();
        for row in rows {
            units.push(row?.into_unit()?);
        }

        Ok(UnitPage { units, total: count_to_u64(total)?, page: query.page, limit: query.limit })
    }

    /// Append ledger records in one transaction using the largest safe chunk.
    ///
    /// # Errors
    /// Returns [`IngestError::NoValidRows`] (wrapped) for an empty slice, or the
    /// first chunk failure after rolling back every chunk.
    pub fn append_raw_signals(&mut self, records: &[RawSignalRecord]) -> Result<usize> {
        self.append_raw_signals_chunked(records, MAX_LEDGER_CHUNK_ROWS)
    }

    /// Like [`Self::append_raw_signals`] with an explicit chunk size, clamped
    /// to `1..=MAX_LEDGER_CHUNK_ROWS`.
    ///
    /// # Errors
    /// See [`Self::append_raw_signals`].
    pub fn append_raw_signals_chunked(
        &mut self,
        records: &[RawSignalRecord],
        chunk_rows: usize,
    ) -> Result<usize> {
        if records.is_empty() {
            return Err(IngestError::NoValidRows.into());
        }
        let chunk_rows = chunk_rows.clamp(1, MAX_LEDGER_CHUNK_ROWS);

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start ledger transaction")?;
        for (index, chunk) in records.chunks(chunk_rows).enumerate() {
            let placeholders = vec!["(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"; chunk.len()].join(", ");
            let sql = format!(
                "INSERT INTO raw_signal_ledger(
                   report_date, application_id, identity_key, document_ref, user_name,
                   organization, status, reject_flag, reason, created_at
                 ) VALUES {placeholders}"
            );

            let mut values = Vec::with_capacity(chunk.len() * LEDGER_COLUMNS);
            for record in chunk {
                values.push(format_rfc3339(record.report_date)?);
                values.push(record.application_id.clone());
                values.push(record.identity_key.clone());
                values.push(record.document_ref.clone());
                values.push(record.user_name.clone());
                values.push(record.organization.clone());
                values.push(record.status.clone());
                values.push(record.reject_flag.clone());
                values.push(record.reason.clone());
                values.push(format_rfc3339(record.created_at)?);
            }

            tx.execute(&sql, params_from_iter(values.iter()))
                .with_context(|| format!("failed to insert ledger chunk {index}"))?;
        }
        tx.commit().context("failed to commit ledger transaction")?;

        Ok(records.len())
    }

    /// Number of rows in the ledger.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn ledger_row_count(&self) -> Result<u64> {
        count_rows(&self.conn, "raw_signal_ledger")
    }

    /// Documents that appear on more than one ledger row.
    ///
    /// # Errors
    /// Returns an error when the report query fails.
    pub fn document_reuse_report(&self) -> Result<Vec<DocumentReuse>> {
        self.document_report(
            "SELECT document_ref, COUNT(*) AS uses FROM raw_signal_ledger
             WHERE document_ref <> ''
             GROUP BY document_ref HAVING COUNT(*) > 1
             ORDER BY uses DESC, document_ref ASC",
        )
        .context("document reuse report failed")
    }

    /// Documents used by more than one distinct identity key.
    ///
    /// # Errors
    /// Returns an error when the report query fails.
    pub fn document_identity_reuse_report(&self) -> Result<Vec<DocumentReuse>> {
        self.document_report(
            "SELECT document_ref, COUNT(DISTINCT identity_key) AS identities FROM raw_signal_ledger
             WHERE document_ref <> ''
             GROUP BY document_ref HAVING COUNT(DISTINCT identity_key) > 1
             ORDER BY identities DESC, document_ref ASC",
        )
        .context("document identity reuse report failed")
    }

    fn document_report(&self, sql: &str) -> Result<Vec<DocumentReuse>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            let (document_ref, count) = row?;
            out.push(DocumentReuse { document_ref, count: count_to_u64(count)? });
        }
        Ok(out)
    }

    /// Ledger rows per identity key, most frequent first.
    ///
    /// # Errors
    /// Returns an error when the report query fails.
    pub fn identity_frequency_report(&self) -> Result<Vec<IdentityFrequency>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT identity_key, COUNT(*) AS uses FROM raw_signal_ledger
                 GROUP BY identity_key
                 ORDER BY uses DESC, identity_key ASC",
            )
            .context("identity frequency report failed")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            let (identity_key, count) = row?;
            out.push(IdentityFrequency { identity_key, count: count_to_u64(count)? });
        }
        Ok(out)
    }

    /// `(document, identity)` pairs whose status changed over time.
    ///
    /// Rows are walked in report date order with insertion order breaking ties.
    ///
    /// # Errors
    /// Returns an error when the report query fails.
    pub fn flip_flop_status_report(&self) -> Result<Vec<StatusFlipFlop>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT document_ref, identity_key, status FROM raw_signal_ledger
                 WHERE document_ref <> ''
                 ORDER BY document_ref ASC, identity_key ASC, report_date ASC, id ASC",
            )
            .context("flip-flop status report failed")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;

        let mut out = Vec::new();
        let mut group: Option<(String, String)> = None;
        let mut statuses: Vec<String> = Vec::new();
        for row in rows {
            let (document_ref, identity_key, status) = row?;
            let same_group = group
                .as_ref()
                .is_some_and(|(doc, identity)| *doc == document_ref && *identity == identity_key);
            if !same_group {
                if let Some((doc, identity)) = group.take() {
                    push_flip_flop(&mut out, doc, identity, &statuses);
                }
                group = Some((document_ref, identity_key));
                statuses.clear();
            }
            statuses.push(status);
        }
        if let Some((doc, identity)) = group {
            push_flip_flop(&mut out, doc, identity, &statuses);
        }

        Ok(out)
    }

    /// Create or replace the profile for an identity key; latest write wins.
    ///
    /// # Errors
    /// Returns [`IngestError::Validation`] (wrapped) for a blank identity key,
    /// or a storage error.
    pub fn set_risk_profile(
        &mut self,
        identity_key: &str,
        risk_level: RiskLevel,
        flagged_by: UserId,
        reason: &str,
    ) -> Result<RiskProfile> {
        RiskProfile::validate_identity(identity_key)?;
        let identity_key = identity_key.trim();
        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT INTO risk_profiles(
                   id, identity_key, risk_level, flagged_by, reason, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(identity_key) DO UPDATE SET
                   risk_level = excluded.risk_level,
                   flagged_by = excluded.flagged_by,
                   reason = excluded.reason,
                   updated_at = excluded.updated_at",
                params![
                    RiskProfileId::new().to_string(),
                    identity_key,
                    risk_level.as_str(),
                    flagged_by.to_string(),
                    reason,
                    now,
                ],
            )
            .with_context(|| format!("failed to upsert risk profile for {identity_key}"))?;

        self.get_risk_profile(identity_key)?
            .ok_or_else(|| anyhow!("risk profile for {identity_key} vanished after upsert"))
    }

    /// # Errors
    /// Returns an error when the query fails or the stored row is malformed.
    pub fn get_risk_profile(&self, identity_key: &str) -> Result<Option<RiskProfile>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {RISK_PROFILE_COLUMNS} FROM risk_profiles WHERE identity_key = ?1"),
                params![identity_key.trim()],
                ProfileRow::from_row,
            )
            .optional()
            .with_context(|| format!("failed to load risk profile for {identity_key}"))?;
        row.map(ProfileRow::into_profile).transpose()
    }

    /// All risk profiles, most recently updated first.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored row is malformed.
    pub fn list_risk_profiles(&self) -> Result<Vec<RiskProfile>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RISK_PROFILE_COLUMNS} FROM risk_profiles ORDER BY updated_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map([], ProfileRow::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_profile()?);
        }
        Ok(out)
    }

    /// # Errors
    /// Returns [`IngestError::NotFound`] (wrapped) when no profile has this id.
    pub fn delete_risk_profile(&mut self, id: RiskProfileId) -> Result<()> {
        let changed = self
            .conn
            .execute("DELETE FROM risk_profiles WHERE id = ?1", params![id.to_string()])
            .with_context(|| format!("failed to delete risk profile {id}"))?;
        if changed == 0 {
            return Err(IngestError::NotFound(format!("risk profile {id}")).into());
        }
        Ok(())
    }

    /// Run quick-check, table counts, and schema status checks.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let schema_status = self.schema_status()?;
        let table_counts = if schema_status.current_version >= 1 {
            TableCounts {
                tracked_units: count_rows(&self.conn, "tracked_units")?,
                raw_signal_ledger: count_rows(&self.conn, "raw_signal_ledger")?,
                risk_profiles: count_rows(&self.conn, "risk_profiles")?,
            }
        } else {
            TableCounts { tracked_units: 0, raw_signal_ledger: 0, risk_profiles: 0 }
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            table_counts,
            schema_status,
        })
    }
}

struct UnitRow {
    id: String,
    track_number: String,
    marketplace: String,
    country: String,
    brand: String,
    product_name: String,
    serial_ref: String,
    is_used: i64,
    upload_timestamp: String,
    uploader_id: String,
    created_at: String,
    updated_at: String,
}

impl UnitRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            track_number: row.get(1)?,
            marketplace: row.get(2)?,
            country: row.get(3)?,
            brand: row.get(4)?,
            product_name: row.get(5)?,
            serial_ref: row.get(6)?,
            is_used: row.get(7)?,
            upload_timestamp: row.get(8)?,
            uploader_id: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_unit(self) -> Result<TrackedUnit> {
        Ok(TrackedUnit {
            id: UnitId::parse(&self.id)?,
            track_number: self.track_number,
            marketplace: self.marketplace,
            country: self.country,
            brand: self.brand,
            product_name: self.product_name,
            serial_ref: self.serial_ref,
            is_used: self.is_used != 0,
            upload_timestamp: parse_timestamp(&self.upload_timestamp)?,
            uploader_id: UserId::parse(&self.uploader_id)?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

struct ProfileRow {
    id: String,
    identity_key: String,
    risk_level: String,
    flagged_by: String,
    reason: String,
    created_at: String,
    updated_at: String,
}

impl ProfileRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            identity_key: row.get(1)?,
            risk_level: row.get(2)?,
            flagged_by: row.get(3)?,
            reason: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_profile(self) -> Result<RiskProfile> {
        let risk_level = RiskLevel::parse(&self.risk_level)
            .ok_or_else(|| anyhow!("invalid risk_level in database: {}", self.risk_level))?;
        Ok(RiskProfile {
            id: RiskProfileId::parse(&self.id)?,
            identity_key: self.identity_key,
            risk_level,
            flagged_by: UserId::parse(&self.flagged_by)?,
            reason: self.reason,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn push_flip_flop(
    out: &mut Vec<StatusFlipFlop>,
    document_ref: String,
    identity_key: String,
    statuses: &[String],
) {
    if let Some(trace) = status_trace(statuses.iter().map(String::as_str)) {
        out.push(StatusFlipFlop { document_ref, identity_key, statuses: trace });
    }
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn count_rows(conn: &Connection, table: &str) -> Result<u64> {
    let count: i64 = conn
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .with_context(|| format!("failed to count rows in {table}"))?;
    count_to_u64(count)
}

fn count_to_u64(count: i64) -> Result<u64> {
    u64::try_from(count).with_context(|| format!("negative row count {count}"))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = format_rfc3339(now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn parse_timestamp(value: &str) -> Result<OffsetDateTime> {
    parse_rfc3339_utc(value).with_context(|| format!("invalid timestamp in database: {value}"))
}
