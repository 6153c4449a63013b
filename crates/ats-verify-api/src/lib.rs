use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{Context, Result};
use ats_verify_core::{
    now_utc, AnalyticsReports, BulkLookup, DiagnosticKind, IngestError, IngestionResult, LedgerLoadResult,
    ListUnitsQuery, MarkUsedOutcome, Normalizer, RawRow, ReadError, ReaderOptions, ReportFailure,
    ReportKind, RiskLevel, RiskProfile, RiskProfileId, RowDiagnostic, RowReader,
    UnitPage, UploadContext, UserId,
};
use ats_verify_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore, MAX_LEDGER_CHUNK_ROWS};
use serde::{Deserialize, Serialize};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetRiskProfileRequest {
    pub identity_key: String,
    pub risk_level: RiskLevel,
    pub flagged_by: UserId,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct AtsVerifyApi {
    db_path: PathBuf,
    normalizer: Normalizer,
    reader_options: ReaderOptions,
    ledger_chunk_rows: usize,
}

impl AtsVerifyApi {
    #[must_use]
    pub fn new(db_path: PathBuf, normalizer: Normalizer) -> Self {
        Self {
            db_path,
            normalizer,
            reader_options: ReaderOptions::default(),
            ledger_chunk_rows: MAX_LEDGER_CHUNK_ROWS,
        }
    }

    #[must_use]
    pub fn with_reader_options(mut self, reader_options: ReaderOptions) -> Self {
        self.reader_options = reader_options;
        self
    }

    /// Override the ledger insert chunk size (clamped by the store).
    #[must_use]
    pub fn with_ledger_chunk_rows(mut self, chunk_rows: usize) -> Self {
        self.ledger_chunk_rows = chunk_rows;
        self
    }

    #[must_use]
    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
            .with_context(|| format!("failed to open store at {}", self.db_path.display()))
    }

    /// Open the store, migrating only when the schema is behind so that reads
    /// against a current database never write.
    fn open_current_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        if !store.schema_is_current()? {
            store.migrate().context("failed to bring schema up to date")?;
        }
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when an integrity check fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// Ingest a parcel file: one header row, then 7-column rows.
    ///
    /// Every row is decided on its own; row-level problems end up in
    /// `errors` and never abort the run.
    ///
    /// # Errors
    /// Returns [`IngestError::UnreadableHeader`] or [`IngestError::Stream`]
    /// (wrapped) when the input itself cannot be read, or a storage error when
    /// the database cannot be opened.
    pub fn ingest_parcels<R: BufRead>(
        &self,
        input: R,
        context: &UploadContext,
    ) -> Result<IngestionResult> {
        let mut store = self.open_current_store()?;
        let mut rows = RowReader::with_options(input, self.reader_options);
        skip_header(&mut rows)?;

        let now = now_utc();
        let mut result = IngestionResult::default();
        for item in rows {
            let Some(row) = next_row(item, &mut result.diagnostics)? else {
                continue;
            };
            result.total_processed += 1;

            let draft = match self.normalizer.parcel(&row, context, now) {
                Ok(draft) => draft,
                Err(rejection) => {
                    tracing::debug!(line = row.line, %rejection, "parcel row rejected");
                    result.push_diagnostic(
                        row.line,
                        self.normalizer.track_number(&row).as_deref(),
                        DiagnosticKind::Rejected,
                        rejection.to_string(),
                    );
                    continue;
                }
            };

            match store.upsert_tracked_unit(&draft) {
                Ok(outcome) => {
                    tracing::debug!(line = row.line, track_number = %draft.track_number, ?outcome, "parcel row applied");
                    result.record_outcome(row.line, &draft.track_number, outcome);
                }
                Err(err) => {
                    tracing::debug!(line = row.line, track_number = %draft.track_number, error = %format!("{err:#}"), "parcel row failed to persist");
                    result.push_diagnostic(
                        row.line,
                        Some(&draft.track_number),
                        DiagnosticKind::StorageFailed,
                        format!("{err:#}"),
                    );
                }
            }
        }

        tracing::info!(
            uploader_id = %context.uploader_id,
            total_processed = result.total_processed,
            inserted = result.inserted,
            updated = result.updated,
            skipped = result.skipped,
            errors = result.diagnostics.len(),
            "parcel ingestion finished"
        );
        Ok(result)
    }

    /// Ingest a risk file: one header row, then 9-column rows appended to the
    /// ledger in a single transaction.
    ///
    /// # Errors
    /// Returns [`IngestError::NoValidRows`] (wrapped) when no row survives
    /// normalization, a header/stream error, or the ledger transaction failure.
    pub fn ingest_risk_ledger<R: BufRead>(&self, input: R) -> Result<LedgerLoadResult> {
        let mut store = self.open_current_store()?;
        let mut rows = RowReader::with_options(input, self.reader_options);
        skip_header(&mut rows)?;

        let now = now_utc();
        let mut result = LedgerLoadResult::default();
        let mut records = Vec::new();
        for item in rows {
            let Some(row) = next_row(item, &mut result.diagnostics)? else {
                result.rows_rejected += 1;
                continue;
            };
            match self.normalizer.raw_signal(&row, now) {
                Ok(record) => records.push(record),
                Err(rejection) => {
                    tracing::debug!(line = row.line, %rejection, "risk row rejected");
                    result.rows_rejected += 1;
                    result.diagnostics.push(RowDiagnostic {
                        line: row.line,
                        track_number: None,
                        kind: DiagnosticKind::Rejected,
                        message: rejection.to_string(),
                    });
                }
            }
        }

        if records.is_empty() {
            tracing::info!(rows_rejected = result.rows_rejected, "risk file had no valid rows");
            return Err(IngestError::NoValidRows.into());
        }

        result.rows_persisted = store.append_raw_signals_chunked(&records, self.ledger_chunk_rows)?;
        tracing::info!(
            rows_persisted = result.rows_persisted,
            rows_rejected = result.rows_rejected,
            "risk ledger load finished"
        );
        Ok(result)
    }

    /// Run all four ledger reports. A failing report is left empty and named
    /// in `failures` while the others are still returned.
    ///
    /// # Errors
    /// Returns an error only when the database cannot be opened.
    pub fn analytics_reports(&self) -> Result<AnalyticsReports> {
        let store = self.open_current_store()?;
        let mut failures = Vec::new();

        let document_reuse =
            fail_open(&mut failures, ReportKind::DocumentReuse, store.document_reuse_report());
        let document_identity_reuse = fail_open(
            &mut failures,
            ReportKind::DocumentIdentityReuse,
            store.document_identity_reuse_report(),
        );
        let identity_frequency = fail_open(
            &mut failures,
            ReportKind::IdentityFrequency,
            store.identity_frequency_report(),
        );
        let flip_flop_status =
            fail_open(&mut failures, ReportKind::FlipFlopStatus, store.flip_flop_status_report());

        Ok(AnalyticsReports {
            document_reuse,
            document_identity_reuse,
            identity_frequency,
            flip_flop_status,
            failures,
        })
    }

    /// # Errors
    /// Returns an error when a lookup query fails.
    pub fn lookup_tracks(&self, track_numbers: &[String]) -> Result<BulkLookup> {
        let store = self.open_current_store()?;
        Ok(BulkLookup::from_results(store.bulk_lookup(track_numbers)?))
    }

    /// # Errors
    /// Returns [`IngestError::NotFound`] (wrapped) for unknown track numbers.
    pub fn mark_used(&self, track_number: &str) -> Result<MarkUsedOutcome> {
        let mut store = self.open_current_store()?;
        let outcome = store.mark_used(track_number)?;
        tracing::info!(track_number = track_number.trim(), ?outcome, "mark used");
        Ok(outcome)
    }

    /// # Errors
    /// Returns an error when the listing query fails.
    pub fn list_units(&self, query: &ListUnitsQuery) -> Result<UnitPage> {
        let store = self.open_current_store()?;
        store.list_units(query)
    }

    /// # Errors
    /// Returns a validation error for a blank identity key, or a storage error.
    pub fn set_risk_profile(&self, input: SetRiskProfileRequest) -> Result<RiskProfile> {
        let mut store = self.open_current_store()?;
        store.set_risk_profile(&input.identity_key, input.risk_level, input.flagged_by, &input.reason)
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn get_risk_profile(&self, identity_key: &str) -> Result<Option<RiskProfile>> {
        let store = self.open_current_store()?;
        store.get_risk_profile(identity_key)
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_risk_profiles(&self) -> Result<Vec<RiskProfile>> {
        let store = self.open_current_store()?;
        store.list_risk_profiles()
    }

    /// # Errors
    /// Returns [`IngestError::NotFound`] (wrapped) when no profile has this id.
    pub fn delete_risk_profile(&self, id: RiskProfileId) -> Result<()> {
        let mut store = self.open_current_store()?;
        store.delete_risk_profile(id)
    }
}

fn skip_header<R: BufRead>(rows: &mut RowReader<R>) -> Result<()> {
    match rows.next() {
        Some(Ok(_)) => Ok(()),
        Some(Err(err)) => Err(IngestError::UnreadableHeader(err.to_string()).into()),
        None => Err(IngestError::UnreadableHeader("input is empty".to_string()).into()),
    }
}

/// Unwrap one reader item: a malformed row becomes a diagnostic and `None`,
/// a stream failure aborts.
fn next_row(
    item: Result<RawRow, ReadError>,
    diagnostics: &mut Vec<RowDiagnostic>,
) -> Result<Option<RawRow>> {
    match item {
        Ok(row) => Ok(Some(row)),
        Err(ReadError::Row(err)) => {
            tracing::debug!(line = err.line(), %err, "malformed row skipped");
            diagnostics.push(RowDiagnostic {
                line: err.line(),
                track_number: None,
                kind: DiagnosticKind::MalformedRow,
                message: err.to_string(),
            });
            Ok(None)
        }
        Err(ReadError::Io(err)) => Err(IngestError::Stream(err.to_string()).into()),
    }
}

fn fail_open<T>(
    failures: &mut Vec<ReportFailure>,
    report: ReportKind,
    outcome: Result<Vec<T>>,
) -> Vec<T> {
    match outcome {
        Ok(rows) => rows,
        Err(err) => {
            let error = format!("{err:#}");
            tracing::warn!(?report, %error, "analytics report failed");
            failures.push(ReportFailure { report, error });
            Vec::new()
        }
    }
}
