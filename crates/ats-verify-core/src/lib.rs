use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

pub mod normalize;
pub mod reader;

pub use normalize::{NormalizerConfig, Normalizer, Rejection, PARCEL_COLUMNS, RISK_COLUMNS};
pub use reader::{RawRow, ReadError, ReaderOptions, RowError, RowReader};

/// Separator used when rendering a status history as a single trace string.
pub const STATUS_TRACE_SEPARATOR: &str = " -> ";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IngestError {
    #[error("unreadable header row: {0}")]
    UnreadableHeader(String),
    #[error("input stream failed: {0}")]
    Stream(String),
    #[error("input contains no valid data rows")]
    NoValidRows,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
}

macro_rules! ulid_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
        )]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parse a canonical ULID string.
            ///
            /// # Errors
            /// Returns [`IngestError::Validation`] when `raw` is not a ULID.
            pub fn parse(raw: &str) -> Result<Self, IngestError> {
                Ulid::from_str(raw.trim()).map(Self).map_err(|err| {
                    IngestError::Validation(format!(
                        "invalid {} `{raw}`: {err}",
                        stringify!($name)
                    ))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(UnitId);
ulid_id!(UserId);
ulid_id!(RiskProfileId);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Green,
    Yellow,
    Red,
}

impl RiskLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Green => "green",
            Self::Yellow => "yellow",
            Self::Red => "red",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "green" => Some(Self::Green),
            "yellow" => Some(Self::Yellow),
            "red" => Some(Self::Red),
            _ => None,
        }
    }
}

/// A tracked unit (parcel) as persisted in the uniquely-keyed store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackedUnit {
    pub id: UnitId,
    pub track_number: String,
    pub marketplace: String,
    pub country: String,
    pub brand: String,
    pub product_name: String,
    pub serial_ref: String,
    pub is_used: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub upload_timestamp: OffsetDateTime,
    pub uploader_id: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// The mutable part of a tracked unit, produced by the normalizer from one row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackedUnitDraft {
    pub track_number: String,
    pub marketplace: String,
    pub country: String,
    pub brand: String,
    pub product_name: String,
    pub serial_ref: String,
    #[serde(with = "time::serde::rfc3339")]
    pub upload_timestamp: OffsetDateTime,
    pub uploader_id: UserId,
}

/// One append-only ledger row. Never mutated after insert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawSignalRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub report_date: OffsetDateTime,
    pub application_id: String,
    pub identity_key: String,
    pub document_ref: String,
    pub user_name: String,
    pub organization: String,
    pub status: String,
    pub reject_flag: String,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RiskProfile {
    pub id: RiskProfileId,
    pub identity_key: String,
    pub risk_level: RiskLevel,
    pub flagged_by: UserId,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl RiskProfile {
    /// Validate the caller-supplied parts of a risk profile write.
    ///
    /// # Errors
    /// Returns [`IngestError::Validation`] when the identity key is blank.
    pub fn validate_identity(identity_key: &str) -> Result<(), IngestError> {
        if identity_key.trim().is_empty() {
            return Err(IngestError::Validation("identity_key MUST be provided".to_string()));
        }
        Ok(())
    }
}

/// Who is uploading, as already verified by the authentication layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadContext {
    pub uploader_id: UserId,
    pub marketplace_prefix: Option<String>,
}

/// Prefix → marketplace name table. Injected configuration, never global state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct MarketplaceDirectory {
    prefixes: BTreeMap<String, String>,
}

impl MarketplaceDirectory {
    #[must_use]
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let prefixes = pairs
            .into_iter()
            .map(|(prefix, name)| (prefix.as_ref().trim().to_lowercase(), name.into()))
            .collect();
        Self { prefixes }
    }

    /// Load a directory from a JSON object of `"prefix": "Marketplace Name"` pairs.
    ///
    /// # Errors
    /// Returns [`IngestError::Validation`] when the document is not such an object.
    pub fn from_json_str(raw: &str) -> Result<Self, IngestError> {
        let pairs: BTreeMap<String, String> = serde_json::from_str(raw).map_err(|err| {
            IngestError::Validation(format!("invalid marketplace directory: {err}"))
        })?;
        Ok(Self::from_pairs(pairs))
    }

    /// Resolve an uploader prefix to a marketplace name. Unknown prefixes are
    /// used verbatim; a blank prefix resolves to nothing.
    #[must_use]
    pub fn resolve(&self, prefix: &str) -> Option<String> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return None;
        }
        Some(
            self.prefixes
                .get(&prefix.to_lowercase())
                .cloned()
                .unwrap_or_else(|| prefix.to_string()),
        )
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}

/// What the dedup engine does with one incoming row.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum UpsertAction {
    Insert,
    Overwrite,
    Reject,
}

impl UpsertAction {
    /// Decide from the persisted `is_used` flag of the key, if the key exists.
    #[must_use]
    pub fn decide(existing_is_used: Option<bool>) -> Self {
        match existing_is_used {
            None => Self::Insert,
            Some(false) => Self::Overwrite,
            Some(true) => Self::Reject,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    SkippedUsed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    MalformedRow,
    Rejected,
    SkippedUsed,
    StorageFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RowDiagnostic {
    /// 1-based physical line where the row starts; the header is line 1.
    pub line: usize,
    pub track_number: Option<String>,
    pub kind: DiagnosticKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestionResult {
    pub total_processed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    #[serde(rename = "errors")]
    pub diagnostics: Vec<RowDiagnostic>,
}

impl IngestionResult {
    pub fn record_outcome(&mut self, line: usize, track_number: &str, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::SkippedUsed => {
                self.skipped += 1;
                self.diagnostics.push(RowDiagnostic {
                    line,
                    track_number: Some(track_number.to_string()),
                    kind: DiagnosticKind::SkippedUsed,
                    message: "track already used (is_used=true); cannot overwrite".to_string(),
                });
            }
        }
    }

    pub fn push_diagnostic(
        &mut self,
        line: usize,
        track_number: Option<&str>,
        kind: DiagnosticKind,
        message: impl Into<String>,
    ) {
        self.diagnostics.push(RowDiagnostic {
            line,
            track_number: track_number.map(str::to_string),
            kind,
            message: message.into(),
        });
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerLoadResult {
    pub rows_persisted: usize,
    pub rows_rejected: usize,
    #[serde(rename = "errors")]
    pub diagnostics: Vec<RowDiagnostic>,
}

/// Documents seen more than once. For the identity variant `count` is the
/// number of distinct identity keys that used the document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentReuse {
    pub document_ref: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityFrequency {
    pub identity_key: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusFlipFlop {
    pub document_ref: String,
    pub identity_key: String,
    pub statuses: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    DocumentReuse,
    DocumentIdentityReuse,
    IdentityFrequency,
    FlipFlopStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportFailure {
    pub report: ReportKind,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalyticsReports {
    pub document_reuse: Vec<DocumentReuse>,
    pub document_identity_reuse: Vec<DocumentReuse>,
    pub identity_frequency: Vec<IdentityFrequency>,
    pub flip_flop_status: Vec<StatusFlipFlop>,
    #[serde(default)]
    pub failures: Vec<ReportFailure>,
}

/// Collapse a date-ordered status history into a trace such as `NEW -> REJECTED`.
///
/// Consecutive repeats are folded, so `NEW, NEW, REJECTED, NEW` renders as
/// `NEW -> REJECTED -> NEW`. Returns `None` unless more than one distinct
/// status occurs.
#[must_use]
pub fn status_trace<'a, I>(statuses: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut trace: Vec<&str> = Vec::new();
    let mut distinct = std::collections::BTreeSet::new();
    for status in statuses {
        distinct.insert(status);
        if trace.last() != Some(&status) {
            trace.push(status);
        }
    }
    (distinct.len() > 1).then(|| trace.join(STATUS_TRACE_SEPARATOR))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UsageFilter {
    #[default]
    All,
    Used,
    Unused,
}

impl UsageFilter {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" | "all" => Some(Self::All),
            "used" => Some(Self::Used),
            "unused" => Some(Self::Unused),
            _ => None,
        }
    }
}

pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ListUnitsQuery {
    #[serde(default)]
    pub status: UsageFilter,
    #[serde(default)]
    pub search: String,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub limit: u32,
}

impl ListUnitsQuery {
    /// Clamp paging to `page >= 1` and `1..=100` rows, defaulting to 20.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.page = self.page.max(1);
        if self.limit == 0 || self.limit > MAX_PAGE_LIMIT {
            self.limit = DEFAULT_PAGE_LIMIT;
        }
        self.search = self.search.trim().to_string();
        self
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitPage {
    pub units: Vec<TrackedUnit>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackLookup {
    pub track_number: String,
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<TrackedUnit>,
}

/// Per-track lookups plus found/missing totals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BulkLookup {
    pub total: usize,
    pub found: usize,
    pub missing: usize,
    pub results: Vec<TrackLookup>,
}

impl BulkLookup {
    #[must_use]
    pub fn from_results(results: Vec<TrackLookup>) -> Self {
        let found = results.iter().filter(|lookup| lookup.found).count();
        Self { total: results.len(), found, missing: results.len() - found, results }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MarkUsedOutcome {
    Marked,
    AlreadyUsed,
}

/// Current UTC time truncated to whole seconds, so persisted RFC 3339 text
/// sorts chronologically.
#[must_use]
pub fn now_utc() -> OffsetDateTime {
    truncate_to_seconds(OffsetDateTime::now_utc())
}

#[must_use]
pub fn truncate_to_seconds(value: OffsetDateTime) -> OffsetDateTime {
    value.to_offset(time::UtcOffset::UTC).replace_nanosecond(0).unwrap_or(value)
}

/// Format a timestamp as RFC 3339 in UTC.
///
/// # Errors
/// Returns [`IngestError::Validation`] when the value cannot be represented.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, IngestError> {
    value
        .to_offset(time::UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| IngestError::Validation(format!("failed to format timestamp: {err}")))
}

/// Parse an RFC 3339 timestamp and normalize it to UTC.
///
/// # Errors
/// Returns [`IngestError::Validation`] for malformed input.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, IngestError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map(|parsed| parsed.to_offset(time::UtcOffset::UTC))
        .map_err(|err| IngestError::Validation(format!("invalid RFC3339 timestamp `{value}`: {err}")))
}
