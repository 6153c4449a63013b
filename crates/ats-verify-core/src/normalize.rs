//! Positional row → domain draft mapping.

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, OffsetDateTime, Time};

use crate::{
    truncate_to_seconds, MarketplaceDirectory, RawRow, RawSignalRecord, TrackedUnitDraft,
    UploadContext,
};

/// Minimum column count of a parcel row.
pub const PARCEL_COLUMNS: usize = 7;
/// Minimum column count of a risk ledger row.
pub const RISK_COLUMNS: usize = 9;
const PARCEL_TRACK_NUMBER: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizerConfig {
    /// Literal tokens that mean "no value".
    #[serde(default = "default_null_tokens")]
    pub null_tokens: Vec<String>,
    /// Identity keys that are never a real taxpayer.
    #[serde(default = "default_identity_sentinels")]
    pub identity_sentinels: Vec<String>,
}

fn default_null_tokens() -> Vec<String> {
    vec!["<nil>".to_string()]
}

fn default_identity_sentinels() -> Vec<String> {
    vec!["0".to_string()]
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            null_tokens: default_null_tokens(),
            identity_sentinels: default_identity_sentinels(),
        }
    }
}

/// Why a row was not turned into a draft.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("expected at least {expected} columns, found {found}")]
    TooFewColumns { expected: usize, found: usize },
    #[error("track_number is empty")]
    MissingTrackNumber,
    #[error("marketplace is empty and no uploader prefix was supplied")]
    MissingMarketplace,
    #[error("required fields are empty: {}", fields.join(", "))]
    Incomplete { fields: Vec<&'static str> },
    #[error("identity key `{value}` is empty or a sentinel")]
    MissingIdentity { value: String },
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    config: NormalizerConfig,
    directory: MarketplaceDirectory,
}

impl Normalizer {
    #[must_use]
    pub fn new(config: NormalizerConfig, directory: MarketplaceDirectory) -> Self {
        Self { config, directory }
    }

    #[must_use]
    pub fn directory(&self) -> &MarketplaceDirectory {
        &self.directory
    }

    #[must_use]
    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// The cleaned track number of a parcel row, for diagnostics.
    #[must_use]
    pub fn track_number(&self, row: &RawRow) -> Option<String> {
        row.field(PARCEL_TRACK_NUMBER).map(|raw| self.clean(raw)).filter(|track| !track.is_empty())
    }

    /// Map one parcel row to a draft.
    ///
    /// `now` is the ingestion wall clock, used when the row's date is empty or
    /// unparseable.
    ///
    /// # Errors
    /// Returns a [`Rejection`] when the row is too short or incomplete.
    pub fn parcel(
        &self,
        row: &RawRow,
        context: &UploadContext,
        now: OffsetDateTime,
    ) -> Result<TrackedUnitDraft, Rejection> {
        let fields = self.cleaned(row, PARCEL_COLUMNS)?;
        let [in_row_marketplace, country, brand, product_name, track_number, serial_ref, date] =
            [0, 1, 2, 3, 4, 5, 6].map(|index| fields[index].clone());

        if track_number.is_empty() {
            return Err(Rejection::MissingTrackNumber);
        }

        let marketplace = context
            .marketplace_prefix
            .as_deref()
            .and_then(|prefix| self.directory.resolve(prefix))
            .unwrap_or(in_row_marketplace);
        if marketplace.is_empty() {
            return Err(Rejection::MissingMarketplace);
        }

        let missing: Vec<&'static str> = [
            ("country", &country),
            ("brand", &brand),
            ("product_name", &product_name),
        ]
        .into_iter()
        .filter(|(_, value)| value.is_empty())
        .map(|(name, _)| name)
        .collect();
        if !missing.is_empty() {
            return Err(Rejection::Incomplete { fields: missing });
        }

        Ok(TrackedUnitDraft {
            track_number,
            marketplace,
            country,
            brand,
            product_name,
            serial_ref,
            upload_timestamp: parse_row_date(&date, now),
            uploader_id: context.uploader_id,
        })
    }

    /// Map one risk ledger row to a record.
    ///
    /// # Errors
    /// Returns a [`Rejection`] when the row is too short or carries no usable identity.
    pub fn raw_signal(&self, row: &RawRow, now: OffsetDateTime) -> Result<RawSignalRecord, Rejection> {
        let fields = self.cleaned(row, RISK_COLUMNS)?;
        let [date, application_id, identity_key, document_ref, user_name, organization, status, reject_flag, reason] =
            [0, 1, 2, 3, 4, 5, 6, 7, 8].map(|index| fields[index].clone());

        if identity_key.is_empty() || self.config.identity_sentinels.contains(&identity_key) {
            return Err(Rejection::MissingIdentity { value: identity_key });
        }

        Ok(RawSignalRecord {
            report_date: parse_row_date(&date, now),
            application_id,
            identity_key,
            document_ref,
            user_name,
            organization,
            status,
            reject_flag,
            reason,
            created_at: truncate_to_seconds(now),
        })
    }

    fn cleaned(&self, row: &RawRow, expected: usize) -> Result<Vec<String>, Rejection> {
        if row.len() < expected {
            return Err(Rejection::TooFewColumns { expected, found: row.len() });
        }
        Ok(row.fields[..expected].iter().map(|raw| self.clean(raw)).collect())
    }

    fn clean(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        if self.config.null_tokens.iter().any(|token| token == trimmed) {
            String::new()
        } else {
            trimmed.to_string()
        }
    }
}

/// Parse a row date as `YYYY-MM-DD` or `DD.MM.YYYY` (midnight UTC).
///
/// Any time part after a space or `T` is ignored. Falls back to `fallback`
/// truncated to whole seconds.
#[must_use]
pub fn parse_row_date(raw: &str, fallback: OffsetDateTime) -> OffsetDateTime {
    let token = raw.trim().split([' ', 'T']).next().unwrap_or_default();
    Date::parse(token, format_description!("[year]-[month]-[day]"))
        .or_else(|_| Date::parse(token, format_description!("[day].[month].[year]")))
        .map(|date| date.with_time(Time::MIDNIGHT).assume_utc())
        .unwrap_or_else(|_| truncate_to_seconds(fallback))
}
