//! Lenient, single-pass tabular row reader.
//!
//! The reader is deliberately forgiving: ragged rows are passed through as-is,
//! a stray quote in an unquoted field is kept literally, and a row that cannot
//! be decoded yields a [`RowError`] while the stream keeps going. Only an I/O
//! failure on the underlying reader is fatal.

use std::io::{BufRead, Read};

pub const DEFAULT_MAX_RECORD_LINES: usize = 64;
pub const DEFAULT_MAX_RECORD_BYTES: usize = 1 << 20;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const SNIFF_CANDIDATES: [u8; 3] = [b',', b';', b'\t'];
/// Bytes a physical line may carry beyond its content: BOM plus `\r\n`.
const LINE_SLACK: usize = UTF8_BOM.len() + 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    /// 1-based physical line the row starts on.
    pub line: usize,
    pub fields: Vec<String>,
}

impl RawRow {
    #[must_use]
    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A single malformed row. Reading can continue after it.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RowError {
    #[error("line {line}: row is not valid UTF-8")]
    InvalidUtf8 { line: usize },
    #[error("line {line}: quoted field is never closed")]
    UnterminatedQuote { line: usize },
    #[error("line {line}: row exceeds {limit} bytes")]
    TooLong { line: usize, limit: usize },
}

impl RowError {
    #[must_use]
    pub fn line(&self) -> usize {
        match self {
            Self::InvalidUtf8 { line }
            | Self::UnterminatedQuote { line }
            | Self::TooLong { line, .. } => *line,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error(transparent)]
    Row(#[from] RowError),
    #[error("failed to read input stream: {0}")]
    Io(#[from] std::io::Error),
}

impl ReadError {
    /// Whether the stream itself failed; after a fatal error the reader is exhausted.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderOptions {
    /// Field delimiter; sniffed from the first record when `None`.
    pub delimiter: Option<u8>,
    /// Physical lines a quoted field may span before the row is abandoned.
    pub max_record_lines: usize,
    pub max_record_bytes: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            delimiter: None,
            max_record_lines: DEFAULT_MAX_RECORD_LINES,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
        }
    }
}

enum PhysicalLine {
    Line(Vec<u8>),
    TooLong,
    Eof,
}

/// Iterator over the rows of one byte stream. Not restartable.
pub struct RowReader<R> {
    inner: R,
    options: ReaderOptions,
    delimiter: Option<u8>,
    line: usize,
    done: bool,
}

impl<R: BufRead> RowReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_options(inner, ReaderOptions::default())
    }

    pub fn with_options(inner: R, options: ReaderOptions) -> Self {
        Self { inner, delimiter: options.delimiter, options, line: 0, done: false }
    }

    /// The delimiter in use, once known.
    #[must_use]
    pub fn delimiter(&self) -> Option<u8> {
        self.delimiter
    }

    /// Read one physical line holding at most `budget` content bytes.
    ///
    /// Never buffers more than `budget + LINE_SLACK` bytes; the remainder of
    /// an oversized line is consumed without being kept.
    fn read_physical_line(&mut self, budget: usize) -> std::io::Result<PhysicalLine> {
        let cap = budget.saturating_add(LINE_SLACK);
        let mut buf = Vec::new();
        let read = (&mut self.inner)
            .take(u64::try_from(cap).unwrap_or(u64::MAX))
            .read_until(b'\n', &mut buf)?;
        if read == 0 {
            return Ok(PhysicalLine::Eof);
        }
        self.line += 1;

        let has_newline = buf.last() == Some(&b'\n');
        if !has_newline && buf.len() >= cap {
            self.skip_rest_of_line()?;
            return Ok(PhysicalLine::TooLong);
        }
        if has_newline {
            buf.pop();
        }
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        if self.line == 1 && buf.starts_with(UTF8_BOM) {
            buf.drain(..UTF8_BOM.len());
        }
        if buf.len() > budget {
            return Ok(PhysicalLine::TooLong);
        }
        Ok(PhysicalLine::Line(buf))
    }

    fn skip_rest_of_line(&mut self) -> std::io::Result<()> {
        loop {
            let available = self.inner.fill_buf()?;
            if available.is_empty() {
                return Ok(());
            }
            if let Some(index) = available.iter().position(|byte| *byte == b'\n') {
                self.inner.consume(index + 1);
                return Ok(());
            }
            let len = available.len();
            self.inner.consume(len);
        }
    }

    fn fail(&mut self, err: std::io::Error) -> Option<Result<RawRow, ReadError>> {
        self.done = true;
        Some(Err(ReadError::Io(err)))
    }
}

impl<R: BufRead> Iterator for RowReader<R> {
    type Item = Result<RawRow, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let limit = self.options.max_record_bytes;
        let mut record = loop {
            match self.read_physical_line(limit) {
                Ok(PhysicalLine::Line(line)) if line.iter().all(u8::is_ascii_whitespace) => {}
                Ok(PhysicalLine::Line(line)) => break line,
                Ok(PhysicalLine::TooLong) => {
                    return Some(Err(RowError::TooLong { line: self.line, limit }.into()));
                }
                Ok(PhysicalLine::Eof) => {
                    self.done = true;
                    return None;
                }
                Err(err) => return self.fail(err),
            }
        };
        let start_line = self.line;
        let delimiter = *self.delimiter.get_or_insert_with(|| sniff_delimiter(&record));

        let mut lines_used = 1;
        let fields = loop {
            let (fields, open_quote) = tokenize(&record, delimiter);
            if !open_quote {
                break fields;
            }
            if lines_used >= self.options.max_record_lines {
                return Some(Err(RowError::UnterminatedQuote { line: start_line }.into()));
            }
            let budget = limit.saturating_sub(record.len() + 1);
            match self.read_physical_line(budget) {
                Ok(PhysicalLine::Line(next)) => {
                    record.push(b'\n');
                    record.extend_from_slice(&next);
                    lines_used += 1;
                }
                Ok(PhysicalLine::TooLong) => {
                    return Some(Err(RowError::TooLong { line: start_line, limit }.into()));
                }
                Ok(PhysicalLine::Eof) => {
                    self.done = true;
                    return Some(Err(RowError::UnterminatedQuote { line: start_line }.into()));
                }
                Err(err) => return self.fail(err),
            }
        };

        let mut decoded = Vec::with_capacity(fields.len());
        for field in fields {
            match String::from_utf8(field) {
                Ok(text) => decoded.push(text),
                Err(_) => return Some(Err(RowError::InvalidUtf8 { line: start_line }.into())),
            }
        }

        Some(Ok(RawRow { line: start_line, fields: decoded }))
    }
}

/// Pick the candidate delimiter that occurs most often outside quotes.
fn sniff_delimiter(first_line: &[u8]) -> u8 {
    let mut counts = [0_usize; SNIFF_CANDIDATES.len()];
    let mut in_quotes = false;
    for byte in first_line {
        if *byte == b'"' {
            in_quotes = !in_quotes;
            continue;
        }
        if in_quotes {
            continue;
        }
        if let Some(slot) = SNIFF_CANDIDATES.iter().position(|candidate| candidate == byte) {
            counts[slot] += 1;
        }
    }

    let mut best = 0;
    for slot in 1..SNIFF_CANDIDATES.len() {
        if counts[slot] > counts[best] {
            best = slot;
        }
    }
    SNIFF_CANDIDATES[best]
}

/// Split one logical record into raw field bytes.
///
/// Returns the fields and whether a quoted field is still open at the end.
/// A quote only opens a field when it is the first non-blank byte; `""`
/// inside a quoted field is an escaped quote; bytes after a closing quote are
/// kept as-is.
fn tokenize(record: &[u8], delimiter: u8) -> (Vec<Vec<u8>>, bool) {
    let mut fields = Vec::new();
    let mut field = Vec::new();
    let mut in_quotes = false;
    let mut at_start = true;
    let mut index = 0;

    while index < record.len() {
        let byte = record[index];
        if in_quotes {
            if byte == b'"' {
                if record.get(index + 1) == Some(&b'"') {
                    field.push(b'"');
                    index += 1;
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(byte);
            }
        } else if byte == delimiter {
            fields.push(std::mem::take(&mut field));
            at_start = true;
        } else if byte == b'"' && at_start {
            field.clear();
            in_quotes = true;
            at_start = false;
        } else {
            if byte != b' ' && byte != b'\t' {
                at_start = false;
            }
            field.push(byte);
        }
        index += 1;
    }

    fields.push(field);
    (fields, in_quotes)
}

#[cfg(test)]
mod tests {
    use std::io::{BufReader, Cursor, Read};

    use proptest::prelude::*;

    use super::*;

    fn rows(input: &[u8]) -> Vec<Result<RawRow, ReadError>> {
        RowReader::new(Cursor::new(input.to_vec())).collect()
    }

    fn fields(row: &Result<RawRow, ReadError>) -> Vec<&str> {
        match row {
            Ok(row) => row.fields.iter().map(String::as_str).collect(),
            Err(err) => panic!("expected a row, got error: {err}"),
        }
    }

    #[test]
    fn reads_ragged_rows_without_complaint() {
        let out = rows(b"a,b,c\n1,2\n1,2,3,4\n");
        assert_eq!(out.len(), 3);
        assert_eq!(fields(&out[1]), vec!["1", "2"]);
        assert_eq!(fields(&out[2]), vec!["1", "2", "3", "4"]);
    }

    #[test]
    fn strips_bom_and_crlf_and_skips_blank_lines() {
        let out = rows(b"\xEF\xBB\xBFh1,h2\r\n\r\n  \nx,y\r\n");
        assert_eq!(out.len(), 2);
        assert_eq!(fields(&out[0]), vec!["h1", "h2"]);
        let Ok(second) = &out[1] else { panic!("second row should parse") };
        assert_eq!(second.line, 4);
        assert_eq!(second.fields, vec!["x", "y"]);
    }

    #[test]
    fn sniffs_semicolon_delimiter_from_first_record() {
        let mut reader = RowReader::new(Cursor::new(b"a;b;c\n1;2,5;3\n".to_vec()));
        let header = reader.next();
        assert_eq!(reader.delimiter(), Some(b';'));
        assert!(matches!(header, Some(Ok(_))));
        let Some(row) = reader.next() else { panic!("expected data row") };
        assert_eq!(fields(&row), vec!["1", "2,5", "3"]);
    }

    #[test]
    fn explicit_delimiter_overrides_sniffing() {
        let options = ReaderOptions { delimiter: Some(b'|'), ..ReaderOptions::default() };
        let out: Vec<_> =
            RowReader::with_options(Cursor::new(b"a,b|c\n".to_vec()), options).collect();
        assert_eq!(fields(&out[0]), vec!["a,b", "c"]);
    }

    #[test]
    fn quoted_fields_handle_delimiters_escapes_and_newlines() {
        let out = rows(b"h1,h2\n\"a,b\",\"say \"\"hi\"\"\"\n\"multi\nline\",z\nnext,row\n");
        assert_eq!(out.len(), 4);
        assert_eq!(fields(&out[1]), vec!["a,b", "say \"hi\""]);
        assert_eq!(fields(&out[2]), vec!["multi\nline", "z"]);
        let Ok(last) = &out[3] else { panic!("last row should parse") };
        assert_eq!(last.line, 5);
    }

    #[test]
    fn stray_quotes_are_kept_literally() {
        let out = rows(b"h\nab\"c,\"x\"tail, \"lead\"\n");
        assert_eq!(fields(&out[1]), vec!["ab\"c", "xtail", "lead"]);
    }

    #[test]
    fn invalid_utf8_is_a_row_error_and_reading_continues() {
        let out = rows(b"h1,h2\nok,1\n\xFF\xFE,2\nok,3\n");
        assert_eq!(out.len(), 4);
        match &out[2] {
            Err(ReadError::Row(RowError::InvalidUtf8 { line })) => assert_eq!(*line, 3),
            other => panic!("expected utf-8 row error, got {other:?}"),
        }
        assert_eq!(fields(&out[3]), vec!["ok", "3"]);
    }

    #[test]
    fn unterminated_quote_at_eof_is_a_row_error() {
        let out = rows(b"h1,h2\nok,1\n\"never closed,2\n");
        assert_eq!(out.len(), 3);
        match &out[2] {
            Err(err @ ReadError::Row(RowError::UnterminatedQuote { line: 3 })) => {
                assert!(!err.is_fatal());
            }
            other => panic!("expected unterminated quote error, got {other:?}"),
        }
    }

    #[test]
    fn runaway_quote_is_bounded_and_reading_resumes() {
        let options = ReaderOptions { max_record_lines: 2, ..ReaderOptions::default() };
        let input = b"h1,h2\n\"open,1\nstill open\nafter,3\n".to_vec();
        let out: Vec<_> = RowReader::with_options(Cursor::new(input), options).collect();
        assert_eq!(out.len(), 3);
        assert!(matches!(out[1], Err(ReadError::Row(RowError::UnterminatedQuote { line: 2 }))));
        assert_eq!(fields(&out[2]), vec!["after", "3"]);
    }

    #[test]
    fn oversized_rows_are_rejected_individually() {
        let options = ReaderOptions { max_record_bytes: 8, ..ReaderOptions::default() };
        let input = b"a,b\nthis,row,is,too,long\nc,d\n".to_vec();
        let out: Vec<_> = RowReader::with_options(Cursor::new(input), options).collect();
        assert_eq!(out.len(), 3);
        assert!(matches!(out[1], Err(ReadError::Row(RowError::TooLong { line: 2, limit: 8 }))));
        assert_eq!(fields(&out[2]), vec!["c", "d"]);
    }

    #[test]
    fn long_line_without_newline_is_skipped_in_bounded_reads() {
        let options = ReaderOptions { max_record_bytes: 16, ..ReaderOptions::default() };
        let mut input = b"a,b\n".to_vec();
        input.extend(std::iter::repeat(b'x').take(100_000));
        input.extend_from_slice(b"\nc,d\n");
        let reader = BufReader::with_capacity(32, Cursor::new(input));
        let out: Vec<_> = RowReader::with_options(reader, options).collect();
        assert_eq!(out.len(), 3);
        assert!(matches!(out[1], Err(ReadError::Row(RowError::TooLong { line: 2, limit: 16 }))));
        let Ok(last) = &out[2] else { panic!("row after the long line should parse") };
        assert_eq!((last.line, last.fields.clone()), (3, vec!["c".to_string(), "d".to_string()]));
    }

    #[test]
    fn quoted_continuation_counts_toward_the_byte_bound() {
        let options = ReaderOptions { max_record_bytes: 12, ..ReaderOptions::default() };
        let input = b"h1,h2\n\"start\nthis continuation is long\",1\nok,2\n".to_vec();
        let out: Vec<_> = RowReader::with_options(Cursor::new(input), options).collect();
        assert_eq!(out.len(), 3);
        assert!(matches!(out[1], Err(ReadError::Row(RowError::TooLong { line: 2, limit: 12 }))));
        assert_eq!(fields(&out[2]), vec!["ok", "2"]);
    }

    #[test]
    fn line_at_exact_limit_with_bom_and_crlf_is_accepted() {
        let options = ReaderOptions { max_record_bytes: 5, ..ReaderOptions::default() };
        let input = b"\xEF\xBB\xBFab,cd\r\nx,y\r\n".to_vec();
        let out: Vec<_> = RowReader::with_options(Cursor::new(input), options).collect();
        assert_eq!(out.len(), 2);
        assert_eq!(fields(&out[0]), vec!["ab", "cd"]);
        assert_eq!(fields(&out[1]), vec!["x", "y"]);
    }

    struct FailingRead {
        served: bool,
    }

    impl Read for FailingRead {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.served {
                return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "connection reset"));
            }
            self.served = true;
            let chunk = b"h1,h2\nok,1\n";
            buf[..chunk.len()].copy_from_slice(chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn io_failure_is_fatal_and_ends_iteration() {
        let reader = BufReader::with_capacity(64, FailingRead { served: false });
        let out: Vec<_> = RowReader::new(reader).collect();
        assert_eq!(out.len(), 3);
        assert!(out[0].is_ok());
        assert!(out[1].is_ok());
        match &out[2] {
            Err(err) => assert!(err.is_fatal()),
            Ok(row) => panic!("expected fatal error, got row {row:?}"),
        }
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(rows(b"").is_empty());
        assert!(rows(b"\n\n").is_empty());
    }

    proptest! {
        #[test]
        fn property_reader_never_panics_and_terminates(input in proptest::collection::vec(any::<u8>(), 0..512)) {
            let line_count = input.iter().filter(|byte| **byte == b'\n').count() + 1;
            let out: Vec<_> = RowReader::new(Cursor::new(input)).collect();
            prop_assert!(out.len() <= line_count);
            prop_assert!(out.iter().all(|item| !matches!(item, Err(err) if err.is_fatal())));
        }

        #[test]
        fn property_plain_rows_round_trip(cells in proptest::collection::vec(proptest::collection::vec("[a-z0-9 ]{0,6}", 1..6), 1..20)) {
            let mut input = String::new();
            for row in &cells {
                input.push_str(&row.join(","));
                input.push('\n');
            }
            let expected: Vec<&Vec<String>> = cells
                .iter()
                .filter(|row| !row.join(",").trim().is_empty())
                .collect();
            let options = ReaderOptions { delimiter: Some(b','), ..ReaderOptions::default() };
            let out: Vec<_> = RowReader::with_options(Cursor::new(input.into_bytes()), options)
                .filter_map(Result::ok)
                .map(|row| row.fields)
                .collect();
            prop_assert_eq!(out.len(), expected.len());
            for (actual, wanted) in out.iter().zip(expected) {
                prop_assert_eq!(actual, wanted);
            }
        }
    }
}
