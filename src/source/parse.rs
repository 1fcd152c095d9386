//! Row parsing for HWPC CSV files.
//!
//! Each file holds one counter group. The header names the fixed
//! `timestamp,sensor,target,socket,cpu` columns followed by one column per
//! counter. Timestamps are milliseconds since the Unix epoch.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Fixed leading columns of every HWPC CSV file.
const FIXED_COLUMNS: [&str; 5] = ["timestamp", "sensor", "target", "socket", "cpu"];

/// Errors that can occur while parsing HWPC CSV content.
#[derive(Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("empty file: missing header")]
    MissingHeader,

    #[error("header column {position} must be {expected}, found {found:?}")]
    UnexpectedColumn {
        position: usize,
        expected: &'static str,
        found: String,
    },

    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },

    #[error("invalid timestamp: {raw:?}")]
    InvalidTimestamp { raw: String },

    #[error("invalid value {raw:?} for counter {counter}")]
    InvalidCounter { counter: String, raw: String },

    #[error("malformed quoted field")]
    MalformedQuote,
}

/// Parsed header of one HWPC CSV file.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvHeader {
    /// Counter column names, in file order.
    pub counters: Vec<String>,
}

impl CsvHeader {
    fn field_count(&self) -> usize {
        FIXED_COLUMNS.len() + self.counters.len()
    }
}

/// One data row of an HWPC CSV file.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvRow {
    pub timestamp: DateTime<Utc>,
    pub sensor: String,
    pub target: String,
    pub socket: String,
    pub cpu: String,
    /// Counter name and raw value pairs, in header order.
    pub counters: Vec<(String, u64)>,
}

/// Parses the header line of an HWPC CSV file.
pub fn parse_header(line: &str) -> Result<CsvHeader, ParseError> {
    let columns = split_fields(line)?;
    if columns.len() == 1 && columns[0].is_empty() {
        return Err(ParseError::MissingHeader);
    }

    for (position, expected) in FIXED_COLUMNS.iter().enumerate() {
        let found = columns.get(position).map(Cow::as_ref).unwrap_or_default();
        if found != *expected {
            return Err(ParseError::UnexpectedColumn {
                position,
                expected: *expected,
                found: found.to_string(),
            });
        }
    }

    Ok(CsvHeader {
        counters: columns
            .iter()
            .skip(FIXED_COLUMNS.len())
            .map(|c| c.to_string())
            .collect(),
    })
}

/// Parses one data line against its file header.
pub fn parse_row(header: &CsvHeader, line: &str) -> Result<CsvRow, ParseError> {
    let fields = split_fields(line)?;
    if fields.len() != header.field_count() {
        return Err(ParseError::FieldCount {
            expected: header.field_count(),
            found: fields.len(),
        });
    }

    let timestamp = parse_timestamp(&fields[0])?;

    let counters = header
        .counters
        .iter()
        .zip(&fields[FIXED_COLUMNS.len()..])
        .map(|(counter, raw)| {
            parse_counter(raw)
                .map(|value| (counter.clone(), value))
                .ok_or_else(|| ParseError::InvalidCounter {
                    counter: counter.clone(),
                    raw: raw.to_string(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CsvRow {
        timestamp,
        sensor: fields[1].to_string(),
        target: fields[2].to_string(),
        socket: fields[3].to_string(),
        cpu: fields[4].to_string(),
        counters,
    })
}

/// Splits a line on commas. Fields may be double-quoted, with `""` standing
/// for a literal quote, so targets holding commas survive a round trip
/// through the CSV sink.
fn split_fields(line: &str) -> Result<Vec<Cow<'_, str>>, ParseError> {
    let mut fields = Vec::new();
    let mut rest = line.trim_end_matches(['\r', '\n']);

    loop {
        let Some(quoted) = rest.trim_start().strip_prefix('"') else {
            match rest.split_once(',') {
                Some((field, next)) => {
                    fields.push(Cow::Borrowed(field.trim()));
                    rest = next;
                    continue;
                }
                None => {
                    fields.push(Cow::Borrowed(rest.trim()));
                    return Ok(fields);
                }
            }
        };

        let mut value = String::new();
        let mut chars = quoted.char_indices().peekable();
        let end = loop {
            match chars.next() {
                Some((_, '"')) if chars.peek().map(|&(_, c)| c) == Some('"') => {
                    value.push('"');
                    chars.next();
                }
                Some((i, '"')) => break i + 1,
                Some((_, c)) => value.push(c),
                None => return Err(ParseError::MalformedQuote),
            }
        };
        fields.push(Cow::Owned(value));

        let after = quoted[end..].trim_start();
        if after.is_empty() {
            return Ok(fields);
        }
        rest = after
            .strip_prefix(',')
            .ok_or(ParseError::MalformedQuote)?;
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ParseError> {
    raw.parse::<i64>()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .ok_or_else(|| ParseError::InvalidTimestamp {
            raw: raw.to_string(),
        })
}

/// Counters are integers, but some sensors write them with a trailing `.0`.
fn parse_counter(raw: &str) -> Option<u64> {
    if let Ok(value) = raw.parse::<u64>() {
        return Some(value);
    }
    let value = raw.parse::<f64>().ok()?;
    (value.is_finite() && value >= 0.0 && value.fract() == 0.0 && value <= u64::MAX as f64)
        .then_some(value as u64)
}
