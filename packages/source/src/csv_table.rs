//! Reader for downloaded service-request tables.
//!
//! Parses a delimited byte stream, locates the mapped columns by header name
//! (surrounding whitespace ignored), and coerces each row into a
//! [`RawRequest`]. Cell values are kept verbatim; an empty cell is treated
//! as missing.

use chrono::{DateTime, Utc};

use crate::fields::FieldMapping;
use crate::parsing::parse_timestamp;

/// Errors that make a downloaded table unusable as a whole.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    /// CSV parsing failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A mapped column is not present in the header row.
    #[error("column '{column}' not found (available: {available})")]
    MissingColumn {
        /// The mapped column name.
        column: String,
        /// Comma-separated header names actually present.
        available: String,
    },
}

/// One raw service request after timestamp coercion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    /// Creation instant, `None` when the cell was empty or unparseable.
    pub created_at: Option<DateTime<Utc>>,
    /// Request type, `None` when the cell was empty.
    pub request_type: Option<String>,
    /// Division, empty when the cell was empty.
    pub division: String,
    /// Ward, empty when the cell was empty.
    pub ward: String,
    /// Status, `None` when the cell was empty.
    pub status: Option<String>,
}

/// Column positions of the mapped fields.
struct ColumnIndex {
    created_at: usize,
    request_type: usize,
    division: usize,
    ward: usize,
    status: usize,
}

impl ColumnIndex {
    fn locate(headers: &[String], fields: &FieldMapping) -> Result<Self, TableError> {
        let find = |column: &str| {
            headers
                .iter()
                .position(|h| h == column.trim())
                .ok_or_else(|| TableError::MissingColumn {
                    column: column.to_string(),
                    available: headers.join(", "),
                })
        };

        Ok(Self {
            created_at: find(&fields.created_at)?,
            request_type: find(&fields.request_type)?,
            division: find(&fields.division)?,
            ward: find(&fields.ward)?,
            status: find(&fields.status)?,
        })
    }
}

/// Parses a comma-delimited table into raw requests.
///
/// # Errors
///
/// Returns [`TableError`] if the bytes are not valid CSV or a mapped column
/// is missing from the header row.
pub fn read_raw_requests(bytes: &[u8], fields: &FieldMapping) -> Result<Vec<RawRequest>, TableError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .byte_headers()?
        .iter()
        .enumerate()
        .map(|(i, h)| {
            let raw = String::from_utf8_lossy(h);
            let name: &str = if i == 0 {
                raw.trim_start_matches('\u{feff}')
            } else {
                &raw
            };
            name.trim().to_owned()
        })
        .collect();

    let index = ColumnIndex::locate(&headers, fields)?;
    let mut rows = Vec::new();

    for result in reader.byte_records() {
        let record = result?;
        let cell = |i: usize| -> Option<String> {
            record
                .get(i)
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .filter(|v| !v.is_empty())
        };

        rows.push(RawRequest {
            created_at: cell(index.created_at).as_deref().and_then(parse_timestamp),
            request_type: cell(index.request_type),
            division: cell(index.division).unwrap_or_default(),
            ward: cell(index.ward).unwrap_or_default(),
            status: cell(index.status),
        });
    }

    log::debug!("Parsed {} rows from downloaded table", rows.len());

    Ok(rows)
}
