//! CSV upload boundary (§6 `/upload/preview`, `/upload/process`). XLSX
//! parsing and durable blob storage are out of scope (§2 Non-goals) — a
//! previewed file lives only long enough for the matching `/upload/process`
//! call to consume it, in an in-process cache keyed by a one-time token.

use dashmap::DashMap;
use uuid::Uuid;

use crate::domain::Address;
use crate::errors::{Error, Result};

const PREVIEW_ROW_LIMIT: usize = 10;

/// Holds raw upload bytes between `/upload/preview` and `/upload/process`.
/// Entries are removed the moment they're consumed; nothing here survives a
/// process restart, matching the upload surface's Non-goal scope.
pub struct UploadCache {
    files: DashMap<String, Vec<u8>>,
}

impl Default for UploadCache {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadCache {
    pub fn new() -> Self {
        Self { files: DashMap::new() }
    }

    pub fn store(&self, bytes: Vec<u8>) -> String {
        let token = Uuid::new_v4().to_string();
        self.files.insert(token.clone(), bytes);
        token
    }

    pub fn take(&self, token: &str) -> Option<Vec<u8>> {
        self.files.remove(token).map(|(_, v)| v)
    }
}

pub struct ParsedPreview {
    pub headers: Vec<String>,
    pub preview_rows: Vec<Vec<String>>,
}

fn csv_err(e: csv::Error) -> Error {
    Error::InputError { message: format!("malformed CSV upload: {e}") }
}

/// Headers plus the first few data rows, enough for a caller to map columns
/// before committing to `/upload/process`.
pub fn parse_preview(bytes: &[u8]) -> Result<ParsedPreview> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(bytes);
    let headers: Vec<String> = reader.headers().map_err(csv_err)?.iter().map(str::to_string).collect();
    if headers.is_empty() {
        return Err(Error::InputError { message: "CSV upload has no header row".to_string() });
    }

    let mut preview_rows = Vec::new();
    for record in reader.records().take(PREVIEW_ROW_LIMIT) {
        let record = record.map_err(csv_err)?;
        preview_rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(ParsedPreview { headers, preview_rows })
}

/// Which CSV columns hold the payee name and the optional address parts,
/// chosen by the caller from the columns `parse_preview` reported.
#[derive(Debug, Clone, Default)]
pub struct ColumnMapping {
    pub payee_column: String,
    pub address_line1_column: Option<String>,
    pub city_column: Option<String>,
    pub state_column: Option<String>,
    pub zip_column: Option<String>,
    pub country_column: Option<String>,
}

pub struct ParsedRow {
    pub original_name: String,
    pub input_address: Address,
}

fn column_index(headers: &csv::StringRecord, column: &str) -> Result<usize> {
    headers.iter().position(|h| h == column).ok_or_else(|| Error::InputError { message: format!("column '{column}' not found in upload") })
}

fn cell(record: &csv::StringRecord, idx: Option<usize>) -> Option<String> {
    idx.and_then(|i| record.get(i)).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Parses every data row into a payee name plus whatever address columns
/// were mapped. Rows whose payee column is empty are skipped rather than
/// rejecting the whole upload — blank trailing rows are common in
/// spreadsheet exports.
pub fn parse_rows(bytes: &[u8], mapping: &ColumnMapping) -> Result<Vec<ParsedRow>> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(bytes);
    let headers = reader.headers().map_err(csv_err)?.clone();

    let payee_idx = column_index(&headers, &mapping.payee_column)?;
    let line1_idx = mapping.address_line1_column.as_deref().map(|c| column_index(&headers, c)).transpose()?;
    let city_idx = mapping.city_column.as_deref().map(|c| column_index(&headers, c)).transpose()?;
    let state_idx = mapping.state_column.as_deref().map(|c| column_index(&headers, c)).transpose()?;
    let zip_idx = mapping.zip_column.as_deref().map(|c| column_index(&headers, c)).transpose()?;
    let country_idx = mapping.country_column.as_deref().map(|c| column_index(&headers, c)).transpose()?;

    let mut out = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        let Some(name) = cell(&record, Some(payee_idx)) else { continue };
        out.push(ParsedRow {
            original_name: name,
            input_address: Address {
                line1: cell(&record, line1_idx),
                city: cell(&record, city_idx),
                state: cell(&record, state_idx),
                zip: cell(&record, zip_idx),
                country: cell(&record, country_idx),
            },
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Payee Name,City,State\nAcme Corp,Austin,TX\n,Austin,TX\nBeta LLC,Denver,CO\n";

    #[test]
    fn preview_reports_headers_and_rows() {
        let preview = parse_preview(SAMPLE.as_bytes()).unwrap();
        assert_eq!(preview.headers, vec!["Payee Name", "City", "State"]);
        assert_eq!(preview.preview_rows.len(), 3);
    }

    #[test]
    fn parse_rows_skips_blank_payee_names() {
        let mapping = ColumnMapping { payee_column: "Payee Name".to_string(), city_column: Some("City".to_string()), ..Default::default() };
        let rows = parse_rows(SAMPLE.as_bytes(), &mapping).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].original_name, "Acme Corp");
        assert_eq!(rows[0].input_address.city.as_deref(), Some("Austin"));
    }

    #[test]
    fn unknown_column_is_an_input_error() {
        let mapping = ColumnMapping { payee_column: "Nonexistent".to_string(), ..Default::default() };
        assert!(parse_rows(SAMPLE.as_bytes(), &mapping).is_err());
    }
}
