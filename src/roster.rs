//! Loads the company roster: a list of `(document_id, folder_name)` pairs.
//!
//! The roster-spreadsheet reader is an external collaborator by the
//! specification's own scope — this module provides the minimal concrete
//! form needed to run the crate end to end (a two-column CSV), matching the
//! "thin contract" status rather than reimplementing a general parser.

use crate::domain::Company;
use crate::errors::ManifestError;
use crate::identifiers::{normalize, sanitize_folder};
use std::path::Path;

/// Loads the roster from a local path or, if `source` looks like an
/// HTTP(S) URL, downloads it first — same path-or-url convention as the
/// Manifest Reader's `read_report_data`.
pub async fn load_roster_source(source: &str) -> Result<Vec<Company>, ManifestError> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let text = reqwest::get(source).await?.text().await?;
        parse_roster(&text)
    } else {
        load_roster(Path::new(source))
    }
}

/// Reads a CSV roster with columns `document_id,folder_name` (header
/// optional, detected by checking whether the first row's id parses).
pub fn load_roster(path: &Path) -> Result<Vec<Company>, ManifestError> {
    let text = std::fs::read_to_string(path)?;
    parse_roster(&text)
}

fn parse_roster(text: &str) -> Result<Vec<Company>, ManifestError> {
    let mut companies = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(2, ',');
        let (Some(raw_id), Some(raw_folder)) = (parts.next(), parts.next()) else {
            continue;
        };
        let raw_id = raw_id.trim();
        let raw_folder = raw_folder.trim();

        // A row whose first column doesn't parse as an id is skipped outright;
        // in practice this is just the header row ("document_id,folder_name").
        let Ok(id_canonical) = normalize(raw_id) else {
            continue;
        };

        companies.push(Company {
            id_canonical,
            folder_name: sanitize_folder(raw_folder),
        });
    }

    Ok(companies)
}
