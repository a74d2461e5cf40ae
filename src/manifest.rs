//! Reads the monthly manifest spreadsheet (local path or HTTP(S) URL),
//! cleans/validates rows, and classifies keys by role.
//!
//! Column-priority role logic is ported from
//! `core/report_validator.py::_get_papel_empresa`; the reader itself has no
//! teacher precedent (no example repo parses spreadsheets) and uses
//! `calamine`, the idiomatic crate for `.xlsx`.

use crate::domain::{DocType, Role};
use crate::errors::ManifestError;
use std::collections::{HashMap, HashSet};
use std::path::Path;

const NFE_EMIT_COL: &str = "CNPJ_CPF_CnpjEmit";
const NFE_DEST_COL: &str = "CNPJ_CPF_Dest";
const CTE_TOMADOR_COL: &str = "CNPJ_CPF_Tomador";
const CTE_TOMADOR_OUTRO_COL: &str = "CNPJ_CPF_Outro_Tomador";
const CTE_EMIT_COL: &str = "CNPJ_CPF_Emitente";
const CTE_DEST_COL: &str = "CNPJ_CPF_Dest";
const KEY_COLUMN_CANDIDATES: [&str; 2] = ["Chave", "Key"];
const DATE_COLUMN_CANDIDATES: [&str; 2] = ["DataEmissao", "Data_Emissao"];

#[derive(Debug, Clone)]
pub struct ManifestRow {
    pub key: String,
    pub emission_date: chrono::NaiveDate,
    pub role_fields: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ManifestTable {
    pub rows: Vec<ManifestRow>,
}

/// Reads a manifest file from disk into raw string rows, with the header
/// row mapped to column indexes.
fn read_rows(path: &Path) -> Result<(Vec<String>, Vec<Vec<String>>), ManifestError> {
    use calamine::{open_workbook_auto, Reader};

    let mut workbook =
        open_workbook_auto(path).map_err(|e| ManifestError::Spreadsheet(e.to_string()))?;
    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| ManifestError::Spreadsheet("workbook has no sheets".into()))?;
    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| ManifestError::Spreadsheet(e.to_string()))?;

    let mut rows_iter = range.rows();
    let header: Vec<String> = rows_iter
        .next()
        .ok_or_else(|| ManifestError::Spreadsheet("empty manifest".into()))?
        .iter()
        .map(cell_to_string)
        .collect();

    let rows: Vec<Vec<String>> = rows_iter
        .map(|row| row.iter().map(cell_to_string).collect())
        .collect();

    Ok((header, rows))
}

fn cell_to_string(cell: &calamine::Data) -> String {
    use calamine::Data;
    match cell {
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) => {
            // Spreadsheet software frequently stores long digit strings
            // (keys, CNPJs) as floats; format without exponent or decimal.
            format!("{f:.0}")
        }
        Data::Int(i) => i.to_string(),
        Data::DateTime(d) => d.to_string(),
        Data::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

fn digits_only(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Accepts ISO (`YYYY-MM-DD`) and `DD/MM/YYYY`.
fn parse_date_permissive(raw: &str) -> Option<chrono::NaiveDate> {
    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| chrono::NaiveDate::parse_from_str(raw, "%d/%m/%Y"))
        .ok()
}

fn find_column(header: &[String], candidates: &[&str]) -> Option<usize> {
    header
        .iter()
        .position(|h| candidates.iter().any(|c| h.eq_ignore_ascii_case(c)))
}

/// Downloads `path_or_url` if it looks like an HTTP(S) URL, otherwise treats
/// it as a local path, and parses the resulting workbook.
pub async fn read_report_data(
    path_or_url: &str,
    start_date: chrono::NaiveDate,
    end_date: chrono::NaiveDate,
) -> Result<(ManifestTable, HashSet<String>), ManifestError> {
    let local_path = if path_or_url.starts_with("http://") || path_or_url.starts_with("https://") {
        download_to_temp(path_or_url).await?
    } else {
        std::path::PathBuf::from(path_or_url)
    };

    let (header, raw_rows) = read_rows(&local_path)?;
    let key_col = find_column(&header, &KEY_COLUMN_CANDIDATES)
        .ok_or(ManifestError::MissingColumn("Chave"))?;
    let date_col = find_column(&header, &DATE_COLUMN_CANDIDATES)
        .ok_or(ManifestError::MissingColumn("DataEmissao"))?;

    let mut rows = Vec::new();
    let mut keys_in_period = HashSet::new();

    for raw in &raw_rows {
        let Some(key_raw) = raw.get(key_col) else { continue };
        let key = digits_only(key_raw);
        if key.len() != 44 {
            continue;
        }
        let Some(date_raw) = raw.get(date_col) else { continue };
        let Some(emission_date) = parse_date_permissive(date_raw) else {
            continue;
        };

        let mut role_fields = HashMap::new();
        for (name, value) in header.iter().zip(raw.iter()) {
            if name.as_str() != header[key_col].as_str() && name.as_str() != header[date_col].as_str() {
                role_fields.insert(name.clone(), digits_only(value));
            }
        }

        if emission_date >= start_date && emission_date <= end_date {
            keys_in_period.insert(key.clone());
        }

        rows.push(ManifestRow {
            key,
            emission_date,
            role_fields,
        });
    }

    Ok((ManifestTable { rows }, keys_in_period))
}

async fn download_to_temp(url: &str) -> Result<std::path::PathBuf, ManifestError> {
    let bytes = reqwest::get(url).await?.bytes().await?;
    let tmp = std::env::temp_dir().join(format!("manifest_{}.xlsx", uuid::Uuid::new_v4()));
    std::fs::write(&tmp, &bytes)?;
    Ok(tmp)
}

fn role_for_row(table_row: &ManifestRow, company_id: &str, doc_type: DocType) -> Option<Role> {
    match doc_type {
        DocType::NFe => {
            if table_row.role_fields.get(NFE_EMIT_COL).map(String::as_str) == Some(company_id) {
                Some(Role::Emitente)
            } else if table_row.role_fields.get(NFE_DEST_COL).map(String::as_str) == Some(company_id) {
                Some(Role::Destinatario)
            } else {
                None
            }
        }
        DocType::CTe => {
            let is_tomador = table_row
                .role_fields
                .get(CTE_TOMADOR_COL)
                .map(String::as_str)
                == Some(company_id)
                || table_row
                    .role_fields
                    .get(CTE_TOMADOR_OUTRO_COL)
                    .map(String::as_str)
                    == Some(company_id);
            if is_tomador {
                Some(Role::Tomador)
            } else if table_row.role_fields.get(CTE_EMIT_COL).map(String::as_str) == Some(company_id) {
                Some(Role::Emitente)
            } else if table_row.role_fields.get(CTE_DEST_COL).map(String::as_str) == Some(company_id) {
                Some(Role::Destinatario)
            } else {
                None
            }
        }
    }
}

pub fn get_counts_by_role(
    table: &ManifestTable,
    company_id: &str,
    doc_type: DocType,
) -> HashMap<Role, usize> {
    let mut counts = HashMap::new();
    for row in &table.rows {
        if let Some(role) = role_for_row(row, company_id, doc_type) {
            *counts.entry(role).or_insert(0) += 1;
        }
    }
    counts
}

/// Classifies a set of keys (typically "faltantes" - keys missing locally)
/// by role, using the manifest rows to look each key's role up. Keys whose
/// role can't be determined are reported separately as "ignored".
pub struct ClassifiedKeys {
    pub by_role: HashMap<Role, HashSet<String>>,
    pub ignored: HashSet<String>,
}

pub fn classify_keys_by_role(
    keys: &HashSet<String>,
    table: &ManifestTable,
    company_id: &str,
    doc_type: DocType,
) -> ClassifiedKeys {
    let mut by_role: HashMap<Role, HashSet<String>> = HashMap::new();
    let mut ignored = HashSet::new();
    let rows_by_key: HashMap<&str, &ManifestRow> =
        table.rows.iter().map(|r| (r.key.as_str(), r)).collect();

    for key in keys {
        match rows_by_key.get(key.as_str()) {
            Some(row) => match role_for_row(row, company_id, doc_type) {
                Some(role) => {
                    by_role.entry(role).or_default().insert(key.clone());
                }
                None => {
                    ignored.insert(key.clone());
                }
            },
            None => {
                ignored.insert(key.clone());
            }
        }
    }

    ClassifiedKeys { by_role, ignored }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(key: &str, date: &str, field: &str, value: &str) -> ManifestRow {
        let mut role_fields = HashMap::new();
        role_fields.insert(field.to_string(), value.to_string());
        ManifestRow {
            key: key.to_string(),
            emission_date: chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            role_fields,
        }
    }

    #[test]
    fn counts_by_role_nfe() {
        let table = ManifestTable {
            rows: vec![
                row(&"1".repeat(44), "2024-04-01", NFE_EMIT_COL, "123"),
                row(&"2".repeat(44), "2024-04-02", NFE_DEST_COL, "123"),
                row(&"3".repeat(44), "2024-04-03", NFE_EMIT_COL, "999"),
            ],
        };
        let counts = get_counts_by_role(&table, "123", DocType::NFe);
        assert_eq!(counts.get(&Role::Emitente), Some(&1));
        assert_eq!(counts.get(&Role::Destinatario), Some(&1));
    }

    #[test]
    fn tomador_outranks_emitente_for_cte() {
        let mut fields = HashMap::new();
        fields.insert(CTE_TOMADOR_COL.to_string(), "123".to_string());
        fields.insert(CTE_EMIT_COL.to_string(), "123".to_string());
        let table = ManifestTable {
            rows: vec![ManifestRow {
                key: "4".repeat(44),
                emission_date: chrono::NaiveDate::parse_from_str("2024-04-01", "%Y-%m-%d").unwrap(),
                role_fields: fields,
            }],
        };
        let counts = get_counts_by_role(&table, "123", DocType::CTe);
        assert_eq!(counts.get(&Role::Tomador), Some(&1));
        assert_eq!(counts.get(&Role::Emitente), None);
    }

    #[test]
    fn classify_separates_ignored_keys() {
        let table = ManifestTable {
            rows: vec![row(&"5".repeat(44), "2024-04-01", NFE_EMIT_COL, "123")],
        };
        let mut keys = HashSet::new();
        keys.insert("5".repeat(44));
        keys.insert("6".repeat(44)); // not in manifest at all
        let classified = classify_keys_by_role(&keys, &table, "123", DocType::NFe);
        assert!(classified.by_role[&Role::Emitente].contains(&"5".repeat(44)));
        assert!(classified.ignored.contains(&"6".repeat(44)));
    }
}
