//! Pure placement-rule functions: given parsed document metadata, the
//! current clock, and the imported-key set, compute the list of target
//! paths a document (or cancel event) must be written to. C5 consumes the
//! resulting list; this module does no filesystem I/O of its own for
//! documents, and only probes existence through an injected closure for
//! events, so C7/C9 stay testable without a real filesystem.
//!
//! Grounded on spec §4.7's placement rules and the "dynamic dispatch over
//! save paths -> pure function" design note.

use crate::domain::{Company, DocType, Direction};
use crate::xml_inspector::Inspection;
use chrono::NaiveDate;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub struct PlacementInputs<'a> {
    pub company: &'a Company,
    pub inspection: &'a Inspection,
    pub primary_root: &'a Path,
    pub flat_root: &'a Path,
    pub today: NaiveDate,
    pub imported_keys: &'a HashSet<String>,
}

pub struct PlacementResult {
    pub destinations: Vec<PathBuf>,
    /// True if a flat-mirror destination was added; the caller must mark
    /// the key imported *before* committing.
    pub flat_added: bool,
}

fn year_month_dir(primary_root: &Path, year: &str, company_folder: &str, month: &str) -> PathBuf {
    primary_root.join(year).join(company_folder).join(month)
}

fn direction_segment(direction: Option<Direction>) -> Option<&'static str> {
    direction.map(|d| d.as_str())
}

/// Computes destinations for a regular document (NFe/CTe), not an event.
/// Minus-previous-month variant is controlled by `include_previous_month`
/// (recovery fetches skip it per spec §4.8). Returns `None` if the
/// inspection's root element wasn't one of the recognized document/event
/// kinds (`Kind::Unknown`) — the caller must treat that as a metadata-
/// extraction failure (spec §7) rather than placing the document anywhere.
pub fn compute_document_destinations(
    inputs: &PlacementInputs,
    include_previous_month: bool,
) -> Option<PlacementResult> {
    let insp = inputs.inspection;
    let doc_type = insp.doc_type()?;
    let (year, month) = split_year_month(&insp.year_month);

    let mut destinations = Vec::new();

    let mut primary = year_month_dir(inputs.primary_root, &year, &inputs.company.folder_name, &month)
        .join(doc_type.as_str());
    if let Some(seg) = direction_segment(insp.direction) {
        primary = primary.join(seg);
    }
    primary = primary.join(format!("{}.xml", insp.key));
    destinations.push(primary);

    let flat_added = !inputs.imported_keys.contains(&insp.key);
    if flat_added {
        destinations.push(inputs.flat_root.join(format!("{}.xml", insp.key)));
    }

    if include_previous_month && insp.direction == Some(Direction::Entrada) {
        let emission_is_current_month = year == inputs.today.format("%Y").to_string()
            && month == inputs.today.format("%m").to_string();
        if emission_is_current_month && (1..=3).contains(&inputs.today.format("%d").to_string().parse::<u32>().unwrap_or(0)) {
            let prev = previous_year_month(&year, &month);
            let prev_path = year_month_dir(inputs.primary_root, &prev.0, &inputs.company.folder_name, &prev.1)
                .join("M\u{ea}s_anterior")
                .join(doc_type.as_str())
                .join(Direction::Entrada.as_str())
                .join(format!("{}.xml", insp.key));
            destinations.push(prev_path);
        }
    }

    Some(PlacementResult {
        destinations,
        flat_added,
    })
}

fn split_year_month(year_month: &str) -> (String, String) {
    let mut parts = year_month.splitn(2, '/');
    let year = parts.next().unwrap_or("0000").to_string();
    let month = parts.next().unwrap_or("00").to_string();
    (year, month)
}

fn previous_year_month(year: &str, month: &str) -> (String, String) {
    let y: i32 = year.parse().unwrap_or(0);
    let m: u32 = month.parse().unwrap_or(1);
    if m == 1 {
        (format!("{:04}", y - 1), "12".to_string())
    } else {
        (y.to_string(), format!("{:02}", m - 1))
    }
}

/// Cancel-mirror destination, added unconditionally for cancel events once
/// the referenced document has been located (see `locate_referenced_document`).
pub fn cancel_mirror_path(cancel_root: &Path, referenced_key: &str) -> PathBuf {
    cancel_root.join(format!("{referenced_key}_CANC.xml"))
}

/// Searches, in priority order, for the referenced document's directory:
/// (1) the referenced key's own year/month (decoded from positions 3-6,
/// interpreting `YY` as `20YY`), (2) the event's own year/month, (3) the
/// previous-month mirror tree. Returns the event's target path next to the
/// document if found, otherwise `None` (caller must retry the event in a
/// future cycle).
pub fn locate_referenced_document(
    company: &Company,
    primary_root: &Path,
    event: &Inspection,
    exists: impl Fn(&Path) -> bool,
) -> Option<PathBuf> {
    let referenced_key = event.referenced_key.as_deref()?;
    let doc_type = DocType::from_key_model(referenced_key);

    let mut candidates: Vec<(String, String, bool)> = Vec::new();
    if referenced_key.len() >= 6 {
        let yy = &referenced_key[2..4];
        let mm = &referenced_key[4..6];
        candidates.push((format!("20{yy}"), mm.to_string(), false));
    }
    let (event_year, event_month) = split_year_month(&event.year_month);
    candidates.push((event_year, event_month, false));
    if let Some((y, m, _)) = candidates.first().cloned() {
        let prev = previous_year_month(&y, &m);
        candidates.push((prev.0, prev.1, true));
    }

    for (year, month, is_previous_mirror) in candidates {
        for direction in [Some(Direction::Entrada), Some(Direction::Saida), None] {
            let mut base = year_month_dir(primary_root, &year, &company.folder_name, &month);
            if is_previous_mirror {
                base = base.join("M\u{ea}s_anterior");
            }
            base = base.join(doc_type.as_str());
            if let Some(d) = direction {
                base = base.join(d.as_str());
            }
            let candidate = base.join(format!("{referenced_key}.xml"));
            if exists(&candidate) {
                return Some(candidate.parent().unwrap().join(format!("{referenced_key}_CANC.xml")));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml_inspector::Kind;

    fn company() -> Company {
        Company {
            id_canonical: "12345678000195".to_string(),
            folder_name: "Empresa".to_string(),
        }
    }

    fn inspection(direction: Option<Direction>) -> Inspection {
        Inspection {
            kind: Kind::NFe,
            key: "1".repeat(44),
            referenced_key: None,
            event_type: None,
            emission_ts: "2024-04-10T10:00:00".to_string(),
            year_month: "2024/04".to_string(),
            direction,
        }
    }

    #[test]
    fn flat_mirror_added_only_once() {
        let root = PathBuf::from("/primary");
        let flat = PathBuf::from("/flat");
        let company = company();
        let insp = inspection(Some(Direction::Saida));
        let imported = HashSet::new();
        let inputs = PlacementInputs {
            company: &company,
            inspection: &insp,
            primary_root: &root,
            flat_root: &flat,
            today: NaiveDate::from_ymd_opt(2024, 4, 15).unwrap(),
            imported_keys: &imported,
        };
        let result = compute_document_destinations(&inputs, false).unwrap();
        assert!(result.flat_added);
        assert_eq!(result.destinations.len(), 2);

        let mut already_imported = HashSet::new();
        already_imported.insert(insp.key.clone());
        let inputs2 = PlacementInputs {
            imported_keys: &already_imported,
            ..inputs
        };
        let result2 = compute_document_destinations(&inputs2, false).unwrap();
        assert!(!result2.flat_added);
        assert_eq!(result2.destinations.len(), 1);
    }

    #[test]
    fn previous_month_mirror_added_within_bleed_window() {
        let root = PathBuf::from("/primary");
        let flat = PathBuf::from("/flat");
        let company = company();
        let insp = inspection(Some(Direction::Entrada));
        let imported = HashSet::new();
        let inputs = PlacementInputs {
            company: &company,
            inspection: &insp,
            primary_root: &root,
            flat_root: &flat,
            today: NaiveDate::from_ymd_opt(2024, 4, 2).unwrap(),
            imported_keys: &imported,
        };
        let result = compute_document_destinations(&inputs, true).unwrap();
        assert_eq!(result.destinations.len(), 3);
        assert!(result
            .destinations
            .iter()
            .any(|p| p.to_string_lossy().contains("anterior")));
    }

    #[test]
    fn locate_referenced_document_falls_back_through_priority() {
        let company = company();
        let event = Inspection {
            kind: Kind::EventNFe,
            key: "9".repeat(44),
            referenced_key: Some(format!("{}{}{}{}", "0".repeat(2), "24", "04", "0".repeat(38))),
            event_type: Some("110111".to_string()),
            emission_ts: "2024-05-01T00:00:00".to_string(),
            year_month: "2024/05".to_string(),
            direction: None,
        };
        let found = locate_referenced_document(&company, Path::new("/primary"), &event, |_p| false);
        assert!(found.is_none());
    }
}
