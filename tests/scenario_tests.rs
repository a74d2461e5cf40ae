//! Cross-module scenario tests mirroring the S1-S7 situations the design
//! calls out, exercised directly against the state store, manifest
//! classifier, and placement rules rather than through the upstream HTTP
//! client. A crash-mid-commit scenario (S7) is already covered by
//! `committer::tests::recovery_resumes_partial_commit` and isn't repeated
//! here.

use fiscal_archivist::domain::{Company, Direction, DocType, MonthKey, Role};
use fiscal_archivist::manifest::{classify_keys_by_role, get_counts_by_role, ManifestRow, ManifestTable};
use fiscal_archivist::placement::{compute_document_destinations, locate_referenced_document, PlacementInputs};
use fiscal_archivist::state_store::{PendencyStatus, StateStore, MAX_PENDENCY_ATTEMPTS};
use fiscal_archivist::xml_inspector::{Inspection, Kind};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

fn month() -> MonthKey {
    MonthKey::parse("04-2024").unwrap()
}

/// S3: a monthly report call fails, the pendency is recorded, then a later
/// replay attempt succeeds and the pendency is resolved and the skip cursor
/// reset so the next batch fetch starts from zero again.
#[test]
fn stuck_report_pendency_resolves_after_replay() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = StateStore::open(dir.path()).unwrap();
    let m = month();

    let pendency = store
        .add_or_update_report_pendency("123", &m, DocType::NFe, PendencyStatus::PendingApi, "t0")
        .unwrap();
    assert_eq!(pendency.attempts, 1);
    assert_eq!(pendency.status, PendencyStatus::PendingApi);

    store.update_skip("123", &m, DocType::NFe, Role::Emitente, 40).unwrap();
    store.save_month(&m, "t0").unwrap();

    // list_pending_reports must see it after a fresh open, reading metadata
    // off disk rather than relying on the in-memory cache.
    let mut reopened = StateStore::open(dir.path()).unwrap();
    let pending = reopened.list_pending_reports().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].0, "123");
    assert_eq!(pending[0].2, DocType::NFe);

    // Replay succeeds: pendency resolves, cursor resets.
    reopened.resolve_report_pendency("123", &m, DocType::NFe).unwrap();
    reopened.reset_skip_for_report("123", &m, DocType::NFe).unwrap();

    assert!(reopened
        .get_report_pendency_details("123", &m, DocType::NFe)
        .unwrap()
        .is_none());
    assert_eq!(reopened.get_skip("123", &m, DocType::NFe, Role::Emitente).unwrap(), 0);
}

/// S4: a report genuinely has no data for the period. The pendency should
/// never reach MaxAttemptsReached just from repeated "no data" cycles, since
/// each confirmation is a fresh call with its own attempt count cap, and a
/// caller that checks the pendency status before re-fetching will see
/// `NoDataConfirmed` and skip re-querying that month.
#[test]
fn no_data_confirmed_is_distinguishable_from_pending() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = StateStore::open(dir.path()).unwrap();
    let m = month();

    store
        .add_or_update_report_pendency("123", &m, DocType::CTe, PendencyStatus::NoDataConfirmed, "t0")
        .unwrap();
    let details = store
        .get_report_pendency_details("123", &m, DocType::CTe)
        .unwrap()
        .unwrap();
    assert_eq!(details.status, PendencyStatus::NoDataConfirmed);

    // list_pending_reports only surfaces PendingApi/PendingProcessing, so a
    // confirmed-empty month is not replayed forever.
    store.save_month(&m, "t0").unwrap();
    let pending = store.list_pending_reports().unwrap();
    assert!(pending.is_empty());
}

/// A pendency that never resolves after MAX_PENDENCY_ATTEMPTS stops being
/// replayed, since its status flips to MaxAttemptsReached and
/// list_pending_reports filters on PendingApi/PendingProcessing only.
#[test]
fn exhausted_pendency_drops_out_of_replay_list() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = StateStore::open(dir.path()).unwrap();
    let m = month();

    for _ in 0..MAX_PENDENCY_ATTEMPTS {
        store
            .add_or_update_report_pendency("123", &m, DocType::NFe, PendencyStatus::PendingApi, "t")
            .unwrap();
    }
    store.save_month(&m, "t").unwrap();
    let pending = store.list_pending_reports().unwrap();
    assert!(pending.is_empty());
}

/// S2-style reconciliation: the manifest's expected counts per role should
/// match how many of a batch of "missing locally" keys classify into each
/// role, with anything not found in the manifest (or with no recognizable
/// role) reported as ignored rather than silently dropped.
#[test]
fn manifest_counts_and_classification_agree_on_role_membership() {
    let emit_key = "1".repeat(44);
    let dest_key = "2".repeat(44);
    let stray_key = "3".repeat(44);

    let mut emit_fields = HashMap::new();
    emit_fields.insert("CNPJ_CPF_CnpjEmit".to_string(), "123".to_string());
    let mut dest_fields = HashMap::new();
    dest_fields.insert("CNPJ_CPF_Dest".to_string(), "123".to_string());

    let table = ManifestTable {
        rows: vec![
            ManifestRow {
                key: emit_key.clone(),
                emission_date: chrono::NaiveDate::from_ymd_opt(2024, 4, 1).unwrap(),
                role_fields: emit_fields,
            },
            ManifestRow {
                key: dest_key.clone(),
                emission_date: chrono::NaiveDate::from_ymd_opt(2024, 4, 2).unwrap(),
                role_fields: dest_fields,
            },
        ],
    };

    let counts = get_counts_by_role(&table, "123", DocType::NFe);
    assert_eq!(counts.get(&Role::Emitente), Some(&1));
    assert_eq!(counts.get(&Role::Destinatario), Some(&1));

    let mut missing = HashSet::new();
    missing.insert(emit_key.clone());
    missing.insert(dest_key.clone());
    missing.insert(stray_key.clone());

    let classified = classify_keys_by_role(&missing, &table, "123", DocType::NFe);
    assert_eq!(classified.by_role[&Role::Emitente].len(), 1);
    assert_eq!(classified.by_role[&Role::Destinatario].len(), 1);
    assert!(classified.ignored.contains(&stray_key));
    assert_eq!(
        classified.by_role.values().map(|s| s.len()).sum::<usize>(),
        counts.values().sum::<usize>()
    );
}

/// S6: a cancellation event arrives before its referenced document has been
/// downloaded. Placement must report "not found yet" rather than guessing a
/// path, so the cancel fetcher can defer the event to a later cycle.
#[test]
fn cancel_event_defers_when_referenced_document_not_yet_on_disk() {
    let company = Company {
        id_canonical: "12345678000195".to_string(),
        folder_name: "Empresa".to_string(),
    };
    let referenced_key = format!("{}{}{}{}", "00", "24", "04", "0".repeat(38));
    let event = Inspection {
        kind: Kind::EventNFe,
        key: "9".repeat(44),
        referenced_key: Some(referenced_key),
        event_type: Some("110111".to_string()),
        emission_ts: "2024-04-10T00:00:00".to_string(),
        year_month: "2024/04".to_string(),
        direction: None,
    };

    let found = locate_referenced_document(&company, &PathBuf::from("/primary"), &event, |_| false);
    assert!(found.is_none());
}

/// Once the referenced document exists on disk (in any of the candidate
/// directions), placement resolves the cancel-mirror path right next to it.
#[test]
fn cancel_event_resolves_once_referenced_document_exists() {
    let company = Company {
        id_canonical: "12345678000195".to_string(),
        folder_name: "Empresa".to_string(),
    };
    let referenced_key = format!("{}{}{}{}", "00", "24", "04", "0".repeat(38));
    let event = Inspection {
        kind: Kind::EventNFe,
        key: "9".repeat(44),
        referenced_key: Some(referenced_key.clone()),
        event_type: Some("110111".to_string()),
        emission_ts: "2024-04-10T00:00:00".to_string(),
        year_month: "2024/04".to_string(),
        direction: None,
    };

    let expected_doc_path = PathBuf::from("/primary")
        .join("2024")
        .join("Empresa")
        .join("04")
        .join("NFe")
        .join("Entrada")
        .join(format!("{referenced_key}.xml"));

    let found = locate_referenced_document(&company, &PathBuf::from("/primary"), &event, |p| {
        p == expected_doc_path
    });
    assert!(found.is_some());
    assert!(found.unwrap().to_string_lossy().ends_with("_CANC.xml"));
}

/// A document already flat-mirrored on a prior pass doesn't get a second
/// flat-mirror write on a later pass that re-observes the same key, keeping
/// `flat_root` a true one-entry-per-key mirror across cycles.
#[test]
fn flat_mirror_not_duplicated_across_cycles_for_same_key() {
    let company = Company {
        id_canonical: "12345678000195".to_string(),
        folder_name: "Empresa".to_string(),
    };
    let insp = Inspection {
        kind: Kind::NFe,
        key: "7".repeat(44),
        referenced_key: None,
        event_type: None,
        emission_ts: "2024-04-10T00:00:00".to_string(),
        year_month: "2024/04".to_string(),
        direction: Some(Direction::Saida),
    };
    let primary_root = PathBuf::from("/primary");
    let flat_root = PathBuf::from("/flat");

    let first_pass_imported = HashSet::new();
    let first = compute_document_destinations(
        &PlacementInputs {
            company: &company,
            inspection: &insp,
            primary_root: &primary_root,
            flat_root: &flat_root,
            today: chrono::NaiveDate::from_ymd_opt(2024, 4, 15).unwrap(),
            imported_keys: &first_pass_imported,
        },
        false,
    )
    .unwrap();
    assert!(first.flat_added);

    let mut second_pass_imported = HashSet::new();
    second_pass_imported.insert(insp.key.clone());
    let second = compute_document_destinations(
        &PlacementInputs {
            company: &company,
            inspection: &insp,
            primary_root: &primary_root,
            flat_root: &flat_root,
            today: chrono::NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
            imported_keys: &second_pass_imported,
        },
        false,
    )
    .unwrap();
    assert!(!second.flat_added);
    assert_eq!(second.destinations.len(), 1);
}

/// An upstream blob whose root element isn't a recognized document/event
/// kind must not panic placement; it's treated as unplaceable.
#[test]
fn unrecognized_root_element_yields_no_placement() {
    let company = Company {
        id_canonical: "12345678000195".to_string(),
        folder_name: "Empresa".to_string(),
    };
    let insp = Inspection {
        kind: Kind::Unknown,
        key: String::new(),
        referenced_key: None,
        event_type: None,
        emission_ts: String::new(),
        year_month: String::new(),
        direction: None,
    };
    let primary_root = PathBuf::from("/primary");
    let flat_root = PathBuf::from("/flat");
    let imported = HashSet::new();

    let result = compute_document_destinations(
        &PlacementInputs {
            company: &company,
            inspection: &insp,
            primary_root: &primary_root,
            flat_root: &flat_root,
            today: chrono::NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
            imported_keys: &imported,
        },
        false,
    );
    assert!(result.is_none());
}
