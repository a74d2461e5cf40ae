//! Per-month persisted state: skip cursors, imported-key sets, report
//! pendencies and download status, failed-company markers.
//!
//! Atomic-write-then-rename and the lazily-loaded/cached-per-partition shape
//! are ported from `keeper-rs/src/state.rs::KeeperState::load_or_init`/`save`;
//! `ReportPendency`'s attempts/backoff bookkeeping mirrors that file's
//! `RetryInfo`.

use crate::domain::{DocType, MonthKey, Role};
use crate::errors::StateError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::info;

pub const MAX_PENDENCY_ATTEMPTS: u32 = 10;
const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendencyStatus {
    PendingApi,
    PendingProcessing,
    NoDataConfirmed,
    MaxAttemptsReached,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportPendency {
    pub status: PendencyStatus,
    pub attempts: u32,
    pub first_failure_ts: String,
    pub last_attempt_ts: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadStatus {
    pub status: String,
    pub timestamp: String,
    pub message: Option<String>,
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedCompanyMarker {
    pub timestamp: String,
    pub month: String,
}

type DocTypeKey = String;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonthState {
    #[serde(default)]
    xml_skip_counts: HashMap<String, HashMap<DocTypeKey, HashMap<String, u64>>>,
    #[serde(default)]
    processed_xml_keys: HashMap<String, HashMap<DocTypeKey, HashSet<String>>>,
    #[serde(default)]
    report_download_status: HashMap<String, HashMap<DocTypeKey, DownloadStatus>>,
    #[serde(default)]
    report_pendencies: HashMap<String, HashMap<DocTypeKey, ReportPendency>>,
    #[serde(default)]
    failed_companies: HashMap<String, FailedCompanyMarker>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Metadata {
    version: u32,
    created_at: String,
    last_modified: String,
    available_months: Vec<String>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            created_at: String::new(),
            last_modified: String::new(),
            available_months: Vec::new(),
        }
    }
}

pub struct StateStore {
    root: PathBuf,
    metadata: Metadata,
    months: HashMap<String, MonthState>,
}

fn doc_key(d: DocType) -> String {
    d.as_str().to_string()
}

fn role_key(r: Role) -> String {
    r.as_str().to_string()
}

impl StateStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StateError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| StateError::Io {
            path: root.clone(),
            source: e,
        })?;
        let metadata_path = root.join("metadata.json");
        let metadata = if metadata_path.exists() {
            let text = std::fs::read_to_string(&metadata_path).map_err(|e| StateError::Io {
                path: metadata_path.clone(),
                source: e,
            })?;
            serde_json::from_str(&text)?
        } else {
            Metadata::default()
        };
        Ok(Self {
            root,
            metadata,
            months: HashMap::new(),
        })
    }

    fn month_path(&self, month: &MonthKey) -> PathBuf {
        self.root.join(month.as_str()).join("state.json")
    }

    /// Loads (and caches) a month's state, normalizing legacy `YYYY-MM`
    /// directory names to `MM-YYYY` the first time they're encountered.
    fn load(&mut self, month: &MonthKey) -> Result<(), StateError> {
        if self.months.contains_key(month.as_str()) {
            return Ok(());
        }
        let path = self.month_path(month);
        let state = if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|e| StateError::Io {
                path: path.clone(),
                source: e,
            })?;
            serde_json::from_str(&text)?
        } else {
            MonthState::default()
        };
        self.months.insert(month.as_str().to_string(), state);
        Ok(())
    }

    fn month_mut(&mut self, month: &MonthKey) -> Result<&mut MonthState, StateError> {
        self.load(month)?;
        Ok(self.months.get_mut(month.as_str()).expect("just loaded"))
    }

    // -- skip cursors --------------------------------------------------

    pub fn get_skip(
        &mut self,
        company: &str,
        month: &MonthKey,
        doc_type: DocType,
        role: Role,
    ) -> Result<u64, StateError> {
        let state = self.month_mut(month)?;
        Ok(state
            .xml_skip_counts
            .get(company)
            .and_then(|m| m.get(&doc_key(doc_type)))
            .and_then(|m| m.get(&role_key(role)))
            .copied()
            .unwrap_or(0))
    }

    /// Additive: adds `batch_size` to the current cursor.
    pub fn update_skip(
        &mut self,
        company: &str,
        month: &MonthKey,
        doc_type: DocType,
        role: Role,
        batch_size: u64,
    ) -> Result<u64, StateError> {
        let state = self.month_mut(month)?;
        let entry = state
            .xml_skip_counts
            .entry(company.to_string())
            .or_default()
            .entry(doc_key(doc_type))
            .or_default()
            .entry(role_key(role))
            .or_insert(0);
        *entry += batch_size;
        Ok(*entry)
    }

    /// Resets cursors for every role under `(company, month, doc_type)` to
    /// zero. Called when a pendency resolves with new manifest content, or
    /// under `seed_run`.
    pub fn reset_skip_for_report(
        &mut self,
        company: &str,
        month: &MonthKey,
        doc_type: DocType,
    ) -> Result<(), StateError> {
        let state = self.month_mut(month)?;
        if let Some(per_doc) = state.xml_skip_counts.get_mut(company) {
            if let Some(per_role) = per_doc.get_mut(&doc_key(doc_type)) {
                for v in per_role.values_mut() {
                    *v = 0;
                }
            }
        }
        Ok(())
    }

    // -- imported keys ---------------------------------------------------

    pub fn mark_xml_as_imported(
        &mut self,
        company: &str,
        month: &MonthKey,
        doc_type: DocType,
        key: &str,
    ) -> Result<(), StateError> {
        let state = self.month_mut(month)?;
        state
            .processed_xml_keys
            .entry(company.to_string())
            .or_default()
            .entry(doc_key(doc_type))
            .or_default()
            .insert(key.to_string());
        Ok(())
    }

    pub fn is_xml_already_imported(
        &mut self,
        company: &str,
        month: &MonthKey,
        doc_type: DocType,
        key: &str,
    ) -> Result<bool, StateError> {
        let state = self.month_mut(month)?;
        Ok(state
            .processed_xml_keys
            .get(company)
            .and_then(|m| m.get(&doc_key(doc_type)))
            .map(|set| set.contains(key))
            .unwrap_or(false))
    }

    /// Returns a snapshot copy of the full imported-key set for
    /// `(company, month, doc_type)`, for placement decisions that need to
    /// check membership repeatedly within one batch.
    pub fn imported_keys_snapshot(
        &mut self,
        company: &str,
        month: &MonthKey,
        doc_type: DocType,
    ) -> Result<HashSet<String>, StateError> {
        let state = self.month_mut(month)?;
        Ok(state
            .processed_xml_keys
            .get(company)
            .and_then(|m| m.get(&doc_key(doc_type)))
            .cloned()
            .unwrap_or_default())
    }

    pub fn imported_xml_count(
        &mut self,
        company: &str,
        month: &MonthKey,
        doc_type: DocType,
    ) -> Result<usize, StateError> {
        let state = self.month_mut(month)?;
        Ok(state
            .processed_xml_keys
            .get(company)
            .and_then(|m| m.get(&doc_key(doc_type)))
            .map(|set| set.len())
            .unwrap_or(0))
    }

    /// Unions a set of locally-observed keys into `processed_xml_keys`,
    /// correcting for XMLs that existed on disk but were never marked
    /// (spec's "retroactive import mark"). Returns how many keys were newly
    /// added (the "retroactive corrections" count).
    pub fn retroactively_mark_imported(
        &mut self,
        company: &str,
        month: &MonthKey,
        doc_type: DocType,
        local_keys: &HashSet<String>,
    ) -> Result<usize, StateError> {
        let state = self.month_mut(month)?;
        let set = state
            .processed_xml_keys
            .entry(company.to_string())
            .or_default()
            .entry(doc_key(doc_type))
            .or_default();
        let before = set.len();
        set.extend(local_keys.iter().cloned());
        Ok(set.len() - before)
    }

    // -- report pendencies -------------------------------------------------

    pub fn add_or_update_report_pendency(
        &mut self,
        company: &str,
        month: &MonthKey,
        doc_type: DocType,
        status: PendencyStatus,
        now_ts: &str,
    ) -> Result<ReportPendency, StateError> {
        let state = self.month_mut(month)?;
        let entry = state
            .report_pendencies
            .entry(company.to_string())
            .or_default()
            .entry(doc_key(doc_type));
        let pendency = entry.or_insert_with(|| ReportPendency {
            status,
            attempts: 0,
            first_failure_ts: now_ts.to_string(),
            last_attempt_ts: now_ts.to_string(),
        });
        pendency.attempts = (pendency.attempts + 1).min(MAX_PENDENCY_ATTEMPTS);
        pendency.last_attempt_ts = now_ts.to_string();
        pendency.status = if pendency.attempts >= MAX_PENDENCY_ATTEMPTS {
            PendencyStatus::MaxAttemptsReached
        } else {
            status
        };
        Ok(pendency.clone())
    }

    pub fn update_report_pendency_status(
        &mut self,
        company: &str,
        month: &MonthKey,
        doc_type: DocType,
        status: PendencyStatus,
    ) -> Result<(), StateError> {
        let state = self.month_mut(month)?;
        if let Some(p) = state
            .report_pendencies
            .get_mut(company)
            .and_then(|m| m.get_mut(&doc_key(doc_type)))
        {
            p.status = status;
        }
        Ok(())
    }

    pub fn resolve_report_pendency(
        &mut self,
        company: &str,
        month: &MonthKey,
        doc_type: DocType,
    ) -> Result<(), StateError> {
        let state = self.month_mut(month)?;
        if let Some(m) = state.report_pendencies.get_mut(company) {
            m.remove(&doc_key(doc_type));
        }
        Ok(())
    }

    pub fn get_report_pendency_details(
        &mut self,
        company: &str,
        month: &MonthKey,
        doc_type: DocType,
    ) -> Result<Option<ReportPendency>, StateError> {
        let state = self.month_mut(month)?;
        Ok(state
            .report_pendencies
            .get(company)
            .and_then(|m| m.get(&doc_key(doc_type)))
            .cloned())
    }

    /// Lists every `(company, month, doc_type)` with an open pendency,
    /// across all months currently known to this store's metadata, paired
    /// with the pendency record itself so callers can report how long it's
    /// been stuck (`first_failure_ts`) without a second lookup.
    pub fn list_pending_reports(
        &mut self,
    ) -> Result<Vec<(String, MonthKey, DocType, ReportPendency)>, StateError> {
        let months: Vec<String> = self.metadata.available_months.clone();
        let mut out = Vec::new();
        for raw in months {
            let month = MonthKey::parse(&raw)?;
            self.load(&month)?;
            let state = self.months.get(month.as_str()).expect("just loaded");
            for (company, by_doc) in &state.report_pendencies {
                for (doc, pendency) in by_doc {
                    if matches!(
                        pendency.status,
                        PendencyStatus::PendingApi | PendencyStatus::PendingProcessing
                    ) {
                        let doc_type = if doc == "CTe" { DocType::CTe } else { DocType::NFe };
                        out.push((company.clone(), month.clone(), doc_type, pendency.clone()));
                    }
                }
            }
        }
        Ok(out)
    }

    // -- download status / failed companies -----------------------------

    pub fn update_report_download_status(
        &mut self,
        company: &str,
        month: &MonthKey,
        doc_type: DocType,
        status: DownloadStatus,
    ) -> Result<(), StateError> {
        let state = self.month_mut(month)?;
        state
            .report_download_status
            .entry(company.to_string())
            .or_default()
            .insert(doc_key(doc_type), status);
        Ok(())
    }

    pub fn mark_company_failed(
        &mut self,
        company: &str,
        month: &MonthKey,
        now_ts: &str,
    ) -> Result<(), StateError> {
        let state = self.month_mut(month)?;
        state.failed_companies.insert(
            company.to_string(),
            FailedCompanyMarker {
                timestamp: now_ts.to_string(),
                month: month.as_str().to_string(),
            },
        );
        Ok(())
    }

    // -- persistence -------------------------------------------------------

    pub fn save_month(&mut self, month: &MonthKey, now_ts: &str) -> Result<(), StateError> {
        self.load(month)?;
        let path = self.month_path(month);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StateError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let state = self.months.get(month.as_str()).expect("just loaded");
        atomic_write_json(&path, state)?;

        if !self.metadata.available_months.iter().any(|m| m == month.as_str()) {
            self.metadata.available_months.push(month.as_str().to_string());
        }
        if self.metadata.created_at.is_empty() {
            self.metadata.created_at = now_ts.to_string();
        }
        self.metadata.last_modified = now_ts.to_string();
        let metadata_path = self.root.join("metadata.json");
        atomic_write_json(&metadata_path, &self.metadata)?;
        info!(month = month.as_str(), "saved state");
        Ok(())
    }
}

fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
    let tmp_path = path.with_extension("json.tmp");
    let text = serde_json::to_string_pretty(value)?;
    std::fs::write(&tmp_path, text.as_bytes()).map_err(|e| StateError::Io {
        path: tmp_path.clone(),
        source: e,
    })?;
    let file = std::fs::File::open(&tmp_path).map_err(|e| StateError::Io {
        path: tmp_path.clone(),
        source: e,
    })?;
    file.sync_all().map_err(|e| StateError::Io {
        path: tmp_path.clone(),
        source: e,
    })?;
    std::fs::rename(&tmp_path, path).map_err(|e| StateError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn month() -> MonthKey {
        MonthKey::parse("04-2024").unwrap()
    }

    #[test]
    fn skip_cursor_is_additive_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open(dir.path()).unwrap();
        let m = month();
        assert_eq!(store.get_skip("123", &m, DocType::NFe, Role::Emitente).unwrap(), 0);
        store.update_skip("123", &m, DocType::NFe, Role::Emitente, 50).unwrap();
        store.update_skip("123", &m, DocType::NFe, Role::Emitente, 30).unwrap();
        assert_eq!(store.get_skip("123", &m, DocType::NFe, Role::Emitente).unwrap(), 80);
        store.save_month(&m, "2024-04-01T00:00:00Z").unwrap();

        let mut reopened = StateStore::open(dir.path()).unwrap();
        assert_eq!(
            reopened.get_skip("123", &m, DocType::NFe, Role::Emitente).unwrap(),
            80
        );
    }

    #[test]
    fn reset_skip_zeroes_all_roles() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open(dir.path()).unwrap();
        let m = month();
        store.update_skip("c", &m, DocType::NFe, Role::Emitente, 20).unwrap();
        store.update_skip("c", &m, DocType::NFe, Role::Destinatario, 10).unwrap();
        store.reset_skip_for_report("c", &m, DocType::NFe).unwrap();
        assert_eq!(store.get_skip("c", &m, DocType::NFe, Role::Emitente).unwrap(), 0);
        assert_eq!(store.get_skip("c", &m, DocType::NFe, Role::Destinatario).unwrap(), 0);
    }

    #[test]
    fn pendency_attempts_cap_at_max() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open(dir.path()).unwrap();
        let m = month();
        let mut last = None;
        for _ in 0..(MAX_PENDENCY_ATTEMPTS + 5) {
            last = Some(
                store
                    .add_or_update_report_pendency(
                        "c",
                        &m,
                        DocType::NFe,
                        PendencyStatus::PendingApi,
                        "t",
                    )
                    .unwrap(),
            );
        }
        let p = last.unwrap();
        assert_eq!(p.attempts, MAX_PENDENCY_ATTEMPTS);
        assert_eq!(p.status, PendencyStatus::MaxAttemptsReached);
    }

    #[test]
    fn is_xml_already_imported_reflects_mark() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open(dir.path()).unwrap();
        let m = month();
        let key = "1".repeat(44);
        assert!(!store.is_xml_already_imported("c", &m, DocType::NFe, &key).unwrap());
        store.mark_xml_as_imported("c", &m, DocType::NFe, &key).unwrap();
        assert!(store.is_xml_already_imported("c", &m, DocType::NFe, &key).unwrap());
    }

    #[test]
    fn update_report_pendency_status_overwrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open(dir.path()).unwrap();
        let m = month();
        store
            .add_or_update_report_pendency("c", &m, DocType::CTe, PendencyStatus::PendingApi, "t0")
            .unwrap();
        store
            .update_report_pendency_status("c", &m, DocType::CTe, PendencyStatus::PendingProcessing)
            .unwrap();
        let details = store.get_report_pendency_details("c", &m, DocType::CTe).unwrap().unwrap();
        assert_eq!(details.status, PendencyStatus::PendingProcessing);
        // attempts/timestamps are untouched by a bare status overwrite.
        assert_eq!(details.attempts, 1);
    }

    #[test]
    fn retroactive_mark_reports_only_new_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open(dir.path()).unwrap();
        let m = month();
        store.mark_xml_as_imported("c", &m, DocType::NFe, &"1".repeat(44)).unwrap();
        let mut locally_seen = HashSet::new();
        locally_seen.insert("1".repeat(44));
        locally_seen.insert("2".repeat(44));
        let added = store
            .retroactively_mark_imported("c", &m, DocType::NFe, &locally_seen)
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(store.imported_xml_count("c", &m, DocType::NFe).unwrap(), 2);
    }
}
