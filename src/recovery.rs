//! Individual Recovery Fetcher: downloads a list of specific keys one by
//! one, sequentially (never concurrently — spec §4.8/§5), persisting each
//! via the same Placement Rules as the batch fetcher minus the
//! previous-month mirror.
//!
//! Per-item precheck/send/classify loop narrowed from
//! `keeper-rs/src/collector.rs::collect_due` to strictly sequential, since
//! the specification forbids concurrency in this path.

use crate::committer::Committer;
use crate::domain::{Company, DocType, MonthKey};
use crate::errors::FetchError;
use crate::placement::{compute_document_destinations, PlacementInputs};
use crate::state_store::StateStore;
use crate::upstream::UpstreamClient;
use crate::xml_inspector;
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct RecoveryStats {
    pub attempts: u32,
    pub successes: u32,
    pub download_failures: u32,
    pub save_failures: u32,
}

pub struct RecoveryParams<'a> {
    pub company: &'a Company,
    pub month: &'a MonthKey,
    pub primary_root: &'a Path,
    pub flat_root: &'a Path,
    pub today: chrono::NaiveDate,
}

/// Attempts recovery for every key in `keys`, in order. Returns the keys
/// that succeeded and the keys that failed, alongside aggregate stats.
pub async fn recover_keys(
    upstream: &UpstreamClient,
    state: &mut StateStore,
    committer: &Committer,
    params: &RecoveryParams<'_>,
    keys: &[String],
    now_ts: &str,
) -> Result<(RecoveryStats, Vec<String>, Vec<String>), FetchError> {
    let mut stats = RecoveryStats::default();
    let mut succeeded = Vec::new();
    let mut failed = Vec::new();

    for key in keys {
        stats.attempts += 1;
        let doc_type = DocType::from_key_model(key);

        let bytes = match upstream.get_one(key, doc_type, true).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                warn!(key, "upstream returned no content for recovery key");
                stats.download_failures += 1;
                failed.push(key.clone());
                continue;
            }
            Err(e) => {
                warn!(key, error = %e, "recovery download failed");
                stats.download_failures += 1;
                failed.push(key.clone());
                continue;
            }
        };

        let inspection = match xml_inspector::inspect(&bytes, &params.company.id_canonical) {
            Ok(i) => i,
            Err(e) => {
                warn!(key, error = %e, "recovery blob failed to parse");
                stats.save_failures += 1;
                failed.push(key.clone());
                continue;
            }
        };

        let mut imported = state.imported_keys_snapshot(
            &params.company.id_canonical,
            params.month,
            doc_type,
        )?;
        let inputs = PlacementInputs {
            company: params.company,
            inspection: &inspection,
            primary_root: params.primary_root,
            flat_root: params.flat_root,
            today: params.today,
            imported_keys: &imported,
        };
        // Previous-month mirror doesn't apply: the document's own emission
        // already determines placement for a recovered key.
        let placement = match compute_document_destinations(&inputs, false) {
            Some(p) => p,
            None => {
                warn!(key, "recovered blob has an unrecognized xml root element");
                stats.save_failures += 1;
                failed.push(key.clone());
                continue;
            }
        };

        let mut tx = committer.begin(now_ts)?;
        let filename = format!("{}.xml", inspection.key);
        if let Err(e) = committer.add_file_operation(&mut tx, &bytes, placement.destinations, &filename) {
            warn!(key, error = %e, "failed to stage recovered file");
            stats.save_failures += 1;
            failed.push(key.clone());
            continue;
        }
        if let Err(e) = committer.commit(&mut tx) {
            warn!(key, error = %e, "failed to commit recovered file");
            stats.save_failures += 1;
            failed.push(key.clone());
            continue;
        }

        if placement.flat_added {
            imported.insert(inspection.key.clone());
            state.mark_xml_as_imported(&params.company.id_canonical, params.month, doc_type, &inspection.key)?;
        }

        stats.successes += 1;
        succeeded.push(key.clone());
        info!(key, "recovered key");
    }

    Ok((stats, succeeded, failed))
}

/// Computes the set of "valid faltantes" still missing from disk: manifest
/// keys in period minus keys already observed locally.
pub fn missing_keys(keys_in_period: &HashSet<String>, local_keys: &HashSet<String>) -> Vec<String> {
    keys_in_period.difference(local_keys).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_is_set_difference() {
        let mut period = HashSet::new();
        period.insert("a".to_string());
        period.insert("b".to_string());
        let mut local = HashSet::new();
        local.insert("a".to_string());
        let missing = missing_keys(&period, &local);
        assert_eq!(missing, vec!["b".to_string()]);
    }
}
