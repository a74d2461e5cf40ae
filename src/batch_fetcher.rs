//! Incremental batch fetcher: for a `(company, month, doc_type, role)`
//! cursor, pulls pages of XML blobs from the upstream client, parses and
//! commits them, then advances the persisted cursor.
//!
//! Cursor/chunk loop shape ported from
//! `keeper-rs/src/scanner.rs::scan_new_subscriptions`, generalized from
//! block ranges to `(skip, take)` pages.

use crate::committer::Committer;
use crate::domain::{Company, DocType, MonthKey, Role};
use crate::errors::FetchError;
use crate::placement::{compute_document_destinations, PlacementInputs};
use crate::state_store::StateStore;
use crate::upstream::{BatchFilter, UpstreamClient};
use crate::xml_inspector;
use base64::Engine;
use std::path::Path;
use tracing::{info, warn};

pub const BATCH_SIZE: u32 = 50;

#[derive(Debug, Default)]
pub struct BatchFetchStats {
    pub fetched: u64,
    pub saved: u64,
    pub parse_errors: u64,
    pub info_errors: u64,
    pub save_errors: u64,
}

pub struct BatchFetchParams<'a> {
    pub company: &'a Company,
    pub month: &'a MonthKey,
    pub doc_type: DocType,
    pub role: Role,
    pub date_start: chrono::NaiveDate,
    pub date_end: chrono::NaiveDate,
    pub expected: u64,
    pub primary_root: &'a Path,
    pub flat_root: &'a Path,
    pub include_previous_month: bool,
    pub today: chrono::NaiveDate,
}

/// Runs the role's cursor loop to completion: `cursor < expected` while
/// upstream keeps returning full pages. On commit failure the cursor is
/// left untouched and the role loop breaks (spec §4.7 step 4).
pub async fn fetch_role(
    upstream: &UpstreamClient,
    state: &mut StateStore,
    committer: &Committer,
    params: &BatchFetchParams<'_>,
    now_ts: &str,
) -> Result<BatchFetchStats, FetchError> {
    let mut stats = BatchFetchStats::default();
    loop {
        let cursor = state.get_skip(&params.company.id_canonical, params.month, params.doc_type, params.role)?;
        if cursor >= params.expected {
            break;
        }
        let take = BATCH_SIZE.min((params.expected - cursor) as u32);

        let filter = BatchFilter {
            company_id: params.company.id_canonical.clone(),
            doc_type: params.doc_type,
            role: params.role,
            date_start: params.date_start,
            date_end: params.date_end,
            skip: cursor as u32,
            take,
        };
        let blobs = upstream.batch_download(&filter).await?;

        if blobs.is_empty() {
            if cursor < params.expected {
                warn!(
                    company = %params.company.id_canonical,
                    month = %params.month,
                    doc_type = params.doc_type.as_str(),
                    role = params.role.as_str(),
                    cursor,
                    expected = params.expected,
                    "upstream returned an unexpectedly empty batch; manifest and upstream disagree"
                );
            }
            break;
        }

        let mut imported = state.imported_keys_snapshot(
            &params.company.id_canonical,
            params.month,
            params.doc_type,
        )?;
        let mut tx = committer.begin(now_ts)?;
        let mut newly_imported = Vec::new();

        for blob in &blobs {
            stats.fetched += 1;
            let bytes = match base64::engine::general_purpose::STANDARD.decode(blob) {
                Ok(b) => b,
                Err(_) => {
                    stats.parse_errors += 1;
                    continue;
                }
            };
            let inspection = match xml_inspector::inspect(&bytes, &params.company.id_canonical) {
                Ok(i) => i,
                Err(_) => {
                    stats.info_errors += 1;
                    continue;
                }
            };

            let inputs = PlacementInputs {
                company: params.company,
                inspection: &inspection,
                primary_root: params.primary_root,
                flat_root: params.flat_root,
                today: params.today,
                imported_keys: &imported,
            };
            let placement = match compute_document_destinations(&inputs, params.include_previous_month) {
                Some(p) => p,
                None => {
                    warn!(key = %inspection.key, "unrecognized xml root element; skipping");
                    stats.info_errors += 1;
                    continue;
                }
            };
            if placement.flat_added {
                imported.insert(inspection.key.clone());
                newly_imported.push(inspection.key.clone());
            }

            let filename = format!("{}.xml", inspection.key);
            if let Err(e) = committer.add_file_operation(&mut tx, &bytes, placement.destinations, &filename) {
                warn!(error = %e, key = %inspection.key, "failed to stage file operation");
                stats.save_errors += 1;
            }
        }

        match committer.commit(&mut tx) {
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "batch commit failed; cursor not advanced");
                stats.save_errors += 1;
                break;
            }
        }

        for key in &newly_imported {
            state.mark_xml_as_imported(&params.company.id_canonical, params.month, params.doc_type, key)?;
        }
        let batch_len = blobs.len() as u64;
        state.update_skip(&params.company.id_canonical, params.month, params.doc_type, params.role, batch_len)?;
        stats.saved += batch_len;

        info!(
            company = %params.company.id_canonical,
            month = %params.month,
            doc_type = params.doc_type.as_str(),
            role = params.role.as_str(),
            batch_len,
            "committed batch"
        );

        if batch_len < take as u64 {
            break;
        }
    }
    Ok(stats)
}
