//! Cancel-Event Fetcher: queries a fixed matrix of
//! `(doc_type, role_field, event_type_code)` triples for a company's date
//! window, paginating each until the response is empty or short, then
//! persists every decoded event next to its referenced document.
//!
//! Pagination loop reuses `batch_fetcher`'s cursor-over-pages shape; the
//! matrix iteration follows spec §4.9 directly.

use crate::committer::Committer;
use crate::domain::{Company, DocType, Role};
use crate::errors::FetchError;
use crate::placement::{cancel_mirror_path, locate_referenced_document};
use crate::upstream::{EventsFilter, UpstreamClient};
use crate::xml_inspector;
use base64::Engine;
use std::path::Path;
use tracing::{info, warn};

/// `(doc_type, role, event_type_code)` triples covering NFe cancel, NFe
/// substitution-cancel, CTe cancel (two code variants), for
/// Emitente/Destinatario, plus Tomador for CTe.
fn matrix() -> Vec<(DocType, Role, &'static str)> {
    let mut rows = Vec::new();
    for role in [Role::Emitente, Role::Destinatario] {
        rows.push((DocType::NFe, role, "110111"));
        rows.push((DocType::NFe, role, "110112"));
        rows.push((DocType::CTe, role, "110111"));
        rows.push((DocType::CTe, role, "610601"));
    }
    rows.push((DocType::CTe, Role::Tomador, "110111"));
    rows.push((DocType::CTe, Role::Tomador, "610601"));
    rows
}

#[derive(Debug, Default)]
pub struct CancelFetchStats {
    pub fetched: u32,
    pub placed: u32,
    pub deferred: u32,
    pub parse_errors: u32,
}

pub async fn fetch_cancel_events(
    upstream: &UpstreamClient,
    committer: &Committer,
    company: &Company,
    date_start: chrono::NaiveDate,
    date_end: chrono::NaiveDate,
    primary_root: &Path,
    cancel_root: &Path,
    now_ts: &str,
) -> Result<CancelFetchStats, FetchError> {
    let mut stats = CancelFetchStats::default();

    for (doc_type, role, event_type) in matrix() {
        let filter = EventsFilter {
            company_id: company.id_canonical.clone(),
            doc_type,
            role,
            event_type: event_type.to_string(),
            date_start,
            date_end,
        };
        let blobs = upstream.events_download(&filter).await?;
        stats.fetched += blobs.len() as u32;

        for blob in blobs {
            let bytes = match base64::engine::general_purpose::STANDARD.decode(&blob) {
                Ok(b) => b,
                Err(_) => {
                    stats.parse_errors += 1;
                    continue;
                }
            };
            let event = match xml_inspector::inspect(&bytes, &company.id_canonical) {
                Ok(e) => e,
                Err(_) => {
                    stats.parse_errors += 1;
                    continue;
                }
            };

            // Upstream filters by event_type server-side, but a blob with an
            // unexpected type is still worth rejecting rather than writing.
            if !event.event_type.as_deref().is_some_and(crate::domain::is_cancel_event) {
                warn!(event_type = ?event.event_type, "upstream returned a non-cancel event; skipping");
                stats.parse_errors += 1;
                continue;
            }

            let found = locate_referenced_document(company, primary_root, &event, |p| p.exists());
            let Some(primary_target) = found else {
                info!(
                    referenced_key = ?event.referenced_key,
                    "referenced document not found locally yet; deferring cancel event"
                );
                stats.deferred += 1;
                continue;
            };

            let referenced_key = event.referenced_key.clone().unwrap_or_default();
            let cancel_target = cancel_mirror_path(cancel_root, &referenced_key);
            let filename = format!("{referenced_key}_CANC.xml");

            let mut tx = committer.begin(now_ts)?;
            if let Err(e) = committer.add_file_operation(
                &mut tx,
                &bytes,
                vec![primary_target, cancel_target],
                &filename,
            ) {
                warn!(referenced_key, error = %e, "failed to stage cancel event");
                continue;
            }
            if let Err(e) = committer.commit(&mut tx) {
                warn!(referenced_key, error = %e, "failed to commit cancel event");
                continue;
            }
            stats.placed += 1;
        }
    }

    Ok(stats)
}
