//! Company Pipeline Orchestrator (C11): drives the per-company, per-month
//! state machine described in spec §4.11. Every step is wrapped so no
//! error escapes company scope — on an unexpected failure the company is
//! marked failed and the cycle moves on to the next one.
//!
//! Error-containment (catch, log, continue) is grounded on the loop body
//! of `keeper-rs/src/main.rs`.

use crate::audit::{self, AuditSummary, DocTypeValidation, IndividualDownloadStats};
use crate::batch_fetcher::{self, BatchFetchParams};
use crate::cancel_fetcher;
use crate::circuit::CircuitBreaker;
use crate::committer::Committer;
use crate::domain::{Company, DocType, MonthKey, Role};
use crate::errors::{FetchError, StateError, UpstreamError};
use crate::manifest::{self, ManifestTable};
use crate::recovery::{self, RecoveryParams};
use crate::state_store::{PendencyStatus, StateStore};
use crate::upstream::UpstreamClient;
use chrono::Datelike;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, warn};

/// Bundles the shared, mutable collaborators a cycle threads through every
/// company, in place of ambient globals.
pub struct Context<'a> {
    pub upstream: &'a UpstreamClient,
    pub state: &'a mut StateStore,
    pub committer: &'a Committer,
    pub circuit: &'a mut CircuitBreaker,
    pub primary_root: PathBuf,
    pub flat_root: PathBuf,
    pub cancel_root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompanyOutcome {
    Ok,
    FailedCritical,
    SkippedCircuit,
}

/// Runs the full per-company state machine for one cycle pass. Returns the
/// outcome used by the cycle orchestrator's aggregate statistics.
pub async fn process_company(
    ctx: &mut Context<'_>,
    company: &Company,
    today: chrono::NaiveDate,
    seed_run: bool,
    now_ts: &str,
) -> CompanyOutcome {
    let now = Instant::now();
    if ctx.circuit.is_open(&company.id_canonical, now) {
        return CompanyOutcome::SkippedCircuit;
    }

    if today.day() <= 3 {
        if let Err(timed_out) = run_previous_month_pass(ctx, company, today, now_ts).await {
            if timed_out {
                ctx.circuit.blacklist_for_timeout(&company.id_canonical, now);
            }
        }
    }

    let month = MonthKey::from_year_month(today.year(), today.month());
    if seed_run {
        let _ = ctx.state.reset_skip_for_report(&company.id_canonical, &month, DocType::NFe);
        let _ = ctx.state.reset_skip_for_report(&company.id_canonical, &month, DocType::CTe);
    }

    let critical_failure = match run_current_month_pass(ctx, company, &month, today, now_ts).await {
        Ok(()) => false,
        Err(e) => {
            error!(company = %company.id_canonical, error = %e, "current-month pass failed");
            true
        }
    };

    if !critical_failure {
        let date_start = chrono::NaiveDate::from_ymd_opt(month.year(), month.month(), 1).unwrap();
        if let Err(e) = cancel_fetcher::fetch_cancel_events(
            ctx.upstream,
            ctx.committer,
            company,
            date_start,
            today,
            &ctx.primary_root,
            &ctx.cancel_root,
            now_ts,
        )
        .await
        {
            warn!(company = %company.id_canonical, error = %e, "cancel-event pass failed");
        }
    }

    if critical_failure {
        ctx.circuit.record_failure(&company.id_canonical);
        let _ = ctx.state.mark_company_failed(&company.id_canonical, &month, now_ts);
        CompanyOutcome::FailedCritical
    } else {
        ctx.circuit.record_success(&company.id_canonical);
        CompanyOutcome::Ok
    }
}

/// Returns `Err(true)` if a hard timeout occurred (caller arms the timeout
/// blacklist), `Err(false)` for any other non-critical failure. The
/// previous-month pass never counts toward company-level critical failure.
async fn run_previous_month_pass(
    ctx: &mut Context<'_>,
    company: &Company,
    today: chrono::NaiveDate,
    now_ts: &str,
) -> Result<(), bool> {
    let current = MonthKey::from_year_month(today.year(), today.month());
    let prev = current.previous();
    let date_start = chrono::NaiveDate::from_ymd_opt(prev.year(), prev.month(), 1).unwrap();
    let date_end = last_day_of_month(prev.year(), prev.month());

    for doc_type in [DocType::NFe, DocType::CTe] {
        let report = ctx
            .upstream
            .monthly_report(&company.id_canonical, doc_type, prev.month(), prev.year(), None)
            .await;
        let report = match report {
            Ok(r) => r,
            Err(UpstreamError::Timeout(_)) => return Err(true),
            Err(_) => continue,
        };
        if report.empty || report.report_base64.is_none() {
            continue;
        }

        let (table, _keys_in_period) = match load_manifest_from_report(&report).await {
            Ok(v) => v,
            Err(_) => continue,
        };

        let counts = manifest::get_counts_by_role(&table, &company.id_canonical, doc_type);
        for role in Role::applicable_for(doc_type) {
            let expected = *counts.get(role).unwrap_or(&0) as u64;
            if expected == 0 {
                continue;
            }
            let params = BatchFetchParams {
                company,
                month: &prev,
                doc_type,
                role: *role,
                date_start,
                date_end,
                expected,
                primary_root: &ctx.primary_root,
                flat_root: &ctx.flat_root,
                include_previous_month: true,
                today,
            };
            let _ = batch_fetcher::fetch_role(ctx.upstream, ctx.state, ctx.committer, &params, now_ts).await;
        }
    }
    Ok(())
}

fn last_day_of_month(year: i32, month: u32) -> chrono::NaiveDate {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    chrono::NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .unwrap()
        .pred_opt()
        .unwrap()
}

/// A monthly report's body arrives as a base64-encoded xlsx payload; it is
/// decoded to a temp file so the manifest reader's path-based API can parse
/// it the same way it parses a disk-resident manifest.
async fn load_manifest_from_report(
    report: &crate::upstream::MonthlyReportResult,
) -> Result<(ManifestTable, HashSet<String>), crate::errors::ManifestError> {
    use base64::Engine;
    let b64 = report
        .report_base64
        .as_deref()
        .ok_or_else(|| crate::errors::ManifestError::Spreadsheet("empty report".into()))?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|e| crate::errors::ManifestError::Spreadsheet(e.to_string()))?;
    let tmp = std::env::temp_dir().join(format!("report_{}.xlsx", uuid::Uuid::new_v4()));
    std::fs::write(&tmp, &bytes)?;
    let far_future = chrono::NaiveDate::from_ymd_opt(9999, 12, 31).unwrap();
    let far_past = chrono::NaiveDate::from_ymd_opt(1, 1, 1).unwrap();
    let result = manifest::read_report_data(tmp.to_string_lossy().as_ref(), far_past, far_future).await;
    let _ = std::fs::remove_file(&tmp);
    result
}

async fn run_current_month_pass(
    ctx: &mut Context<'_>,
    company: &Company,
    month: &MonthKey,
    today: chrono::NaiveDate,
    now_ts: &str,
) -> Result<(), FetchError> {
    let date_start = chrono::NaiveDate::from_ymd_opt(month.year(), month.month(), 1).unwrap();
    let date_end = today;
    let include_previous_month = today.day() <= 3;

    let mut validations = Vec::new();
    let mut report_counts_by_role = Vec::new();
    let mut local_dir_counts = std::collections::HashMap::new();
    let mut retroactive_total = 0usize;
    let mut individual_totals = recovery::RecoveryStats::default();
    let mut batch_totals = batch_fetcher::BatchFetchStats::default();

    for doc_type in [DocType::NFe, DocType::CTe] {
        let pendency = ctx.state.get_report_pendency_details(&company.id_canonical, month, doc_type)?;
        if let Some(p) = &pendency {
            if matches!(p.status, PendencyStatus::NoDataConfirmed | PendencyStatus::MaxAttemptsReached) {
                continue;
            }
        }

        let report = ctx
            .upstream
            .monthly_report(&company.id_canonical, doc_type, month.month(), month.year(), None)
            .await;

        let report = match report {
            Ok(r) => r,
            Err(_) => {
                ctx.state.add_or_update_report_pendency(
                    &company.id_canonical,
                    month,
                    doc_type,
                    PendencyStatus::PendingApi,
                    now_ts,
                )?;
                continue;
            }
        };

        if report.empty {
            ctx.state.add_or_update_report_pendency(
                &company.id_canonical,
                month,
                doc_type,
                PendencyStatus::NoDataConfirmed,
                now_ts,
            )?;
            continue;
        }

        let (table, keys_in_period) = match load_manifest_from_report(&report).await {
            Ok(v) => v,
            Err(_) => {
                ctx.state.add_or_update_report_pendency(
                    &company.id_canonical,
                    month,
                    doc_type,
                    PendencyStatus::PendingProcessing,
                    now_ts,
                )?;
                continue;
            }
        };
        ctx.state.resolve_report_pendency(&company.id_canonical, month, doc_type)?;
        ctx.state.update_report_download_status(
            &company.id_canonical,
            month,
            doc_type,
            crate::state_store::DownloadStatus {
                status: "success_temp".to_string(),
                timestamp: now_ts.to_string(),
                message: None,
                file_path: None,
            },
        )?;

        let counts = manifest::get_counts_by_role(&table, &company.id_canonical, doc_type);
        for role in Role::applicable_for(doc_type) {
            let expected = *counts.get(role).unwrap_or(&0) as u64;
            report_counts_by_role.push((doc_type, *role, expected as usize));
            if expected == 0 {
                continue;
            }
            let params = BatchFetchParams {
                company,
                month,
                doc_type,
                role: *role,
                date_start,
                date_end,
                expected,
                primary_root: &ctx.primary_root,
                flat_root: &ctx.flat_root,
                include_previous_month,
                today,
            };
            let role_stats =
                batch_fetcher::fetch_role(ctx.upstream, ctx.state, ctx.committer, &params, now_ts).await?;
            batch_totals.parse_errors += role_stats.parse_errors;
            batch_totals.info_errors += role_stats.info_errors;
            batch_totals.save_errors += role_stats.save_errors;
        }

        let local_keys = list_local_keys(&ctx.primary_root, company, month, doc_type);
        let extras: HashSet<String> = local_keys.difference(&keys_in_period).cloned().collect();
        let missing: HashSet<String> = recovery::missing_keys(&keys_in_period, &local_keys).into_iter().collect();
        let classified = manifest::classify_keys_by_role(&missing, &table, &company.id_canonical, doc_type);

        let retro = ctx.state.retroactively_mark_imported(&company.id_canonical, month, doc_type, &local_keys)?;
        retroactive_total += retro;

        let valid_faltantes: HashSet<String> = classified.by_role.values().flatten().cloned().collect();
        let mut recovered = 0usize;
        let mut individual_stats = recovery::RecoveryStats::default();
        if !valid_faltantes.is_empty() {
            let recovery_params = RecoveryParams {
                company,
                month,
                primary_root: &ctx.primary_root,
                flat_root: &ctx.flat_root,
                today,
            };
            let keys: Vec<String> = valid_faltantes.iter().cloned().collect();
            let (stats, succeeded, _failed) =
                recovery::recover_keys(ctx.upstream, ctx.state, ctx.committer, &recovery_params, &keys, now_ts)
                    .await?;
            recovered = succeeded.len();
            individual_stats = stats;
        }
        individual_totals.attempts += individual_stats.attempts;
        individual_totals.successes += individual_stats.successes;
        individual_totals.download_failures += individual_stats.download_failures;
        individual_totals.save_failures += individual_stats.save_failures;

        let disk_count = list_local_keys(&ctx.primary_root, company, month, doc_type).len();
        let faltantes_valid = valid_faltantes.len().saturating_sub(recovered);
        validations.push(DocTypeValidation {
            doc_type,
            manifest_count: keys_in_period.len(),
            disk_count,
            faltantes_valid,
            ignored_faltantes: classified.ignored.len(),
            extras: extras.len(),
            status: if extras.is_empty() && faltantes_valid == 0 {
                "OK".to_string()
            } else {
                "PENDENTE".to_string()
            },
        });
        *local_dir_counts.entry(doc_type.as_str().to_string()).or_insert(0) += disk_count;
    }

    let cancel_event_counts = collect_cancel_event_counts(&ctx.primary_root, company, month);

    let summary = AuditSummary {
        execution_ts: now_ts.to_string(),
        period: month.as_str().to_string(),
        validations,
        report_counts_by_role,
        local_dir_counts,
        cancel_event_counts,
        parse_errors: batch_totals.parse_errors,
        info_errors: batch_totals.info_errors,
        save_errors: batch_totals.save_errors,
        individual: IndividualDownloadStats {
            attempts: individual_totals.attempts,
            successes: individual_totals.successes,
            download_failures: individual_totals.download_failures,
            save_failures: individual_totals.save_failures,
            retroactive_corrections: retroactive_total,
        },
    };
    audit::append_summary(&ctx.primary_root, company, month, &summary).map_err(|e| {
        FetchError::State(StateError::Io {
            path: ctx.primary_root.clone(),
            source: e,
        })
    })?;

    Ok(())
}

/// Replays a single open report pendency: attempts the monthly report and
/// batch fetch for `(company, month, doc_type)` exactly as the normal
/// current-month pass does. Returns `Ok(true)` if the pendency resolved with
/// a non-empty report (caller resets the cursor), `Ok(false)` if it's still
/// pending or came back empty, `Err` on an unexpected failure.
pub async fn replay_pendency(
    ctx: &mut Context<'_>,
    company: &Company,
    month: &MonthKey,
    doc_type: DocType,
    today: chrono::NaiveDate,
    now_ts: &str,
) -> Result<bool, FetchError> {
    let report = ctx
        .upstream
        .monthly_report(&company.id_canonical, doc_type, month.month(), month.year(), None)
        .await;

    let report = match report {
        Ok(r) => r,
        Err(_) => {
            ctx.state.add_or_update_report_pendency(
                &company.id_canonical,
                month,
                doc_type,
                PendencyStatus::PendingApi,
                now_ts,
            )?;
            return Ok(false);
        }
    };

    if report.empty {
        ctx.state.add_or_update_report_pendency(
            &company.id_canonical,
            month,
            doc_type,
            PendencyStatus::NoDataConfirmed,
            now_ts,
        )?;
        return Ok(false);
    }

    let (table, _keys_in_period) = match load_manifest_from_report(&report).await {
        Ok(v) => v,
        Err(_) => {
            ctx.state.add_or_update_report_pendency(
                &company.id_canonical,
                month,
                doc_type,
                PendencyStatus::PendingProcessing,
                now_ts,
            )?;
            return Ok(false);
        }
    };

    ctx.state.resolve_report_pendency(&company.id_canonical, month, doc_type)?;
    ctx.state.update_report_download_status(
        &company.id_canonical,
        month,
        doc_type,
        crate::state_store::DownloadStatus {
            status: "success_temp".to_string(),
            timestamp: now_ts.to_string(),
            message: None,
            file_path: None,
        },
    )?;

    let date_start = chrono::NaiveDate::from_ymd_opt(month.year(), month.month(), 1).unwrap();
    let date_end = today;
    let counts = manifest::get_counts_by_role(&table, &company.id_canonical, doc_type);
    for role in Role::applicable_for(doc_type) {
        let expected = *counts.get(role).unwrap_or(&0) as u64;
        if expected == 0 {
            continue;
        }
        let params = BatchFetchParams {
            company,
            month,
            doc_type,
            role: *role,
            date_start,
            date_end,
            expected,
            primary_root: &ctx.primary_root,
            flat_root: &ctx.flat_root,
            include_previous_month: false,
            today,
        };
        batch_fetcher::fetch_role(ctx.upstream, ctx.state, ctx.committer, &params, now_ts).await?;
    }

    Ok(true)
}

/// Lists the 44-digit document keys present on disk under the month's
/// primary directory for a doc_type (all direction/mirror subdirectories).
fn list_local_keys(primary_root: &Path, company: &Company, month: &MonthKey, doc_type: DocType) -> HashSet<String> {
    let mut keys = HashSet::new();
    let base = primary_root
        .join(month.year().to_string())
        .join(&company.folder_name)
        .join(format!("{:02}", month.month()))
        .join(doc_type.as_str());
    collect_xml_keys(&base, &mut keys);
    keys
}

fn collect_xml_keys(dir: &Path, out: &mut HashSet<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_xml_keys(&path, out);
        } else if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if crate::domain::is_valid_key(stem) {
                out.insert(stem.to_string());
            }
        }
    }
}

/// Tallies cancel-event files (`<referenced_key>_CANC.xml`) found anywhere
/// under the month's directory (including `Mês_anterior` subtrees), keyed by
/// the referenced document's doc type.
fn collect_cancel_event_counts(
    primary_root: &Path,
    company: &Company,
    month: &MonthKey,
) -> std::collections::HashMap<String, usize> {
    let mut counts = std::collections::HashMap::new();
    let base = primary_root
        .join(month.year().to_string())
        .join(&company.folder_name)
        .join(format!("{:02}", month.month()));
    collect_cancel_files(&base, &mut counts);
    counts
}

fn collect_cancel_files(dir: &Path, out: &mut std::collections::HashMap<String, usize>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_cancel_files(&path, out);
        } else if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if let Some(referenced_key) = stem.strip_suffix("_CANC") {
                if crate::domain::is_valid_key(referenced_key) {
                    let doc_type = DocType::from_key_model(referenced_key);
                    *out.entry(doc_type.as_str().to_string()).or_insert(0) += 1;
                }
            }
        }
    }
}
