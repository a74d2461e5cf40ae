//! Cycle Orchestrator (C12): loads the roster, runs pendency replay, then
//! drives every company's pipeline sequentially and aggregates outcomes.
//!
//! The `--loop`/single-instance-lock/catch-and-continue shape is
//! `keeper-rs/src/main.rs`'s outer `loop { ... }` body, narrowed from an
//! indefinitely-running keeper to a cycle that can also run once and report
//! an exit code from an aggregate failure rate.

use crate::circuit::CircuitBreaker;
use crate::committer::Committer;
use crate::config::ArchivistConfig;
use crate::domain::{Company, MonthKey};
use crate::pipeline::{self, CompanyOutcome, Context};
use crate::roster;
use crate::state_store::StateStore;
use crate::upstream::UpstreamClient;
use chrono::Datelike;
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::OpenOptions;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct CycleStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl CycleStats {
    pub fn failure_rate_pct(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.failed as f64 / self.total as f64) * 100.0
        }
    }
}

pub fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Replays every open report pendency across every company known to the
/// state store's metadata, resetting cursors for the ones that resolve with
/// a non-empty report, before the main per-company loop runs.
async fn run_pendency_replay(
    ctx: &mut Context<'_>,
    by_id: &HashMap<String, Company>,
    today: chrono::NaiveDate,
    ts: &str,
) {
    let pending = match ctx.state.list_pending_reports() {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "failed to list pending reports for replay");
            return;
        }
    };

    for (company_id, month, doc_type, pendency) in pending {
        let Some(company) = by_id.get(&company_id) else {
            continue;
        };
        info!(
            company = %company_id,
            month = month.as_str(),
            doc_type = doc_type.as_str(),
            attempts = pendency.attempts,
            first_failure_ts = %pendency.first_failure_ts,
            "replaying stuck report pendency"
        );
        match pipeline::replay_pendency(ctx, company, &month, doc_type, today, ts).await {
            Ok(true) => {
                let _ = ctx.state.reset_skip_for_report(&company_id, &month, doc_type);
            }
            Ok(false) => {}
            Err(e) => warn!(company = %company_id, error = %e, "pendency replay failed"),
        }
    }
}

/// Runs a single cycle: pendency replay, then every company in the roster
/// (bounded by `cfg.limit`), sequentially. Returns aggregate statistics.
pub async fn run_cycle(
    cfg: &ArchivistConfig,
    upstream: &UpstreamClient,
    state: &mut StateStore,
    committer: &Committer,
    circuit: &mut CircuitBreaker,
    roster: &[Company],
) -> CycleStats {
    let ts = now_ts();
    let today = chrono::Utc::now().date_naive();
    let mut ctx = Context {
        upstream,
        state,
        committer,
        circuit,
        primary_root: cfg.primary_root.clone(),
        flat_root: cfg.flat_root.clone(),
        cancel_root: cfg.cancel_root.clone(),
    };

    let by_id: HashMap<String, Company> = roster
        .iter()
        .map(|c| (c.id_canonical.clone(), c.clone()))
        .collect();
    run_pendency_replay(&mut ctx, &by_id, today, &ts).await;

    let companies: Vec<&Company> = match cfg.limit {
        Some(n) => roster.iter().take(n).collect(),
        None => roster.iter().collect(),
    };

    let mut stats = CycleStats::default();
    for company in companies {
        stats.total += 1;
        let outcome = pipeline::process_company(&mut ctx, company, today, cfg.seed_run, &ts).await;
        match outcome {
            CompanyOutcome::Ok => stats.success += 1,
            CompanyOutcome::FailedCritical => stats.failed += 1,
            CompanyOutcome::SkippedCircuit => stats.skipped += 1,
        }
    }

    let month = MonthKey::from_year_month(today.year(), today.month());
    if let Err(e) = ctx.state.save_month(&month, &ts) {
        warn!(error = %e, "failed to persist state after cycle");
    }

    if let Err(e) = ctx.committer.cleanup_completed(cfg.retention_days, std::time::SystemTime::now()) {
        warn!(error = %e, "failed to clean up completed transaction records");
    }

    info!(
        total = stats.total,
        success = stats.success,
        failed = stats.failed,
        skipped = stats.skipped,
        failure_rate = stats.failure_rate_pct(),
        "cycle complete"
    );

    stats
}

/// Exit code per spec §4.12/§6: 0 success, 1 at or above the warning rate,
/// 2 at or above the critical rate, unless `ignore_failure_rates` is set.
pub fn exit_code_for(stats: &CycleStats, cfg: &ArchivistConfig) -> i32 {
    if cfg.ignore_failure_rates {
        return 0;
    }
    let rate = stats.failure_rate_pct();
    if rate >= cfg.critical_threshold_pct {
        2
    } else if rate >= cfg.warning_threshold_pct {
        1
    } else {
        0
    }
}

/// Acquires an exclusive advisory lock on a file under `state_root`,
/// refusing to start a second instance against the same state directory —
/// the single-instance guard from `keeper-rs/src/main.rs`, adapted from a
/// lockfile next to the state JSON to one next to `estado/`.
pub fn acquire_single_instance_lock(cfg: &ArchivistConfig) -> eyre::Result<std::fs::File> {
    std::fs::create_dir_all(&cfg.state_root)?;
    let lock_path = cfg.state_root.join("archivist.lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| eyre::eyre!("failed to open lock file {}: {e}", lock_path.display()))?;
    lock_file
        .try_lock_exclusive()
        .map_err(|e| eyre::eyre!("another instance is already running against {}: {e}", cfg.state_root.display()))?;
    Ok(lock_file)
}

/// Loads the roster and, if `cfg.seed_run`, nothing else needs resetting at
/// this layer — `seed_run`'s cursor reset happens per-company inside
/// `pipeline::process_company` (spec leaves `processed_xml_keys` alone).
pub async fn load_roster(cfg: &ArchivistConfig) -> eyre::Result<Vec<Company>> {
    let companies = roster::load_roster_source(&cfg.roster_source).await?;
    if companies.is_empty() {
        warn!(source = %cfg.roster_source, "roster loaded zero companies");
    }
    Ok(companies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn exit_code_thresholds() {
        let mut cfg = test_config();
        cfg.critical_threshold_pct = 50.0;
        cfg.warning_threshold_pct = 20.0;

        assert_eq!(exit_code_for(&CycleStats { total: 10, failed: 0, success: 10, skipped: 0 }, &cfg), 0);
        assert_eq!(exit_code_for(&CycleStats { total: 10, failed: 2, success: 8, skipped: 0 }, &cfg), 1);
        assert_eq!(exit_code_for(&CycleStats { total: 10, failed: 5, success: 5, skipped: 0 }, &cfg), 2);
    }

    #[test]
    fn ignore_failure_rates_always_zero() {
        let mut cfg = test_config();
        cfg.ignore_failure_rates = true;
        assert_eq!(exit_code_for(&CycleStats { total: 10, failed: 9, success: 1, skipped: 0 }, &cfg), 0);
    }

    fn test_config() -> ArchivistConfig {
        ArchivistConfig {
            roster_source: "roster.csv".to_string(),
            base_url: "https://api.sieg.com".to_string(),
            api_key: "key".to_string(),
            state_root: "/tmp/archivist-test/estado".into(),
            transactions_root: "/tmp/archivist-test/transactions".into(),
            primary_root: "/tmp/archivist-test/primario".into(),
            flat_root: "/tmp/archivist-test/plano".into(),
            cancel_root: "/tmp/archivist-test/cancelamentos".into(),
            limit: None,
            seed_run: false,
            loop_mode: false,
            loop_interval: Duration::from_secs(0),
            log_level: crate::config::LogLevel::Info,
            ignore_failure_rates: false,
            critical_threshold_pct: 50.0,
            warning_threshold_pct: 20.0,
            retention_days: 30,
            timeouts: crate::upstream::UpstreamTimeouts::from_env(),
        }
    }
}
