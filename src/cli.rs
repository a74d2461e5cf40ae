//! Command-line surface, grounded on `keeper-rs/src/main.rs`'s `Args`
//! (a flat `clap::Parser` struct handed to `ArchivistConfig::from_raw_args`).

use crate::config::{ArchivistConfig, RawArgs};
use clap::Parser;
use eyre::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "fiscal-archivist",
    version,
    about = "Incremental fetcher and local-archive manager for NFe/CTe fiscal documents"
)]
pub struct Args {
    /// Company roster: a local CSV path or an http(s) URL.
    pub roster_source: String,

    /// Root directory under which `estado/`, `primario/`, `plano/` and
    /// `cancelamentos/` are created.
    #[arg(long, default_value = "archivist-data")]
    pub base_dir: PathBuf,

    /// Override the upstream API base URL (defaults to the production host,
    /// or SIEG_BASE_URL if set).
    #[arg(long)]
    pub base_url: Option<String>,

    /// Process only the first N companies in the roster.
    #[arg(long)]
    pub limit: Option<usize>,

    /// Reset cursors before running the cycle.
    #[arg(long)]
    pub seed: bool,

    /// Run cycles continuously until interrupted.
    #[arg(long)]
    pub r#loop: bool,

    /// Seconds to pause between cycles in loop mode (0 = immediately).
    #[arg(long, default_value_t = 0)]
    pub loop_interval: u64,

    /// DEBUG, INFO, WARNING, ERROR, or CRITICAL.
    #[arg(long, default_value = "INFO")]
    pub log_level: String,

    /// Never exit nonzero because of the failure rate.
    #[arg(long)]
    pub ignore_failure_rates: bool,

    /// Critical failure-rate threshold as a percent (default 50); the
    /// warning threshold is max(20, this / 2).
    #[arg(long, default_value_t = 50.0)]
    pub failure_threshold: f64,

    /// How long completed transaction records are kept before cleanup.
    #[arg(long, default_value_t = 30)]
    pub retention_days: u64,
}

impl Args {
    pub fn into_config(self) -> Result<ArchivistConfig> {
        ArchivistConfig::from_raw_args(RawArgs {
            roster_source: self.roster_source,
            base_dir: self.base_dir,
            base_url: self.base_url,
            limit: self.limit,
            seed: self.seed,
            loop_mode: self.r#loop,
            loop_interval_seconds: self.loop_interval,
            log_level: self.log_level,
            ignore_failure_rates: self.ignore_failure_rates,
            failure_threshold_pct: self.failure_threshold,
            retention_days: self.retention_days,
        })
    }
}
