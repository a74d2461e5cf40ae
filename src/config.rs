//! Assembles `ArchivistConfig` from CLI flags and the `SIEG_*` environment
//! overrides, with the same "warn and clamp" posture
//! `keeper-rs/src/config.rs::KeeperConfig::from_cli_and_deployment` uses for
//! its backoff knobs.

use crate::upstream::UpstreamTimeouts;
use eyre::{eyre, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.sieg.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
            LogLevel::Critical => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" => Ok(LogLevel::Critical),
            other => Err(eyre!("invalid --log-level '{other}': expected DEBUG|INFO|WARNING|ERROR|CRITICAL")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchivistConfig {
    pub roster_source: String,
    pub base_url: String,
    pub api_key: String,

    pub state_root: PathBuf,
    pub transactions_root: PathBuf,
    pub primary_root: PathBuf,
    pub flat_root: PathBuf,
    pub cancel_root: PathBuf,

    pub limit: Option<usize>,
    pub seed_run: bool,
    pub loop_mode: bool,
    pub loop_interval: Duration,
    pub log_level: LogLevel,
    pub ignore_failure_rates: bool,
    pub critical_threshold_pct: f64,
    pub warning_threshold_pct: f64,
    pub retention_days: u64,

    pub timeouts: UpstreamTimeouts,
}

/// Raw fields the CLI layer hands off; kept separate from `ArchivistConfig`
/// so clamping/validation lives in one place regardless of who calls it
/// (the binary's `clap` parser, or a test harness).
#[allow(clippy::too_many_arguments)]
pub struct RawArgs {
    pub roster_source: String,
    pub base_dir: PathBuf,
    pub base_url: Option<String>,
    pub limit: Option<usize>,
    pub seed: bool,
    pub loop_mode: bool,
    pub loop_interval_seconds: u64,
    pub log_level: String,
    pub ignore_failure_rates: bool,
    pub failure_threshold_pct: f64,
    pub retention_days: u64,
}

impl ArchivistConfig {
    pub fn from_raw_args(raw: RawArgs) -> Result<Self> {
        let api_key = std::env::var("SIEG_API_KEY")
            .map_err(|_| eyre!("missing SIEG_API_KEY environment variable"))?;

        let base_url = raw
            .base_url
            .or_else(|| std::env::var("SIEG_BASE_URL").ok())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let log_level: LogLevel = raw.log_level.parse()?;

        let critical = if raw.failure_threshold_pct <= 0.0 {
            tracing::warn!(
                configured = raw.failure_threshold_pct,
                "failure threshold must be > 0; clamping to 50"
            );
            50.0
        } else {
            raw.failure_threshold_pct.min(100.0)
        };
        let warning = (critical / 2.0).max(20.0).min(critical);

        let loop_interval_seconds = if raw.loop_mode && raw.loop_interval_seconds == 0 {
            0
        } else if raw.loop_mode {
            raw.loop_interval_seconds.max(1)
        } else {
            raw.loop_interval_seconds
        };

        Ok(Self {
            roster_source: raw.roster_source,
            base_url,
            api_key,
            state_root: raw.base_dir.join("estado"),
            transactions_root: raw.base_dir.join("transactions"),
            primary_root: raw.base_dir.join("primario"),
            flat_root: raw.base_dir.join("plano"),
            cancel_root: raw.base_dir.join("cancelamentos"),
            limit: raw.limit,
            seed_run: raw.seed,
            loop_mode: raw.loop_mode,
            loop_interval: Duration::from_secs(loop_interval_seconds),
            log_level,
            ignore_failure_rates: raw.ignore_failure_rates,
            critical_threshold_pct: critical,
            warning_threshold_pct: warning,
            retention_days: if raw.retention_days == 0 { 30 } else { raw.retention_days },
            timeouts: UpstreamTimeouts::from_env(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_raw() -> RawArgs {
        RawArgs {
            roster_source: "roster.csv".to_string(),
            base_dir: PathBuf::from("/tmp/archivist-test"),
            base_url: None,
            limit: None,
            seed: false,
            loop_mode: false,
            loop_interval_seconds: 0,
            log_level: "INFO".to_string(),
            ignore_failure_rates: false,
            failure_threshold_pct: 50.0,
            retention_days: 30,
        }
    }

    #[test]
    fn warning_threshold_is_half_critical_but_at_least_20() {
        std::env::set_var("SIEG_API_KEY", "test-key");
        let mut raw = base_raw();
        raw.failure_threshold_pct = 80.0;
        let cfg = ArchivistConfig::from_raw_args(raw).unwrap();
        assert_eq!(cfg.critical_threshold_pct, 80.0);
        assert_eq!(cfg.warning_threshold_pct, 40.0);
    }

    #[test]
    fn warning_threshold_floors_at_20() {
        std::env::set_var("SIEG_API_KEY", "test-key");
        let mut raw = base_raw();
        raw.failure_threshold_pct = 30.0;
        let cfg = ArchivistConfig::from_raw_args(raw).unwrap();
        assert_eq!(cfg.warning_threshold_pct, 20.0);
    }

    #[test]
    fn zero_threshold_clamps_to_default() {
        std::env::set_var("SIEG_API_KEY", "test-key");
        let mut raw = base_raw();
        raw.failure_threshold_pct = 0.0;
        let cfg = ArchivistConfig::from_raw_args(raw).unwrap();
        assert_eq!(cfg.critical_threshold_pct, 50.0);
    }

    #[test]
    fn loop_interval_below_one_second_is_clamped_when_nonzero_requested() {
        std::env::set_var("SIEG_API_KEY", "test-key");
        let mut raw = base_raw();
        raw.loop_mode = true;
        raw.loop_interval_seconds = 0;
        let cfg = ArchivistConfig::from_raw_args(raw).unwrap();
        assert_eq!(cfg.loop_interval, Duration::from_secs(0));
    }
}
