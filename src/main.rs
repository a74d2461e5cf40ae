use clap::Parser;
use eyre::Result;
use fiscal_archivist::circuit::CircuitBreaker;
use fiscal_archivist::cli::Args;
use fiscal_archivist::committer::Committer;
use fiscal_archivist::cycle;
use fiscal_archivist::state_store::StateStore;
use fiscal_archivist::upstream::UpstreamClient;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = args.into_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cfg.log_level.as_filter_str())),
        )
        .init();

    // Single-instance guard: two processes sharing a state directory would
    // race on cursor and pendency writes.
    let _lock_guard = cycle::acquire_single_instance_lock(&cfg)?;

    let roster = cycle::load_roster(&cfg).await?;
    tracing::info!(companies = roster.len(), source = %cfg.roster_source, "roster loaded");

    let mut state = StateStore::open(&cfg.state_root)?;
    let committer = Committer::new(&cfg.transactions_root)?;
    let recovered = committer.recover()?;
    if recovered > 0 {
        tracing::info!(recovered, "resumed in-flight transactions from a prior run");
    }
    let mut circuit = CircuitBreaker::new();
    let upstream = UpstreamClient::new(cfg.base_url.clone(), &cfg.api_key, cfg.timeouts);

    if cfg.loop_mode {
        tracing::info!(interval_secs = cfg.loop_interval.as_secs(), "starting loop mode");
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupted; exiting loop cleanly");
                    break;
                }
                _ = run_one_cycle(&cfg, &upstream, &mut state, &committer, &mut circuit, &roster) => {}
            }
            tokio::time::sleep(cfg.loop_interval).await;
        }
        Ok(())
    } else {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("interrupted");
                std::process::exit(130);
            }
            stats = cycle::run_cycle(&cfg, &upstream, &mut state, &committer, &mut circuit, &roster) => {
                let code = cycle::exit_code_for(&stats, &cfg);
                std::process::exit(code);
            }
        }
    }
}

/// Loop mode never propagates a cycle's internal errors or failure rate —
/// `run_cycle` already catches every company-scoped error, so this wrapper
/// only exists to give `tokio::select!` a future of matching shape.
async fn run_one_cycle(
    cfg: &fiscal_archivist::config::ArchivistConfig,
    upstream: &UpstreamClient,
    state: &mut StateStore,
    committer: &Committer,
    circuit: &mut CircuitBreaker,
    roster: &[fiscal_archivist::domain::Company],
) {
    let stats = cycle::run_cycle(cfg, upstream, state, committer, circuit, roster).await;
    tracing::info!(
        failure_rate = stats.failure_rate_pct(),
        "loop cycle finished"
    );
}
