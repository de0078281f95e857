mod api;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use heron_cluster::monitor::{StatusFileMetrics, TcpProbe};
use heron_cluster::quorum::QuorumEngine;
use heron_cluster::state::TransitionTable;
use heron_cluster::{EventLog, FailoverOrchestrator, HealthMonitor, Registry};
use heron_common::config::{ConsensusMode, HeronConfig};
use heron_common::{NodeId, StopSignal};
use heron_consensus::{ConsensusHandle, SingleNodeConsensus};

#[derive(Parser, Debug)]
#[command(name = "heron", about = "Heron — HA control plane for primary/replica database clusters")]
struct Cli {
    /// Config file path.
    #[arg(short, long, default_value = "heron.toml")]
    config: String,

    /// Control-plane API listen address (overrides config).
    #[arg(long)]
    listen_addr: Option<String>,

    /// Metrics listen address (overrides config; empty disables).
    #[arg(long)]
    metrics_addr: Option<String>,

    /// Data directory (overrides config).
    #[arg(long)]
    data_dir: Option<String>,

    /// Print the default configuration as TOML and exit.
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // --print-default-config: dump default TOML and exit
    if cli.print_default_config {
        let default_config = HeronConfig::default();
        let toml_str = toml::to_string_pretty(&default_config)
            .unwrap_or_else(|e| format!("# failed to serialize default config: {}", e));
        println!("{}", toml_str);
        return Ok(());
    }

    heron_observability::init_tracing();
    tracing::info!("Starting Heron control plane...");

    let mut config = load_config(&cli.config);
    if let Some(ref addr) = cli.listen_addr {
        config.server.listen_addr = addr.clone();
    }
    if let Some(ref addr) = cli.metrics_addr {
        config.server.metrics_addr = addr.clone();
    }
    if let Some(ref dir) = cli.data_dir {
        config.storage.data_dir = dir.clone();
    }
    config.validate().map_err(|e| anyhow::anyhow!("{}", e))?;

    tracing::info!("Config: {:?}", config);

    if !config.server.metrics_addr.is_empty() {
        if let Err(e) = heron_observability::init_metrics(&config.server.metrics_addr) {
            tracing::warn!("Failed to initialize metrics: {}", e);
        }
    }

    // Persistence: registry snapshot and event journal under data_dir.
    let data_dir = Path::new(&config.storage.data_dir);
    std::fs::create_dir_all(data_dir)?;
    let events = Arc::new(EventLog::open(data_dir, config.events.max_events)?);
    let table = TransitionTable::with_overrides(&config.cluster.transitions)
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    let registry = Arc::new(
        Registry::open(data_dir, table, events).map_err(|e| anyhow::anyhow!("{}", e))?,
    );
    tracing::info!(
        "Registry restored: {} node(s), {} event(s) replayed",
        registry.list_all().len(),
        registry.events().len(),
    );

    let consensus: Arc<dyn ConsensusHandle> = match config.cluster.consensus_mode {
        ConsensusMode::Single => {
            tracing::info!("Consensus: single instance (always leader, always quorate)");
            Arc::new(SingleNodeConsensus::new(NodeId(0)))
        }
        ConsensusMode::Channel => {
            // An external adapter owns the other ends of these channels.
            // Until it publishes a view, every evaluation is incomplete and
            // the control plane holds state.
            let (event_tx, command_rx, handle) = heron_consensus::channel_pair(64);
            tracing::info!("Consensus: channel mode, waiting for external adapter events");
            std::thread::Builder::new()
                .name("heron-consensus-adapter".to_string())
                .spawn(move || {
                    let _keep_events_open = event_tx;
                    while let Ok(command) = command_rx.recv() {
                        tracing::info!(?command, "membership command for external adapter");
                    }
                })?;
            Arc::new(handle)
        }
    };

    let mut monitor = HealthMonitor::new(
        registry.clone(),
        consensus.clone(),
        Arc::new(TcpProbe),
        config.monitor.clone(),
    );
    if let Some(id) = config.cluster.self_node_id {
        monitor = monitor.with_self_node(NodeId(id));
    }
    if let Some(ref path) = config.monitor.local_metrics_path {
        monitor = monitor.with_local_metrics(Arc::new(StatusFileMetrics::new(path)));
    }
    let monitor = Arc::new(monitor);
    let orchestrator = Arc::new(FailoverOrchestrator::new(
        registry.clone(),
        monitor.clone(),
        consensus,
        QuorumEngine::new(config.monitor.clone(), config.failover.clone()),
        config.failover.clone(),
    ));

    // Background threads: probe cycle and evaluation tick.
    let stop = Arc::new(StopSignal::new());
    let monitor_handle = monitor.clone().spawn(stop.clone());
    let orchestrator_handle = orchestrator.clone().spawn(stop.clone());

    let api_state = Arc::new(api::AppState::new(
        config.cluster.name.clone(),
        registry,
        orchestrator,
        monitor,
    ));

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    let api_addr = config.server.listen_addr.clone();
    let api_state_for_server = api_state.clone();
    let server = tokio::spawn(async move {
        api::run_api_server(&api_addr, api_state_for_server, async move {
            let _ = shutdown_rx.changed().await;
        })
        .await;
    });

    tracing::info!(
        "Heron ready (cluster={}, api={})",
        config.cluster.name,
        config.server.listen_addr,
    );

    let shutdown_reason = wait_for_shutdown_signal().await;
    tracing::info!("{} — initiating graceful shutdown", shutdown_reason);

    // Mark not-ready first so load balancers drain, then give in-flight
    // requests the configured window to finish.
    api_state.set_ready(false);
    let drain = drain_duration(&config);
    if !drain.is_zero() {
        tokio::time::sleep(drain).await;
    }

    let _ = shutdown_tx.send(true);
    stop.stop();
    let _ = server.await;
    if monitor_handle.join().is_err() {
        tracing::warn!("monitor thread panicked during shutdown");
    }
    if orchestrator_handle.join().is_err() {
        tracing::warn!("orchestrator thread panicked during shutdown");
    }
    tracing::info!("Heron stopped");

    Ok(())
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM, returning a description of which signal fired.
async fn wait_for_shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .unwrap_or_else(|e| panic!("Failed to register SIGTERM handler: {}", e));
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT (Ctrl+C) received",
            _ = sigterm.recv() => "SIGTERM received",
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT (Ctrl+C) received"
    }
}

/// Shutdown drain window. Zero disables the drain entirely.
fn drain_duration(config: &HeronConfig) -> Duration {
    Duration::from_secs(config.server.shutdown_drain_timeout_secs)
}

fn load_config(path: &str) -> HeronConfig {
    match std::fs::read_to_string(path) {
        Ok(content) => match HeronConfig::from_toml(&content) {
            Ok(config) => {
                tracing::info!("Loaded config from {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("Failed to parse config {}: {}, using defaults", path, e);
                HeronConfig::default()
            }
        },
        Err(_) => {
            tracing::info!("Config file {} not found, using defaults", path);
            HeronConfig::default()
        }
    }
}
