//! Recurring health probe loop.
//!
//! One monitor per process. Each cycle probes every known node, folds in the
//! consensus adapter's peer-health bits, and publishes an immutable snapshot.
//! The monitor never writes the registry; the orchestrator syncs health
//! scores from the snapshot on its own tick.

use std::collections::BTreeMap;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use heron_common::config::MonitorConfig;
use heron_common::{unix_ms, NodeId, StopSignal};
use heron_consensus::ConsensusHandle;

use crate::registry::Registry;

/// Composite health classification per node and for the cluster overall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    Ok,
    Warning,
    Error,
    Critical,
}

impl HealthStatus {
    /// Integer health score written back to the registry. -1 stays
    /// reserved for "unknown" (never probed, or probe timed out).
    pub fn score(&self) -> i32 {
        match self {
            HealthStatus::Ok => 100,
            HealthStatus::Warning => 50,
            HealthStatus::Error => 10,
            HealthStatus::Critical => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Ok => "ok",
            HealthStatus::Warning => "warning",
            HealthStatus::Error => "error",
            HealthStatus::Critical => "critical",
        }
    }
}

/// Outcome of one engine probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable,
    Unreachable,
    /// Timed out. Treated as health unknown, never as CRITICAL by itself.
    TimedOut,
}

/// Probe into the database engine. Every call carries a timeout.
pub trait EngineProbe: Send + Sync + 'static {
    fn probe(&self, host: &str, port: u16, timeout: Duration) -> ProbeOutcome;
}

/// Production probe: a plain TCP connect to the node's endpoint.
pub struct TcpProbe;

impl EngineProbe for TcpProbe {
    fn probe(&self, host: &str, port: u16, timeout: Duration) -> ProbeOutcome {
        let Ok(mut addrs) = (host, port).to_socket_addrs() else {
            return ProbeOutcome::Unreachable;
        };
        let Some(addr) = addrs.next() else {
            return ProbeOutcome::Unreachable;
        };
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(_) => ProbeOutcome::Reachable,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => ProbeOutcome::TimedOut,
            Err(_) => ProbeOutcome::Unreachable,
        }
    }
}

/// Test probe with per-endpoint scripted outcomes. Unknown endpoints are
/// reachable.
#[derive(Default)]
pub struct ScriptedProbe {
    outcomes: Mutex<BTreeMap<String, ProbeOutcome>>,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, host: &str, port: u16, outcome: ProbeOutcome) {
        self.outcomes
            .lock()
            .insert(format!("{}:{}", host, port), outcome);
    }
}

impl EngineProbe for ScriptedProbe {
    fn probe(&self, host: &str, port: u16, _timeout: Duration) -> ProbeOutcome {
        self.outcomes
            .lock()
            .get(&format!("{}:{}", host, port))
            .copied()
            .unwrap_or(ProbeOutcome::Reachable)
    }
}

/// Local engine metrics sampled only for the node this process runs on.
#[derive(Debug, Clone, Copy)]
pub struct LocalEngineMetrics {
    /// Fraction of the connection budget still free, 0.0..=1.0.
    pub connection_headroom: f64,
    pub replication_active: bool,
    pub wal_archiving_ok: bool,
}

pub trait LocalMetricsSource: Send + Sync + 'static {
    fn sample(&self) -> LocalEngineMetrics;
}

/// Production metrics source: a JSON status file maintained by the engine
/// agent next to this daemon. A missing or malformed file samples as
/// healthy; absence of data must never degrade the node.
pub struct StatusFileMetrics {
    path: std::path::PathBuf,
}

#[derive(serde::Deserialize)]
struct StatusFileDoc {
    #[serde(default = "full_headroom")]
    connection_headroom: f64,
    #[serde(default = "status_true")]
    replication_active: bool,
    #[serde(default = "status_true")]
    wal_archiving_ok: bool,
}

fn full_headroom() -> f64 {
    1.0
}

fn status_true() -> bool {
    true
}

impl StatusFileMetrics {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl LocalMetricsSource for StatusFileMetrics {
    fn sample(&self) -> LocalEngineMetrics {
        let healthy = LocalEngineMetrics {
            connection_headroom: 1.0,
            replication_active: true,
            wal_archiving_ok: true,
        };
        let Ok(text) = std::fs::read_to_string(&self.path) else {
            return healthy;
        };
        match serde_json::from_str::<StatusFileDoc>(&text) {
            Ok(doc) => LocalEngineMetrics {
                connection_headroom: doc.connection_headroom,
                replication_active: doc.replication_active,
                wal_archiving_ok: doc.wal_archiving_ok,
            },
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "unreadable engine status file");
                healthy
            }
        }
    }
}

/// Health of one node as seen in a snapshot. `status = None` means unknown
/// (no probe has completed, or the last probe timed out).
#[derive(Debug, Clone, Copy)]
pub struct NodeHealth {
    pub status: Option<HealthStatus>,
    pub consecutive_failures: u32,
    pub last_success_ms: u64,
}

impl NodeHealth {
    pub fn score(&self) -> i32 {
        self.status.map(|s| s.score()).unwrap_or(-1)
    }
}

/// Immutable output of one monitor cycle, readable without blocking the
/// probe loop.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub taken_ms: u64,
    pub overall: HealthStatus,
    pub per_node: BTreeMap<NodeId, NodeHealth>,
    pub checks_performed: u64,
    pub warnings_count: u64,
    pub errors_count: u64,
}

impl HealthSnapshot {
    fn empty() -> Self {
        Self {
            taken_ms: 0,
            overall: HealthStatus::Warning,
            per_node: BTreeMap::new(),
            checks_performed: 0,
            warnings_count: 0,
            errors_count: 0,
        }
    }

    pub fn node_status(&self, node_id: NodeId) -> Option<HealthStatus> {
        self.per_node.get(&node_id).and_then(|h| h.status)
    }
}

struct FailureTracking {
    consecutive: BTreeMap<NodeId, u32>,
    last_success_ms: BTreeMap<NodeId, u64>,
}

/// The recurring probe loop.
pub struct HealthMonitor {
    registry: Arc<Registry>,
    consensus: Arc<dyn ConsensusHandle>,
    probe: Arc<dyn EngineProbe>,
    local_metrics: Option<Arc<dyn LocalMetricsSource>>,
    /// The node record this process runs next to, if any.
    self_node: Option<NodeId>,
    config: MonitorConfig,
    snapshot: RwLock<HealthSnapshot>,
    failures: Mutex<FailureTracking>,
    checks_performed: AtomicU64,
    warnings_count: AtomicU64,
    errors_count: AtomicU64,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<Registry>,
        consensus: Arc<dyn ConsensusHandle>,
        probe: Arc<dyn EngineProbe>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            registry,
            consensus,
            probe,
            local_metrics: None,
            self_node: None,
            config,
            snapshot: RwLock::new(HealthSnapshot::empty()),
            failures: Mutex::new(FailureTracking {
                consecutive: BTreeMap::new(),
                last_success_ms: BTreeMap::new(),
            }),
            checks_performed: AtomicU64::new(0),
            warnings_count: AtomicU64::new(0),
            errors_count: AtomicU64::new(0),
        }
    }

    pub fn with_self_node(mut self, self_node: NodeId) -> Self {
        self.self_node = Some(self_node);
        self
    }

    pub fn with_local_metrics(mut self, source: Arc<dyn LocalMetricsSource>) -> Self {
        self.local_metrics = Some(source);
        self
    }

    /// Latest published snapshot. Never blocks on an in-flight cycle.
    pub fn snapshot(&self) -> HealthSnapshot {
        self.snapshot.read().clone()
    }

    /// Run one probe cycle and publish the resulting snapshot.
    pub fn run_cycle(&self) {
        // Fold pending adapter notifications into the cached view before
        // reading it. This is the only place the event queue is drained.
        self.consensus.drain();

        let nodes = self.registry.list_live();
        let timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let now = unix_ms();
        let view = self.consensus.view();

        let mut per_node = BTreeMap::new();
        let mut cycle_warnings = 0u64;
        let mut cycle_errors = 0u64;
        let mut reachable_peers = 0usize;

        {
            let mut tracking = self.failures.lock();
            let FailureTracking {
                consecutive,
                last_success_ms,
            } = &mut *tracking;
            for node in &nodes {
                self.checks_performed.fetch_add(1, Ordering::Relaxed);
                let outcome = self.probe.probe(&node.host, node.port, timeout);
                let failures = consecutive.entry(node.node_id).or_insert(0);
                let status = match outcome {
                    ProbeOutcome::Reachable => {
                        *failures = 0;
                        last_success_ms.insert(node.node_id, now);
                        if Some(node.node_id) != self.self_node {
                            reachable_peers += 1;
                        }
                        let peer_ok = Some(node.node_id) == self.self_node
                            || self.consensus.is_peer_healthy(node.node_id)
                            || view.peer_reachable.is_empty();
                        if peer_ok {
                            Some(HealthStatus::Ok)
                        } else {
                            Some(HealthStatus::Warning)
                        }
                    }
                    ProbeOutcome::TimedOut => {
                        // Timeout is not evidence of death.
                        None
                    }
                    ProbeOutcome::Unreachable => {
                        *failures += 1;
                        if *failures >= self.config.failure_threshold {
                            Some(HealthStatus::Critical)
                        } else {
                            Some(HealthStatus::Warning)
                        }
                    }
                };
                match status {
                    Some(HealthStatus::Warning) => cycle_warnings += 1,
                    Some(HealthStatus::Error) | Some(HealthStatus::Critical) => cycle_errors += 1,
                    _ => {}
                }
                per_node.insert(
                    node.node_id,
                    NodeHealth {
                        status,
                        consecutive_failures: *failures,
                        last_success_ms: last_success_ms
                            .get(&node.node_id)
                            .copied()
                            .unwrap_or(0),
                    },
                );
            }
            consecutive.retain(|id, _| per_node.contains_key(id));
        }

        // Local engine metrics only degrade this node, never improve it.
        if let (Some(self_id), Some(source)) = (self.self_node, &self.local_metrics) {
            if let Some(health) = per_node.get_mut(&self_id) {
                let metrics = source.sample();
                let degraded = metrics.connection_headroom < 0.1
                    || !metrics.wal_archiving_ok
                    || !metrics.replication_active;
                if degraded && health.status == Some(HealthStatus::Ok) {
                    health.status = Some(HealthStatus::Warning);
                    cycle_warnings += 1;
                }
            }
        }

        let overall = if nodes.is_empty() {
            HealthStatus::Warning
        } else if self.self_node.is_some()
            && view.leader == self.self_node
            && nodes.len() > 1
            && reachable_peers == 0
        {
            // Leader isolated from every peer: must not accept writes.
            HealthStatus::Critical
        } else if !view.has_quorum && nodes.len() > 1 {
            HealthStatus::Error
        } else {
            HealthStatus::Ok
        };
        match overall {
            HealthStatus::Warning => cycle_warnings += 1,
            HealthStatus::Error | HealthStatus::Critical => cycle_errors += 1,
            HealthStatus::Ok => {}
        }

        self.warnings_count.fetch_add(cycle_warnings, Ordering::Relaxed);
        self.errors_count.fetch_add(cycle_errors, Ordering::Relaxed);

        let snapshot = HealthSnapshot {
            taken_ms: now,
            overall,
            per_node,
            checks_performed: self.checks_performed.load(Ordering::Relaxed),
            warnings_count: self.warnings_count.load(Ordering::Relaxed),
            errors_count: self.errors_count.load(Ordering::Relaxed),
        };
        if overall != HealthStatus::Ok {
            tracing::debug!(overall = ?overall, nodes = nodes.len(), "monitor cycle degraded");
        }
        heron_observability::record_probe_cycle(
            nodes.len(),
            cycle_warnings as usize,
            cycle_errors as usize,
            overall.as_str(),
        );
        *self.snapshot.write() = snapshot;
    }

    /// Run the probe loop on its own thread until `stop` fires. The
    /// in-flight cycle finishes before the thread exits.
    pub fn spawn(self: Arc<Self>, stop: Arc<StopSignal>) -> JoinHandle<()> {
        let interval = Duration::from_millis(self.config.probe_interval_ms);
        std::thread::Builder::new()
            .name("heron-monitor".to_string())
            .spawn(move || {
                tracing::info!(interval_ms = interval.as_millis() as u64, "health monitor started");
                loop {
                    self.run_cycle();
                    if stop.wait(interval) {
                        break;
                    }
                }
                tracing::info!("health monitor stopped");
            })
            .unwrap_or_else(|e| panic!("failed to spawn monitor thread: {}", e))
    }
}
