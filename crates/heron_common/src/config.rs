use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{HeronError, HeronResult};

/// Top-level daemon configuration, loaded from heron.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeronConfig {
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub events: EventLogConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Cluster identity section in heron.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name. Reported in /status and event records.
    pub name: String,
    /// Consensus mode: "single" (no peers, every decision local) or
    /// "channel" (driven by an external consensus adapter).
    #[serde(default = "default_consensus_mode")]
    pub consensus_mode: ConsensusMode,
    /// Registry id of the database node this daemon runs next to, if any.
    /// Required for the leader-isolation escalation and for local engine
    /// metrics; a daemon running off-box leaves it unset.
    #[serde(default)]
    pub self_node_id: Option<u64>,
    /// Per-state overrides of the lifecycle transition table. Each entry
    /// replaces the full successor set for that state, e.g.
    /// `secondary = ["prepare_promotion", "catchingup"]`.
    #[serde(default)]
    pub transitions: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusMode {
    /// Single control-plane instance; has_quorum is always true and this
    /// instance is always the leader.
    #[default]
    Single,
    /// Membership and leadership come from an external consensus adapter.
    Channel,
}

fn default_consensus_mode() -> ConsensusMode {
    ConsensusMode::Single
}

/// Control-plane API and metrics listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Control-plane HTTP listen address.
    pub listen_addr: String,
    /// Prometheus metrics listen address. Empty disables the exporter.
    #[serde(default)]
    pub metrics_addr: String,
    /// Graceful shutdown drain timeout in seconds.
    /// After SIGINT/SIGTERM, the server waits up to this many seconds for
    /// in-flight requests and the orchestrator tick to finish.
    #[serde(default = "default_shutdown_drain_timeout_secs")]
    pub shutdown_drain_timeout_secs: u64,
}

fn default_shutdown_drain_timeout_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8008".to_string(),
            metrics_addr: String::new(),
            shutdown_drain_timeout_secs: 30,
        }
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Interval between probe rounds in milliseconds.
    pub probe_interval_ms: u64,
    /// Per-probe connect timeout in milliseconds.
    pub probe_timeout_ms: u64,
    /// A node with no successful probe or report for this long is UNREACHABLE.
    pub health_timeout_ms: u64,
    /// Consecutive failed probes before a node is considered failed.
    pub failure_threshold: u32,
    /// Status file written by the local engine agent (connection headroom,
    /// replication activity, WAL archiving). Only sampled for the node
    /// named by cluster.self_node_id; unset disables local metrics.
    #[serde(default)]
    pub local_metrics_path: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 5_000,
            probe_timeout_ms: 5_000,
            health_timeout_ms: 15_000,
            failure_threshold: 3,
            local_metrics_path: None,
        }
    }
}

/// Failover decision engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Primary must be unhealthy for this long before failover starts.
    pub grace_period_ms: u64,
    /// How long a demotion waits for confirmation from the old primary
    /// before it is presumed dead and promotion proceeds.
    pub confirmation_grace_ms: u64,
    /// Orchestrator evaluation tick interval in milliseconds.
    pub tick_interval_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 30_000,
            confirmation_grace_ms: 10_000,
            tick_interval_ms: 1_000,
        }
    }
}

/// Event log retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogConfig {
    /// Maximum events kept in memory for the query API. The on-disk
    /// journal is never truncated by this limit.
    pub max_events: usize,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self { max_events: 1000 }
    }
}

/// Persistence locations for the registry snapshot and event journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding registry.json and events.jsonl.
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./heron_data".to_string(),
        }
    }
}

impl HeronConfig {
    /// Parse a TOML document into a config, then validate it.
    pub fn from_toml(text: &str) -> HeronResult<Self> {
        let config: HeronConfig =
            toml::from_str(text).map_err(|e| HeronError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field sanity checks not expressible in serde.
    pub fn validate(&self) -> HeronResult<()> {
        if self.cluster.name.is_empty() {
            return Err(HeronError::Config("cluster.name must be set".into()));
        }
        if self.server.listen_addr.is_empty() {
            return Err(HeronError::Config("server.listen_addr must be set".into()));
        }
        if self.monitor.probe_interval_ms == 0 {
            return Err(HeronError::Config(
                "monitor.probe_interval_ms must be >= 1".into(),
            ));
        }
        if self.monitor.failure_threshold == 0 {
            return Err(HeronError::Config(
                "monitor.failure_threshold must be >= 1".into(),
            ));
        }
        if self.failover.tick_interval_ms == 0 {
            return Err(HeronError::Config(
                "failover.tick_interval_ms must be >= 1".into(),
            ));
        }
        if self.events.max_events == 0 {
            return Err(HeronError::Config("events.max_events must be >= 1".into()));
        }
        Ok(())
    }
}

impl Default for HeronConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig {
                name: "heron".to_string(),
                consensus_mode: ConsensusMode::Single,
                self_node_id: None,
                transitions: BTreeMap::new(),
            },
            server: ServerConfig::default(),
            monitor: MonitorConfig::default(),
            failover: FailoverConfig::default(),
            events: EventLogConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}
