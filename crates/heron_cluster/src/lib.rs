//! Core of the Heron control plane: the node registry and its lifecycle
//! rules, the health monitor, the quorum/split-brain engine, and the
//! failover orchestrator.
//!
//! Data flows one way: probes produce health scores, health feeds the
//! quorum decision, the decision drives lifecycle transitions, transitions
//! update the registry, and every accepted transition lands in the event
//! log.

pub mod events;
pub mod monitor;
pub mod orchestrator;
pub mod quorum;
pub mod registry;
pub mod state;

pub use events::{EventLog, EventRecord};
pub use monitor::{
    EngineProbe, HealthMonitor, HealthSnapshot, HealthStatus, ProbeOutcome, ScriptedProbe,
    TcpProbe,
};
pub use orchestrator::FailoverOrchestrator;
pub use quorum::{votes_required, QuorumDecision, QuorumEngine};
pub use registry::{NodeRecord, NodeSpec, Registry, ReportOutcome, StateReport};
pub use state::{ReplicationState, TransitionTable};
