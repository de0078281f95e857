//! Durable node registry.
//!
//! The registry exclusively owns Node records. All mutations go through one
//! writer lock, so every change to a node's state is serialized; an event is
//! appended only after the registry write is durable. Removed nodes stay as
//! `dropped` tombstones so node ids are never reused, but tombstones do not
//! count toward host:port uniqueness or quorum.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use heron_common::{
    unix_ms, GroupId, HeronError, HeronResult, Lsn, NodeId, ReplicationMode, TimelineId,
};

use crate::events::EventLog;
use crate::state::{advance_goal, ReplicationState, TransitionTable};

pub const REGISTRY_FILE: &str = "registry.json";

/// Health score sentinel: nothing is known about the node yet.
pub const HEALTH_UNKNOWN: i32 = -1;

/// One monitored database node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub cluster_name: String,
    pub group_id: GroupId,
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Opaque engine instance fingerprint. Set once, then immutable; must
    /// agree with every other node in the same group.
    pub system_identifier: Option<String>,
    pub goal_state: ReplicationState,
    pub reported_state: ReplicationState,
    /// Integer health score, -1 = unknown.
    pub health: i32,
    pub last_health_check_ms: u64,
    pub last_state_change_ms: u64,
    pub reported_timeline: TimelineId,
    pub reported_lsn: Lsn,
    pub reported_replication_mode: ReplicationMode,
    pub last_report_ms: u64,
    /// 0..=100; 0 excludes the node from promotion.
    pub candidate_priority: u8,
    pub replication_quorum_member: bool,
    /// Reported state stashed when maintenance was requested, restored as
    /// the goal when maintenance is released.
    #[serde(default)]
    pub pre_maintenance_state: Option<ReplicationState>,
}

impl NodeRecord {
    pub fn is_dropped(&self) -> bool {
        self.reported_state == ReplicationState::Dropped
    }

    pub fn is_primary_class(&self) -> bool {
        self.reported_state.is_primary_class()
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Registration request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub cluster_name: String,
    #[serde(default)]
    pub group_id: GroupId,
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub system_identifier: Option<String>,
    #[serde(default)]
    pub desired_node_id: Option<NodeId>,
    #[serde(default)]
    pub initial_state: ReplicationState,
    #[serde(default)]
    pub candidate_priority: u8,
    #[serde(default)]
    pub replication_quorum_member: bool,
}

/// Heartbeat payload from a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateReport {
    pub state: ReplicationState,
    pub is_running: bool,
    #[serde(default)]
    pub timeline: TimelineId,
    #[serde(default)]
    pub lsn: Lsn,
    #[serde(default)]
    pub replication_mode: ReplicationMode,
}

/// Result of a heartbeat. A rejected report still succeeds at the transport
/// level: `accepted = false`, goal unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportOutcome {
    pub accepted: bool,
    pub goal_state: ReplicationState,
    /// Why the report was rejected. `None` on accepted reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct RegistrySnapshot {
    next_node_id: u64,
    nodes: Vec<NodeRecord>,
}

struct RegistryInner {
    nodes: BTreeMap<NodeId, NodeRecord>,
    next_node_id: u64,
}

/// Single-writer node table. Mutations persist the snapshot before the
/// corresponding event is appended.
pub struct Registry {
    inner: RwLock<RegistryInner>,
    table: TransitionTable,
    events: Arc<EventLog>,
    data_dir: Option<PathBuf>,
}

impl Registry {
    /// In-memory registry, no persistence. Tests and dry runs.
    pub fn in_memory(table: TransitionTable, events: Arc<EventLog>) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                nodes: BTreeMap::new(),
                next_node_id: 1,
            }),
            table,
            events,
            data_dir: None,
        }
    }

    /// Open the registry under `data_dir`, restoring any persisted snapshot.
    pub fn open(
        data_dir: &Path,
        table: TransitionTable,
        events: Arc<EventLog>,
    ) -> HeronResult<Self> {
        let path = data_dir.join(REGISTRY_FILE);
        let (nodes, next_node_id) = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            let snapshot: RegistrySnapshot = serde_json::from_str(&text)
                .map_err(|e| HeronError::Storage(format!("corrupt registry snapshot: {}", e)))?;
            let nodes = snapshot
                .nodes
                .into_iter()
                .map(|n| (n.node_id, n))
                .collect();
            (nodes, snapshot.next_node_id)
        } else {
            (BTreeMap::new(), 1)
        };
        Ok(Self {
            inner: RwLock::new(RegistryInner {
                nodes,
                next_node_id,
            }),
            table,
            events,
            data_dir: Some(data_dir.to_path_buf()),
        })
    }

    fn persist(&self, inner: &RegistryInner) -> HeronResult<()> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let snapshot = RegistrySnapshot {
            next_node_id: inner.next_node_id,
            nodes: inner.nodes.values().cloned().collect(),
        };
        let text = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| HeronError::Storage(format!("serialize registry: {}", e)))?;
        let tmp = dir.join(format!("{}.tmp", REGISTRY_FILE));
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, dir.join(REGISTRY_FILE))?;
        Ok(())
    }

    // ── registration ─────────────────────────────────────────────────────

    pub fn register_node(&self, spec: NodeSpec) -> HeronResult<NodeRecord> {
        if spec.candidate_priority > 100 {
            return Err(HeronError::Config(format!(
                "candidate_priority must be 0..=100, got {}",
                spec.candidate_priority
            )));
        }
        let mut inner = self.inner.write();

        // Tombstones free their host:port but keep their id reserved.
        for node in inner.nodes.values() {
            if node.is_dropped() {
                continue;
            }
            if node.host == spec.host && node.port == spec.port {
                return Err(HeronError::Conflict(format!(
                    "{} already registered as node {}",
                    node.endpoint(),
                    node.node_id
                )));
            }
            if node.group_id == spec.group_id {
                if let (Some(existing), Some(new)) =
                    (&node.system_identifier, &spec.system_identifier)
                {
                    if existing != new {
                        return Err(HeronError::Conflict(format!(
                            "system identifier mismatch in group {}: node {} has {}, new node has {}",
                            spec.group_id, node.node_id, existing, new
                        )));
                    }
                }
            }
        }

        let node_id = match spec.desired_node_id {
            Some(id) => {
                if inner.nodes.contains_key(&id) {
                    return Err(HeronError::Conflict(format!(
                        "node id {} already assigned",
                        id
                    )));
                }
                inner.next_node_id = inner.next_node_id.max(id.0 + 1);
                id
            }
            None => {
                let id = NodeId(inner.next_node_id);
                inner.next_node_id += 1;
                id
            }
        };

        let now = unix_ms();
        let record = NodeRecord {
            node_id,
            cluster_name: spec.cluster_name,
            group_id: spec.group_id,
            name: spec.name,
            host: spec.host,
            port: spec.port,
            system_identifier: spec.system_identifier,
            goal_state: spec.initial_state,
            reported_state: ReplicationState::Unknown,
            health: HEALTH_UNKNOWN,
            last_health_check_ms: 0,
            last_state_change_ms: now,
            reported_timeline: TimelineId::default(),
            reported_lsn: Lsn::default(),
            reported_replication_mode: ReplicationMode::default(),
            last_report_ms: 0,
            candidate_priority: spec.candidate_priority,
            replication_quorum_member: spec.replication_quorum_member,
            pre_maintenance_state: None,
        };
        inner.nodes.insert(node_id, record.clone());
        self.persist(&inner)?;
        self.events.append(
            record.node_id,
            record.group_id,
            &record.name,
            record.reported_state,
            record.goal_state,
            record.reported_lsn,
            "node registered",
        )?;
        Ok(record)
    }

    // ── heartbeat ────────────────────────────────────────────────────────

    /// Apply a node's self-report and return its (possibly advanced) goal.
    ///
    /// Rejected transitions return `accepted = false` with the goal
    /// unchanged and append a `rejected transition` event; the node is
    /// expected to re-synchronize and retry.
    pub fn report_state(&self, node_id: NodeId, report: StateReport) -> HeronResult<ReportOutcome> {
        let mut inner = self.inner.write();
        let node = inner
            .nodes
            .get(&node_id)
            .ok_or(HeronError::NodeNotFound(node_id))?
            .clone();

        let legal = report.state == node.goal_state
            || self.table.is_legal(node.reported_state, report.state);
        if !legal {
            let err = HeronError::IllegalTransition {
                node_id,
                from: node.reported_state.to_string(),
                to: report.state.to_string(),
            };
            tracing::warn!(node_id = %node_id, retryable = err.is_retryable(), "{}", err);
            heron_observability::record_rejected_transition();
            self.events.append(
                node.node_id,
                node.group_id,
                &node.name,
                node.reported_state,
                node.goal_state,
                node.reported_lsn,
                &format!("rejected transition {} -> {}", node.reported_state, report.state),
            )?;
            return Ok(ReportOutcome {
                accepted: false,
                goal_state: node.goal_state,
                rejection: Some(err.to_string()),
            });
        }

        let now = unix_ms();
        let duplicate = report.state == node.reported_state
            && report.timeline == node.reported_timeline
            && report.lsn == node.reported_lsn
            && report.replication_mode == node.reported_replication_mode
            && report.state != node.goal_state;

        let node = inner.nodes.get_mut(&node_id).ok_or(HeronError::NodeNotFound(node_id))?;
        node.last_report_ms = now;
        if !report.is_running {
            node.health = 0;
            node.last_health_check_ms = now;
        }
        if duplicate {
            // No-op transition: refresh liveness only, no event.
            let goal = node.goal_state;
            self.persist(&inner)?;
            return Ok(ReportOutcome {
                accepted: true,
                goal_state: goal,
                rejection: None,
            });
        }

        let old_reported = node.reported_state;
        let old_goal = node.goal_state;
        let state_changed = report.state != old_reported;
        node.reported_replication_mode = report.replication_mode;
        if report.timeline != node.reported_timeline {
            // Timeline change resets the monotonicity baseline.
            node.reported_timeline = report.timeline;
            node.reported_lsn = report.lsn;
        } else {
            node.reported_lsn = node.reported_lsn.max(report.lsn);
        }
        if state_changed {
            node.reported_state = report.state;
            node.last_state_change_ms = now;
            // A node that was stable at its goal and legally moved on its
            // own initiative carries its goal with it. A goal set ahead by
            // the orchestrator is never overwritten here.
            if old_goal == old_reported {
                node.goal_state = report.state;
            }
        }
        if node.reported_state == node.goal_state {
            if let Some(next) = advance_goal(node.goal_state) {
                node.goal_state = next;
            }
        }
        let goal_changed = node.goal_state != old_goal;
        let snapshot = node.clone();
        self.persist(&inner)?;
        if state_changed || goal_changed {
            self.events.append(
                snapshot.node_id,
                snapshot.group_id,
                &snapshot.name,
                snapshot.reported_state,
                snapshot.goal_state,
                snapshot.reported_lsn,
                "report accepted",
            )?;
        }
        Ok(ReportOutcome {
            accepted: true,
            goal_state: snapshot.goal_state,
            rejection: None,
        })
    }

    // ── operator commands ────────────────────────────────────────────────

    pub fn set_candidate_priority(&self, node_id: NodeId, priority: u8) -> HeronResult<()> {
        if priority > 100 {
            return Err(HeronError::Config(format!(
                "candidate_priority must be 0..=100, got {}",
                priority
            )));
        }
        let mut inner = self.inner.write();
        let node = inner
            .nodes
            .get_mut(&node_id)
            .ok_or(HeronError::NodeNotFound(node_id))?;
        node.candidate_priority = priority;
        self.persist(&inner)
    }

    pub fn set_quorum_membership(&self, node_id: NodeId, member: bool) -> HeronResult<()> {
        let mut inner = self.inner.write();
        let node = inner
            .nodes
            .get_mut(&node_id)
            .ok_or(HeronError::NodeNotFound(node_id))?;
        node.replication_quorum_member = member;
        self.persist(&inner)
    }

    /// Request maintenance. The current reported state is stashed and
    /// restored as the goal when maintenance is released.
    pub fn start_maintenance(&self, node_id: NodeId) -> HeronResult<()> {
        let mut inner = self.inner.write();
        let node = inner
            .nodes
            .get_mut(&node_id)
            .ok_or(HeronError::NodeNotFound(node_id))?;
        if node.is_dropped() {
            return Err(HeronError::PreconditionFailed(format!(
                "node {} is dropped",
                node_id
            )));
        }
        if node.pre_maintenance_state.is_some() {
            return Err(HeronError::PreconditionFailed(format!(
                "node {} is already in maintenance",
                node_id
            )));
        }
        node.pre_maintenance_state = Some(node.reported_state);
        node.goal_state = ReplicationState::Maintenance;
        let snapshot = node.clone();
        self.persist(&inner)?;
        self.events.append(
            snapshot.node_id,
            snapshot.group_id,
            &snapshot.name,
            snapshot.reported_state,
            snapshot.goal_state,
            snapshot.reported_lsn,
            "maintenance requested",
        )?;
        Ok(())
    }

    /// Release maintenance, restoring the stashed pre-maintenance state as
    /// the goal.
    pub fn stop_maintenance(&self, node_id: NodeId) -> HeronResult<()> {
        let mut inner = self.inner.write();
        let node = inner
            .nodes
            .get_mut(&node_id)
            .ok_or(HeronError::NodeNotFound(node_id))?;
        let Some(previous) = node.pre_maintenance_state.take() else {
            return Err(HeronError::PreconditionFailed(format!(
                "node {} is not in maintenance",
                node_id
            )));
        };
        node.goal_state = previous;
        let snapshot = node.clone();
        self.persist(&inner)?;
        self.events.append(
            snapshot.node_id,
            snapshot.group_id,
            &snapshot.name,
            snapshot.reported_state,
            snapshot.goal_state,
            snapshot.reported_lsn,
            "maintenance released",
        )?;
        Ok(())
    }

    /// Remove a node. Fails with PreconditionFailed when the node holds a
    /// primary-class state and `force` is false. The record stays as a
    /// `dropped` tombstone so the id is never reused; the host:port pair is
    /// freed for a different node.
    pub fn remove_node(&self, node_id: NodeId, force: bool) -> HeronResult<()> {
        let mut inner = self.inner.write();
        let node = inner
            .nodes
            .get_mut(&node_id)
            .ok_or(HeronError::NodeNotFound(node_id))?;
        if node.is_primary_class() && !force {
            return Err(HeronError::PreconditionFailed(format!(
                "node {} is {}; pass force to remove an active primary",
                node_id, node.reported_state
            )));
        }
        node.reported_state = ReplicationState::Dropped;
        node.goal_state = ReplicationState::Dropped;
        node.last_state_change_ms = unix_ms();
        node.pre_maintenance_state = None;
        let snapshot = node.clone();
        self.persist(&inner)?;
        self.events.append(
            snapshot.node_id,
            snapshot.group_id,
            &snapshot.name,
            snapshot.reported_state,
            snapshot.goal_state,
            snapshot.reported_lsn,
            "node removed",
        )?;
        Ok(())
    }

    /// Set a node's goal directly. Used by the orchestrator for failover
    /// decisions; appends an event describing the instruction.
    pub fn set_goal(
        &self,
        node_id: NodeId,
        goal: ReplicationState,
        description: &str,
    ) -> HeronResult<()> {
        let mut inner = self.inner.write();
        let node = inner
            .nodes
            .get_mut(&node_id)
            .ok_or(HeronError::NodeNotFound(node_id))?;
        if node.goal_state == goal {
            return Ok(());
        }
        node.goal_state = goal;
        let snapshot = node.clone();
        self.persist(&inner)?;
        self.events.append(
            snapshot.node_id,
            snapshot.group_id,
            &snapshot.name,
            snapshot.reported_state,
            snapshot.goal_state,
            snapshot.reported_lsn,
            description,
        )?;
        Ok(())
    }

    /// Write back a health score from the monitor snapshot.
    pub fn apply_health(&self, node_id: NodeId, health: i32) -> HeronResult<()> {
        let mut inner = self.inner.write();
        let node = inner
            .nodes
            .get_mut(&node_id)
            .ok_or(HeronError::NodeNotFound(node_id))?;
        node.health = health;
        node.last_health_check_ms = unix_ms();
        Ok(())
    }

    // ── views ────────────────────────────────────────────────────────────

    pub fn get(&self, node_id: NodeId) -> Option<NodeRecord> {
        self.inner.read().nodes.get(&node_id).cloned()
    }

    /// All records, tombstones included.
    pub fn list_all(&self) -> Vec<NodeRecord> {
        self.inner.read().nodes.values().cloned().collect()
    }

    /// Live (non-dropped) records.
    pub fn list_live(&self) -> Vec<NodeRecord> {
        self.inner
            .read()
            .nodes
            .values()
            .filter(|n| !n.is_dropped())
            .cloned()
            .collect()
    }

    /// Live records in one replication group.
    pub fn group_nodes(&self, group_id: GroupId) -> Vec<NodeRecord> {
        self.inner
            .read()
            .nodes
            .values()
            .filter(|n| !n.is_dropped() && n.group_id == group_id)
            .cloned()
            .collect()
    }

    /// Group ids with at least one live member.
    pub fn live_groups(&self) -> Vec<GroupId> {
        let inner = self.inner.read();
        let mut groups: Vec<GroupId> = inner
            .nodes
            .values()
            .filter(|n| !n.is_dropped())
            .map(|n| n.group_id)
            .collect();
        groups.sort_unstable();
        groups.dedup();
        groups
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }
}
