//! Quorum and split-brain evaluation.
//!
//! Pure decision logic: registry records plus a health snapshot plus the
//! consensus view go in, one `QuorumDecision` comes out. Nothing here
//! mutates state; the orchestrator acts on the decision under the group
//! evaluation lock.

use heron_common::config::{FailoverConfig, MonitorConfig};
use heron_common::{GroupId, NodeId};
use heron_consensus::ConsensusView;

use crate::monitor::{HealthSnapshot, HealthStatus};
use crate::registry::NodeRecord;

/// Output of one evaluation cycle. Ephemeral, never persisted.
#[derive(Debug, Clone)]
pub struct QuorumDecision {
    pub group_id: GroupId,
    pub has_quorum: bool,
    pub healthy_node_count: usize,
    pub total_node_count: usize,
    pub votes_required: usize,
    pub leader_node_id: Option<NodeId>,
    pub split_brain_detected: bool,
    pub needs_election: bool,
    pub decision_reason: String,
}

impl QuorumDecision {
    fn incomplete(group_id: GroupId, total: usize, reason: &str) -> Self {
        Self {
            group_id,
            has_quorum: false,
            healthy_node_count: 0,
            total_node_count: total,
            votes_required: votes_required(total),
            leader_node_id: None,
            split_brain_detected: false,
            needs_election: false,
            decision_reason: format!("evaluation incomplete: {}", reason),
        }
    }

    pub fn is_incomplete(&self) -> bool {
        self.decision_reason.starts_with("evaluation incomplete")
    }
}

/// Majority of n: floor(n/2) + 1.
pub fn votes_required(total: usize) -> usize {
    total / 2 + 1
}

pub struct QuorumEngine {
    monitor_config: MonitorConfig,
    failover_config: FailoverConfig,
}

impl QuorumEngine {
    pub fn new(monitor_config: MonitorConfig, failover_config: FailoverConfig) -> Self {
        Self {
            monitor_config,
            failover_config,
        }
    }

    fn health_timeout_ms(&self) -> u64 {
        self.monitor_config.health_timeout_ms
    }

    /// A node counts as healthy when its latest status is OK or WARNING and
    /// the evidence is no older than the health timeout. A recent
    /// self-report also counts as evidence of life.
    fn is_healthy(&self, node: &NodeRecord, snapshot: &HealthSnapshot, now_ms: u64) -> bool {
        let Some(health) = snapshot.per_node.get(&node.node_id) else {
            return false;
        };
        match health.status {
            Some(HealthStatus::Ok) | Some(HealthStatus::Warning) => {
                let freshest = health.last_success_ms.max(node.last_report_ms);
                now_ms.saturating_sub(freshest) <= self.health_timeout_ms()
            }
            _ => false,
        }
    }

    /// Evaluate one replication group.
    ///
    /// When the health snapshot or consensus view is stale the decision is
    /// `has_quorum = false` with reason "evaluation incomplete"; callers
    /// must treat that as "do nothing destructive".
    pub fn evaluate(
        &self,
        group_id: GroupId,
        nodes: &[NodeRecord],
        snapshot: &HealthSnapshot,
        view: &ConsensusView,
        now_ms: u64,
    ) -> QuorumDecision {
        let total = nodes.len();

        if snapshot.taken_ms == 0 {
            return QuorumDecision::incomplete(group_id, total, "no health snapshot yet");
        }
        if now_ms.saturating_sub(snapshot.taken_ms) > self.health_timeout_ms() {
            return QuorumDecision::incomplete(group_id, total, "health snapshot stale");
        }
        if view.updated.is_none() {
            return QuorumDecision::incomplete(group_id, total, "consensus view never updated");
        }

        let healthy = nodes
            .iter()
            .filter(|n| self.is_healthy(n, snapshot, now_ms))
            .count();
        let required = votes_required(total);
        let has_quorum = total > 0 && healthy >= required;

        let primaries: Vec<&NodeRecord> =
            nodes.iter().filter(|n| n.is_primary_class()).collect();
        let split_brain_detected = primaries.len() > 1;

        let mut reason = if split_brain_detected {
            let ids: Vec<String> = primaries.iter().map(|n| n.node_id.to_string()).collect();
            format!("split brain between nodes {}", ids.join(", "))
        } else if !has_quorum {
            format!("quorum lost: {} healthy of {} (need {})", healthy, total, required)
        } else {
            "quorum held".to_string()
        };

        // A primary that has been unhealthy past the grace period forces an
        // election even while the rest of the group is quorate.
        let grace = self.failover_config.grace_period_ms;
        let mut primary_failed = false;
        for primary in &primaries {
            if self.is_healthy(primary, snapshot, now_ms) {
                continue;
            }
            let freshest = snapshot
                .per_node
                .get(&primary.node_id)
                .map(|h| h.last_success_ms)
                .unwrap_or(0)
                .max(primary.last_report_ms);
            if now_ms.saturating_sub(freshest) > grace {
                primary_failed = true;
                reason = format!("primary node {} unhealthy past grace period", primary.node_id);
            }
        }

        let needs_election = !has_quorum || primary_failed;
        QuorumDecision {
            group_id,
            has_quorum,
            healthy_node_count: healthy,
            total_node_count: total,
            votes_required: required,
            leader_node_id: view.leader,
            split_brain_detected,
            needs_election,
            decision_reason: reason,
        }
    }
}

/// Pick the surviving primary among conflicting primary-class nodes:
/// the consensus leader if it is one of them, else the highest reported
/// LSN, else the lowest node id. Returns (survivor, to_demote).
pub fn resolve_split_brain<'a>(
    primaries: &[&'a NodeRecord],
    leader: Option<NodeId>,
) -> (Option<&'a NodeRecord>, Vec<&'a NodeRecord>) {
    if primaries.is_empty() {
        return (None, Vec::new());
    }
    let survivor = primaries
        .iter()
        .find(|n| Some(n.node_id) == leader)
        .copied()
        .unwrap_or_else(|| {
            primaries
                .iter()
                .copied()
                .max_by(|a, b| {
                    a.reported_lsn
                        .cmp(&b.reported_lsn)
                        .then(b.node_id.cmp(&a.node_id))
                })
                .unwrap_or(primaries[0])
        });
    let demote = primaries
        .iter()
        .copied()
        .filter(|n| n.node_id != survivor.node_id)
        .collect();
    (Some(survivor), demote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::NodeHealth;
    use crate::state::ReplicationState;
    use heron_common::{unix_ms, Lsn, ReplicationMode, TimelineId};
    use std::collections::BTreeMap;
    use std::time::Instant;

    fn node(id: u64, state: ReplicationState, lsn: u64) -> NodeRecord {
        NodeRecord {
            node_id: NodeId(id),
            cluster_name: "test".to_string(),
            group_id: GroupId(0),
            name: format!("node-{}", id),
            host: format!("10.0.0.{}", id),
            port: 5432,
            system_identifier: None,
            goal_state: state,
            reported_state: state,
            health: 100,
            last_health_check_ms: unix_ms(),
            last_state_change_ms: 0,
            reported_timeline: TimelineId(1),
            reported_lsn: Lsn(lsn),
            reported_replication_mode: ReplicationMode::Async,
            last_report_ms: unix_ms(),
            candidate_priority: 50,
            replication_quorum_member: true,
            pre_maintenance_state: None,
        }
    }

    fn snapshot_for(nodes: &[NodeRecord], healthy: &[u64]) -> HealthSnapshot {
        let now = unix_ms();
        let mut per_node = BTreeMap::new();
        for n in nodes {
            let is_healthy = healthy.contains(&n.node_id.0);
            per_node.insert(
                n.node_id,
                NodeHealth {
                    status: Some(if is_healthy {
                        HealthStatus::Ok
                    } else {
                        HealthStatus::Critical
                    }),
                    consecutive_failures: if is_healthy { 0 } else { 5 },
                    last_success_ms: if is_healthy { now } else { 0 },
                },
            );
        }
        HealthSnapshot {
            taken_ms: now,
            overall: HealthStatus::Ok,
            per_node,
            checks_performed: 1,
            warnings_count: 0,
            errors_count: 0,
        }
    }

    fn view(leader: Option<u64>) -> ConsensusView {
        ConsensusView {
            leader: leader.map(NodeId),
            term: 1,
            has_quorum: true,
            peer_reachable: BTreeMap::new(),
            updated: Some(Instant::now()),
        }
    }

    fn engine() -> QuorumEngine {
        QuorumEngine::new(MonitorConfig::default(), FailoverConfig::default())
    }

    #[test]
    fn test_votes_required_boundaries() {
        assert_eq!(votes_required(1), 1);
        assert_eq!(votes_required(2), 2);
        assert_eq!(votes_required(3), 2);
        assert_eq!(votes_required(4), 3);
        assert_eq!(votes_required(5), 3);
    }

    #[test]
    fn test_quorum_flips_exactly_at_threshold() {
        let engine = engine();
        for n in 1..=5u64 {
            let nodes: Vec<NodeRecord> = (1..=n)
                .map(|i| node(i, ReplicationState::Secondary, 10))
                .collect();
            let required = votes_required(n as usize);
            for healthy_count in 0..=n as usize {
                let healthy: Vec<u64> = (1..=healthy_count as u64).collect();
                let snapshot = snapshot_for(&nodes, &healthy);
                // Stale reports: quorum must come from the snapshot alone.
                let mut nodes = nodes.clone();
                for node in &mut nodes {
                    node.last_report_ms = 0;
                }
                let decision =
                    engine.evaluate(GroupId(0), &nodes, &snapshot, &view(None), unix_ms());
                assert_eq!(
                    decision.has_quorum,
                    healthy_count >= required,
                    "n={} healthy={} required={}",
                    n,
                    healthy_count,
                    required
                );
                assert_eq!(decision.votes_required, required);
                assert_eq!(decision.healthy_node_count, healthy_count);
            }
        }
    }

    #[test]
    fn test_no_quorum_needs_election() {
        let engine = engine();
        let nodes = vec![
            node(1, ReplicationState::Primary, 100),
            node(2, ReplicationState::Secondary, 90),
            node(3, ReplicationState::Secondary, 95),
        ];
        let snapshot = snapshot_for(&nodes, &[1]);
        let mut nodes = nodes;
        for n in &mut nodes {
            n.last_report_ms = 0;
        }
        let decision = engine.evaluate(GroupId(0), &nodes, &snapshot, &view(None), unix_ms());
        assert!(!decision.has_quorum);
        assert!(decision.needs_election);
    }

    #[test]
    fn test_split_brain_detected_with_two_primaries() {
        let engine = engine();
        let nodes = vec![
            node(1, ReplicationState::Primary, 100),
            node(2, ReplicationState::Primary, 90),
            node(3, ReplicationState::Secondary, 95),
        ];
        let snapshot = snapshot_for(&nodes, &[1, 2, 3]);
        let decision = engine.evaluate(GroupId(0), &nodes, &snapshot, &view(None), unix_ms());
        assert!(decision.split_brain_detected);
        assert!(decision.decision_reason.contains('1'));
        assert!(decision.decision_reason.contains('2'));
    }

    #[test]
    fn test_wait_primary_counts_as_primary_class() {
        let engine = engine();
        let nodes = vec![
            node(1, ReplicationState::Primary, 100),
            node(2, ReplicationState::WaitPrimary, 90),
        ];
        let snapshot = snapshot_for(&nodes, &[1, 2]);
        let decision = engine.evaluate(GroupId(0), &nodes, &snapshot, &view(None), unix_ms());
        assert!(decision.split_brain_detected);
    }

    #[test]
    fn test_resolution_prefers_consensus_leader() {
        let a = node(1, ReplicationState::Primary, 100);
        let b = node(2, ReplicationState::Primary, 200);
        let primaries = vec![&a, &b];
        // Leader wins even with the lower LSN.
        let (survivor, demote) = resolve_split_brain(&primaries, Some(NodeId(1)));
        assert_eq!(survivor.unwrap().node_id, NodeId(1));
        assert_eq!(demote.len(), 1);
        assert_eq!(demote[0].node_id, NodeId(2));
    }

    #[test]
    fn test_resolution_falls_back_to_highest_lsn() {
        let a = node(1, ReplicationState::Primary, 100);
        let b = node(2, ReplicationState::Primary, 200);
        let primaries = vec![&a, &b];
        let (survivor, demote) = resolve_split_brain(&primaries, None);
        assert_eq!(survivor.unwrap().node_id, NodeId(2));
        assert_eq!(demote[0].node_id, NodeId(1));
    }

    #[test]
    fn test_resolution_tie_breaks_on_lowest_id() {
        let a = node(3, ReplicationState::Primary, 100);
        let b = node(7, ReplicationState::Primary, 100);
        let primaries = vec![&a, &b];
        let (survivor, _) = resolve_split_brain(&primaries, None);
        assert_eq!(survivor.unwrap().node_id, NodeId(3));
    }

    #[test]
    fn test_resolution_ignores_leader_outside_group() {
        let a = node(1, ReplicationState::Primary, 100);
        let b = node(2, ReplicationState::Primary, 200);
        let primaries = vec![&a, &b];
        let (survivor, _) = resolve_split_brain(&primaries, Some(NodeId(9)));
        assert_eq!(survivor.unwrap().node_id, NodeId(2));
    }

    #[test]
    fn test_failed_primary_past_grace_needs_election() {
        let engine = QuorumEngine::new(
            MonitorConfig::default(),
            FailoverConfig {
                grace_period_ms: 1_000,
                confirmation_grace_ms: 1_000,
                tick_interval_ms: 100,
            },
        );
        let mut nodes = vec![
            node(1, ReplicationState::Primary, 100),
            node(2, ReplicationState::Secondary, 90),
            node(3, ReplicationState::Secondary, 95),
        ];
        // Primary last proved life well past the grace period.
        nodes[0].last_report_ms = unix_ms().saturating_sub(60_000);
        let snapshot = snapshot_for(&nodes, &[2, 3]);
        let decision = engine.evaluate(GroupId(0), &nodes, &snapshot, &view(None), unix_ms());
        assert!(decision.has_quorum, "2 of 3 healthy keeps quorum");
        assert!(decision.needs_election);
        assert!(decision.decision_reason.contains("grace period"));
    }

    #[test]
    fn test_missing_snapshot_is_incomplete() {
        let engine = engine();
        let nodes = vec![node(1, ReplicationState::Primary, 100)];
        let snapshot = HealthSnapshot {
            taken_ms: 0,
            overall: HealthStatus::Warning,
            per_node: BTreeMap::new(),
            checks_performed: 0,
            warnings_count: 0,
            errors_count: 0,
        };
        let decision = engine.evaluate(GroupId(0), &nodes, &snapshot, &view(None), unix_ms());
        assert!(decision.is_incomplete());
        assert!(!decision.has_quorum);
        assert!(!decision.needs_election);
    }

    #[test]
    fn test_stale_snapshot_is_incomplete() {
        let engine = engine();
        let nodes = vec![node(1, ReplicationState::Primary, 100)];
        let mut snapshot = snapshot_for(&nodes, &[1]);
        snapshot.taken_ms = unix_ms().saturating_sub(120_000);
        let decision = engine.evaluate(GroupId(0), &nodes, &snapshot, &view(None), unix_ms());
        assert!(decision.is_incomplete());
    }

    #[test]
    fn test_never_updated_view_is_incomplete() {
        let engine = engine();
        let nodes = vec![node(1, ReplicationState::Primary, 100)];
        let snapshot = snapshot_for(&nodes, &[1]);
        let mut stale_view = view(None);
        stale_view.updated = None;
        let decision = engine.evaluate(GroupId(0), &nodes, &snapshot, &stale_view, unix_ms());
        assert!(decision.is_incomplete());
    }
}
