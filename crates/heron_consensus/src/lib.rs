//! Consensus adapter boundary for the Heron control plane.
//!
//! The decision engine never talks to a consensus protocol directly. It sees
//! a [`ConsensusHandle`]: a cached view of leadership and quorum plus a
//! drainable queue of membership events. Implementations:
//!
//! - `SingleNodeConsensus`: no peers, always leader, always quorate
//! - `ChannelConsensus`: fed by an external adapter over channels
//! - `ScriptedConsensus`: test double with settable leadership/quorum

use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, Sender, TrySendError};
use std::sync::mpsc::SyncSender;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use heron_common::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("not leader")]
    NotLeader,
    #[error("membership change failed: {0}")]
    MembershipFailed(String),
    #[error("adapter disconnected")]
    Disconnected,
}

/// Inbound notification from the consensus adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusEvent {
    /// Leadership moved. `leader` is None during an election.
    LeaderChanged { leader: Option<NodeId>, term: u64 },
    /// The quorate/non-quorate status of the control-plane group flipped.
    QuorumChanged { has_quorum: bool },
    /// A peer control-plane instance became reachable or unreachable.
    PeerHealth { peer: NodeId, reachable: bool },
}

/// Outbound request to the consensus adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipCommand {
    AddVoter { node: NodeId, addr: String },
    RemoveVoter(NodeId),
}

/// Point-in-time snapshot of what the consensus layer believes.
///
/// `updated` is None until the first event arrives; callers treat a missing
/// or stale view as "evaluation incomplete" rather than acting on it.
#[derive(Debug, Clone)]
pub struct ConsensusView {
    pub leader: Option<NodeId>,
    pub term: u64,
    pub has_quorum: bool,
    pub peer_reachable: BTreeMap<NodeId, bool>,
    pub updated: Option<Instant>,
}

impl ConsensusView {
    fn empty() -> Self {
        Self {
            leader: None,
            term: 0,
            has_quorum: false,
            peer_reachable: BTreeMap::new(),
            updated: None,
        }
    }

    /// Age of this view, or None if no event has ever been applied.
    pub fn staleness(&self) -> Option<Duration> {
        self.updated.map(|t| t.elapsed())
    }
}

/// What the decision engine requires of a consensus implementation.
///
/// All methods are synchronous and non-blocking; implementations cache
/// state pushed by the adapter rather than querying it inline.
pub trait ConsensusHandle: Send + Sync + 'static {
    /// Current cached view.
    fn view(&self) -> ConsensusView;

    /// Drain and apply pending adapter events, returning them in arrival
    /// order. The orchestrator calls this at the top of every tick.
    fn drain(&self) -> Vec<ConsensusEvent>;

    /// Ask the adapter to add a voting member.
    fn add_voting_member(&self, node: NodeId, addr: &str) -> Result<(), ConsensusError>;

    /// Ask the adapter to remove a voting member.
    fn remove_voting_member(&self, node: NodeId) -> Result<(), ConsensusError>;

    /// True when this instance currently believes it is the leader.
    fn is_leader(&self, self_id: NodeId) -> bool {
        self.view().leader == Some(self_id)
    }

    fn current_leader(&self) -> Option<NodeId> {
        self.view().leader
    }

    fn current_term(&self) -> u64 {
        self.view().term
    }

    fn has_quorum(&self) -> bool {
        self.view().has_quorum
    }

    /// Peer health as last reported by the adapter. Unknown peers count
    /// as unreachable.
    fn is_peer_healthy(&self, peer: NodeId) -> bool {
        self.view().peer_reachable.get(&peer).copied().unwrap_or(false)
    }

    /// Age of the cached view; None before the first adapter event.
    fn staleness(&self) -> Option<Duration> {
        self.view().staleness()
    }
}

// ---------------------------------------------------------------------------
// SingleNodeConsensus — no peers, every decision is local
// ---------------------------------------------------------------------------

/// Consensus for a single control-plane instance. Always quorate, always
/// leader, membership changes succeed as no-ops.
pub struct SingleNodeConsensus {
    self_id: NodeId,
    started: Instant,
}

impl SingleNodeConsensus {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            started: Instant::now(),
        }
    }
}

impl ConsensusHandle for SingleNodeConsensus {
    fn view(&self) -> ConsensusView {
        ConsensusView {
            leader: Some(self.self_id),
            term: 1,
            has_quorum: true,
            peer_reachable: BTreeMap::new(),
            updated: Some(self.started),
        }
    }

    fn drain(&self) -> Vec<ConsensusEvent> {
        Vec::new()
    }

    fn add_voting_member(&self, _node: NodeId, _addr: &str) -> Result<(), ConsensusError> {
        Ok(())
    }

    fn remove_voting_member(&self, _node: NodeId) -> Result<(), ConsensusError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ChannelConsensus — driven by an external adapter over channels
// ---------------------------------------------------------------------------

/// Consensus handle fed by an external adapter process or thread.
///
/// The adapter pushes [`ConsensusEvent`]s into the inbound channel; `drain`
/// folds them into the cached view. Membership commands go out on a bounded
/// channel so a stuck adapter surfaces as an error instead of a hang.
pub struct ChannelConsensus {
    view: Mutex<ConsensusView>,
    events: Mutex<Receiver<ConsensusEvent>>,
    commands: SyncSender<MembershipCommand>,
}

impl ChannelConsensus {
    pub fn new(
        events: Receiver<ConsensusEvent>,
        commands: SyncSender<MembershipCommand>,
    ) -> Self {
        Self {
            view: Mutex::new(ConsensusView::empty()),
            events: Mutex::new(events),
            commands,
        }
    }

    fn apply(view: &mut ConsensusView, event: &ConsensusEvent) {
        match event {
            ConsensusEvent::LeaderChanged { leader, term } => {
                view.leader = *leader;
                view.term = *term;
            }
            ConsensusEvent::QuorumChanged { has_quorum } => {
                view.has_quorum = *has_quorum;
            }
            ConsensusEvent::PeerHealth { peer, reachable } => {
                view.peer_reachable.insert(*peer, *reachable);
            }
        }
        view.updated = Some(Instant::now());
    }

    fn send(&self, command: MembershipCommand) -> Result<(), ConsensusError> {
        match self.commands.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(c)) => Err(ConsensusError::MembershipFailed(format!(
                "adapter command queue full, dropped {:?}",
                c
            ))),
            Err(TrySendError::Disconnected(_)) => Err(ConsensusError::Disconnected),
        }
    }
}

impl ConsensusHandle for ChannelConsensus {
    fn view(&self) -> ConsensusView {
        self.view.lock().clone()
    }

    fn drain(&self) -> Vec<ConsensusEvent> {
        let receiver = self.events.lock();
        let mut view = self.view.lock();
        let mut drained = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            Self::apply(&mut view, &event);
            drained.push(event);
        }
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "applied consensus events");
        }
        drained
    }

    fn add_voting_member(&self, node: NodeId, addr: &str) -> Result<(), ConsensusError> {
        self.send(MembershipCommand::AddVoter {
            node,
            addr: addr.to_string(),
        })
    }

    fn remove_voting_member(&self, node: NodeId) -> Result<(), ConsensusError> {
        self.send(MembershipCommand::RemoveVoter(node))
    }
}

// ---------------------------------------------------------------------------
// ScriptedConsensus — test double
// ---------------------------------------------------------------------------

/// Test double whose leadership and quorum are set directly by tests.
/// Membership commands are recorded for later assertion.
pub struct ScriptedConsensus {
    view: Mutex<ConsensusView>,
    queued: Mutex<Vec<ConsensusEvent>>,
    recorded: Mutex<Vec<MembershipCommand>>,
}

impl ScriptedConsensus {
    pub fn new() -> Self {
        Self {
            view: Mutex::new(ConsensusView {
                leader: None,
                term: 0,
                has_quorum: true,
                peer_reachable: BTreeMap::new(),
                updated: Some(Instant::now()),
            }),
            queued: Mutex::new(Vec::new()),
            recorded: Mutex::new(Vec::new()),
        }
    }

    pub fn set_leader(&self, leader: Option<NodeId>, term: u64) {
        let mut view = self.view.lock();
        view.leader = leader;
        view.term = term;
        view.updated = Some(Instant::now());
    }

    pub fn set_quorum(&self, has_quorum: bool) {
        let mut view = self.view.lock();
        view.has_quorum = has_quorum;
        view.updated = Some(Instant::now());
    }

    /// Queue an event to be returned by the next `drain` call.
    pub fn push_event(&self, event: ConsensusEvent) {
        self.queued.lock().push(event);
    }

    pub fn recorded_commands(&self) -> Vec<MembershipCommand> {
        self.recorded.lock().clone()
    }
}

impl Default for ScriptedConsensus {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsensusHandle for ScriptedConsensus {
    fn view(&self) -> ConsensusView {
        self.view.lock().clone()
    }

    fn drain(&self) -> Vec<ConsensusEvent> {
        let drained: Vec<ConsensusEvent> = self.queued.lock().drain(..).collect();
        let mut view = self.view.lock();
        for event in &drained {
            ChannelConsensus::apply(&mut view, event);
        }
        drained
    }

    fn add_voting_member(&self, node: NodeId, addr: &str) -> Result<(), ConsensusError> {
        self.recorded.lock().push(MembershipCommand::AddVoter {
            node,
            addr: addr.to_string(),
        });
        Ok(())
    }

    fn remove_voting_member(&self, node: NodeId) -> Result<(), ConsensusError> {
        self.recorded
            .lock()
            .push(MembershipCommand::RemoveVoter(node));
        Ok(())
    }
}

/// Build a connected (adapter side, handle) pair for channel-driven mode.
/// `command_depth` bounds the outbound queue.
pub fn channel_pair(
    command_depth: usize,
) -> (
    Sender<ConsensusEvent>,
    Receiver<MembershipCommand>,
    ChannelConsensus,
) {
    let (event_tx, event_rx) = std::sync::mpsc::channel();
    let (command_tx, command_rx) = std::sync::mpsc::sync_channel(command_depth);
    let handle = ChannelConsensus::new(event_rx, command_tx);
    (event_tx, command_rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_node_always_leader_and_quorate() {
        let consensus = SingleNodeConsensus::new(NodeId(1));
        assert!(consensus.is_leader(NodeId(1)));
        assert!(!consensus.is_leader(NodeId(2)));
        assert!(consensus.has_quorum());
        assert_eq!(consensus.current_term(), 1);
        assert!(consensus.drain().is_empty());
        assert!(consensus.add_voting_member(NodeId(9), "10.0.0.9:8008").is_ok());
        assert!(consensus.remove_voting_member(NodeId(9)).is_ok());
    }

    #[test]
    fn test_channel_view_starts_empty() {
        let (_events, _commands, handle) = channel_pair(8);
        let view = handle.view();
        assert!(view.leader.is_none());
        assert!(!view.has_quorum);
        assert!(view.updated.is_none());
        assert!(view.staleness().is_none());
    }

    #[test]
    fn test_channel_drain_folds_events_into_view() {
        let (events, _commands, handle) = channel_pair(8);
        events
            .send(ConsensusEvent::LeaderChanged {
                leader: Some(NodeId(2)),
                term: 7,
            })
            .unwrap();
        events
            .send(ConsensusEvent::QuorumChanged { has_quorum: true })
            .unwrap();
        events
            .send(ConsensusEvent::PeerHealth {
                peer: NodeId(3),
                reachable: false,
            })
            .unwrap();

        let drained = handle.drain();
        assert_eq!(drained.len(), 3);

        let view = handle.view();
        assert_eq!(view.leader, Some(NodeId(2)));
        assert_eq!(view.term, 7);
        assert!(view.has_quorum);
        assert_eq!(view.peer_reachable.get(&NodeId(3)), Some(&false));
        assert!(view.updated.is_some());
        assert!(!handle.is_peer_healthy(NodeId(3)));
        assert!(!handle.is_peer_healthy(NodeId(99)));
    }

    #[test]
    fn test_channel_drain_preserves_order() {
        let (events, _commands, handle) = channel_pair(8);
        events
            .send(ConsensusEvent::QuorumChanged { has_quorum: true })
            .unwrap();
        events
            .send(ConsensusEvent::QuorumChanged { has_quorum: false })
            .unwrap();
        let drained = handle.drain();
        assert_eq!(
            drained,
            vec![
                ConsensusEvent::QuorumChanged { has_quorum: true },
                ConsensusEvent::QuorumChanged { has_quorum: false },
            ]
        );
        // Last write wins in the folded view.
        assert!(!handle.has_quorum());
    }

    #[test]
    fn test_channel_membership_commands_delivered() {
        let (_events, commands, handle) = channel_pair(8);
        handle.add_voting_member(NodeId(4), "10.0.0.4:8008").unwrap();
        handle.remove_voting_member(NodeId(5)).unwrap();
        assert_eq!(
            commands.recv().unwrap(),
            MembershipCommand::AddVoter {
                node: NodeId(4),
                addr: "10.0.0.4:8008".to_string(),
            }
        );
        assert_eq!(
            commands.recv().unwrap(),
            MembershipCommand::RemoveVoter(NodeId(5))
        );
    }

    #[test]
    fn test_channel_command_queue_full_is_error() {
        let (_events, commands, handle) = channel_pair(1);
        handle.add_voting_member(NodeId(1), "a:1").unwrap();
        let err = handle.add_voting_member(NodeId(2), "b:2").unwrap_err();
        assert!(matches!(err, ConsensusError::MembershipFailed(_)));
        drop(commands);
        let err = handle.add_voting_member(NodeId(3), "c:3").unwrap_err();
        assert!(matches!(
            err,
            ConsensusError::MembershipFailed(_) | ConsensusError::Disconnected
        ));
    }

    #[test]
    fn test_channel_adapter_disconnect_is_error() {
        let (_events, commands, handle) = channel_pair(8);
        drop(commands);
        let err = handle.add_voting_member(NodeId(1), "a:1").unwrap_err();
        assert!(matches!(err, ConsensusError::Disconnected));
    }

    #[test]
    fn test_scripted_set_and_drain() {
        let consensus = ScriptedConsensus::new();
        consensus.set_leader(Some(NodeId(1)), 3);
        assert!(consensus.is_leader(NodeId(1)));

        consensus.push_event(ConsensusEvent::QuorumChanged { has_quorum: false });
        let drained = consensus.drain();
        assert_eq!(drained.len(), 1);
        assert!(!consensus.has_quorum());

        consensus.add_voting_member(NodeId(8), "10.0.0.8:8008").unwrap();
        assert_eq!(
            consensus.recorded_commands(),
            vec![MembershipCommand::AddVoter {
                node: NodeId(8),
                addr: "10.0.0.8:8008".to_string(),
            }]
        );
    }
}
