//! Replication lifecycle states and the legal-transition table.
//!
//! The table is data, not code: a map from state to its legal successor
//! set, built once from defaults plus optional config overrides, and
//! consulted in exactly one place (`TransitionTable::is_legal`).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use heron_common::{HeronError, HeronResult};

/// Lifecycle state of a monitored node. `reported_state` is the node's last
/// self-report; `goal_state` is what the orchestrator wants it to become.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationState {
    #[default]
    Unknown,
    Init,
    Single,
    WaitPrimary,
    Primary,
    Draining,
    DemoteTimeout,
    Demoted,
    #[serde(rename = "catchingup")]
    CatchingUp,
    Secondary,
    PreparePromotion,
    StopReplication,
    WaitStandby,
    Maintenance,
    JoinPrimary,
    ApplySettings,
    PrepareMaintenance,
    WaitMaintenance,
    ReportLsn,
    FastForward,
    JoinSecondary,
    Dropped,
}

impl ReplicationState {
    pub const ALL: [ReplicationState; 22] = [
        ReplicationState::Unknown,
        ReplicationState::Init,
        ReplicationState::Single,
        ReplicationState::WaitPrimary,
        ReplicationState::Primary,
        ReplicationState::Draining,
        ReplicationState::DemoteTimeout,
        ReplicationState::Demoted,
        ReplicationState::CatchingUp,
        ReplicationState::Secondary,
        ReplicationState::PreparePromotion,
        ReplicationState::StopReplication,
        ReplicationState::WaitStandby,
        ReplicationState::Maintenance,
        ReplicationState::JoinPrimary,
        ReplicationState::ApplySettings,
        ReplicationState::PrepareMaintenance,
        ReplicationState::WaitMaintenance,
        ReplicationState::ReportLsn,
        ReplicationState::FastForward,
        ReplicationState::JoinSecondary,
        ReplicationState::Dropped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationState::Unknown => "unknown",
            ReplicationState::Init => "init",
            ReplicationState::Single => "single",
            ReplicationState::WaitPrimary => "wait_primary",
            ReplicationState::Primary => "primary",
            ReplicationState::Draining => "draining",
            ReplicationState::DemoteTimeout => "demote_timeout",
            ReplicationState::Demoted => "demoted",
            ReplicationState::CatchingUp => "catchingup",
            ReplicationState::Secondary => "secondary",
            ReplicationState::PreparePromotion => "prepare_promotion",
            ReplicationState::StopReplication => "stop_replication",
            ReplicationState::WaitStandby => "wait_standby",
            ReplicationState::Maintenance => "maintenance",
            ReplicationState::JoinPrimary => "join_primary",
            ReplicationState::ApplySettings => "apply_settings",
            ReplicationState::PrepareMaintenance => "prepare_maintenance",
            ReplicationState::WaitMaintenance => "wait_maintenance",
            ReplicationState::ReportLsn => "report_lsn",
            ReplicationState::FastForward => "fast_forward",
            ReplicationState::JoinSecondary => "join_secondary",
            ReplicationState::Dropped => "dropped",
        }
    }

    /// Primary-class states are write-capable leadership. At most one node
    /// per group may report one of these at any instant.
    pub fn is_primary_class(&self) -> bool {
        matches!(
            self,
            ReplicationState::Single | ReplicationState::WaitPrimary | ReplicationState::Primary
        )
    }
}

impl fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplicationState {
    type Err = HeronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReplicationState::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| HeronError::Config(format!("unknown replication state '{}'", s)))
    }
}

// ---------------------------------------------------------------------------
// TransitionTable
// ---------------------------------------------------------------------------

/// Legal successors per state. A report is accepted only when the proposed
/// state equals the node's current state, equals its goal, or appears in the
/// current state's successor set.
#[derive(Debug, Clone)]
pub struct TransitionTable {
    successors: BTreeMap<ReplicationState, BTreeSet<ReplicationState>>,
}

impl TransitionTable {
    pub fn new() -> Self {
        use ReplicationState::*;
        let entries: [(ReplicationState, &[ReplicationState]); 22] = [
            (Unknown, &[Init, Single, WaitStandby, CatchingUp, Secondary]),
            (Init, &[Single, WaitPrimary, CatchingUp, WaitStandby]),
            (Single, &[WaitPrimary, Draining, ApplySettings]),
            (WaitPrimary, &[Primary, Single, Draining]),
            (Primary, &[Draining, DemoteTimeout, JoinPrimary, ApplySettings]),
            (Draining, &[DemoteTimeout, Demoted]),
            (DemoteTimeout, &[Demoted]),
            (Demoted, &[CatchingUp]),
            (CatchingUp, &[Secondary]),
            (
                Secondary,
                &[
                    PreparePromotion,
                    CatchingUp,
                    ReportLsn,
                    ApplySettings,
                    PrepareMaintenance,
                    JoinSecondary,
                ],
            ),
            (PreparePromotion, &[StopReplication, FastForward]),
            (StopReplication, &[WaitPrimary]),
            (WaitStandby, &[CatchingUp]),
            (Maintenance, &[CatchingUp, Secondary]),
            (JoinPrimary, &[Primary, WaitPrimary]),
            (ApplySettings, &[Primary, Secondary, Single]),
            (PrepareMaintenance, &[WaitMaintenance, Maintenance]),
            (WaitMaintenance, &[Maintenance]),
            (ReportLsn, &[FastForward, Secondary]),
            (FastForward, &[PreparePromotion]),
            (JoinSecondary, &[Secondary, CatchingUp]),
            (Dropped, &[]),
        ];
        let successors = entries
            .into_iter()
            .map(|(from, to)| (from, to.iter().copied().collect()))
            .collect();
        Self { successors }
    }

    /// Default table with per-state overrides applied. Each override
    /// replaces the full successor set for its state.
    pub fn with_overrides(overrides: &BTreeMap<String, Vec<String>>) -> HeronResult<Self> {
        let mut table = Self::new();
        for (from, to_list) in overrides {
            let from: ReplicationState = from.parse()?;
            let mut set = BTreeSet::new();
            for to in to_list {
                set.insert(to.parse::<ReplicationState>()?);
            }
            table.successors.insert(from, set);
        }
        Ok(table)
    }

    /// Is `to` a legal successor of `from`? Same-state is always legal
    /// (a repeated report is a no-op, not a violation).
    pub fn is_legal(&self, from: ReplicationState, to: ReplicationState) -> bool {
        if from == to {
            return true;
        }
        self.successors
            .get(&from)
            .map(|set| set.contains(&to))
            .unwrap_or(false)
    }

    pub fn successors(&self, from: ReplicationState) -> impl Iterator<Item = ReplicationState> + '_ {
        self.successors.get(&from).into_iter().flatten().copied()
    }
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Next goal once a node's report has caught up with its current goal.
/// Returns None for stable states where the orchestrator decides separately.
pub fn advance_goal(reached: ReplicationState) -> Option<ReplicationState> {
    use ReplicationState::*;
    match reached {
        Draining => Some(DemoteTimeout),
        DemoteTimeout => Some(Demoted),
        Demoted => Some(CatchingUp),
        CatchingUp => Some(Secondary),
        WaitStandby => Some(CatchingUp),
        PreparePromotion => Some(StopReplication),
        StopReplication => Some(WaitPrimary),
        WaitPrimary => Some(Primary),
        ReportLsn => Some(FastForward),
        FastForward => Some(PreparePromotion),
        PrepareMaintenance => Some(WaitMaintenance),
        WaitMaintenance => Some(Maintenance),
        JoinPrimary => Some(Primary),
        JoinSecondary => Some(Secondary),
        _ => None,
    }
}
