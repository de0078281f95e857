//! Append-only cluster event log.
//!
//! Every accepted (or explicitly rejected) state transition produces one
//! immutable event. Events go to a JSONL journal on disk and to a bounded
//! in-memory ring that serves the query API. The journal is the durable
//! record; the ring only caps what queries can see.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use heron_common::{unix_ms, GroupId, HeronError, HeronResult, Lsn, NodeId};

use crate::state::ReplicationState;

pub const EVENT_JOURNAL_FILE: &str = "events.jsonl";

/// One immutable record of a state transition. Never mutated after append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: u64,
    pub timestamp_ms: u64,
    pub node_id: NodeId,
    pub group_id: GroupId,
    pub node_name: String,
    pub reported_state: ReplicationState,
    pub goal_state: ReplicationState,
    pub reported_lsn: Lsn,
    pub description: String,
}

#[derive(Debug)]
struct EventLogInner {
    ring: VecDeque<EventRecord>,
    next_id: u64,
    journal: Option<File>,
}

/// Append-only event log with a bounded query window.
#[derive(Debug)]
pub struct EventLog {
    inner: Mutex<EventLogInner>,
    max_events: usize,
    journal_path: Option<PathBuf>,
}

impl EventLog {
    /// In-memory only log. Used by tests and by deployments without a
    /// data directory.
    pub fn in_memory(max_events: usize) -> Self {
        Self {
            inner: Mutex::new(EventLogInner {
                ring: VecDeque::new(),
                next_id: 1,
                journal: None,
            }),
            max_events,
            journal_path: None,
        }
    }

    /// Open (or create) the journal under `data_dir`. Existing records are
    /// replayed so `event_id` stays monotonic across restarts and the query
    /// window is warm.
    pub fn open(data_dir: &Path, max_events: usize) -> HeronResult<Self> {
        let path = data_dir.join(EVENT_JOURNAL_FILE);
        let mut ring = VecDeque::new();
        let mut next_id = 1u64;
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: EventRecord = serde_json::from_str(&line)
                    .map_err(|e| HeronError::Storage(format!("corrupt event journal: {}", e)))?;
                next_id = next_id.max(record.event_id + 1);
                ring.push_back(record);
                if ring.len() > max_events {
                    ring.pop_front();
                }
            }
        }
        let journal = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            inner: Mutex::new(EventLogInner {
                ring,
                next_id,
                journal: Some(journal),
            }),
            max_events,
            journal_path: Some(path),
        })
    }

    /// Append one event. The journal write happens before the record is
    /// visible to readers of the ring.
    pub fn append(
        &self,
        node_id: NodeId,
        group_id: GroupId,
        node_name: &str,
        reported_state: ReplicationState,
        goal_state: ReplicationState,
        reported_lsn: Lsn,
        description: &str,
    ) -> HeronResult<u64> {
        let mut inner = self.inner.lock();
        let record = EventRecord {
            event_id: inner.next_id,
            timestamp_ms: unix_ms(),
            node_id,
            group_id,
            node_name: node_name.to_string(),
            reported_state,
            goal_state,
            reported_lsn,
            description: description.to_string(),
        };
        if let Some(journal) = inner.journal.as_mut() {
            let line = serde_json::to_string(&record)
                .map_err(|e| HeronError::Storage(format!("serialize event: {}", e)))?;
            writeln!(journal, "{}", line)?;
            journal.flush()?;
        }
        tracing::info!(
            event_id = record.event_id,
            node_id = %record.node_id,
            group_id = %record.group_id,
            reported = %record.reported_state,
            goal = %record.goal_state,
            lsn = %record.reported_lsn,
            "{}",
            record.description
        );
        inner.next_id += 1;
        inner.ring.push_back(record.clone());
        if inner.ring.len() > self.max_events {
            inner.ring.pop_front();
        }
        Ok(record.event_id)
    }

    /// The most recent `limit` events, oldest-event-id-first.
    pub fn recent(&self, limit: usize) -> Vec<EventRecord> {
        let inner = self.inner.lock();
        let skip = inner.ring.len().saturating_sub(limit);
        inner.ring.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal_path.as_deref()
    }
}
