//! Shared foundation for the Heron HA control plane: typed identifiers,
//! the error taxonomy, configuration structs, and the cooperative stop
//! signal used by background loops.

pub mod config;
pub mod error;
pub mod stop;
pub mod types;

pub use error::{ErrorKind, HeronError, HeronResult};
pub use stop::StopSignal;
pub use types::{unix_ms, GroupId, Lsn, NodeId, ReplicationMode, TimelineId};
