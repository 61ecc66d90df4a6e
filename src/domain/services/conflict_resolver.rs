//! Conflict Resolution
//!
//! Last-writer-wins by timestamp with local winning ties. The rule is a pure
//! function of the two timestamps: it is deterministic but, unlike a hybrid
//! logical clock, it trusts device wall clocks.

use crate::domain::entities::Winner;

/// Outcome of comparing an incoming event with the local record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub winner: Winner,
    /// Whether the timestamps disagreed with a record already present
    pub conflict: bool,
}

impl Resolution {
    pub fn remote_wins(&self) -> bool {
        self.winner == Winner::Remote
    }
}

/// Remote wins iff `remote_ts > local_ts`; local wins otherwise.
pub fn resolve(local_ts: u64, remote_ts: u64) -> Winner {
    if remote_ts > local_ts {
        Winner::Remote
    } else {
        Winner::Local
    }
}

/// Resolve an incoming event against an optional local record timestamp.
///
/// With no local record the remote side always applies and nothing conflicts.
pub fn resolve_against(local_ts: Option<u64>, remote_ts: u64) -> Resolution {
    match local_ts {
        None => Resolution {
            winner: Winner::Remote,
            conflict: false,
        },
        Some(local_ts) => Resolution {
            winner: resolve(local_ts, remote_ts),
            conflict: local_ts != remote_ts,
        },
    }
}
