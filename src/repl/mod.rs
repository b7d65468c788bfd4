//! What the storage layer needs from replication, and what replication needs
//! from storage.
//!
//! [`ReplicationCoordinator`] answers whether this node accepts writes.
//! [`ExternalState`] persists the node identity, the replica set config
//! document, and reads the newest oplog position.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::info;

mod external_state;

pub use external_state::{
    ExternalState, StorageExternalState, CONFIG_NS, LOCAL_DB, ME_NS, OPLOG_NS, TS_FIELD,
};

/// Position in the oplog: seconds since the epoch plus an ordinal within the
/// second.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpTime {
    /// Seconds component.
    pub secs: u32,
    /// Ordinal within the second.
    pub inc: u32,
}

impl OpTime {
    /// Optime at `secs` with ordinal `inc`.
    pub fn new(secs: u32, inc: u32) -> Self {
        Self { secs, inc }
    }

    /// True for the zero optime, which precedes every real write.
    pub fn is_null(&self) -> bool {
        self.secs == 0 && self.inc == 0
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.secs, self.inc)
    }
}

/// Replication state consulted by operations.
pub trait ReplicationCoordinator: Send + Sync {
    /// Whether writes to database `db` are accepted right now.
    fn can_accept_writes_for_database(&self, db: &str) -> bool;
}

/// A node that is not part of a replica set accepts every write.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandaloneCoordinator;

impl ReplicationCoordinator for StandaloneCoordinator {
    fn can_accept_writes_for_database(&self, _db: &str) -> bool {
        true
    }
}

/// Replica set member. Writes are accepted while primary; the unreplicated
/// `local` database always accepts them.
#[derive(Debug, Default)]
pub struct ReplSetCoordinator {
    primary: AtomicBool,
}

impl ReplSetCoordinator {
    /// Coordinator that starts as primary or secondary.
    pub fn new(primary: bool) -> Self {
        Self {
            primary: AtomicBool::new(primary),
        }
    }

    /// Flips the node between primary and secondary.
    pub fn set_primary(&self, primary: bool) {
        let was = self.primary.swap(primary, Ordering::AcqRel);
        if was != primary {
            info!(primary, "repl.member_state_changed");
        }
    }

    /// Whether this node currently accepts writes.
    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::Acquire)
    }
}

impl ReplicationCoordinator for ReplSetCoordinator {
    fn can_accept_writes_for_database(&self, db: &str) -> bool {
        db == LOCAL_DB || self.is_primary()
    }
}
