#![forbid(unsafe_code)]

//! Hierarchical intent locking: global → database → collection.
//!
//! A [`LockManager`] is shared process-wide and arbitrates grants between
//! lockers. Each operation owns one [`Locker`], which tracks what it holds,
//! enforces top-down acquisition and bottom-up release, and counts recursive
//! acquisitions. Waits are bounded and expire with [`DuskError::LockTimeout`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::invariant;
use crate::types::{invariant_failure, DuskError, Result};

/// Lock modes, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Intent to take shared locks below this resource.
    IntentShared,
    /// Intent to take exclusive locks below this resource.
    IntentExclusive,
    /// Shared access to the whole resource.
    Shared,
    /// Exclusive access to the whole resource.
    Exclusive,
}

impl LockMode {
    /// Standard multi-granularity compatibility matrix.
    pub fn is_compatible_with(self, other: LockMode) -> bool {
        use LockMode::*;
        matches!(
            (self, other),
            (IntentShared, IntentShared)
                | (IntentShared, IntentExclusive)
                | (IntentShared, Shared)
                | (IntentExclusive, IntentShared)
                | (IntentExclusive, IntentExclusive)
                | (Shared, IntentShared)
                | (Shared, Shared)
        )
    }

    /// Returns `true` when holding `self` grants everything `other` would.
    pub fn covers(self, other: LockMode) -> bool {
        use LockMode::*;
        match self {
            Exclusive => true,
            Shared => matches!(other, Shared | IntentShared),
            IntentExclusive => matches!(other, IntentExclusive | IntentShared),
            IntentShared => other == IntentShared,
        }
    }

    /// Weakest mode covering both `self` and `other`.
    pub fn join(self, other: LockMode) -> LockMode {
        if self.covers(other) {
            self
        } else if other.covers(self) {
            other
        } else {
            // Shared + IntentExclusive.
            LockMode::Exclusive
        }
    }

    /// Mode a parent must be held in before locking a child in `self`.
    pub fn intent(self) -> LockMode {
        match self {
            LockMode::IntentShared | LockMode::Shared => LockMode::IntentShared,
            LockMode::IntentExclusive | LockMode::Exclusive => LockMode::IntentExclusive,
        }
    }

    /// Short name used in logs and state reports.
    pub fn as_str(self) -> &'static str {
        match self {
            LockMode::IntentShared => "IS",
            LockMode::IntentExclusive => "IX",
            LockMode::Shared => "S",
            LockMode::Exclusive => "X",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lockable node in the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceId {
    /// The whole instance.
    Global,
    /// One database by name.
    Database(String),
    /// One collection by full namespace (`db.collection`).
    Collection(String),
}

impl ResourceId {
    /// Database resource for a full namespace.
    pub fn database_of(ns: &str) -> ResourceId {
        let db = ns.split_once('.').map_or(ns, |(db, _)| db);
        ResourceId::Database(db.to_string())
    }

    /// Resource that must be intent-locked before this one.
    pub fn parent(&self) -> Option<ResourceId> {
        match self {
            ResourceId::Global => None,
            ResourceId::Database(_) => Some(ResourceId::Global),
            ResourceId::Collection(ns) => Some(ResourceId::database_of(ns)),
        }
    }

    fn is_ancestor_of(&self, other: &ResourceId) -> bool {
        let mut cursor = other.parent();
        while let Some(parent) = cursor {
            if &parent == self {
                return true;
            }
            cursor = parent.parent();
        }
        false
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Global => f.write_str("global"),
            ResourceId::Database(db) => write!(f, "database({db})"),
            ResourceId::Collection(ns) => write!(f, "collection({ns})"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Grant {
    locker: u64,
    mode: LockMode,
}

/// Arbiter of lock grants across all lockers.
#[derive(Default)]
pub struct LockManager {
    grants: Mutex<HashMap<ResourceId, SmallVec<[Grant; 4]>>>,
    released: Condvar,
    next_locker: AtomicU64,
}

impl LockManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self) -> u64 {
        self.next_locker.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Grants `mode` on `resource` to `locker`, replacing any mode it already
    /// holds there. Waits until `deadline` for conflicting holders to leave.
    fn acquire(
        &self,
        locker: u64,
        resource: &ResourceId,
        mode: LockMode,
        deadline: Instant,
    ) -> Result<()> {
        let mut grants = self.grants.lock();
        loop {
            let holders = grants.entry(resource.clone()).or_default();
            let conflict = holders
                .iter()
                .any(|g| g.locker != locker && !g.mode.is_compatible_with(mode));
            if !conflict {
                match holders.iter_mut().find(|g| g.locker == locker) {
                    Some(own) => own.mode = mode,
                    None => holders.push(Grant { locker, mode }),
                }
                return Ok(());
            }
            if self.released.wait_until(&mut grants, deadline).timed_out() {
                let still_blocked = grants.get(resource).is_some_and(|holders| {
                    holders
                        .iter()
                        .any(|g| g.locker != locker && !g.mode.is_compatible_with(mode))
                });
                if still_blocked {
                    debug!(locker, resource = %resource, mode = %mode, "lock.acquire.timeout");
                    return Err(DuskError::LockTimeout(format!(
                        "{resource} in mode {mode}"
                    )));
                }
            }
        }
    }

    fn release(&self, locker: u64, resource: &ResourceId) {
        let mut grants = self.grants.lock();
        if let Some(holders) = grants.get_mut(resource) {
            holders.retain(|g| g.locker != locker);
            if holders.is_empty() {
                grants.remove(resource);
            }
        }
        drop(grants);
        self.released.notify_all();
    }

    /// Current holders of `resource`, for diagnostics.
    pub fn holders(&self, resource: &ResourceId) -> Vec<(u64, LockMode)> {
        self.grants
            .lock()
            .get(resource)
            .map(|holders| holders.iter().map(|g| (g.locker, g.mode)).collect())
            .unwrap_or_default()
    }
}

/// Per-operation lock acquisition strategy.
pub trait Locker: Send + Sync {
    /// Identifier of this locker within its manager.
    fn id(&self) -> u64;

    /// Acquires `resource` in `mode`, waiting at most `timeout`.
    ///
    /// The parent resource must already be held in the matching intent mode.
    fn lock(&self, resource: &ResourceId, mode: LockMode, timeout: Duration) -> Result<()>;

    /// Releases one acquisition of `resource`.
    fn unlock(&self, resource: &ResourceId);

    /// Mode currently held on `resource`, if any.
    fn mode_held(&self, resource: &ResourceId) -> Option<LockMode>;

    /// Everything currently held, in acquisition order.
    fn held(&self) -> Vec<(ResourceId, LockMode)>;

    /// Returns `true` if anything is held.
    fn is_locked(&self) -> bool {
        !self.held().is_empty()
    }

    /// Returns `true` if the global lock is held in a write-capable mode.
    fn is_write_locked(&self) -> bool {
        self.mode_held(&ResourceId::Global)
            .is_some_and(|m| m.covers(LockMode::IntentExclusive))
    }

    /// Returns `true` if `db` is held in `mode` or stronger.
    fn is_db_locked_for_mode(&self, db: &str, mode: LockMode) -> bool {
        self.mode_held(&ResourceId::Database(db.to_string()))
            .is_some_and(|m| m.covers(mode))
    }

    /// Returns `true` if `ns` (or its database, under database-level locking)
    /// is held in `mode` or stronger.
    fn is_collection_locked_for_mode(&self, ns: &str, mode: LockMode) -> bool {
        self.mode_held(&ResourceId::Collection(ns.to_string()))
            .is_some_and(|m| m.covers(mode))
    }
}

#[derive(Debug)]
struct Held {
    resource: ResourceId,
    mode: LockMode,
    count: u32,
}

/// Default [`Locker`] over a shared [`LockManager`].
pub struct LockerImpl {
    id: u64,
    manager: Arc<LockManager>,
    db_level: bool,
    held: Mutex<Vec<Held>>,
}

impl LockerImpl {
    /// Locker with collection-level granularity.
    pub fn new(manager: Arc<LockManager>) -> Self {
        Self {
            id: manager.register(),
            manager,
            db_level: false,
            held: Mutex::new(Vec::new()),
        }
    }

    /// Locker for engines without document-level concurrency: collection
    /// requests lock the whole database, intents promoted to full modes.
    pub fn db_level(manager: Arc<LockManager>) -> Self {
        let mut locker = Self::new(manager);
        locker.db_level = true;
        locker
    }

    fn effective(&self, resource: &ResourceId, mode: LockMode) -> (ResourceId, LockMode) {
        match resource {
            ResourceId::Collection(ns) if self.db_level => {
                let promoted = match mode {
                    LockMode::IntentShared => LockMode::Shared,
                    LockMode::IntentExclusive => LockMode::Exclusive,
                    other => other,
                };
                (ResourceId::database_of(ns), promoted)
            }
            _ => (resource.clone(), mode),
        }
    }
}

impl Locker for LockerImpl {
    fn id(&self) -> u64 {
        self.id
    }

    fn lock(&self, resource: &ResourceId, mode: LockMode, timeout: Duration) -> Result<()> {
        let (resource, mode) = self.effective(resource, mode);
        let mut held = self.held.lock();
        if let Some(parent) = resource.parent() {
            let parent_mode = held
                .iter()
                .find(|h| h.resource == parent)
                .map(|h| h.mode);
            invariant!(
                parent_mode.is_some_and(|m| m.covers(mode.intent())),
                "locking {resource} in {mode} requires {parent} in {} (held {:?})",
                mode.intent(),
                parent_mode
            );
        }
        let deadline = Instant::now() + timeout;
        match held.iter_mut().find(|h| h.resource == resource) {
            Some(entry) if entry.mode.covers(mode) => {
                entry.count += 1;
            }
            Some(entry) => {
                let converted = entry.mode.join(mode);
                self.manager
                    .acquire(self.id, &resource, converted, deadline)?;
                trace!(locker = self.id, resource = %resource, from = %entry.mode, to = %converted, "lock.convert");
                entry.mode = converted;
                entry.count += 1;
            }
            None => {
                self.manager.acquire(self.id, &resource, mode, deadline)?;
                trace!(locker = self.id, resource = %resource, mode = %mode, "lock.acquire");
                held.push(Held {
                    resource,
                    mode,
                    count: 1,
                });
            }
        }
        Ok(())
    }

    fn unlock(&self, resource: &ResourceId) {
        let (resource, _) = self.effective(resource, LockMode::IntentShared);
        let mut held = self.held.lock();
        let Some(pos) = held.iter().position(|h| h.resource == resource) else {
            invariant_failure(
                "held",
                format_args!("unlocking {resource} which is not held"),
            );
        };
        if held[pos].count > 1 {
            held[pos].count -= 1;
            return;
        }
        let child = held
            .iter()
            .find(|h| resource.is_ancestor_of(&h.resource))
            .map(|h| h.resource.clone());
        invariant!(
            child.is_none(),
            "releasing {resource} while {:?} is still held",
            child
        );
        held.remove(pos);
        drop(held);
        self.manager.release(self.id, &resource);
        trace!(locker = self.id, resource = %resource, "lock.release");
    }

    fn mode_held(&self, resource: &ResourceId) -> Option<LockMode> {
        let (resource, _) = self.effective(resource, LockMode::IntentShared);
        self.held
            .lock()
            .iter()
            .find(|h| h.resource == resource)
            .map(|h| h.mode)
    }

    fn held(&self) -> Vec<(ResourceId, LockMode)> {
        self.held
            .lock()
            .iter()
            .map(|h| (h.resource.clone(), h.mode))
            .collect()
    }
}

impl Drop for LockerImpl {
    fn drop(&mut self) {
        let held = std::mem::take(self.held.get_mut());
        if !held.is_empty() {
            warn!(locker = self.id, count = held.len(), "lock.locker_dropped_holding_locks");
        }
        for entry in held.iter().rev() {
            self.manager.release(self.id, &entry.resource);
        }
    }
}

impl fmt::Debug for LockerImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockerImpl")
            .field("id", &self.id)
            .field("db_level", &self.db_level)
            .field("held", &*self.held.lock())
            .finish()
    }
}

/// Guard for a held global lock.
pub struct GlobalLock {
    locker: Arc<dyn Locker>,
}

impl GlobalLock {
    /// Acquires the global lock in `mode`.
    pub fn acquire(locker: &Arc<dyn Locker>, mode: LockMode, timeout: Duration) -> Result<Self> {
        locker.lock(&ResourceId::Global, mode, timeout)?;
        Ok(Self {
            locker: Arc::clone(locker),
        })
    }
}

impl Drop for GlobalLock {
    fn drop(&mut self) {
        self.locker.unlock(&ResourceId::Global);
    }
}

/// Guard for a database lock together with the global intent lock above it.
pub struct DbLock {
    resource: ResourceId,
    locker: Arc<dyn Locker>,
    _global: GlobalLock,
}

impl DbLock {
    /// Takes the global lock in the intent of `mode`, then `db` in `mode`.
    pub fn acquire(
        locker: &Arc<dyn Locker>,
        db: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<Self> {
        let global = GlobalLock::acquire(locker, mode.intent(), timeout)?;
        let resource = ResourceId::Database(db.to_string());
        locker.lock(&resource, mode, timeout)?;
        Ok(Self {
            resource,
            locker: Arc::clone(locker),
            _global: global,
        })
    }
}

impl Drop for DbLock {
    fn drop(&mut self) {
        self.locker.unlock(&self.resource);
    }
}

/// Guard for a collection lock. The caller must hold its database lock.
pub struct CollectionLock {
    resource: ResourceId,
    locker: Arc<dyn Locker>,
}

impl CollectionLock {
    /// Locks the collection `ns` in `mode`.
    pub fn acquire(
        locker: &Arc<dyn Locker>,
        ns: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<Self> {
        let resource = ResourceId::Collection(ns.to_string());
        locker.lock(&resource, mode, timeout)?;
        Ok(Self {
            resource,
            locker: Arc::clone(locker),
        })
    }
}

impl Drop for CollectionLock {
    fn drop(&mut self) {
        self.locker.unlock(&self.resource);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(50);
    const LONG: Duration = Duration::from_secs(5);

    fn locker(manager: &Arc<LockManager>) -> Arc<dyn Locker> {
        Arc::new(LockerImpl::new(Arc::clone(manager)))
    }

    #[test]
    fn compatibility_matrix_is_symmetric() {
        use LockMode::*;
        let modes = [IntentShared, IntentExclusive, Shared, Exclusive];
        for a in modes {
            for b in modes {
                assert_eq!(a.is_compatible_with(b), b.is_compatible_with(a));
            }
        }
        assert!(!Exclusive.is_compatible_with(IntentShared));
        assert!(!Shared.is_compatible_with(IntentExclusive));
        assert_eq!(Shared.join(IntentExclusive), Exclusive);
        assert_eq!(IntentShared.join(Shared), Shared);
    }

    #[test]
    fn conflicting_request_times_out() {
        let manager = Arc::new(LockManager::new());
        let a = locker(&manager);
        let b = locker(&manager);
        let _writer = DbLock::acquire(&a, "app", LockMode::Exclusive, LONG).unwrap();
        let err = DbLock::acquire(&b, "app", LockMode::Shared, SHORT)
            .err()
            .unwrap();
        assert!(matches!(err, DuskError::LockTimeout(_)));
        assert!(err.is_retryable());
        // The failed attempt must not leave its global intent behind.
        assert!(!b.is_locked());
        let _other_db = DbLock::acquire(&b, "other", LockMode::Exclusive, SHORT).unwrap();
    }

    #[test]
    fn waiter_is_granted_after_release() {
        let manager = Arc::new(LockManager::new());
        let a = locker(&manager);
        let b = locker(&manager);
        let guard = DbLock::acquire(&a, "app", LockMode::Exclusive, LONG).unwrap();
        let handle = thread::spawn(move || {
            let lock = DbLock::acquire(&b, "app", LockMode::Shared, LONG);
            lock.is_ok()
        });
        thread::sleep(Duration::from_millis(20));
        drop(guard);
        assert!(handle.join().unwrap());
    }

    #[test]
    fn recursive_locks_are_counted_and_converted() {
        let manager = Arc::new(LockManager::new());
        let a = locker(&manager);
        let db = ResourceId::Database("app".into());
        let _g = GlobalLock::acquire(&a, LockMode::IntentExclusive, LONG).unwrap();
        a.lock(&db, LockMode::IntentShared, LONG).unwrap();
        a.lock(&db, LockMode::Shared, LONG).unwrap();
        assert_eq!(a.mode_held(&db), Some(LockMode::Shared));
        a.lock(&db, LockMode::IntentExclusive, LONG).unwrap();
        assert_eq!(a.mode_held(&db), Some(LockMode::Exclusive));
        a.unlock(&db);
        a.unlock(&db);
        assert!(a.is_db_locked_for_mode("app", LockMode::Exclusive));
        a.unlock(&db);
        assert_eq!(a.mode_held(&db), None);
        assert!(manager.holders(&db).is_empty());
    }

    #[test]
    #[should_panic(expected = "invariant failure")]
    fn skipping_the_parent_intent_is_fatal() {
        let manager = Arc::new(LockManager::new());
        let a = locker(&manager);
        let _ = a.lock(
            &ResourceId::Collection("app.users".into()),
            LockMode::IntentExclusive,
            SHORT,
        );
    }

    #[test]
    #[should_panic(expected = "invariant failure")]
    fn releasing_parent_before_child_is_fatal() {
        let manager = Arc::new(LockManager::new());
        let a = locker(&manager);
        let _db = DbLock::acquire(&a, "app", LockMode::IntentExclusive, LONG).unwrap();
        let _coll = CollectionLock::acquire(&a, "app.users", LockMode::IntentExclusive, LONG)
            .unwrap();
        a.unlock(&ResourceId::Database("app".into()));
    }

    #[test]
    fn guards_release_in_reverse_order() {
        let manager = Arc::new(LockManager::new());
        let a = locker(&manager);
        {
            let _db = DbLock::acquire(&a, "app", LockMode::IntentExclusive, LONG).unwrap();
            let _coll =
                CollectionLock::acquire(&a, "app.users", LockMode::Exclusive, LONG).unwrap();
            assert!(a.is_collection_locked_for_mode("app.users", LockMode::Exclusive));
            assert!(a.is_write_locked());
        }
        assert!(!a.is_locked());
    }

    #[test]
    fn db_level_locker_escalates_collection_requests() {
        let manager = Arc::new(LockManager::new());
        let a: Arc<dyn Locker> = Arc::new(LockerImpl::db_level(Arc::clone(&manager)));
        let b = locker(&manager);
        let _db = DbLock::acquire(&a, "app", LockMode::IntentExclusive, LONG).unwrap();
        let coll = CollectionLock::acquire(&a, "app.users", LockMode::IntentExclusive, LONG)
            .unwrap();
        assert_eq!(
            a.mode_held(&ResourceId::Database("app".into())),
            Some(LockMode::Exclusive)
        );
        assert!(matches!(
            DbLock::acquire(&b, "app", LockMode::IntentShared, SHORT),
            Err(DuskError::LockTimeout(_))
        ));
        drop(coll);
    }

    #[test]
    fn db_level_locker_escalates_a_first_collection_intent() {
        let manager = Arc::new(LockManager::new());
        let a: Arc<dyn Locker> = Arc::new(LockerImpl::db_level(Arc::clone(&manager)));
        let _global = GlobalLock::acquire(&a, LockMode::IntentExclusive, LONG).unwrap();
        let coll = CollectionLock::acquire(&a, "app.users", LockMode::IntentExclusive, LONG)
            .unwrap();
        assert_eq!(
            a.mode_held(&ResourceId::Database("app".into())),
            Some(LockMode::Exclusive)
        );
        assert!(a
            .held()
            .iter()
            .all(|(resource, _)| !matches!(resource, ResourceId::Collection(_))));
        drop(coll);
        assert_eq!(a.held(), vec![(ResourceId::Global, LockMode::IntentExclusive)]);
    }
}
