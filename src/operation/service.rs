use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::json;
use tracing::info;

use crate::repl::ReplicationCoordinator;
use crate::storage::kv::StorageEngine;
use crate::types::{InterruptReason, OpId, Result};

use super::context::OperationContext;
use super::fault::{FaultInjection, FaultInjector};

/// Process-wide state shared by every client and operation.
pub struct ServiceContext {
    storage: Arc<dyn StorageEngine>,
    repl: Arc<dyn ReplicationCoordinator>,
    fault: RwLock<Option<Arc<FaultInjector>>>,
    next_op: AtomicU64,
    next_conn: AtomicU64,
    kill_all: AtomicBool,
    ops: Mutex<FxHashMap<OpId, Arc<CurOp>>>,
}

impl ServiceContext {
    /// Service over `storage` with the given replication coordinator.
    pub fn new(
        storage: Arc<dyn StorageEngine>,
        repl: Arc<dyn ReplicationCoordinator>,
        fault: Option<FaultInjection>,
    ) -> Result<Arc<Self>> {
        let fault = fault.map(FaultInjector::new).transpose()?.map(Arc::new);
        Ok(Arc::new(Self {
            storage,
            repl,
            fault: RwLock::new(fault),
            next_op: AtomicU64::new(1),
            next_conn: AtomicU64::new(1),
            kill_all: AtomicBool::new(false),
            ops: Mutex::new(FxHashMap::default()),
        }))
    }

    /// Storage engine serving every operation.
    pub fn storage(&self) -> &Arc<dyn StorageEngine> {
        &self.storage
    }

    /// Replication coordinator.
    pub fn repl(&self) -> &Arc<dyn ReplicationCoordinator> {
        &self.repl
    }

    /// Replaces the fault-injection policy; `None` turns injection off.
    pub fn set_fault_injection(&self, policy: Option<FaultInjection>) -> Result<()> {
        let injector = policy.map(FaultInjector::new).transpose()?.map(Arc::new);
        if let Some(injector) = &injector {
            info!(
                conn_id = injector.policy().conn_id,
                probability = injector.policy().probability,
                include_nested = injector.policy().include_nested,
                "service.fault_injection_enabled"
            );
        }
        *self.fault.write() = injector;
        Ok(())
    }

    pub(crate) fn fault_injector(&self) -> Option<Arc<FaultInjector>> {
        self.fault.read().clone()
    }

    /// Registers a new connection.
    pub fn make_client(&self, desc: &str) -> Arc<Client> {
        Arc::new(Client {
            conn_id: self.next_conn.fetch_add(1, Ordering::Relaxed),
            desc: desc.to_string(),
            active: Mutex::new(Vec::new()),
        })
    }

    /// Starts an operation on `client` with a fresh recovery unit and locker.
    pub fn make_operation_context(self: &Arc<Self>, client: &Arc<Client>) -> OperationContext {
        let id = OpId(self.next_op.fetch_add(1, Ordering::Relaxed));
        let nested = {
            let mut active = client.active.lock();
            let nested = !active.is_empty();
            active.push(id);
            nested
        };
        let op = Arc::new(CurOp::new(id, client.conn_id, nested));
        self.ops.lock().insert(id, Arc::clone(&op));
        OperationContext::attached(
            Arc::clone(self),
            Arc::clone(client),
            op,
            self.storage.new_recovery_unit(),
            self.storage.new_locker(),
        )
    }

    pub(crate) fn unregister(&self, client: &Client, id: OpId) {
        self.ops.lock().remove(&id);
        client.active.lock().retain(|op| *op != id);
    }

    /// Marks operation `id` killed; it stops at its next checkpoint.
    pub fn kill_op(&self, id: OpId) -> bool {
        let Some(op) = self.ops.lock().get(&id).cloned() else {
            return false;
        };
        op.kill(InterruptReason::Killed);
        info!(op = %id, conn_id = op.conn_id(), "service.kill_op");
        true
    }

    /// Makes every checkpoint in every operation fail with a shutdown error.
    pub fn set_kill_all_operations(&self) {
        self.kill_all.store(true, Ordering::Release);
        info!(live_ops = self.ops.lock().len(), "service.kill_all_operations");
    }

    /// Lets new interrupt checks pass again after [`Self::set_kill_all_operations`].
    pub fn unset_kill_all_operations(&self) {
        self.kill_all.store(false, Ordering::Release);
    }

    /// Whether every operation is currently being killed.
    pub fn kill_all_operations(&self) -> bool {
        self.kill_all.load(Ordering::Acquire)
    }

    /// Live operations, oldest first.
    pub fn current_ops(&self) -> Vec<Arc<CurOp>> {
        let mut ops: Vec<_> = self.ops.lock().values().cloned().collect();
        ops.sort_by_key(|op| op.id());
        ops
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("storage", &self.storage.name())
            .field("live_ops", &self.ops.lock().len())
            .field("kill_all", &self.kill_all_operations())
            .finish()
    }
}

/// One connection.
pub struct Client {
    conn_id: u64,
    desc: String,
    active: Mutex<Vec<OpId>>,
}

impl Client {
    /// Connection id used for fault targeting.
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Free-form description used in logs.
    pub fn desc(&self) -> &str {
        &self.desc
    }

    /// Operations currently running on this connection, outermost first.
    pub fn active_ops(&self) -> Vec<OpId> {
        self.active.lock().clone()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("conn_id", &self.conn_id)
            .field("desc", &self.desc)
            .finish()
    }
}

const NOT_KILLED: u8 = 0;

/// Shared, thread-safe state of one running operation.
///
/// Other threads kill an operation through this handle; the operation itself
/// only observes the kill at its next checkpoint.
pub struct CurOp {
    id: OpId,
    conn_id: u64,
    nested: bool,
    started: Instant,
    deadline: Mutex<Option<Instant>>,
    killed: AtomicU8,
}

impl CurOp {
    pub(crate) fn new(id: OpId, conn_id: u64, nested: bool) -> Self {
        Self {
            id,
            conn_id,
            nested,
            started: Instant::now(),
            deadline: Mutex::new(None),
            killed: AtomicU8::new(NOT_KILLED),
        }
    }

    /// Operation id.
    pub fn id(&self) -> OpId {
        self.id
    }

    /// Connection the operation runs on.
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// True when started from inside another operation.
    pub fn is_nested(&self) -> bool {
        self.nested
    }

    /// Time since the operation was registered.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Instant after which interrupt checks report a timeout.
    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }

    pub(crate) fn set_deadline(&self, deadline: Option<Instant>) {
        *self.deadline.lock() = deadline;
    }

    pub(crate) fn deadline_expired(&self) -> bool {
        self.deadline().is_some_and(|at| Instant::now() >= at)
    }

    /// Marks the operation killed. The first reason sticks.
    pub fn kill(&self, reason: InterruptReason) {
        let _ = self.killed.compare_exchange(
            NOT_KILLED,
            reason.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Reason recorded by the first kill, if any.
    pub fn kill_reason(&self) -> Option<InterruptReason> {
        InterruptReason::from_u8(self.killed.load(Ordering::Acquire))
    }

    /// Diagnostic snapshot for `current_ops` style reporting.
    pub fn report(&self) -> serde_json::Value {
        json!({
            "opid": self.id.0,
            "conn_id": self.conn_id,
            "nested": self.nested,
            "micros_running": self.elapsed().as_micros() as u64,
            "kill_pending": self.kill_reason().map(|r| r.to_string()),
        })
    }
}

impl std::fmt::Debug for CurOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CurOp")
            .field("id", &self.id)
            .field("conn_id", &self.conn_id)
            .field("nested", &self.nested)
            .field("killed", &self.kill_reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::tests_support::harness;

    #[test]
    fn operations_on_a_busy_client_are_nested() {
        let h = harness();
        let service = h.service();
        let client = service.make_client("conn");
        let outer = service.make_operation_context(&client);
        let inner = service.make_operation_context(&client);
        assert!(!outer.op().is_nested());
        assert!(inner.op().is_nested());
        assert_eq!(client.active_ops(), vec![outer.id(), inner.id()]);
        drop(inner);
        drop(outer);
        assert!(client.active_ops().is_empty());
        assert!(service.current_ops().is_empty());
    }

    #[test]
    fn kill_op_targets_one_live_operation() {
        let h = harness();
        let service = h.service();
        let a = h.opctx();
        let b = h.opctx();
        assert!(service.kill_op(a.id()));
        assert_eq!(a.op().kill_reason(), Some(InterruptReason::Killed));
        assert_eq!(b.op().kill_reason(), None);
        let gone = b.id();
        drop(b);
        assert!(!service.kill_op(gone));
        assert_eq!(service.current_ops().len(), 1);
        assert_eq!(service.current_ops()[0].report()["opid"], a.id().0);
    }

    #[test]
    fn first_kill_reason_sticks() {
        let op = CurOp::new(OpId(9), 1, false);
        op.kill(InterruptReason::DeadlineExceeded);
        op.kill(InterruptReason::Killed);
        assert_eq!(op.kill_reason(), Some(InterruptReason::DeadlineExceeded));
    }

    #[test]
    fn invalid_fault_policy_is_rejected() {
        let h = harness();
        let bad = Some(FaultInjection::new(1, 2.0));
        assert!(h.service().set_fault_injection(bad).is_err());
        assert!(h.service().fault_injector().is_none());
    }
}
