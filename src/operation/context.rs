use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::concurrency::Locker;
use crate::storage::kv::database_of;
use crate::storage::recovery_unit::RecoveryUnit;
use crate::types::{invariant_failure, DuskError, InterruptReason, OpId, Result};

use super::service::{Client, CurOp, ServiceContext};

/// Everything one operation carries: its recovery unit, its locker, and its
/// interruption state.
///
/// Not shared across threads. Other threads reach the operation through its
/// [`CurOp`] handle.
pub struct OperationContext {
    service: Option<Arc<ServiceContext>>,
    client: Option<Arc<Client>>,
    op: Arc<CurOp>,
    recovery_unit: Option<Box<dyn RecoveryUnit>>,
    locker: Arc<dyn Locker>,
}

impl OperationContext {
    pub(crate) fn attached(
        service: Arc<ServiceContext>,
        client: Arc<Client>,
        op: Arc<CurOp>,
        mut recovery_unit: Box<dyn RecoveryUnit>,
        locker: Arc<dyn Locker>,
    ) -> Self {
        recovery_unit.being_set_on_operation_context();
        debug!(op = %op.id(), conn_id = op.conn_id(), nested = op.is_nested(), "operation.start");
        Self {
            service: Some(service),
            client: Some(client),
            op,
            recovery_unit: Some(recovery_unit),
            locker,
        }
    }

    /// An operation outside any service, used by storage start-up and tools.
    ///
    /// It has no client, is never targeted by fault injection or kill-all,
    /// and does not run background tasks when dropped.
    pub fn detached(mut recovery_unit: Box<dyn RecoveryUnit>, locker: Arc<dyn Locker>) -> Self {
        recovery_unit.being_set_on_operation_context();
        Self {
            service: None,
            client: None,
            op: Arc::new(CurOp::new(OpId(0), 0, false)),
            recovery_unit: Some(recovery_unit),
            locker,
        }
    }

    /// Identifier assigned at registration.
    pub fn id(&self) -> OpId {
        self.op.id()
    }

    /// The registered current-op record.
    pub fn op(&self) -> &Arc<CurOp> {
        &self.op
    }

    /// Owning client, absent for internal operations.
    pub fn client(&self) -> Option<&Arc<Client>> {
        self.client.as_ref()
    }

    /// Service the operation is registered with.
    pub fn service(&self) -> Option<&Arc<ServiceContext>> {
        self.service.as_ref()
    }

    /// Locker owned by this operation.
    pub fn locker(&self) -> &Arc<dyn Locker> {
        &self.locker
    }

    /// Recovery unit of the operation.
    pub fn recovery_unit(&self) -> &dyn RecoveryUnit {
        match self.recovery_unit.as_deref() {
            Some(ru) => ru,
            None => invariant_failure(
                "recovery_unit.is_some()",
                format_args!("operation {} has no recovery unit", self.op.id()),
            ),
        }
    }

    /// Mutable access to the recovery unit.
    pub fn recovery_unit_mut(&mut self) -> &mut dyn RecoveryUnit {
        let id = self.op.id();
        match self.recovery_unit.as_deref_mut() {
            Some(ru) => ru,
            None => invariant_failure(
                "recovery_unit.is_some()",
                format_args!("operation {id} has no recovery unit"),
            ),
        }
    }

    /// Detaches the recovery unit so it can outlive this operation's use of
    /// it, e.g. while a cursor yields.
    pub fn release_recovery_unit(&mut self) -> Box<dyn RecoveryUnit> {
        let mut ru = match self.recovery_unit.take() {
            Some(ru) => ru,
            None => invariant_failure(
                "recovery_unit.is_some()",
                format_args!("operation {} released its recovery unit twice", self.op.id()),
            ),
        };
        ru.being_released_from_operation_context();
        ru
    }

    /// Installs `ru`, returning the unit it replaces.
    pub fn set_recovery_unit(&mut self, mut ru: Box<dyn RecoveryUnit>) -> Option<Box<dyn RecoveryUnit>> {
        ru.being_set_on_operation_context();
        let previous = self.recovery_unit.replace(ru);
        previous.map(|mut old| {
            old.being_released_from_operation_context();
            old
        })
    }

    /// Opens a unit of work on the recovery unit.
    pub fn begin_unit_of_work(&mut self) -> Result<()> {
        self.recovery_unit_mut().begin_unit_of_work()
    }

    /// Commits the innermost unit of work.
    pub fn commit_unit_of_work(&mut self) -> Result<()> {
        self.recovery_unit_mut().commit_unit_of_work()
    }

    /// Leaves the innermost unit of work, rolling it back if it was not committed.
    pub fn end_unit_of_work(&mut self) {
        self.recovery_unit_mut().end_unit_of_work()
    }

    /// Runs `f` inside one unit of work, committing only if it succeeds.
    ///
    /// The unit of work ends on every path, so an error rolls it back (unless
    /// an outer unit of work is still open).
    pub fn write_unit_of_work<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.begin_unit_of_work()?;
        let result = match f(self) {
            Ok(value) => self.commit_unit_of_work().map(|()| value),
            Err(err) => Err(err),
        };
        self.end_unit_of_work();
        result
    }

    /// Sets an absolute deadline; `None` removes it.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.op.set_deadline(deadline);
    }

    /// Sets a deadline `limit` from now.
    pub fn set_max_time(&self, limit: Duration) {
        self.op.set_deadline(Some(Instant::now() + limit));
    }

    /// Marks the operation killed; the next interrupt check reports `reason`.
    pub fn kill(&self, reason: InterruptReason) {
        self.op.kill(reason);
    }

    /// Whether a kill was requested, without checking deadlines.
    pub fn is_killed(&self) -> bool {
        self.op.kill_reason().is_some()
    }

    /// Interruption checkpoint.
    ///
    /// Checked in order: shutdown, deadline, fault injection, kill. A passed
    /// deadline or an injected fault also marks the operation killed, so
    /// later checkpoints keep failing.
    pub fn check_for_interrupt(&self) -> Result<()> {
        if let Some(service) = &self.service {
            if service.kill_all_operations() {
                return Err(DuskError::Interrupted(InterruptReason::Shutdown));
            }
        }

        if self.op.deadline_expired() {
            self.op.kill(InterruptReason::DeadlineExceeded);
            debug!(op = %self.op.id(), elapsed_ms = self.op.elapsed().as_millis() as u64, "operation.deadline_exceeded");
            return Err(DuskError::Interrupted(InterruptReason::DeadlineExceeded));
        }

        if let Some(injector) = self.service.as_ref().and_then(|s| s.fault_injector()) {
            if injector.should_fail(self.op.conn_id(), self.op.is_nested()) {
                info!(op = %self.op.id(), conn_id = self.op.conn_id(), "operation.fault_injected_kill");
                self.op.kill(InterruptReason::FaultInjected);
            }
        }

        match self.op.kill_reason() {
            Some(reason) => Err(DuskError::Interrupted(reason)),
            None => Ok(()),
        }
    }

    /// Whether writes to `ns` are accepted on this node. Detached operations
    /// behave as on a standalone node.
    pub fn is_primary_for(&self, ns: &str) -> bool {
        match &self.service {
            Some(service) => service.repl().can_accept_writes_for_database(database_of(ns)),
            None => true,
        }
    }
}

impl Drop for OperationContext {
    fn drop(&mut self) {
        if let (Some(service), Some(client)) = (&self.service, &self.client) {
            service.unregister(client, self.op.id());
        }
        drop(self.recovery_unit.take());
        if let Some(service) = self.service.take() {
            if let Err(err) = service.storage().run_background_tasks() {
                warn!(error = %err, op = %self.op.id(), "operation.background_tasks_failed");
            }
        }
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("op", &self.op)
            .field("attached", &self.service.is_some())
            .field("has_recovery_unit", &self.recovery_unit.is_some())
            .finish()
    }
}
