#![allow(missing_docs)]

use std::sync::{mpsc, Arc, Once};
use std::thread;
use std::time::Duration;

use dusk::operation::{FaultInjection, ServiceContext};
use dusk::repl::StandaloneCoordinator;
use dusk::storage::{KvStorageEngine, StorageEngine, StorageOptions};
use dusk::types::{DuskError, InterruptReason, Result};
use tempfile::{tempdir, TempDir};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("dusk::operation=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn service(fault: Option<FaultInjection>) -> Result<(TempDir, Arc<ServiceContext>)> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let mut options = StorageOptions::new(dir.path());
    options.cache_size_gb = Some(1);
    let storage = Arc::new(KvStorageEngine::open(&options)?);
    let service = ServiceContext::new(
        storage as Arc<dyn StorageEngine>,
        Arc::new(StandaloneCoordinator),
        fault,
    )?;
    Ok((dir, service))
}

fn reason(result: Result<()>) -> Option<InterruptReason> {
    match result {
        Err(DuskError::Interrupted(reason)) => Some(reason),
        _ => None,
    }
}

#[test]
fn kill_from_another_thread_stops_a_polling_operation() -> Result<()> {
    let (_dir, service) = service(None)?;
    let (started_tx, started_rx) = mpsc::channel();
    let worker = {
        let service = Arc::clone(&service);
        thread::spawn(move || -> Result<u64> {
            let client = service.make_client("worker");
            let opctx = service.make_operation_context(&client);
            started_tx.send(opctx.id()).expect("send op id");
            let mut checkpoints = 0u64;
            loop {
                match opctx.check_for_interrupt() {
                    Ok(()) => checkpoints += 1,
                    Err(err) => {
                        assert!(err.is_interruption());
                        assert_eq!(err.code(), 11601);
                        return Ok(checkpoints);
                    }
                }
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let id = started_rx.recv().expect("op id");
    thread::sleep(Duration::from_millis(20));
    assert!(service.current_ops().iter().any(|op| op.id() == id));
    assert!(service.kill_op(id));
    let checkpoints = worker.join().expect("worker thread")?;
    assert!(checkpoints > 0);
    assert!(service.current_ops().is_empty());
    Ok(())
}

#[test]
fn shutdown_interrupts_every_operation() -> Result<()> {
    let (_dir, service) = service(None)?;
    let a = service.make_client("a");
    let b = service.make_client("b");
    let op_a = service.make_operation_context(&a);
    let op_b = service.make_operation_context(&b);
    service.set_kill_all_operations();
    assert_eq!(reason(op_a.check_for_interrupt()), Some(InterruptReason::Shutdown));
    assert_eq!(reason(op_b.check_for_interrupt()), Some(InterruptReason::Shutdown));
    let err = op_b.check_for_interrupt().unwrap_err();
    assert_eq!(err.code(), 11600);
    Ok(())
}

#[test]
fn deadline_is_only_observed_at_a_checkpoint() -> Result<()> {
    let (_dir, service) = service(None)?;
    let client = service.make_client("slow");
    let opctx = service.make_operation_context(&client);
    opctx.set_max_time(Duration::from_millis(5));
    thread::sleep(Duration::from_millis(20));
    assert!(!opctx.is_killed());
    let err = opctx.check_for_interrupt().unwrap_err();
    assert!(matches!(
        err,
        DuskError::Interrupted(InterruptReason::DeadlineExceeded)
    ));
    assert_eq!(err.code(), 50);
    assert!(opctx.is_killed());
    Ok(())
}

#[test]
fn injected_faults_hit_only_the_configured_connection() -> Result<()> {
    let policy = FaultInjection::new(1, 1.0).with_seed(7);
    let (_dir, service) = service(Some(policy))?;
    let target = service.make_client("target");
    let other = service.make_client("other");
    assert_eq!(target.conn_id(), 1);

    let bystander = service.make_operation_context(&other);
    for _ in 0..10 {
        bystander.check_for_interrupt()?;
    }
    let victim = service.make_operation_context(&target);
    assert_eq!(
        reason(victim.check_for_interrupt()),
        Some(InterruptReason::FaultInjected)
    );
    Ok(())
}

#[test]
fn out_of_range_probability_is_rejected_at_startup() {
    let err = service(Some(FaultInjection::new(1, 1.01))).unwrap_err();
    assert!(matches!(err, DuskError::InvalidArgument(_)));
}
