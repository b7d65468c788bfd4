#![allow(missing_docs)]

use std::sync::{Arc, Once};
use std::time::Duration;

use dusk::concurrency::{CollectionLock, DbLock, LockMode};
use dusk::operation::{OperationContext, ServiceContext};
use dusk::repl::StandaloneCoordinator;
use dusk::storage::{
    CollectionOptions, IndexDescriptor, IndexKey, KvStorageEngine, StorageEngine, StorageOptions,
};
use dusk::types::{DuskError, RecordId, Result};
use tempfile::{tempdir, TempDir};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("dusk=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn open() -> Result<(TempDir, Arc<KvStorageEngine>, Arc<ServiceContext>)> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let mut options = StorageOptions::new(dir.path());
    options.cache_size_gb = Some(1);
    let storage = Arc::new(KvStorageEngine::open(&options)?);
    let service = ServiceContext::new(
        Arc::clone(&storage) as Arc<dyn StorageEngine>,
        Arc::new(StandaloneCoordinator),
        None,
    )?;
    Ok((dir, storage, service))
}

fn opctx(service: &Arc<ServiceContext>, name: &str) -> OperationContext {
    let client = service.make_client(name);
    service.make_operation_context(&client)
}

/// Reruns `f` in a fresh unit of work until it stops conflicting.
fn with_retry<T>(
    opctx: &mut OperationContext,
    mut f: impl FnMut(&mut OperationContext) -> Result<T>,
) -> Result<(T, usize)> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match opctx.write_unit_of_work(&mut f) {
            Err(err) if err.is_write_conflict() && attempts < 5 => continue,
            other => return other.map(|value| (value, attempts)),
        }
    }
}

#[test]
fn concurrent_update_surfaces_a_write_conflict() -> Result<()> {
    let (_dir, storage, service) = open()?;
    let db = storage.database_catalog_entry("app");
    let mut a = opctx(&service, "a");
    let rs = a.write_unit_of_work(|opctx| {
        db.create_collection(opctx, "app.counters", &CollectionOptions::default())
    })?;
    let id = a.write_unit_of_work(|opctx| rs.insert_record(opctx, b"0"))?;

    let mut b = opctx(&service, "b");
    a.begin_unit_of_work()?;
    rs.update_record(&mut a, id, b"A")?;

    let conflict = b.write_unit_of_work(|opctx| rs.update_record(opctx, id, b"B"));
    let err = conflict.unwrap_err();
    assert!(err.is_write_conflict());
    assert!(err.is_retryable());
    assert_eq!(err.code(), 112);

    a.commit_unit_of_work()?;
    a.end_unit_of_work();

    let ((), attempts) = with_retry(&mut b, |opctx| rs.update_record(opctx, id, b"B"))?;
    assert_eq!(attempts, 1);
    assert_eq!(rs.data_for(&mut b, id)?, b"B".to_vec());
    assert_eq!((rs.num_records(), rs.data_size()), (1, 1));
    Ok(())
}

#[test]
fn concurrent_unique_inserts_of_one_key_conflict() -> Result<()> {
    let (_dir, storage, service) = open()?;
    let db = storage.database_catalog_entry("app");
    let mut a = opctx(&service, "a");
    let desc = IndexDescriptor::new("sku_1", &[("sku", 1)], true);
    let index = a.write_unit_of_work(|opctx| {
        db.create_collection(opctx, "app.products", &CollectionOptions::default())?;
        db.create_index(opctx, "app.products", &desc)
    })?;
    let key = IndexKey::single("sku-42");

    let mut b = opctx(&service, "b");
    a.begin_unit_of_work()?;
    index.insert(&mut a, &key, RecordId(1), false)?;
    let raced = b.write_unit_of_work(|opctx| index.insert(opctx, &key, RecordId(2), false));
    assert!(matches!(raced, Err(DuskError::WriteConflict)));
    a.commit_unit_of_work()?;
    a.end_unit_of_work();

    let retried = b.write_unit_of_work(|opctx| index.insert(opctx, &key, RecordId(2), false));
    assert!(matches!(retried, Err(DuskError::DuplicateKey(_))));
    assert_eq!(index.full_validate(&mut b)?, 1);
    Ok(())
}

#[test]
fn contended_collection_lock_times_out() -> Result<()> {
    let (_dir, storage, _service) = open()?;
    let holder = storage.new_locker();
    let waiter = storage.new_locker();
    let timeout = Duration::from_millis(30);

    let held_db = DbLock::acquire(&holder, "app", LockMode::IntentExclusive, timeout)?;
    let held = CollectionLock::acquire(&holder, "app.c", LockMode::Exclusive, timeout)?;

    let waiter_db = DbLock::acquire(&waiter, "app", LockMode::IntentExclusive, timeout)?;
    let err = match CollectionLock::acquire(&waiter, "app.c", LockMode::Shared, timeout) {
        Ok(_) => panic!("shared lock granted under an exclusive holder"),
        Err(err) => err,
    };
    assert!(matches!(err, DuskError::LockTimeout(_)));
    assert!(err.is_retryable());

    drop(held);
    drop(held_db);
    let granted = CollectionLock::acquire(&waiter, "app.c", LockMode::Shared, timeout)?;
    drop(granted);
    drop(waiter_db);
    Ok(())
}
