#![allow(missing_docs)]

use std::sync::{Arc, Once};

use dusk::operation::ServiceContext;
use dusk::repl::StandaloneCoordinator;
use dusk::storage::{CollectionOptions, KvStorageEngine, StorageEngine, StorageOptions};
use dusk::types::Result;
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("dusk::storage=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn open(path: &std::path::Path) -> Result<(Arc<KvStorageEngine>, Arc<ServiceContext>)> {
    let mut options = StorageOptions::new(path);
    options.cache_size_gb = Some(1);
    let storage = Arc::new(KvStorageEngine::open(&options)?);
    let service = ServiceContext::new(
        Arc::clone(&storage) as Arc<dyn StorageEngine>,
        Arc::new(StandaloneCoordinator),
        None,
    )?;
    Ok((storage, service))
}

#[test]
fn dropping_a_collection_under_an_open_cursor_is_deferred() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let (storage, service) = open(dir.path())?;
    let db = storage.database_catalog_entry("app");

    let reader = service.make_client("reader");
    let writer = service.make_client("writer");

    let mut setup = service.make_operation_context(&writer);
    let rs = setup.write_unit_of_work(|opctx| {
        let rs = db.create_collection(opctx, "app.events", &CollectionOptions::default())?;
        rs.insert_record(opctx, b"one")?;
        rs.insert_record(opctx, b"two")?;
        Ok(rs)
    })?;
    drop(setup);
    let ident = db.collection("app.events").expect("collection").ident().to_string();

    let mut scan = service.make_operation_context(&reader);
    let mut cursor = rs.cursor_for(true);
    assert!(cursor.next(&mut scan)?.is_some());

    let mut dropper = service.make_operation_context(&writer);
    dropper.write_unit_of_work(|opctx| db.drop_collection(opctx, "app.events"))?;
    drop(dropper);

    let kv = storage.kv();
    assert!(db.collection("app.events").is_none());
    assert!(kv.has_ident(&ident), "table must survive while a cursor is open");
    assert!(kv.have_drops_queued());
    assert_eq!(kv.drop_all_queued()?, 0);

    drop(cursor);
    drop(scan);
    kv.drop_all_queued()?;
    assert!(!kv.has_ident(&ident));
    assert!(!kv.have_drops_queued());
    assert!(!storage.catalog().all_idents().contains(&ident));
    Ok(())
}

#[test]
fn background_tasks_reclaim_queued_drops() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let (storage, service) = open(dir.path())?;
    let kv = storage.kv();
    kv.create_record_store("app.side", "side-table", &CollectionOptions::default())?;

    let client = service.make_client("holder");
    let mut holder = service.make_operation_context(&client);
    let rs = kv.get_record_store(&mut holder, "app.side", "side-table")?;
    holder.write_unit_of_work(|opctx| rs.insert_record(opctx, b"row"))?;
    let mut cursor = rs.cursor_for(true);
    assert!(cursor.next(&mut holder)?.is_some());

    kv.drop_record_store("side-table")?;
    assert_eq!(kv.queued_drops(), vec!["table:side-table".to_string()]);
    storage.run_background_tasks()?;
    assert!(kv.has_ident("side-table"));

    drop(cursor);
    drop(holder);
    storage.run_background_tasks()?;
    assert!(!kv.has_ident("side-table"));
    assert!(kv.queued_drops().is_empty());
    Ok(())
}
