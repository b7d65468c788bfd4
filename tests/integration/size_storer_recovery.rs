#![allow(missing_docs)]

use std::sync::{Arc, Once};

use dusk::operation::OperationContext;
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

fn options(path: &std::path::Path) -> StorageOptions {
    let mut options = StorageOptions::new(path);
    options.cache_size_gb = Some(1);
    options
}

fn detached(engine: &KvStorageEngine) -> OperationContext {
    OperationContext::detached(engine.new_recovery_unit(), engine.new_locker())
}

#[test]
fn flushed_sizes_survive_a_crash_and_unflushed_ones_do_not() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    {
        let engine = Arc::new(KvStorageEngine::open(&options(dir.path()))?);
        let db = engine.database_catalog_entry("app");
        let mut opctx = detached(&engine);
        let (flushed, unflushed) = opctx.write_unit_of_work(|opctx| {
            let flushed = db.create_collection(opctx, "app.flushed", &CollectionOptions::default())?;
            let unflushed =
                db.create_collection(opctx, "app.unflushed", &CollectionOptions::default())?;
            for payload in [&b"aaaa"[..], b"bb", b"c"] {
                flushed.insert_record(opctx, payload)?;
            }
            Ok((flushed, unflushed))
        })?;
        engine.flush_all_files(true)?;

        opctx.write_unit_of_work(|opctx| {
            flushed.insert_record(opctx, b"late")?;
            flushed.insert_record(opctx, b"later")?;
            unflushed.insert_record(opctx, b"never synced")?;
            Ok(())
        })?;
        assert_eq!(flushed.num_records(), 5);
        // Dropped without a clean shutdown.
    }

    let engine = KvStorageEngine::open(&options(dir.path()))?;
    let db = engine.database_catalog_entry("app");
    let flushed = db.record_store("app.flushed").expect("flushed collection");
    assert_eq!((flushed.num_records(), flushed.data_size()), (3, 7));

    let mut opctx = detached(&engine);
    assert_eq!(flushed.validate(&mut opctx)?, (5, 16));
    assert_eq!((flushed.num_records(), flushed.data_size()), (5, 16));

    let unflushed = db.record_store("app.unflushed").expect("unflushed collection");
    assert_eq!(unflushed.num_records(), 0);
    Ok(())
}

#[test]
fn rename_persists_sizes_before_touching_the_catalog() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    {
        let engine = KvStorageEngine::open(&options(dir.path()))?;
        let db = engine.database_catalog_entry("app");
        let mut opctx = detached(&engine);
        opctx.write_unit_of_work(|opctx| {
            let rs = db.create_collection(opctx, "app.old", &CollectionOptions { temp: true })?;
            rs.insert_record(opctx, b"payload")?;
            Ok(())
        })?;
        opctx.write_unit_of_work(|opctx| db.rename_collection(opctx, "app.old", "app.new", false))?;
    }

    let engine = KvStorageEngine::open(&options(dir.path()))?;
    let db = engine.database_catalog_entry("app");
    assert_eq!(db.collection_namespaces(), vec!["app.new".to_string()]);
    let rs = db.record_store("app.new").expect("renamed collection");
    assert_eq!(rs.ns(), "app.new");
    assert_eq!((rs.num_records(), rs.data_size()), (1, 7));
    assert!(!engine.catalog().metadata("app.new")?.options.temp);
    Ok(())
}
