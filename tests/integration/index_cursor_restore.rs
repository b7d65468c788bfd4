#![allow(missing_docs)]

use std::sync::{Arc, Once};

use dusk::operation::{OperationContext, ServiceContext};
use dusk::repl::StandaloneCoordinator;
use dusk::storage::{
    CollectionOptions, IndexCursor, IndexDescriptor, IndexKey, KeyValue, KvIndex,
    KvStorageEngine, StorageEngine, StorageOptions,
};
use dusk::types::{DuskError, RecordId, Result};
use tempfile::{tempdir, TempDir};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("dusk::storage::index=trace"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

struct Fixture {
    service: Arc<ServiceContext>,
    index: KvIndex,
    _dir: TempDir,
}

impl Fixture {
    fn opctx(&self) -> OperationContext {
        let client = self.service.make_client("test");
        self.service.make_operation_context(&client)
    }
}

fn fixture(desc: IndexDescriptor) -> Result<Fixture> {
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
    let db = storage.database_catalog_entry("app");
    let client = service.make_client("setup");
    let mut opctx = service.make_operation_context(&client);
    let index = opctx.write_unit_of_work(|opctx| {
        db.create_collection(opctx, "app.items", &CollectionOptions::default())?;
        db.create_index(opctx, "app.items", &desc)
    })?;
    drop(opctx);
    Ok(Fixture {
        service,
        index,
        _dir: dir,
    })
}

fn int_at(cursor: &IndexCursor) -> Result<Option<i64>> {
    Ok(match cursor.key()? {
        Some(key) => match key.values() {
            [KeyValue::Int(v)] => Some(*v),
            _ => None,
        },
        None => None,
    })
}

#[test]
fn restore_after_commit_lands_on_same_or_next_key() -> Result<()> {
    let fx = fixture(IndexDescriptor::new("n_1", &[("n", 1)], false))?;
    let index = &fx.index;
    let mut reader = fx.opctx();
    reader.write_unit_of_work(|opctx| {
        for n in 1..=5i64 {
            index.insert(opctx, &IndexKey::single(n), RecordId(n * 10), false)?;
        }
        Ok(())
    })?;

    let mut cursor = index.new_cursor(true);
    assert!(cursor.locate(&mut reader, &IndexKey::single(3i64), RecordId::MIN)?);
    cursor.save_position();
    reader.recovery_unit_mut().commit_and_restart()?;
    cursor.restore_position(&mut reader)?;
    assert_eq!(int_at(&cursor)?, Some(3));
    assert_eq!(cursor.record_id()?, Some(RecordId(30)));

    cursor.save_position();
    reader.recovery_unit_mut().abandon_snapshot();
    let mut writer = fx.opctx();
    writer.write_unit_of_work(|opctx| {
        assert!(index.unindex(opctx, &IndexKey::single(3i64), RecordId(30), false)?);
        Ok(())
    })?;
    drop(writer);

    cursor.restore_position(&mut reader)?;
    assert_eq!(int_at(&cursor)?, Some(4));
    cursor.advance(&mut reader)?;
    assert_eq!(int_at(&cursor)?, Some(5));
    cursor.advance(&mut reader)?;
    assert!(cursor.is_eof());
    Ok(())
}

#[test]
fn reverse_cursor_restores_toward_smaller_keys() -> Result<()> {
    let fx = fixture(IndexDescriptor::new("n_1", &[("n", 1)], false))?;
    let index = &fx.index;
    let mut opctx = fx.opctx();
    opctx.write_unit_of_work(|opctx| {
        for n in [2i64, 4, 6] {
            index.insert(opctx, &IndexKey::single(n), RecordId(n), false)?;
        }
        Ok(())
    })?;

    let mut cursor = index.new_cursor(false);
    assert!(cursor.locate(&mut opctx, &IndexKey::single(4i64), RecordId::MAX)?);
    cursor.save_position();
    opctx.write_unit_of_work(|opctx| {
        index.unindex(opctx, &IndexKey::single(4i64), RecordId(4), false)?;
        Ok(())
    })?;
    cursor.restore_position(&mut opctx)?;
    assert_eq!(int_at(&cursor)?, Some(2));
    Ok(())
}

#[test]
fn unique_index_duplicates_only_when_allowed() -> Result<()> {
    let fx = fixture(IndexDescriptor::new("email_1", &[("email", 1)], true))?;
    let index = &fx.index;
    let mut opctx = fx.opctx();
    let key = IndexKey::single("a@example.com");

    opctx.write_unit_of_work(|opctx| index.insert(opctx, &key, RecordId(1), false))?;
    let dup = opctx.write_unit_of_work(|opctx| index.insert(opctx, &key, RecordId(2), false));
    assert!(matches!(dup, Err(DuskError::DuplicateKey(_))));
    assert!(matches!(
        index.dup_key_check(&mut opctx, &key, RecordId(2)),
        Err(DuskError::DuplicateKey(_))
    ));
    index.dup_key_check(&mut opctx, &key, RecordId(1))?;

    opctx.write_unit_of_work(|opctx| index.insert(opctx, &key, RecordId(2), true))?;
    let mut cursor = index.new_cursor(true);
    assert!(cursor.locate(&mut opctx, &key, RecordId::MIN)?);
    assert_eq!(cursor.record_id()?, Some(RecordId(1)));
    cursor.advance(&mut opctx)?;
    assert_eq!(cursor.key()?, Some(key.clone()));
    assert_eq!(cursor.record_id()?, Some(RecordId(2)));

    assert!(opctx.write_unit_of_work(|opctx| index.unindex(opctx, &key, RecordId(1), true))?);
    let mut cursor = index.new_cursor(true);
    assert!(cursor.locate(&mut opctx, &key, RecordId::MIN)?);
    assert_eq!(cursor.record_id()?, Some(RecordId(2)));
    assert!(opctx.write_unit_of_work(|opctx| index.unindex(opctx, &key, RecordId(2), true))?);
    assert!(index.is_empty(&mut opctx)?);
    Ok(())
}

#[test]
fn bulk_load_then_walk() -> Result<()> {
    let fx = fixture(IndexDescriptor::new("n_1", &[("n", 1)], false))?;
    let index = &fx.index;
    let mut opctx = fx.opctx();
    let added = opctx.write_unit_of_work(|opctx| {
        let mut builder = index.bulk_builder(opctx, true)?;
        for n in 0..100i64 {
            builder.add_key(&IndexKey::single(n), RecordId(n + 1))?;
        }
        builder.commit(opctx, true)
    })?;
    assert_eq!(added, 100);
    assert_eq!(index.full_validate(&mut opctx)?, 100);

    let mut cursor = index.new_cursor(false);
    cursor.locate(&mut opctx, &IndexKey::single(i64::MAX), RecordId::MAX)?;
    let mut seen = 0;
    while !cursor.is_eof() {
        seen += 1;
        cursor.advance(&mut opctx)?;
    }
    assert_eq!(seen, 100);
    Ok(())
}
