#![allow(missing_docs)]

use std::sync::{Arc, Once};

use dusk::operation::{OperationContext, ServiceContext};
use dusk::repl::{
    ExternalState, OpTime, ReplSetCoordinator, StorageExternalState, OPLOG_NS,
};
use dusk::storage::{CollectionOptions, KvStorageEngine, StorageEngine, StorageOptions};
use dusk::types::{DuskError, Result};
use serde_json::json;
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("dusk::repl=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

struct Node {
    storage: Arc<KvStorageEngine>,
    service: Arc<ServiceContext>,
    repl: Arc<ReplSetCoordinator>,
}

impl Node {
    fn start(path: &std::path::Path) -> Result<Self> {
        let mut options = StorageOptions::new(path);
        options.cache_size_gb = Some(1);
        let storage = Arc::new(KvStorageEngine::open(&options)?);
        let repl = Arc::new(ReplSetCoordinator::new(false));
        let service = ServiceContext::new(
            Arc::clone(&storage) as Arc<dyn StorageEngine>,
            repl.clone(),
            None,
        )?;
        Ok(Self {
            storage,
            service,
            repl,
        })
    }

    fn opctx(&self) -> OperationContext {
        let client = self.service.make_client("repl");
        self.service.make_operation_context(&client)
    }

    fn external(&self, host: &str) -> StorageExternalState {
        StorageExternalState::new(Arc::clone(&self.storage) as Arc<dyn StorageEngine>, host)
    }

    fn shutdown(self) -> Result<()> {
        self.storage.clean_shutdown()
    }
}

fn append_oplog(node: &Node, entry: serde_json::Value) -> Result<()> {
    let mut opctx = node.opctx();
    assert!(opctx.is_primary_for(OPLOG_NS));
    let db = node.storage.database_catalog_entry("local");
    let bytes = serde_json::to_vec(&entry).expect("encode entry");
    opctx.write_unit_of_work(|opctx| {
        let rs = match db.record_store(OPLOG_NS) {
            Some(rs) => rs,
            None => db.create_collection(opctx, OPLOG_NS, &CollectionOptions::default())?,
        };
        rs.insert_record(opctx, &bytes).map(|_| ())
    })
}

#[test]
fn node_identity_survives_restart_on_the_same_host() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");

    let node = Node::start(dir.path())?;
    let first = {
        let mut opctx = node.opctx();
        node.external("db1.example.net:27017").ensure_me(&mut opctx)?
    };
    node.shutdown()?;

    let node = Node::start(dir.path())?;
    let mut opctx = node.opctx();
    let same_host = node.external("db1.example.net:27017");
    assert_eq!(same_host.ensure_me(&mut opctx)?, first);
    let new_host = node.external("db2.example.net:27017");
    let second = new_host.ensure_me(&mut opctx)?;
    assert_ne!(second, first);
    assert_eq!(new_host.ensure_me(&mut opctx)?, second);
    drop(opctx);
    node.shutdown()
}

#[test]
fn last_op_time_follows_the_newest_oplog_entry() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let node = Node::start(dir.path())?;
    let state = node.external("db1.example.net:27017");

    let mut opctx = node.opctx();
    let err = state.load_last_op_time(&mut opctx).unwrap_err();
    assert!(matches!(err, DuskError::NoMatchingDocument(_)));
    assert_eq!(err.code(), 47);
    drop(opctx);

    append_oplog(&node, json!({ "ts": { "$timestamp": { "t": 100, "i": 1 } }, "op": "i" }))?;
    append_oplog(&node, json!({ "ts": { "$timestamp": { "t": 100, "i": 2 } }, "op": "u" }))?;
    let mut opctx = node.opctx();
    assert_eq!(state.load_last_op_time(&mut opctx)?, OpTime::new(100, 2));
    drop(opctx);

    append_oplog(&node, json!({ "ts": 12345, "op": "n" }))?;
    let mut opctx = node.opctx();
    let err = state.load_last_op_time(&mut opctx).unwrap_err();
    assert!(matches!(err, DuskError::TypeMismatch(_)));
    drop(opctx);

    append_oplog(&node, json!({ "op": "n" }))?;
    let mut opctx = node.opctx();
    let err = state.load_last_op_time(&mut opctx).unwrap_err();
    assert!(matches!(err, DuskError::NoSuchKey(_)));
    Ok(())
}

#[test]
fn config_document_round_trips_across_restart() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let config = json!({
        "_id": "rs0",
        "version": 3,
        "members": [{ "_id": 0, "host": "db1.example.net:27017" }],
    });
    let node = Node::start(dir.path())?;
    {
        let mut opctx = node.opctx();
        let state = node.external("db1.example.net:27017");
        state.store_local_config_document(&mut opctx, &config)?;
        assert!(!opctx.is_primary_for("app.users"));
        node.repl.set_primary(true);
        assert!(opctx.is_primary_for("app.users"));
    }
    node.shutdown()?;

    let node = Node::start(dir.path())?;
    let mut opctx = node.opctx();
    let loaded = node
        .external("db1.example.net:27017")
        .load_local_config_document(&mut opctx)?;
    assert_eq!(loaded, config);
    Ok(())
}
