//! Cold start: replay a persisted chain log into a fresh schema store.

use chainsync_core::chain::{replay_and_repair, ChainLog, ChainRecord};
use chainsync_core::schema::SchemaStore;

fn create(id: u64, inherited: u64, name: &str) -> ChainRecord {
    ChainRecord::CreateDefinition {
        definition_id: id,
        inherited_id: inherited,
        timestamp_ms: 1_700_000_000_000 + id,
        name: name.to_string(),
    }
}

#[test]
fn replay_three_definitions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chain.log");

    {
        let mut log = ChainLog::open(&path, 1).unwrap();
        log.append(&create(1, 0, "User")).unwrap();
        log.append(&create(2, 1, "Post")).unwrap();
        log.append(&create(3, 0, "Comment")).unwrap();
    }

    let (_log, outcome) = replay_and_repair(&path, 1).unwrap();
    let mut store = SchemaStore::new();
    for record in &outcome.records {
        store.apply(record).unwrap();
    }

    assert_eq!(store.resolve(1).unwrap().name, "User");
    let post = store.resolve(2).unwrap();
    assert_eq!(post.name, "Post");
    assert_eq!(post.inherited_id, 1);
    assert_eq!(store.resolve(3).unwrap().name, "Comment");
}

#[test]
fn replay_survives_process_restart_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chain.log");
    let names = ["User", "Post", "Comment", "Poll", "Blog"];

    for (k, name) in names.iter().enumerate() {
        // Each cycle reopens the log, replays, and appends one more.
        let (log, outcome) = replay_and_repair(&path, 1).unwrap();
        let mut log = log.unwrap();
        let mut store = SchemaStore::new();
        for record in &outcome.records {
            store.apply(record).unwrap();
        }
        assert_eq!(store.definition_count(), k as u64);

        let next = create(k as u64 + 1, 0, name);
        store.apply(&next).unwrap();
        log.append(&next).unwrap();
    }

    let (_log, outcome) = replay_and_repair(&path, 1).unwrap();
    assert_eq!(outcome.records.len(), names.len());
    let mut store = SchemaStore::new();
    for record in &outcome.records {
        store.apply(record).unwrap();
    }
    for (k, name) in names.iter().enumerate() {
        assert_eq!(&store.resolve(k as u64 + 1).unwrap().name, name);
    }
}
