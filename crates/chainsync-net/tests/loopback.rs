//! Two nodes replicating over real sockets on the loopback interface.

use std::time::Duration;

use chainsync_core::{
    ChainRecord, ClusterConfig, Environment, FieldType, FieldWrite, PeerConfig, StripeRange,
};
use chainsync_net::Replicator;

fn node_config(name: &str, port: u16) -> ClusterConfig {
    let mut config = ClusterConfig::default();
    config.node_id = name.to_string();
    config.host_name = "localhost".to_string();
    config.bind_address = "127.0.0.1".to_string();
    config.port = port;
    config.heartbeat_interval_ms = 200;
    config.heartbeat_timeout_ms = 2_000;
    config.reconnect_backoff_ms = 100;
    config
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn definitions_replicate_between_two_nodes() {
    let a = Replicator::start(node_config("node-a", 0)).await.unwrap();

    let mut b_config = node_config("node-b", 0);
    b_config.peers.push(PeerConfig {
        address: "127.0.0.1".to_string(),
        port: a.listen_addr().port(),
        server_id: "node-a".to_string(),
    });
    let b = Replicator::start(b_config).await.unwrap();

    wait_for("peers to connect", || {
        a.connected_peers().contains(&"node-b".to_string())
            && b.connected_peers().contains(&"node-a".to_string())
    })
    .await;

    // Schema appended on A arrives on B in order.
    a.create_definition("User", 0).unwrap();
    a.create_definition("Post", 1).unwrap();
    wait_for("definitions on b", || b.definition_count() == 2).await;
    assert_eq!(b.resolve("User").unwrap().id, 1);
    let post = b.resolve("Post").unwrap();
    assert_eq!(post.id, 2);
    assert_eq!(post.inherited_id, 1);

    // And the other direction.
    b.create_definition("Comment", 0).unwrap();
    wait_for("comment on a", || a.definition_count() == 3).await;
    assert_eq!(a.resolve_id(3).unwrap().name, "Comment");
}

#[tokio::test(flavor = "multi_thread")]
async fn late_joiner_catches_up_from_history() {
    let a = Replicator::start(node_config("node-a", 0)).await.unwrap();
    a.create_definition("User", 0).unwrap();
    a.create_definition("Post", 1).unwrap();
    a.create_definition("Comment", 0).unwrap();

    // B joins after the chain already has content.
    let mut b_config = node_config("node-b", 0);
    b_config.peers.push(PeerConfig {
        address: "127.0.0.1".to_string(),
        port: a.listen_addr().port(),
        server_id: "node-a".to_string(),
    });
    let b = Replicator::start(b_config).await.unwrap();

    wait_for("catch-up", || b.definition_count() == 3).await;
    assert_eq!(b.resolve_id(1).unwrap().name, "User");
    assert_eq!(b.resolve_id(2).unwrap().inherited_id, 1);
    assert_eq!(b.resolve_id(3).unwrap().name, "Comment");
}

#[tokio::test(flavor = "multi_thread")]
async fn private_field_values_do_not_replicate() {
    let a = Replicator::start(node_config("node-a", 0)).await.unwrap();
    let def = a.create_definition("User", 0).unwrap();
    let secret = a
        .define_field(def, "password", FieldType::Bytes, false, true)
        .unwrap();
    let email = a
        .define_field(def, "email", FieldType::Str, false, false)
        .unwrap();

    let mut b_config = node_config("node-b", 0);
    b_config.peers.push(PeerConfig {
        address: "127.0.0.1".to_string(),
        port: a.listen_addr().port(),
        server_id: "node-a".to_string(),
    });
    let b = Replicator::start(b_config).await.unwrap();
    wait_for("schema on b", || {
        b.with_schema(|s| s.own_fields(def).map(|f| f.len()).unwrap_or(0) == 2)
    })
    .await;

    a.set_fields(
        def,
        vec![
            FieldWrite {
                field_id: secret,
                value: b"hunter2".to_vec(),
            },
            FieldWrite {
                field_id: email,
                value: b"a@example.com".to_vec(),
            },
        ],
    )
    .unwrap();

    // B sees a SetFields record carrying only the public value.
    wait_for("set-fields on b", || {
        b.with_history(|h| {
            h.iter()
                .any(|r| matches!(r, ChainRecord::SetFields { .. }))
        })
    })
    .await;
    b.with_history(|h| {
        let fields = h
            .iter()
            .find_map(|r| match r {
                ChainRecord::SetFields { fields, .. } => Some(fields.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(fields.len(), 1, "private value must not cross the wire");
        assert_eq!(fields[0].field_id, email);
        assert_eq!(fields[0].value, b"a@example.com");
        assert!(fields.iter().all(|f| f.field_id != secret));
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn environment_mismatch_never_connects() {
    let a = Replicator::start(node_config("node-a", 0)).await.unwrap();

    let mut b_config = node_config("node-b", 0);
    b_config.environment = Environment::Prod;
    b_config.peers.push(PeerConfig {
        address: "127.0.0.1".to_string(),
        port: a.listen_addr().port(),
        server_id: "node-a".to_string(),
    });
    let b = Replicator::start(b_config).await.unwrap();

    // Several dial attempts fit in this window; none may survive the
    // handshake.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(a.connected_peers().is_empty());
    assert!(b.connected_peers().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn two_node_concurrent_create_ids_disjoint() {
    let mut a_config = node_config("node-a", 0);
    a_config.stripes.insert(
        "Post".to_string(),
        vec![StripeRange {
            start: 1000,
            end: 1999,
        }],
    );
    let a = Replicator::start(a_config).await.unwrap();

    let mut b_config = node_config("node-b", 0);
    b_config.stripes.insert(
        "Post".to_string(),
        vec![StripeRange {
            start: 2000,
            end: 2999,
        }],
    );
    let b = Replicator::start(b_config).await.unwrap();

    let a2 = a.clone();
    let b2 = b.clone();
    let ja = tokio::task::spawn_blocking(move || {
        (0..500).map(|_| a2.next_id("Post").unwrap()).collect::<Vec<u64>>()
    });
    let jb = tokio::task::spawn_blocking(move || {
        (0..500).map(|_| b2.next_id("Post").unwrap()).collect::<Vec<u64>>()
    });
    let ids_a = ja.await.unwrap();
    let ids_b = jb.await.unwrap();

    assert!(ids_a.iter().all(|id| (1000..=1999).contains(id)));
    assert!(ids_b.iter().all(|id| (2000..=2999).contains(id)));
    let mut all: Vec<u64> = ids_a.into_iter().chain(ids_b).collect();
    let before = all.len();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), before, "ids must be globally distinct");
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_file_mode_persists_replicated_chain() {
    let dir = tempfile::tempdir().unwrap();

    let mut a_config = node_config("node-a", 0);
    a_config.sync_file_mode = true;
    a_config.log_path = dir.path().join("a.log");
    let a = Replicator::start(a_config).await.unwrap();
    a.create_definition("User", 0).unwrap();
    a.create_definition("Post", 1).unwrap();

    let mut b_config = node_config("node-b", 0);
    b_config.sync_file_mode = true;
    b_config.log_path = dir.path().join("b.log");
    b_config.peers.push(PeerConfig {
        address: "127.0.0.1".to_string(),
        port: a.listen_addr().port(),
        server_id: "node-a".to_string(),
    });
    let b = Replicator::start(b_config).await.unwrap();
    wait_for("replication to b", || b.definition_count() == 2).await;

    // B's file is replayable on its own: byte-identical framing to the
    // stream it received. Appends land before definition_count moves, so
    // both records are on disk by now.
    let outcome = chainsync_core::ChainLog::replay(dir.path().join("b.log")).unwrap();
    assert!(outcome.corruption.is_none());
    assert_eq!(outcome.records.len(), 2);
    assert!(matches!(
        &outcome.records[0],
        ChainRecord::CreateDefinition { name, .. } if name == "User"
    ));
}
