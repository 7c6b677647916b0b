//! Two nodes dial each other, establish a peer link, and replicate a
//! trlog end-to-end.

use std::time::Duration;

use medved::config::{ClusterSection, ConnectionSection, NodeConfig, ServerSection, StorageSection};
use medved::node::Node;
use medved::wire::messages::{FieldWire, TableDescWire};
use tokio_util::sync::CancellationToken;

fn config(listen: &str, seeds: Vec<&str>, storage: std::path::PathBuf) -> NodeConfig {
    NodeConfig {
        server: ServerSection { listen: listen.parse().unwrap(), workers: 1 },
        storage: StorageSection { path: storage, workers: 1, worker_queues: 2 },
        connection: ConnectionSection {
            retry_interval: Duration::from_millis(200),
            keep_idle: Duration::from_secs(30),
            keep_count: 3,
            keep_interval: Duration::from_secs(10),
            response_timeout: Duration::from_secs(5),
            collision_penalty: Duration::from_millis(10),
        },
        cluster: ClusterSection { nodes: seeds.iter().map(|s| s.parse().unwrap()).collect() },
        log_level: medved::config::LogLevel::Info,
    }
}

async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn peers_link_up_when_dialed() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let cancel = CancellationToken::new();
    let node_a = Node::start(config("127.0.0.1:17201", vec![], dir_a.path().to_path_buf()), cancel.clone())
        .await
        .unwrap();
    let node_b = Node::start(config("127.0.0.1:17202", vec!["127.0.0.1:17201"], dir_b.path().to_path_buf()), cancel.clone())
        .await
        .unwrap();

    let linked = wait_until(
        || node_b.state.tracker.is_connected(node_b.state.self_uuid, node_a.state.self_uuid),
        Duration::from_secs(5),
    )
    .await;
    assert!(linked, "node B never reported a connected link to node A");

    cancel.cancel();
}

#[tokio::test]
async fn trlog_replicates_to_a_peer_that_joins_after_inserts() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();

    let node_a = Node::start(config("127.0.0.1:17203", vec![], dir_a.path().to_path_buf()), cancel.clone())
        .await
        .unwrap();

    let table_id = node_a.state.create_table(TableDescWire {
        n: "events".into(),
        s: 1,
        b: 0,
        f: vec![FieldWire { t: 1, l: 1, n: "id".into() }],
    });
    node_a.state.insert_into(table_id, vec![vec![b"1".to_vec()], vec![b"2".to_vec()], vec![b"3".to_vec()]]).unwrap();

    let node_b = Node::start(
        config("127.0.0.1:17204", vec!["127.0.0.1:17203"], dir_b.path().to_path_buf()),
        cancel.clone(),
    )
    .await
    .unwrap();

    let linked = wait_until(
        || node_b.state.tracker.is_connected(node_b.state.self_uuid, node_a.state.self_uuid),
        Duration::from_secs(5),
    )
    .await;
    assert!(linked, "node B never linked up with node A");

    // Node B learns the "events" table from node A's tablespace trlog (it
    // never ran `CreateTable` itself), then catches up on the rows node A
    // inserted before B ever joined.
    let learned_table = wait_until(|| node_b.state.table_desc(table_id).is_some(), Duration::from_secs(5)).await;
    assert!(learned_table, "node B never learned node A's table schema");

    let caught_up = wait_until(
        || node_b.state.trlog_for(table_id).map(|t| t.top()).unwrap_or(0) == 3,
        Duration::from_secs(5),
    )
    .await;
    assert!(caught_up, "node B never replicated node A's rows");

    let view_id = node_b.state.select(table_id, vec![true], "").unwrap();
    let page = node_b.state.fetch(view_id, 10).unwrap();
    assert_eq!(page.len(), 3);

    cancel.cancel();
}
