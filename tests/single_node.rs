//! A single node's table/insert/select/fetch/delete path, exercised
//! end-to-end through `NodeState`.

use std::time::Duration;

use medved::config::{ClusterSection, ConnectionSection, NodeConfig, ServerSection, StorageSection};
use medved::node::Node;
use medved::wire::messages::{FieldWire, TableDescWire};
use tokio_util::sync::CancellationToken;

fn test_config(listen: &str, storage: std::path::PathBuf) -> NodeConfig {
    NodeConfig {
        server: ServerSection { listen: listen.parse().unwrap(), workers: 1 },
        storage: StorageSection { path: storage, workers: 1, worker_queues: 2 },
        connection: ConnectionSection {
            retry_interval: Duration::from_secs(60),
            keep_idle: Duration::from_secs(30),
            keep_count: 3,
            keep_interval: Duration::from_secs(10),
            response_timeout: Duration::from_secs(5),
            collision_penalty: Duration::from_millis(10),
        },
        cluster: ClusterSection::default(),
        log_level: medved::config::LogLevel::Info,
    }
}

fn users_desc() -> TableDescWire {
    TableDescWire {
        n: "users".into(),
        s: 1,
        b: 0,
        f: vec![
            FieldWire { t: 1, l: 1, n: "id".into() },
            FieldWire { t: 2, l: 1, n: "name".into() },
        ],
    }
}

#[tokio::test]
async fn create_insert_select_fetch_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config("127.0.0.1:17101", dir.path().to_path_buf());
    let cancel = CancellationToken::new();
    let node = Node::start(config, cancel.clone()).await.unwrap();

    let table_id = node.state.create_table(users_desc());
    let desc = node.state.table_desc(table_id).unwrap();
    assert_eq!(desc.f.len(), 2);

    let inserted = node
        .state
        .insert_into(table_id, vec![vec![b"1".to_vec(), b"alice".to_vec()], vec![b"2".to_vec(), b"bob".to_vec()]])
        .unwrap();
    assert_eq!(inserted, 2);

    let view_id = node.state.select(table_id, vec![true, true], "").unwrap();
    let page = node.state.fetch(view_id, 10).unwrap();
    assert_eq!(page.len(), 2);

    let trlog = node.state.trlog_for(table_id).unwrap();
    assert_eq!(trlog.top(), 2);

    cancel.cancel();
}

#[tokio::test]
async fn select_with_filter_only_returns_matching_rows() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config("127.0.0.1:17102", dir.path().to_path_buf());
    let cancel = CancellationToken::new();
    let node = Node::start(config, cancel.clone()).await.unwrap();

    let table_id = node.state.create_table(users_desc());
    node.state
        .insert_into(table_id, vec![vec![b"1".to_vec(), b"alice".to_vec()], vec![b"2".to_vec(), b"bob".to_vec()]])
        .unwrap();

    let view_id = node.state.select(table_id, vec![true, true], "name = 'bob'").unwrap();
    let page = node.state.fetch(view_id, 10).unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page.rows()[0].cells[1], b"bob".to_vec());

    cancel.cancel();
}

#[tokio::test]
async fn delete_from_removes_matching_rows() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config("127.0.0.1:17103", dir.path().to_path_buf());
    let cancel = CancellationToken::new();
    let node = Node::start(config, cancel.clone()).await.unwrap();

    let table_id = node.state.create_table(users_desc());
    node.state
        .insert_into(table_id, vec![vec![b"1".to_vec(), b"alice".to_vec()], vec![b"2".to_vec(), b"bob".to_vec()]])
        .unwrap();

    let removed = node.state.delete_from(table_id, "name = 'alice'").unwrap();
    assert_eq!(removed, 1);

    let view_id = node.state.select(table_id, vec![true, true], "").unwrap();
    let page = node.state.fetch(view_id, 10).unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page.rows()[0].cells[1], b"bob".to_vec());

    cancel.cancel();
}

#[tokio::test]
async fn get_table_on_unknown_id_is_none() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config("127.0.0.1:17104", dir.path().to_path_buf());
    let cancel = CancellationToken::new();
    let node = Node::start(config, cancel.clone()).await.unwrap();

    assert!(node.state.table_desc(medved::ids::StorageId::generate()).is_none());
    cancel.cancel();
}

#[tokio::test]
async fn tables_and_rows_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();

    let cancel_a = CancellationToken::new();
    let table_id = {
        let config = test_config("127.0.0.1:17105", dir.path().to_path_buf());
        let node = Node::start(config, cancel_a.clone()).await.unwrap();
        let table_id = node.state.create_table(users_desc());
        node.state
            .insert_into(table_id, vec![vec![b"1".to_vec(), b"alice".to_vec()], vec![b"2".to_vec(), b"bob".to_vec()]])
            .unwrap();
        cancel_a.cancel();
        table_id
    };
    // Give the cancelled listener task a moment to release the port.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let cancel_b = CancellationToken::new();
    let config = test_config("127.0.0.1:17105", dir.path().to_path_buf());
    let node = Node::start(config, cancel_b.clone()).await.unwrap();

    let desc = node.state.table_desc(table_id).unwrap();
    assert_eq!(desc.f.len(), 2);
    assert_eq!(node.state.trlog_for(table_id).unwrap().top(), 2);

    let view_id = node.state.select(table_id, vec![true, true], "").unwrap();
    let page = node.state.fetch(view_id, 10).unwrap();
    assert_eq!(page.len(), 2);

    cancel_b.cancel();
}
