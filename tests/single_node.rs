//! End-to-end scenarios against a real single-peer cluster on loopback.

use std::time::Duration;

use serial_test::serial;

use replicated_kv::config::ReadAlgorithm;
use replicated_kv::{ClientOptions, KvClient, KvServer, ServerConfig};

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn start_single_node(tmp: &tempfile::TempDir) -> (std::sync::Arc<KvServer>, u16) {
    let client_port = free_port();
    let config = ServerConfig::new(
        1,
        format!("127.0.0.1:{}", free_port()),
        format!("127.0.0.1:{client_port}"),
        format!("127.0.0.1:{}", free_port()),
        tmp.path().join("db").to_string_lossy().into_owned(),
    );

    let server = KvServer::start(&config).await.expect("server starts");
    let leader = server
        .replica()
        .wait_for_leader(Duration::from_secs(10))
        .await;
    assert_eq!(leader, Some(1), "single node must elect itself");

    (server, client_port)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn put_then_get_round_trips() {
    let tmp = tempfile::tempdir().unwrap();
    let (server, client_port) = start_single_node(&tmp).await;

    let client = KvClient::connect("127.0.0.1", client_port, ClientOptions::default())
        .await
        .expect("client connects");

    let result = client.put(b"apple", b"An apple a day").await.unwrap();
    assert!(result.is_success(), "put failed: {result:?}");

    let read = client.get(b"apple").await.unwrap();
    assert_eq!(read.rc, 0);
    assert_eq!(read.value.as_deref(), Some(&b"An apple a day"[..]));

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn unknown_key_reads_as_a_miss() {
    let tmp = tempfile::tempdir().unwrap();
    let (server, client_port) = start_single_node(&tmp).await;

    let client = KvClient::connect("127.0.0.1", client_port, ClientOptions::default())
        .await
        .unwrap();

    let read = client.get(b"missing").await.unwrap();
    assert_eq!(read.value, None);
    assert_ne!(read.rc, 0);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn delete_then_get_misses() {
    let tmp = tempfile::tempdir().unwrap();
    let (server, client_port) = start_single_node(&tmp).await;

    let client = KvClient::connect("127.0.0.1", client_port, ClientOptions::default())
        .await
        .unwrap();

    assert!(client.put(b"k", b"v").await.unwrap().is_success());
    assert!(client.delete(b"k").await.unwrap().is_success());

    let read = client.get(b"k").await.unwrap();
    assert_eq!(read.value, None);
    assert_ne!(read.rc, 0);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn update_of_absent_key_is_accepted_but_not_successful() {
    let tmp = tempfile::tempdir().unwrap();
    let (server, client_port) = start_single_node(&tmp).await;

    let client = KvClient::connect("127.0.0.1", client_port, ClientOptions::default())
        .await
        .unwrap();

    let result = client.update(b"absent", b"v").await.unwrap();
    assert!(result.was_accepted(), "raft must commit the update");
    assert_ne!(result.engine_rc, 0, "engine must reject the absent key");

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn cluster_queries_and_cache_admin_work_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    let (server, client_port) = start_single_node(&tmp).await;

    let client = KvClient::connect(
        "127.0.0.1",
        client_port,
        ClientOptions {
            read_algorithm: ReadAlgorithm::RoundRobin,
            ..ClientOptions::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(client.leader_id_with_backoff().await.unwrap(), 1);

    let servers = client.all_servers().await.unwrap();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].id, 1);
    assert_eq!(servers[0].client_endpoint, format!("127.0.0.1:{client_port}"));

    let dump_dir = tempfile::tempdir().unwrap();
    client
        .trigger_cache_dumps(&dump_dir.path().to_string_lossy())
        .await;
    assert!(dump_dir.path().join("engine-stats.txt").exists());
    client.trigger_cache_clear().await;

    server.shutdown().await;
}
