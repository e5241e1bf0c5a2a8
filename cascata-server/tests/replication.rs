mod common;

use common::{regional_peer, spawn_node, spawn_node_on, wait_for, NodeOptions};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpListener;

async fn get_version(client: &reqwest::Client, base_url: &str, id: &str) -> Option<u64> {
    let response = client
        .get(format!("{}/contexts/{}/metadata", base_url, id))
        .send()
        .await
        .ok()?;

    if response.status() != 200 {
        return None;
    }

    let metadata: Value = response.json().await.ok()?;
    metadata["version"].as_u64()
}

#[tokio::test]
async fn test_regional_catches_up_and_stays_in_sync() {
    let central = spawn_node(NodeOptions::central()).await;
    let client = reqwest::Client::new();

    for n in 1..=3u64 {
        client
            .put(format!("{}/contexts/c3", central.base_url))
            .json(&json!({"context": {"n": n}}))
            .send()
            .await
            .unwrap();
    }

    let regional = spawn_node(NodeOptions::regional(&central.base_url)).await;

    // Initial catch-up brings the pre-existing context across.
    assert!(
        wait_for(Duration::from_secs(5), || async {
            get_version(&client, &regional.base_url, "c3").await == Some(3)
        })
        .await
    );

    let payload: Value = client
        .get(format!("{}/contexts/c3", regional.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(payload, json!({"n": 3}));

    // A write after the stream is up reaches the regional without another
    // full catch-up cycle.
    client
        .put(format!("{}/contexts/c3", central.base_url))
        .json(&json!({"context": {"n": 4}}))
        .send()
        .await
        .unwrap();

    assert!(
        wait_for(Duration::from_secs(2), || async {
            get_version(&client, &regional.base_url, "c3").await == Some(4)
        })
        .await
    );
}

#[tokio::test]
async fn test_delete_propagates_downstream() {
    let central = spawn_node(NodeOptions::central()).await;
    let client = reqwest::Client::new();

    client
        .put(format!("{}/contexts/doomed", central.base_url))
        .json(&json!({"context": 1}))
        .send()
        .await
        .unwrap();

    let regional = spawn_node(NodeOptions::regional(&central.base_url)).await;
    assert!(
        wait_for(Duration::from_secs(5), || async {
            get_version(&client, &regional.base_url, "doomed").await == Some(1)
        })
        .await
    );

    client
        .delete(format!("{}/contexts/doomed", central.base_url))
        .send()
        .await
        .unwrap();

    assert!(
        wait_for(Duration::from_secs(2), || async {
            let response = client
                .get(format!("{}/contexts/doomed", regional.base_url))
                .send()
                .await
                .unwrap();
            response.status() == 404
        })
        .await
    );
}

#[tokio::test]
async fn test_partial_propagation_never_fails_the_write() {
    // Central knows two regionals: one live, one that went away.
    let central_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let central_url = format!("http://{}", central_listener.local_addr().unwrap());

    let regional = spawn_node(NodeOptions::regional(&central_url)).await;

    let mut options = NodeOptions::central();
    options.peers = vec![
        regional_peer("r1", regional.addr),
        regional_peer("r2-offline", "127.0.0.1:1".parse().unwrap()),
    ];
    let central = spawn_node_on(central_listener, options).await;

    let client = reqwest::Client::new();
    let response = client
        .put(format!("{}/contexts/c4", central.base_url))
        .json(&json!({"context": {"k": 1}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["metadata"]["version"], json!(1));

    // The reachable regional converges despite the dead peer.
    assert!(
        wait_for(Duration::from_secs(5), || async {
            get_version(&client, &regional.base_url, "c4").await == Some(1)
        })
        .await
    );

    // A late-arriving regional catches up on its own.
    let late = spawn_node(NodeOptions::regional(&central.base_url)).await;
    assert!(
        wait_for(Duration::from_secs(5), || async {
            get_version(&client, &late.base_url, "c4").await == Some(1)
        })
        .await
    );
}

#[tokio::test]
async fn test_writes_on_replica_are_forwarded_to_central() {
    let central = spawn_node(NodeOptions::central()).await;
    let regional = spawn_node(NodeOptions::regional(&central.base_url)).await;
    let client = reqwest::Client::new();

    let response = client
        .put(format!("{}/contexts/c5", regional.base_url))
        .json(&json!({"context": {"w": 1}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["metadata"]["version"], json!(1));

    // Central holds the authoritative copy.
    assert_eq!(
        get_version(&client, &central.base_url, "c5").await,
        Some(1)
    );

    // The replica mirrored it immediately, with central's version.
    assert_eq!(
        get_version(&client, &regional.base_url, "c5").await,
        Some(1)
    );

    // Second write through the replica bumps the authoritative version.
    let body: Value = client
        .put(format!("{}/contexts/c5", regional.base_url))
        .json(&json!({"context": {"w": 2}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["metadata"]["version"], json!(2));

    // Deletes forward the same way.
    let response = client
        .delete(format!("{}/contexts/c5", regional.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .get(format!("{}/contexts/c5", central.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let response = client
        .get(format!("{}/contexts/c5", regional.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_replica_reads_survive_upstream_outage() {
    // Upstream that never answers: reads on the replica must keep working.
    let central = spawn_node(NodeOptions::central()).await;
    let client = reqwest::Client::new();

    client
        .put(format!("{}/contexts/kept", central.base_url))
        .json(&json!({"context": {"v": 1}}))
        .send()
        .await
        .unwrap();

    let regional = spawn_node(NodeOptions::regional(&central.base_url)).await;
    assert!(
        wait_for(Duration::from_secs(5), || async {
            get_version(&client, &regional.base_url, "kept").await == Some(1)
        })
        .await
    );

    // Writes against the replica with a dead upstream fail, reads do not.
    let mut orphan_options = NodeOptions::regional("http://127.0.0.1:1");
    orphan_options.sync_interval_ms = 50;
    let orphan = spawn_node(orphan_options).await;

    let response = client
        .put(format!("{}/contexts/x", orphan.base_url))
        .json(&json!({"context": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);

    let response = client
        .get(format!("{}/contexts", orphan.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let ids: Vec<String> = response.json().await.unwrap();
    assert!(ids.is_empty());
}
