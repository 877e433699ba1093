//! Service lifecycle over an in-process mesh: stabilization, announce and
//! discovery flow, warm start, and graceful leave with replacement
//! suggestions.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use common::{MemoryHost, MemoryMesh};
use fret::rpc::now_ms;
use fret::{
    FretConfig, FretNode, HostRuntime, PeerState, PingRequest, Profile, RpcKind, ServiceEvent,
    ServiceMode,
};

const NETWORK: &str = "lifecycle-net";

fn config(mode: ServiceMode, bootstraps: Vec<String>) -> FretConfig {
    FretConfig {
        network_name: NETWORK.into(),
        mode,
        bootstraps,
        ..FretConfig::default()
    }
}

async fn spawn_node(
    mesh: &Arc<MemoryMesh>,
    id: &str,
    config: FretConfig,
) -> FretNode<MemoryHost> {
    let node = FretNode::new(id, config, mesh.host(id));
    node.start().await.expect("node start");
    node
}

#[tokio::test]
async fn ping_feeds_relevance_and_counters_on_both_sides() {
    let mesh = MemoryMesh::new();
    let node_a = spawn_node(&mesh, "ping-a", config(ServiceMode::Passive, vec![])).await;
    let node_b = spawn_node(&mesh, "ping-b", config(ServiceMode::Passive, vec![])).await;
    node_a.upsert_peer("ping-b").await;

    let response = node_a.ping_peer("ping-b").await.expect("ping");
    assert!(response.ok);

    let entry = node_a.get_peer("ping-b").await.expect("entry");
    assert_eq!(entry.success_count, 1);
    assert!(entry.relevance > 1.0);

    let diag_a = node_a.diagnostics().await;
    assert!(diag_a.pings_sent >= 1);
    let diag_b = node_b.diagnostics().await;
    assert!(diag_b.pings_received >= 1);

    // the pinged side learned about the pinger
    let reverse = node_b.get_peer("ping-a").await;
    assert!(reverse.is_some());
}

#[tokio::test]
async fn snapshot_fetch_merges_third_party_peers() {
    let mesh = MemoryMesh::new();
    let node_a = spawn_node(&mesh, "snap-a", config(ServiceMode::Passive, vec![])).await;
    let node_b = spawn_node(&mesh, "snap-b", config(ServiceMode::Passive, vec![])).await;
    let _node_c = spawn_node(&mesh, "snap-c", config(ServiceMode::Passive, vec![])).await;

    node_b.upsert_peer("snap-c").await;
    node_a.upsert_peer("snap-b").await;

    node_a.fetch_neighbors("snap-b").await.expect("fetch");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(node_a.get_peer("snap-c").await.is_some(), "merged from snapshot");
    let diag = node_a.diagnostics().await;
    assert!(diag.snapshots_merged >= 1);
}

#[tokio::test]
async fn discovery_events_reach_the_application() {
    let mesh = MemoryMesh::new();
    let node = FretNode::new(
        "disco-a",
        config(ServiceMode::Passive, vec!["disco-b".into()]),
        mesh.host("disco-a"),
    );
    let mut events = node.events().expect("first take");
    assert!(node.events().is_none(), "receiver is taken once");
    node.start().await.expect("start");

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event in time")
        .expect("channel open");
    assert_eq!(
        event,
        ServiceEvent::PeerDiscovered {
            id: "disco-b".into()
        }
    );
}

#[tokio::test]
async fn warm_start_restores_peers_disconnected() {
    let mesh = MemoryMesh::new();
    let node_a = spawn_node(&mesh, "warm-a", config(ServiceMode::Passive, vec![])).await;
    for i in 0..6 {
        node_a.upsert_peer(&format!("warm-peer-{i}")).await;
    }

    let table = node_a.export_table().await.expect("export");
    assert_eq!(table.peer_id, "warm-a");
    assert!(table.entries.len() >= 7);

    let node_b = spawn_node(&mesh, "warm-b", config(ServiceMode::Passive, vec![])).await;
    let count = node_b.import_table(table).await;
    assert!(count >= 7);

    for i in 0..6 {
        let entry = node_b
            .get_peer(&format!("warm-peer-{i}"))
            .await
            .expect("restored");
        assert_eq!(entry.state, PeerState::Disconnected);
    }
}

#[tokio::test]
async fn ping_flood_hits_the_token_bucket() {
    let mesh = MemoryMesh::new();
    let node = spawn_node(&mesh, "flood-a", config(ServiceMode::Passive, vec![])).await;
    let client = mesh.host("flood-client");

    let mut saw_busy = false;
    for _ in 0..14 {
        let ping = PingRequest {
            v: 1,
            from: "flood-client".into(),
            timestamp: now_ms(),
            size_estimate: None,
            confidence: None,
        };
        let reply = client
            .request(
                "flood-a",
                &RpcKind::Ping.protocol_id(NETWORK),
                serde_json::to_vec(&ping).unwrap(),
            )
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&reply).unwrap();
        if value["busy"] == Value::Bool(true) {
            assert!(value["retry_after_ms"].as_u64().unwrap() > 0);
            saw_busy = true;
            break;
        }
    }
    assert!(saw_busy, "ping bucket should drain");
    let diag = node.diagnostics().await;
    assert!(diag.rejected.rate_limited >= 1);
}

#[tokio::test]
async fn edge_profile_enforces_smaller_payload_caps() {
    let mesh = MemoryMesh::new();
    let node = spawn_node(
        &mesh,
        "cap-a",
        FretConfig {
            network_name: NETWORK.into(),
            profile: Profile::Edge,
            ..FretConfig::default()
        },
    )
    .await;
    let client = mesh.host("cap-client");

    // 80 KiB body exceeds the edge cap for neighbors (64 KiB)
    let body = vec![b'{'; 80 * 1024];
    let outcome = client
        .request("cap-a", &RpcKind::Neighbors.protocol_id(NETWORK), body)
        .await;
    // the handler answers with its benign empty snapshot
    assert!(outcome.is_ok());
    let diag = node.diagnostics().await;
    assert!(diag.rejected.payload_too_large >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn graceful_leave_clears_the_departed_peer_from_a_line() {
    let mesh = MemoryMesh::new();
    let ids: Vec<String> = (0..6).map(|i| format!("line-{i}")).collect();

    let mut nodes = Vec::new();
    for (i, id) in ids.iter().enumerate() {
        let mut bootstraps = Vec::new();
        if i > 0 {
            bootstraps.push(ids[i - 1].clone());
        }
        if i + 1 < ids.len() {
            bootstraps.push(ids[i + 1].clone());
        }
        let node = spawn_node(&mesh, id, config(ServiceMode::Active, bootstraps)).await;
        nodes.push(node);
    }
    for pair in ids.windows(2) {
        mesh.connect(&pair[0], &pair[1]).await;
    }

    // let stabilization spread knowledge along the line
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let observer = &nodes[1];
    let pre = observer.diagnostics().await;

    nodes[2].stop().await;
    tokio::time::sleep(Duration::from_millis(1500)).await;

    for (i, node) in nodes.iter().enumerate() {
        if i == 2 {
            continue;
        }
        let peers = node.list_peers().await;
        assert!(
            peers.iter().all(|p| p.id != "line-2"),
            "node {} still lists the departed peer",
            ids[i]
        );
    }

    let post = observer.diagnostics().await;
    assert!(
        post.pings_sent > pre.pings_sent,
        "leave recovery and stabilization keep probing"
    );
    assert!(
        post.announcements_sent > pre.announcements_sent,
        "leave recovery re-announces around the gap"
    );
    assert!(post.leave_notices_received >= 1);
}

#[tokio::test]
async fn stop_is_idempotent_and_quiesces_the_handle() {
    let mesh = MemoryMesh::new();
    let node = spawn_node(&mesh, "stop-a", config(ServiceMode::Passive, vec![])).await;
    node.stop().await;
    node.stop().await;
    assert!(node.is_stopped());
    // post-stop queries settle on defaults instead of hanging
    assert!(node.list_peers().await.is_empty());
    assert_eq!(node.diagnostics().await.pings_sent, 0);
}
