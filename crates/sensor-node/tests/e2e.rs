//! End-to-end tests for sensor-node.
//!
//! Runs whole nodes on a shared in-memory bus: discovery, fan-out,
//! self-filtering and cooperative shutdown.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sensor_bus::{ChannelConfig, MemoryHub, MembershipConfig, PeerId, Reading, ReadingError};
use sensor_node::{Node, NodeConfig, NodeReport, NodeState, ReadingSource, SetupError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn config(name: &str) -> NodeConfig {
    NodeConfig {
        node_id: name.parse().unwrap(),
        publish_interval: Duration::from_millis(50),
        poll_timeout: Duration::from_millis(20),
        discovery_grace: Duration::from_millis(150),
        channel: ChannelConfig {
            history_depth: 100,
            membership: MembershipConfig {
                liveness_timeout: Duration::from_millis(500),
                removal_grace: Duration::from_secs(2),
                announce_interval: Duration::from_millis(20),
            },
        },
    }
}

/// Publishes the same values every time, stamped at t=1000.
struct Fixed {
    temperature: f32,
    humidity: f32,
}

impl ReadingSource for Fixed {
    fn next_reading(&mut self, sensor_id: &PeerId) -> Result<Reading, ReadingError> {
        Reading::from_peer(sensor_id.clone(), self.temperature, self.humidity, 1000)
    }
}

/// A node running in the background, with its consumed readings.
struct Running {
    handle: JoinHandle<Result<NodeReport, SetupError>>,
    readings: mpsc::UnboundedReceiver<Reading>,
    state: tokio::sync::watch::Receiver<NodeState>,
}

fn start(hub: &MemoryHub, name: &str, shutdown: &CancellationToken) -> Running {
    let (tx, rx) = mpsc::unbounded_channel();
    let node = Node::new(config(name))
        .with_source(Fixed {
            temperature: 23.5,
            humidity: 41.0,
        })
        .with_sink(tx);
    let state = node.state();
    let handle = tokio::spawn(node.run(Arc::new(hub.join()), shutdown.clone()));
    Running {
        handle,
        readings: rx,
        state,
    }
}

async fn stop(node: Running) -> (NodeReport, Vec<Reading>) {
    let report = timeout(Duration::from_secs(2), node.handle)
        .await
        .expect("node did not stop in time")
        .unwrap()
        .unwrap();
    let mut readings = node.readings;
    let mut seen = Vec::new();
    while let Ok(r) = readings.try_recv() {
        seen.push(r);
    }
    (report, seen)
}

// ==================== Exchange ====================

#[tokio::test]
async fn test_two_nodes_exchange_readings() {
    let hub = MemoryHub::new();
    let shutdown = CancellationToken::new();
    let a = start(&hub, "A", &shutdown);
    let b = start(&hub, "B", &shutdown);

    tokio::time::sleep(Duration::from_millis(600)).await;
    shutdown.cancel();

    let (report_a, seen_a) = stop(a).await;
    let (report_b, seen_b) = stop(b).await;

    let expected = Reading::new("A", 23.5, 41.0, 1000).unwrap();
    assert!(seen_b.contains(&expected), "B never received A's reading");
    assert!(seen_b.iter().all(|r| r.sensor_id() == "A"));
    assert!(seen_a.iter().all(|r| r.sensor_id() == "B"));

    assert!(report_a.published > 0);
    assert!(report_b.received > 0);
    assert_eq!(report_b.received as usize, seen_b.len());
}

#[tokio::test]
async fn test_three_nodes_each_hear_both_others() {
    let hub = MemoryHub::new();
    let shutdown = CancellationToken::new();
    let nodes: Vec<Running> = ["A", "B", "C"]
        .iter()
        .map(|name| start(&hub, name, &shutdown))
        .collect();

    tokio::time::sleep(Duration::from_millis(700)).await;
    shutdown.cancel();

    for (name, node) in ["A", "B", "C"].into_iter().zip(nodes) {
        let (_, seen) = stop(node).await;
        let senders: HashSet<String> = seen.iter().map(|r| r.sensor_id().to_string()).collect();
        let expected: HashSet<String> = ["A", "B", "C"]
            .into_iter()
            .filter(|n| *n != name)
            .map(String::from)
            .collect();
        assert_eq!(senders, expected, "node {}", name);
    }
}

#[tokio::test]
async fn test_late_joiner_gets_fresh_readings() {
    let hub = MemoryHub::new();
    let shutdown = CancellationToken::new();
    let a = start(&hub, "A", &shutdown);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let b = start(&hub, "B", &shutdown);
    tokio::time::sleep(Duration::from_millis(500)).await;
    shutdown.cancel();

    let (report_a, _) = stop(a).await;
    let (_, seen_b) = stop(b).await;
    assert!(!seen_b.is_empty());
    // Only what A published after B joined
    assert!((seen_b.len() as u64) < report_a.published);
}

#[tokio::test]
async fn test_lone_node_keeps_publishing() {
    let hub = MemoryHub::new();
    let shutdown = CancellationToken::new();
    let a = start(&hub, "A", &shutdown);

    tokio::time::sleep(Duration::from_millis(500)).await;
    shutdown.cancel();

    let (report, seen) = stop(a).await;
    assert!(report.published >= 3, "published {}", report.published);
    assert!(seen.is_empty());
}

// ==================== Lifecycle ====================

#[tokio::test]
async fn test_node_reaches_running_then_stopped() {
    let hub = MemoryHub::new();
    let shutdown = CancellationToken::new();
    let mut a = start(&hub, "A", &shutdown);

    timeout(
        Duration::from_secs(1),
        a.state.wait_for(|s| *s == NodeState::Running),
    )
    .await
    .unwrap()
    .unwrap();

    shutdown.cancel();
    let state = a.state.clone();
    stop(a).await;
    assert_eq!(*state.borrow(), NodeState::Stopped);
}

#[tokio::test]
async fn test_shutdown_mid_cycle_is_prompt() {
    let hub = MemoryHub::new();
    let shutdown = CancellationToken::new();
    let mut a = start(&hub, "A", &shutdown);
    let b = start(&hub, "B", &shutdown);

    a.state
        .wait_for(|s| *s == NodeState::Running)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(75)).await;

    let requested = Instant::now();
    shutdown.cancel();
    stop(a).await;
    stop(b).await;
    assert!(requested.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn test_shutdown_during_discovery() {
    let hub = MemoryHub::new();
    let shutdown = CancellationToken::new();
    let mut cfg = config("A");
    cfg.discovery_grace = Duration::from_secs(30);

    let node = Node::new(cfg);
    let mut state = node.state();
    let handle = tokio::spawn(node.run(Arc::new(hub.join()), shutdown.clone()));

    state
        .wait_for(|s| *s == NodeState::Discovering)
        .await
        .unwrap();
    shutdown.cancel();

    let report = timeout(Duration::from_secs(1), handle)
        .await
        .expect("node stuck in discovery")
        .unwrap()
        .unwrap();
    assert_eq!(report.published, 0);
}

#[tokio::test]
async fn test_departed_peer_leaves_bus() {
    let hub = MemoryHub::new();
    let shutdown_b = CancellationToken::new();
    let b = start(&hub, "B", &shutdown_b);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hub.endpoint_count(), 1);

    shutdown_b.cancel();
    stop(b).await;
    assert_eq!(hub.endpoint_count(), 0);
}

// ==================== Setup failures ====================

#[tokio::test]
async fn test_invalid_config_is_setup_error() {
    let hub = MemoryHub::new();
    let mut cfg = config("A");
    cfg.poll_timeout = Duration::ZERO;

    let result = Node::new(cfg)
        .run(Arc::new(hub.join()), CancellationToken::new())
        .await;
    assert!(matches!(result, Err(SetupError::Config(_))));
}
