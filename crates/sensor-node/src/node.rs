//! Node lifecycle: discover peers, then publish and consume concurrently.
//!
//! States:
//! - `Starting`: configuration validated, channel opening
//! - `Discovering`: announcing and listening for the discovery grace period
//! - `Running`: publish task and consume task both active
//! - `Stopping`: shutdown requested, tasks winding down
//! - `Stopped`: channel closed
//!
//! Shutdown is cooperative: both tasks watch the same `CancellationToken`
//! and exit at their next wake-up, so latency is bounded by the poll timeout.

use crate::config::NodeConfig;
use crate::error::SetupError;
use crate::source::{RandomReadings, ReadingSource};
use sensor_bus::{Channel, ChannelError, PeerId, Reading, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Starting,
    Discovering,
    Running,
    Stopping,
    Stopped,
}

/// What a node did over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeReport {
    pub published: u64,
    /// Readings from other nodes consumed and logged
    pub received: u64,
    pub publish_failures: u64,
}

pub struct Node {
    config: NodeConfig,
    source: Box<dyn ReadingSource>,
    sink: Option<mpsc::UnboundedSender<Reading>>,
    state: watch::Sender<NodeState>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        let (state, _) = watch::channel(NodeState::Starting);
        Self {
            config,
            source: Box::new(RandomReadings::new()),
            sink: None,
            state,
        }
    }

    /// Replace the synthetic reading source.
    pub fn with_source(mut self, source: impl ReadingSource + 'static) -> Self {
        self.source = Box::new(source);
        self
    }

    /// Forward every consumed reading to `sink` in addition to logging it.
    pub fn with_sink(mut self, sink: mpsc::UnboundedSender<Reading>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Watch lifecycle transitions.
    pub fn state(&self) -> watch::Receiver<NodeState> {
        self.state.subscribe()
    }

    pub fn node_id(&self) -> &PeerId {
        &self.config.node_id
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Errors only during setup; once running, failures are logged and the
    /// loops carry on.
    pub async fn run(
        self,
        transport: Arc<dyn Transport>,
        shutdown: CancellationToken,
    ) -> Result<NodeReport, SetupError> {
        let Node {
            config,
            source,
            sink,
            state,
        } = self;

        config.validate()?;
        let channel = Arc::new(
            Channel::open(config.node_id.clone(), transport, config.channel.clone()).await?,
        );

        state.send_replace(NodeState::Discovering);
        info!(
            "{} discovering peers for {:?}",
            config.node_id, config.discovery_grace
        );
        discover(&channel, &config, &shutdown).await;

        let mut report = NodeReport::default();
        if !shutdown.is_cancelled() {
            state.send_replace(NodeState::Running);
            let peers = channel.alive_peers();
            info!("{} running with {} peer(s)", config.node_id, peers.len());

            let publisher = tokio::spawn(publish_loop(
                channel.clone(),
                source,
                config.publish_interval,
                config.channel.membership.announce_interval,
                shutdown.clone(),
            ));
            let consumer = tokio::spawn(consume_loop(
                channel.clone(),
                sink,
                config.poll_timeout,
                shutdown.clone(),
            ));

            let (published, received) = tokio::join!(publisher, consumer);
            match published {
                Ok((published, failures)) => {
                    report.published = published;
                    report.publish_failures = failures;
                }
                Err(e) => warn!("Publish task ended abnormally: {}", e),
            }
            match received {
                Ok(received) => report.received = received,
                Err(e) => warn!("Consume task ended abnormally: {}", e),
            }
        }

        state.send_replace(NodeState::Stopping);
        info!("{} stopping", config.node_id);
        channel.close().await;
        state.send_replace(NodeState::Stopped);
        info!(
            "{} stopped: published {}, received {}, failed publishes {}",
            config.node_id, report.published, report.received, report.publish_failures
        );
        Ok(report)
    }
}

/// Announce and listen until the grace period ends or shutdown is requested.
///
/// The grace period is a heuristic: peers that show up later are still
/// picked up by the running node.
async fn discover(channel: &Channel, config: &NodeConfig, shutdown: &CancellationToken) {
    let deadline = Instant::now() + config.discovery_grace;
    let heartbeat = config.channel.membership.announce_interval;

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let slice = heartbeat.min(deadline - now);

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            result = channel.pump(slice) => {
                if let Err(e) = result {
                    warn!("Discovery pump failed: {}", e);
                    break;
                }
            }
        }

        if let Err(e) = channel.announce().await {
            debug!("Heartbeat failed during discovery: {}", e);
        }
    }
}

/// Publish one reading per interval and a heartbeat per announce interval.
///
/// Returns (published, failed).
async fn publish_loop(
    channel: Arc<Channel>,
    mut source: Box<dyn ReadingSource>,
    interval: Duration,
    announce_interval: Duration,
    shutdown: CancellationToken,
) -> (u64, u64) {
    let mut publish_tick = tokio::time::interval(interval);
    publish_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heartbeat = tokio::time::interval_at(Instant::now() + announce_interval, announce_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut published = 0;
    let mut failed = 0;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = publish_tick.tick() => {
                let reading = match source.next_reading(channel.local_id()) {
                    Ok(reading) => reading,
                    Err(e) => {
                        warn!("Failed to produce reading: {}", e);
                        failed += 1;
                        continue;
                    }
                };
                match channel.publish(&reading).await {
                    Ok(ack) => {
                        published += 1;
                        info!("[PUBLISHED] {}", reading);
                        debug!("seq {} addressed to {} peer(s)", ack.seq, ack.recipients);
                    }
                    Err(ChannelError::Closed) => break,
                    Err(e) => {
                        failed += 1;
                        warn!("Publish failed: {}", e);
                    }
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = channel.announce().await {
                    debug!("Heartbeat failed: {}", e);
                }
            }
        }
    }
    (published, failed)
}

/// Log (and forward) every reading from other nodes until shutdown.
async fn consume_loop(
    channel: Arc<Channel>,
    sink: Option<mpsc::UnboundedSender<Reading>>,
    poll_timeout: Duration,
    shutdown: CancellationToken,
) -> u64 {
    let mut received = 0;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            result = channel.poll_receive(poll_timeout) => match result {
                Ok(Some(reading)) => {
                    if reading.sensor_id() == channel.local_id() {
                        continue;
                    }
                    received += 1;
                    info!("[RECEIVED] {}", reading);
                    if let Some(sink) = &sink
                        && sink.send(reading).is_err()
                    {
                        debug!("Reading sink dropped");
                    }
                }
                Ok(None) => {}
                Err(ChannelError::Closed) => break,
                Err(e) => warn!("Receive failed: {}", e),
            }
        }
    }
    received
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensor_bus::{ChannelConfig, MemoryHub, MembershipConfig, ReadingError};

    fn quick_config(name: &str) -> NodeConfig {
        NodeConfig {
            node_id: name.parse().unwrap(),
            publish_interval: Duration::from_millis(40),
            poll_timeout: Duration::from_millis(20),
            discovery_grace: Duration::from_millis(100),
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

    /// Always produces the same reading.
    struct Fixed(f32);

    impl ReadingSource for Fixed {
        fn next_reading(&mut self, sensor_id: &PeerId) -> Result<Reading, ReadingError> {
            Reading::from_peer(sensor_id.clone(), self.0, 40.0, 1000)
        }
    }

    /// Always fails.
    struct Broken;

    impl ReadingSource for Broken {
        fn next_reading(&mut self, _: &PeerId) -> Result<Reading, ReadingError> {
            Err(ReadingError::Temperature(f32::NAN))
        }
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let hub = MemoryHub::new();
        let node = Node::new(quick_config("A"));
        assert_eq!(node.node_id(), "A");
        let mut states = node.state();
        assert_eq!(*states.borrow(), NodeState::Starting);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(node.run(Arc::new(hub.join()), shutdown.clone()));

        states
            .wait_for(|s| *s == NodeState::Running)
            .await
            .unwrap();
        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(*states.borrow(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn test_lone_node_keeps_publishing() {
        let hub = MemoryHub::new();
        let node = Node::new(quick_config("A")).with_source(Fixed(22.0));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(node.run(Arc::new(hub.join()), shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(350)).await;
        shutdown.cancel();
        let report = handle.await.unwrap().unwrap();

        assert!(report.published >= 3, "published {}", report.published);
        assert_eq!(report.received, 0);
        assert_eq!(report.publish_failures, 0);
    }

    #[tokio::test]
    async fn test_source_failure_counted_not_fatal() {
        let hub = MemoryHub::new();
        let node = Node::new(quick_config("A")).with_source(Broken);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(node.run(Arc::new(hub.join()), shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(250)).await;
        shutdown.cancel();
        let report = handle.await.unwrap().unwrap();

        assert_eq!(report.published, 0);
        assert!(report.publish_failures >= 1);
    }

    #[tokio::test]
    async fn test_cancel_before_run_skips_running() {
        let hub = MemoryHub::new();
        let node = Node::new(quick_config("A"));
        let states = node.state();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let report = node.run(Arc::new(hub.join()), shutdown).await.unwrap();
        assert_eq!(report, NodeReport::default());
        assert_eq!(*states.borrow(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn test_invalid_config_is_setup_error() {
        let hub = MemoryHub::new();
        let mut config = quick_config("A");
        config.channel.history_depth = 0;

        let result = Node::new(config)
            .run(Arc::new(hub.join()), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(SetupError::Config(_))));
    }

    #[tokio::test]
    async fn test_closed_transport_is_setup_error() {
        let hub = MemoryHub::new();
        let transport = hub.join();
        transport.close().await.unwrap();

        let result = Node::new(quick_config("A"))
            .run(Arc::new(transport), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(SetupError::Channel(_))));
    }
}
