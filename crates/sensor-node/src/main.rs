//! sensor-node: publishes synthetic readings to the bus and logs every
//! reading received from other nodes.

use anyhow::Result;
use clap::Parser;
use sensor_bus::{MemoryHub, PeerId, Transport, UdpTransport};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sensor_node::{Args, Node, NodeConfig, NodeReport, SetupError, TransportKind, logging};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = args.node_config()?;

    if let Some(path) = logging::init(&config.node_id, args.log_dir.as_deref(), args.verbose)? {
        info!("Logging to {}", path.display());
    }

    info!("Starting sensor-node {}", config.node_id);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
            }
            shutdown.cancel();
        });
    }

    let report = run(&args, config, shutdown).await.map_err(|e| {
        error!("Setup failed: {}", e);
        e
    })?;
    info!(
        "Done: published {}, received {}, failed publishes {}",
        report.published, report.received, report.publish_failures
    );
    Ok(())
}

async fn run(
    args: &Args,
    config: NodeConfig,
    shutdown: CancellationToken,
) -> Result<NodeReport, SetupError> {
    match args.transport {
        TransportKind::Udp => {
            let transport: Arc<dyn Transport> = Arc::new(UdpTransport::bind(args.group).await?);
            let node = Node::new(config);
            info!("{} joining {}", node.node_id(), transport.describe());
            node.run(transport, shutdown).await
        }
        TransportKind::Memory => {
            let hub = MemoryHub::new();
            let peers = spawn_simulated_peers(&hub, &config, args.peers, &shutdown)?;
            info!("Simulating {} peer(s) in-process", peers.len());

            let node = Node::new(config);
            let transport: Arc<dyn Transport> = Arc::new(hub.join());
            info!("{} joining {}", node.node_id(), transport.describe());
            let result = node.run(transport, shutdown.clone()).await;

            shutdown.cancel();
            for peer in peers {
                match peer.await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!("Simulated peer failed: {}", e),
                    Err(e) => warn!("Simulated peer task failed: {}", e),
                }
            }
            result
        }
    }
}

/// Start `count` extra nodes on `hub`, named `<node>-sim<i>`.
fn spawn_simulated_peers(
    hub: &MemoryHub,
    config: &NodeConfig,
    count: usize,
    shutdown: &CancellationToken,
) -> Result<Vec<JoinHandle<Result<NodeReport, SetupError>>>, SetupError> {
    let mut handles = Vec::with_capacity(count);
    for i in 1..=count {
        let name: PeerId = format!("{}-sim{}", config.node_id, i).parse()?;
        let node = Node::new(config.for_node(name));
        let transport: Arc<dyn Transport> = Arc::new(hub.join());
        handles.push(tokio::spawn(node.run(transport, shutdown.clone())));
    }
    Ok(handles)
}
