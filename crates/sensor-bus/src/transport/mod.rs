//! Transport trait for broadcasting bus frames.
//!
//! Implementations:
//! - Memory: in-process hub, every joined endpoint sees every other endpoint's frames
//! - UDP: IPv4 multicast group, one datagram per frame

mod memory;
mod udp;

pub use memory::{MemoryHub, MemoryTransport};
pub use udp::{DEFAULT_GROUP, UdpTransport};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Transport closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A shared broadcast medium.
///
/// A frame passed to `broadcast` reaches every other endpoint on the medium
/// (best effort). Whether the sender also hears its own frame depends on the
/// medium; callers must tolerate both.
///
/// `broadcast` and `recv` may be called concurrently from different tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable description for logs.
    fn describe(&self) -> String;

    /// Send one frame to every endpoint on the medium.
    async fn broadcast(&self, frame: &[u8]) -> Result<()>;

    /// Receive the next frame (blocks until one is available).
    async fn recv(&self) -> Result<Vec<u8>>;

    /// Take a frame that has already arrived, without waiting.
    fn try_recv(&self) -> Result<Option<Vec<u8>>>;

    /// Leave the medium. Further sends fail with `Closed`.
    async fn close(&self) -> Result<()>;
}
