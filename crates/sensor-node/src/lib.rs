//! sensor-node: a sensor bus participant.
//!
//! Library exports for the binary and integration tests:
//! - `config`: CLI/environment configuration
//! - `logging`: per-node log file setup
//! - `node`: discovery, publish and consume lifecycle
//! - `source`: reading producers

pub mod config;
pub mod error;
pub mod logging;
pub mod node;
pub mod source;

pub use config::{Args, NodeConfig, TransportKind};
pub use error::SetupError;
pub use node::{Node, NodeReport, NodeState};
pub use source::{RandomReadings, ReadingSource};
