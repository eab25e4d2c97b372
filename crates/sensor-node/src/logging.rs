//! Log sink setup.
//!
//! Logs go to `<dir>/<node>.log` when a directory is configured (the file is
//! truncated on start), otherwise to stdout. `RUST_LOG` overrides the
//! default filter.

use crate::error::SetupError;
use sensor_bus::PeerId;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Default filter, respecting `--verbose`.
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "debug,sensor_node=debug,sensor_bus=debug"
    } else {
        "info,sensor_node=info,sensor_bus=info"
    }
}

/// Path of a node's log file inside `dir`.
pub fn log_file_path(dir: &Path, node: &PeerId) -> PathBuf {
    dir.join(format!("{}.log", node))
}

/// Create (or truncate) the node's log file.
pub fn open_log_file(dir: &Path, node: &PeerId) -> Result<(PathBuf, File), SetupError> {
    let path = log_file_path(dir, node);
    let open = || -> std::io::Result<File> {
        std::fs::create_dir_all(dir)?;
        File::create(&path)
    };
    match open() {
        Ok(file) => Ok((path, file)),
        Err(source) => Err(SetupError::Logging { path, source }),
    }
}

/// Install the global subscriber.
///
/// Returns the log file path when logging to a file.
pub fn init(node: &PeerId, log_dir: Option<&Path>, verbose: bool) -> Result<Option<PathBuf>, SetupError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    match log_dir {
        Some(dir) => {
            let (path, file) = open_log_file(dir, node)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .map_err(|e| SetupError::LoggerInit(e.to_string()))?;
            Ok(Some(path))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .try_init()
                .map_err(|e| SetupError::LoggerInit(e.to_string()))?;
            Ok(None)
        }
    }
}
