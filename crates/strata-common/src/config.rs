//! Configuration types shared across the workspace.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Disk-cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiskCacheConfig {
    /// Root directory of the chunk cache
    pub path: PathBuf,
    /// Disable to run the manager without memoization
    pub enabled: bool,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./strata-disk-cache"),
            enabled: true,
        }
    }
}

/// Refresh-scheduler configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker sleep granularity in milliseconds. Tests set this to ~1 ms.
    pub wait_duration_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            wait_duration_ms: 5_000,
        }
    }
}

/// TCP front-end configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address for the framed TCP front-end
    pub listen: SocketAddr,
    /// Byte that terminates one request on the wire
    pub request_delimiter: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7878".parse().unwrap(),
            request_delimiter: b';',
        }
    }
}
