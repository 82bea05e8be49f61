//! IPC protocol definitions for the control socket
//!
//! Newline-delimited JSON commands and responses exchanged with the
//! daemon over a Unix domain socket.

use serde::{Deserialize, Serialize};

use crate::prefetch::PrefetchStatus;
use crate::stats::StatsSnapshot;

/// Protocol version for future compatibility
pub const PROTOCOL_VERSION: u32 = 1;

/// Commands sent by control clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    /// Pull a whole file through the cache
    #[serde(rename_all = "camelCase")]
    Warm {
        /// Remote URL or origin path
        url: String,
    },
    /// Get live prefetches and cache statistics
    GetStatus,
    /// Run one purge sweep now
    Purge,
}

/// Responses sent back by the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
    /// Success response
    #[serde(rename_all = "camelCase")]
    Success {
        /// Optional success message
        message: Option<String>,
    },
    /// Error response
    #[serde(rename_all = "camelCase")]
    Error {
        /// Error message
        error: String,
    },
    /// Status response with daemon state
    #[serde(rename_all = "camelCase")]
    Status {
        /// Protocol version
        version: u32,
        /// Whether daemon is healthy
        healthy: bool,
        /// Live prefetches
        entries: Vec<PrefetchStatus>,
        /// URLs currently being warmed
        warming: Vec<String>,
        stats: StatsSnapshot,
    },
    /// Result of a purge sweep
    #[serde(rename_all = "camelCase")]
    Purged {
        scanned: usize,
        removed: Vec<String>,
        bytes_freed: u64,
    },
}

/// Parse a JSON command from bytes
pub fn parse_command(data: &[u8]) -> Result<Command, serde_json::Error> {
    serde_json::from_slice(data)
}

/// Serialize a response to JSON bytes
pub fn serialize_response(response: &Response) -> Result<Vec<u8>, serde_json::Error> {
    let mut json = serde_json::to_vec(response)?;
    json.push(b'\n'); // Add newline delimiter
    Ok(json)
}
