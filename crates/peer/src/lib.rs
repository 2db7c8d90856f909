//! Rally Participant
//!
//! Everything a participant runs:
//! - A `PeerTransport` capability, with in-memory and TCP implementations
//! - The mesh manager (one link per peer address)
//! - The session agent (mirror + reconciler, authority events, mesh events)
//! - The authority channel client
//!
//! # Architecture
//!
//! The authority owns membership and status. Once participants know each
//! other's addresses they open direct links and replicate counter and
//! membership changes over them. Whatever arrives, from either path, is
//! folded into the local mirror with the same monotone merge rules, so the
//! order and duplication of deliveries do not matter.

#![deny(unsafe_code)]

pub mod agent;
pub mod authority;
pub mod memory;
pub mod mesh;
pub mod tcp;
pub mod transport;

use std::time::Duration;

use rally_wire::frame::DEFAULT_MAX_FRAME_LEN;
use serde::Deserialize;

pub use agent::{AgentError, AgentHandle, AgentView, SessionAgent};
pub use authority::AuthorityLink;
pub use mesh::{LinkState, MeshEvent, MeshManager};
pub use transport::{PeerLink, PeerTransport, TransportError};

// ============================================================================
// Configuration
// ============================================================================

/// Default per-attempt connect timeout (ms).
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Default number of connect attempts per address.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;

/// Default delay before the first retry (ms). Doubles per retry.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 250;

/// Mesh link configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub connect_timeout_ms: u64,
    pub connect_attempts: u32,
    pub backoff_base_ms: u64,
    pub max_frame_len: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl MeshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_config_defaults() {
        let config = MeshConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.connect_attempts, 3);
        assert_eq!(config.backoff_base(), Duration::from_millis(250));
    }

    #[test]
    fn test_mesh_config_partial_toml() {
        let config: MeshConfig = toml::from_str("connect_attempts = 5").unwrap();
        assert_eq!(config.connect_attempts, 5);
        assert_eq!(config.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS);
    }
}
