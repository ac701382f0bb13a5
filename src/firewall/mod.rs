//! Firewall gateway abstraction.
//!
//! The core never touches packet-filter state directly; it talks to a
//! [`FirewallGateway`]. Two implementations ship with the crate:
//! [`IptablesGateway`] for real hosts and [`MemoryGateway`] for dry runs and
//! tests.

pub mod iptables;
pub mod memory;

pub use iptables::IptablesGateway;
pub use memory::MemoryGateway;

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use crate::config::schema::{FirewallBackend, FirewallConfig};
use crate::error::GatewayError;

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Capability to enforce default-deny and per-source allow rules.
///
/// Both operations must be idempotent: applying the same rule twice leaves
/// the firewall in the same state as applying it once.
#[async_trait::async_trait]
pub trait FirewallGateway: Send + Sync {
    /// Drops all TCP traffic to `port` unless a more specific rule allows it.
    async fn block_by_default(&self, port: u16) -> Result<()>;

    /// Allows TCP traffic from `source` to `port`.
    async fn allow(&self, port: u16, source: IpAddr) -> Result<()>;

    /// Short backend name for logs and events.
    fn name(&self) -> &'static str;
}

/// A packet-filter rule as understood by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirewallRule {
    /// Drop every TCP packet to `port`.
    Drop {
        /// Destination port
        port: u16,
    },
    /// Accept TCP packets from `source` to `port`.
    Accept {
        /// Destination port
        port: u16,
        /// Allowed source address
        source: IpAddr,
    },
}

impl FirewallRule {
    /// Destination port of the rule.
    #[must_use]
    pub const fn port(&self) -> u16 {
        match self {
            Self::Drop { port } | Self::Accept { port, .. } => *port,
        }
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drop { port } => write!(f, "tcp dport {port} DROP"),
            Self::Accept { port, source } => write!(f, "tcp dport {port} from {source} ACCEPT"),
        }
    }
}

/// Builds the gateway selected by the configuration.
#[must_use]
pub fn from_config(config: &FirewallConfig) -> Arc<dyn FirewallGateway> {
    match config.backend() {
        FirewallBackend::Iptables => Arc::new(IptablesGateway::new(
            config.binary(),
            config.chain(),
            config.timeout(),
        )),
        FirewallBackend::DryRun => Arc::new(MemoryGateway::dry_run()),
    }
}
