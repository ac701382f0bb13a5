//! Knock client.
//!
//! Sends a knock sequence to a gate: one TCP connect per port, closed
//! immediately. A refused or timed-out connect still counts as a sent knock,
//! because the gate only needs the connection attempt to reach its accept
//! loop.

use std::fmt;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::ClientError;

/// Default delay after each knock.
pub const DEFAULT_DELAY: Duration = Duration::from_millis(300);

/// Default connect timeout for a single knock.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Connect timeout for the protected-port check.
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// What happened to one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum PortStatus {
    /// The connection was accepted.
    Open,
    /// The host answered with a reset.
    Refused,
    /// No answer within the timeout.
    TimedOut,
    /// Any other connect error.
    Unreachable(String),
}

impl PortStatus {
    /// Whether a connection was established.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("open"),
            Self::Refused => f.write_str("refused"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Unreachable(reason) => write!(f, "unreachable ({reason})"),
        }
    }
}

/// Result of one knock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KnockResult {
    /// Port knocked.
    pub port: u16,
    /// Outcome of the connect.
    #[serde(flatten)]
    pub status: PortStatus,
}

/// Per-port results of a knock sequence.
#[derive(Debug, Clone, Serialize)]
pub struct KnockReport {
    /// Address knocked.
    pub target: IpAddr,
    /// One entry per port, in knock order.
    pub knocks: Vec<KnockResult>,
}

impl KnockReport {
    /// Number of knocks that reached an accept loop.
    #[must_use]
    pub fn accepted(&self) -> usize {
        self.knocks.iter().filter(|k| k.status.is_open()).count()
    }
}

/// Sends knock sequences to one target.
#[derive(Debug, Clone)]
pub struct KnockClient {
    target: IpAddr,
    delay: Duration,
    connect_timeout: Duration,
}

impl KnockClient {
    /// Creates a client for `target` with default timings.
    #[must_use]
    pub const fn new(target: IpAddr) -> Self {
        Self {
            target,
            delay: DEFAULT_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Sets the pause after each knock.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the connect timeout for each knock.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Address this client knocks on.
    #[must_use]
    pub const fn target(&self) -> IpAddr {
        self.target
    }

    /// Knocks once on `port`.
    pub async fn knock(&self, port: u16) -> KnockResult {
        let status = connect(SocketAddr::new(self.target, port), self.connect_timeout).await;
        debug!(target = %self.target, port, %status, "knock sent");
        KnockResult { port, status }
    }

    /// Knocks on every port in order, pausing after each knock.
    pub async fn knock_sequence(&self, ports: &[u16]) -> KnockReport {
        info!(target = %self.target, sequence = ?ports, delay = ?self.delay, "knocking");
        let mut knocks = Vec::with_capacity(ports.len());
        for &port in ports {
            knocks.push(self.knock(port).await);
            tokio::time::sleep(self.delay).await;
        }
        KnockReport {
            target: self.target,
            knocks,
        }
    }
}

/// Resolves a host name or address literal to the first address found.
///
/// # Errors
///
/// Returns [`ClientError::Resolve`] if the lookup fails or yields nothing.
pub async fn resolve(target: &str) -> Result<IpAddr, ClientError> {
    if let Ok(addr) = target.parse::<IpAddr>() {
        return Ok(addr);
    }
    let mut addrs = tokio::net::lookup_host((target, 0))
        .await
        .map_err(|e| ClientError::Resolve {
            target: target.to_string(),
            reason: e.to_string(),
        })?;
    addrs
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| ClientError::Resolve {
            target: target.to_string(),
            reason: "no addresses found".to_string(),
        })
}

/// Attempts one connection to `target:port`.
pub async fn check_port(target: IpAddr, port: u16, timeout: Duration) -> PortStatus {
    connect(SocketAddr::new(target, port), timeout).await
}

async fn connect(addr: SocketAddr, timeout: Duration) -> PortStatus {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            drop(stream);
            PortStatus::Open
        }
        Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => PortStatus::Refused,
        Ok(Err(e)) if e.kind() == ErrorKind::TimedOut => PortStatus::TimedOut,
        Ok(Err(e)) => PortStatus::Unreachable(e.to_string()),
        Err(_) => PortStatus::TimedOut,
    }
}
