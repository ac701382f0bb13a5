//! Access granter.
//!
//! Turns a completed sequence into exactly one `allow` call on the firewall
//! gateway. Gateway faults are logged, counted and reported as an event;
//! they never reach the listener pool.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};

use crate::firewall::FirewallGateway;
use crate::observability::events::{Event, EventEmitter};
use crate::observability::metrics;

/// Result of a single grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantOutcome {
    /// The gateway confirmed the allow rule.
    Granted,
    /// The gateway failed; the message is the gateway error.
    Failed(String),
}

/// Opens the protected port for sources that completed the sequence.
pub struct AccessGranter {
    gateway: Arc<dyn FirewallGateway>,
    protected_port: u16,
    events: Arc<EventEmitter>,
}

impl std::fmt::Debug for AccessGranter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessGranter")
            .field("gateway", &self.gateway.name())
            .field("protected_port", &self.protected_port)
            .finish_non_exhaustive()
    }
}

impl AccessGranter {
    /// Creates a granter for `protected_port` backed by `gateway`.
    #[must_use]
    pub fn new(
        gateway: Arc<dyn FirewallGateway>,
        protected_port: u16,
        events: Arc<EventEmitter>,
    ) -> Self {
        Self {
            gateway,
            protected_port,
            events,
        }
    }

    /// Asks the gateway to allow `source` on the protected port.
    pub async fn grant(&self, source: IpAddr) -> GrantOutcome {
        let port = self.protected_port;

        match self.gateway.allow(port, source).await {
            Ok(()) => {
                info!(source = %source, port, gateway = self.gateway.name(), "access granted");
                metrics::record_grant(true);
                self.events.emit(Event::AccessGranted {
                    timestamp: Utc::now(),
                    source,
                    port,
                });
                GrantOutcome::Granted
            }
            Err(e) => {
                error!(source = %source, port, error = %e, "failed to grant access");
                metrics::record_grant(false);
                let message = e.to_string();
                self.events.emit(Event::GrantFailed {
                    timestamp: Utc::now(),
                    source,
                    port,
                    error: message.clone(),
                });
                GrantOutcome::Failed(message)
            }
        }
    }
}
