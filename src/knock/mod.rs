//! Knock-sequence core
//!
//! The types shared by the listener pool, the state tracker and the
//! dispatcher. An inbound TCP connection on a knock port *is* the knock;
//! no payload is ever read.

pub mod dispatcher;
pub mod granter;
pub mod tracker;

pub use dispatcher::Dispatcher;
pub use granter::{AccessGranter, GrantOutcome};
pub use tracker::{KnockOutcome, SequenceState, StateTracker, Step};

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::validation::Validator;
use crate::error::ConfigError;

/// Immutable knock configuration.
///
/// Invariants (enforced by [`SequenceConfig::new`] and config validation):
/// at least two distinct non-zero ports, a positive window, and a protected
/// port that is not itself part of the sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceConfig {
    sequence: Arc<[u16]>,
    window: Duration,
    protected_port: u16,
}

impl SequenceConfig {
    /// Creates a validated sequence configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] listing every violated
    /// invariant.
    pub fn new(
        sequence: Vec<u16>,
        window: Duration,
        protected_port: u16,
    ) -> Result<Self, ConfigError> {
        let mut validator = Validator::new();
        let result = validator.validate_sequence(&sequence, window, protected_port);
        if result.has_errors() {
            return Err(ConfigError::ValidationError {
                path: "<sequence>".to_string(),
                errors: result.errors,
            });
        }
        Ok(Self::new_unchecked(sequence, window, protected_port))
    }

    /// Creates a configuration without validating it.
    ///
    /// Used by the config loader, which has already run the full validator.
    #[must_use]
    pub fn new_unchecked(sequence: Vec<u16>, window: Duration, protected_port: u16) -> Self {
        Self {
            sequence: sequence.into(),
            window,
            protected_port,
        }
    }

    /// Ordered knock ports.
    #[must_use]
    pub fn sequence(&self) -> &[u16] {
        &self.sequence
    }

    /// Number of knocks in a full sequence.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    /// Always `false` for a validated configuration.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    /// Port expected at `index`, if any.
    #[must_use]
    pub fn port_at(&self, index: usize) -> Option<u16> {
        self.sequence.get(index).copied()
    }

    /// Maximum time from the first knock to the completing knock.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Port opened once a sequence completes.
    #[must_use]
    pub const fn protected_port(&self) -> u16 {
        self.protected_port
    }
}

/// A single knock: one accepted connection on a knock port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnockEvent {
    /// Peer address of the connection, IPv4-mapped IPv6 folded to IPv4.
    pub source: IpAddr,
    /// Knock port the connection arrived on.
    pub port: u16,
    /// When the connection was accepted.
    pub at: Instant,
}

impl KnockEvent {
    /// Creates a knock event, canonicalizing the source address.
    #[must_use]
    pub fn new(source: IpAddr, port: u16, at: Instant) -> Self {
        Self {
            source: source.to_canonical(),
            port,
            at,
        }
    }
}
