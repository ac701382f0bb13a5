//! Configuration schema types
//!
//! These types are deserialized from the YAML gate configuration. Every field
//! is optional; accessors resolve the defaults so CLI flags can be layered on
//! top of a partially specified file.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::knock::SequenceConfig;

/// Default knock sequence.
pub const DEFAULT_SEQUENCE: [u16; 3] = [1234, 5678, 9012];

/// Default protected port.
pub const DEFAULT_PROTECTED_PORT: u16 = 2222;

/// Default sequence window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

/// Default interval between expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Default timeout for a single firewall command.
pub const DEFAULT_FIREWALL_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Top-Level Configuration
// ============================================================================

/// Root configuration for a `knockgate` server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct GateConfig {
    /// Ordered knock ports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<Vec<u16>>,

    /// Maximum time from first to last knock
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<DurationValue>,

    /// Port opened for a source once its sequence completes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protected_port: Option<u16>,

    /// Local address the knock listeners bind to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<IpAddr>,

    /// How often abandoned sequences are purged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sweep_interval: Option<DurationValue>,

    /// Firewall backend settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firewall: Option<FirewallConfig>,
}

impl GateConfig {
    /// Knock sequence, or the default `[1234, 5678, 9012]`.
    #[must_use]
    pub fn sequence(&self) -> Vec<u16> {
        self.sequence
            .clone()
            .unwrap_or_else(|| DEFAULT_SEQUENCE.to_vec())
    }

    /// Sequence window, or the 10 second default.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window.map_or(DEFAULT_WINDOW, DurationValue::get)
    }

    /// Protected port, or 2222.
    #[must_use]
    pub fn protected_port(&self) -> u16 {
        self.protected_port.unwrap_or(DEFAULT_PROTECTED_PORT)
    }

    /// Listener bind address, or `0.0.0.0`.
    #[must_use]
    pub fn bind_address(&self) -> IpAddr {
        self.bind_address
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    /// Expiry sweep interval, or one second.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
            .map_or(DEFAULT_SWEEP_INTERVAL, DurationValue::get)
    }

    /// Firewall settings with defaults filled in.
    #[must_use]
    pub fn firewall(&self) -> FirewallConfig {
        self.firewall.clone().unwrap_or_default()
    }

    /// Builds the immutable sequence configuration consumed by the core.
    ///
    /// Call only after the configuration passed validation.
    #[must_use]
    pub fn sequence_config(&self) -> SequenceConfig {
        SequenceConfig::new_unchecked(self.sequence(), self.window(), self.protected_port())
    }
}

// ============================================================================
// Firewall
// ============================================================================

/// Which firewall gateway implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FirewallBackend {
    /// Mutate rules with `iptables` / `ip6tables`.
    #[default]
    Iptables,
    /// Log intended rules and keep them in memory only.
    DryRun,
}

impl fmt::Display for FirewallBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Iptables => f.write_str("iptables"),
            Self::DryRun => f.write_str("dry-run"),
        }
    }
}

/// Firewall backend settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct FirewallConfig {
    /// Backend implementation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<FirewallBackend>,

    /// Firewall tool to execute (iptables backend only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,

    /// Chain the rules are placed in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,

    /// Timeout for a single firewall command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<DurationValue>,
}

impl FirewallConfig {
    /// Backend, defaulting to `iptables`.
    #[must_use]
    pub fn backend(&self) -> FirewallBackend {
        self.backend.unwrap_or_default()
    }

    /// Firewall binary, defaulting to `iptables`.
    #[must_use]
    pub fn binary(&self) -> &str {
        self.binary.as_deref().unwrap_or("iptables")
    }

    /// Chain name, defaulting to `INPUT`.
    #[must_use]
    pub fn chain(&self) -> &str {
        self.chain.as_deref().unwrap_or("INPUT")
    }

    /// Command timeout, defaulting to five seconds.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
            .map_or(DEFAULT_FIREWALL_TIMEOUT, DurationValue::get)
    }
}

// ============================================================================
// Durations
// ============================================================================

/// A duration written either as a bare number of seconds (`10`, `0.5`) or as
/// a humantime string (`10s`, `1m 30s`, `250ms`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationValue(pub Duration);

impl DurationValue {
    /// Returns the wrapped duration.
    #[must_use]
    pub const fn get(self) -> Duration {
        self.0
    }

    /// Parses the textual form accepted in config files and CLI flags.
    ///
    /// # Errors
    ///
    /// Returns a human-readable message when the value is neither a
    /// non-negative number of seconds nor a humantime duration.
    pub fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        if let Ok(secs) = text.parse::<f64>() {
            return Self::from_secs_f64(secs);
        }
        humantime::parse_duration(text)
            .map(Self)
            .map_err(|e| format!("invalid duration '{text}': {e}"))
    }

    fn from_secs_f64(secs: f64) -> Result<Self, String> {
        Duration::try_from_secs_f64(secs)
            .map(Self)
            .map_err(|e| format!("invalid duration {secs}: {e}"))
    }
}

impl From<Duration> for DurationValue {
    fn from(value: Duration) -> Self {
        Self(value)
    }
}

impl fmt::Display for DurationValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", humantime::format_duration(self.0))
    }
}

impl std::str::FromStr for DurationValue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for DurationValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DurationValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Whole(u64),
            Fractional(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Whole(secs) => Ok(Self(Duration::from_secs(secs))),
            Raw::Fractional(secs) => Self::from_secs_f64(secs).map_err(serde::de::Error::custom),
            Raw::Text(text) => Self::parse(&text).map_err(serde::de::Error::custom),
        }
    }
}
