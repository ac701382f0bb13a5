//! Configuration validation
//!
//! Semantic checks run on a fully deserialized [`GateConfig`] once every
//! default and CLI override has been applied.
//!
//! Validation collects ALL issues instead of stopping at the first one, so a
//! single run of `knockgate server validate` reports everything wrong with a
//! file.

use std::collections::HashSet;
use std::time::Duration;

use crate::config::schema::GateConfig;
use crate::error::{Severity, ValidationIssue};

/// Windows shorter than this are almost impossible to knock over a WAN.
const SHORT_WINDOW: Duration = Duration::from_secs(1);

/// Windows longer than this let stale attempts linger.
const LONG_WINDOW: Duration = Duration::from_secs(3600);

// ============================================================================
// Public API
// ============================================================================

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Validation errors (prevent loading).
    pub errors: Vec<ValidationIssue>,

    /// Validation warnings (informational).
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Returns `true` if there are any errors.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Returns `true` if validation passed (no errors).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Configuration validator.
#[derive(Debug, Default)]
pub struct Validator {
    errors: Vec<ValidationIssue>,
    warnings: Vec<ValidationIssue>,
}

impl Validator {
    /// Creates a new validator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates a complete gate configuration with defaults resolved.
    pub fn validate(&mut self, config: &GateConfig) -> ValidationResult {
        self.errors.clear();
        self.warnings.clear();

        self.check_sequence(&config.sequence(), config.window(), config.protected_port());

        if config.sweep_interval().is_zero() {
            self.add_error("sweep_interval", "Sweep interval must be greater than zero");
        }

        let firewall = config.firewall();
        if firewall.binary().trim().is_empty() {
            self.add_error("firewall.binary", "Firewall binary cannot be empty");
        }
        if firewall.chain().trim().is_empty() {
            self.add_error("firewall.chain", "Firewall chain cannot be empty");
        }
        if firewall.timeout().is_zero() {
            self.add_error("firewall.timeout", "Firewall timeout must be greater than zero");
        }

        self.finish()
    }

    /// Validates only the knock sequence, window and protected port.
    pub fn validate_sequence(
        &mut self,
        sequence: &[u16],
        window: Duration,
        protected_port: u16,
    ) -> ValidationResult {
        self.errors.clear();
        self.warnings.clear();
        self.check_sequence(sequence, window, protected_port);
        self.finish()
    }

    // ========================================================================
    // Checks
    // ========================================================================

    fn check_sequence(&mut self, sequence: &[u16], window: Duration, protected_port: u16) {
        if sequence.len() < 2 {
            self.add_error(
                "sequence",
                &format!(
                    "Sequence must contain at least 2 ports, found {}",
                    sequence.len()
                ),
            );
        }

        let mut seen = HashSet::new();
        for (i, &port) in sequence.iter().enumerate() {
            let path = format!("sequence[{i}]");
            if port == 0 {
                self.add_error(&path, "Knock port cannot be 0");
            }
            if !seen.insert(port) {
                self.add_error(&path, &format!("Duplicate knock port {port}"));
            }
            if port == protected_port && port != 0 {
                self.add_error(
                    &path,
                    &format!("Knock port {port} is the protected port"),
                );
            }
        }

        if protected_port == 0 {
            self.add_error("protected_port", "Protected port cannot be 0");
        }

        if window.is_zero() {
            self.add_error("window", "Window must be greater than zero");
        } else if window < SHORT_WINDOW {
            self.add_warning(
                "window",
                &format!(
                    "Window of {} is very short; knocks over slow links may not complete",
                    humantime::format_duration(window)
                ),
            );
        } else if window > LONG_WINDOW {
            self.add_warning(
                "window",
                &format!(
                    "Window of {} is unusually long",
                    humantime::format_duration(window)
                ),
            );
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn finish(&mut self) -> ValidationResult {
        ValidationResult {
            errors: std::mem::take(&mut self.errors),
            warnings: std::mem::take(&mut self.warnings),
        }
    }

    fn add_error(&mut self, path: &str, message: &str) {
        self.errors.push(ValidationIssue {
            path: path.to_string(),
            message: message.to_string(),
            severity: Severity::Error,
        });
    }

    fn add_warning(&mut self, path: &str, message: &str) {
        self.warnings.push(ValidationIssue {
            path: path.to_string(),
            message: message.to_string(),
            severity: Severity::Warning,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{DurationValue, FirewallConfig};

    fn validate(config: &GateConfig) -> ValidationResult {
        Validator::new().validate(config)
    }

    #[test]
    fn default_config_is_valid() {
        let result = validate(&GateConfig::default());
        assert!(result.is_valid(), "{:?}", result.errors);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn collects_every_issue() {
        let config = GateConfig {
            sequence: Some(vec![0, 2222, 2222]),
            window: Some(DurationValue(Duration::ZERO)),
            protected_port: Some(2222),
            sweep_interval: Some(DurationValue(Duration::ZERO)),
            firewall: Some(FirewallConfig {
                binary: Some("  ".to_string()),
                ..FirewallConfig::default()
            }),
            ..GateConfig::default()
        };
        let result = validate(&config);
        let paths: Vec<&str> = result.errors.iter().map(|e| e.path.as_str()).collect();

        assert!(paths.contains(&"sequence[0]"));
        assert!(paths.contains(&"sequence[1]"));
        assert!(paths.contains(&"sequence[2]"));
        assert!(paths.contains(&"window"));
        assert!(paths.contains(&"sweep_interval"));
        assert!(paths.contains(&"firewall.binary"));
    }

    #[test]
    fn short_sequence_is_an_error() {
        let result = Validator::new().validate_sequence(&[1234], Duration::from_secs(5), 2222);
        assert!(result.has_errors());
        assert_eq!(result.errors[0].path, "sequence");
    }

    #[test]
    fn duplicate_port_reported_once_at_repeat() {
        let result =
            Validator::new().validate_sequence(&[1234, 5678, 1234], Duration::from_secs(5), 2222);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].path, "sequence[2]");
    }

    #[test]
    fn protected_port_zero_is_an_error() {
        let result = Validator::new().validate_sequence(&[1, 2], Duration::from_secs(5), 0);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].path, "protected_port");
    }

    #[test]
    fn extreme_windows_warn() {
        let short =
            Validator::new().validate_sequence(&[1, 2], Duration::from_millis(200), 3);
        assert!(short.is_valid());
        assert_eq!(short.warnings.len(), 1);

        let long = Validator::new().validate_sequence(&[1, 2], Duration::from_secs(7200), 3);
        assert!(long.is_valid());
        assert_eq!(long.warnings.len(), 1);
    }
}
