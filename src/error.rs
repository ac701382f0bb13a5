//! Error types for `knockgate`
//!
//! One error enum per domain, aggregated by [`KnockGateError`], which also
//! owns the mapping to process exit codes.

use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// Exit Codes
// ============================================================================

/// Exit codes for `knockgate` CLI operations.
///
/// These codes follow Unix conventions.
pub struct ExitCode;

impl ExitCode {
    /// Successful execution
    pub const SUCCESS: i32 = 0;

    /// General error (e.g. protected port still unreachable after `knock --check`)
    pub const ERROR: i32 = 1;

    /// Configuration error (invalid YAML, validation failure)
    pub const CONFIG_ERROR: i32 = 2;

    /// I/O error (file not found, permission denied)
    pub const IO_ERROR: i32 = 3;

    /// A knock listener could not be bound at startup
    pub const STARTUP_ERROR: i32 = 4;

    /// Firewall gateway error surfaced to the CLI
    pub const GATEWAY_ERROR: i32 = 5;

    /// Usage error (invalid arguments, missing required options)
    pub const USAGE_ERROR: i32 = 64;

    /// Interrupted by SIGINT (Ctrl+C)
    pub const INTERRUPTED: i32 = 130;

    /// Terminated by SIGTERM
    pub const TERMINATED: i32 = 143;
}

// ============================================================================
// Top-Level Error
// ============================================================================

/// Top-level error type for `knockgate` operations.
///
/// Only configuration problems and listener bind failures are expected to
/// reach the process boundary while serving; sequence violations, expiry and
/// gateway faults are absorbed by the dispatcher.
#[derive(Debug, Error)]
pub enum KnockGateError {
    /// Configuration loading or validation error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Listener pool failed to start
    #[error(transparent)]
    Listener(#[from] ListenerError),

    /// Firewall gateway failure
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Knock client failure
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Invalid command-line usage
    #[error("usage error: {0}")]
    Usage(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl KnockGateError {
    /// Returns the appropriate exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Json(_) | Self::Yaml(_) => ExitCode::CONFIG_ERROR,
            Self::Listener(_) => ExitCode::STARTUP_ERROR,
            Self::Gateway(_) => ExitCode::GATEWAY_ERROR,
            Self::Client(_) => ExitCode::ERROR,
            Self::Usage(_) => ExitCode::USAGE_ERROR,
            Self::Io(_) => ExitCode::IO_ERROR,
        }
    }
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// YAML parsing failed
    #[error("parse error in {path}: {message}")]
    ParseError {
        /// Path to the configuration file
        path: PathBuf,
        /// Line number where the error occurred (if available)
        line: Option<usize>,
        /// Error message from the parser
        message: String,
    },

    /// Configuration validation failed
    #[error("validation failed for {path}: {}", format_issues(.errors))]
    ValidationError {
        /// Path to the configuration file (or `<cli>` for flag-only configs)
        path: String,
        /// List of validation issues found
        errors: Vec<ValidationIssue>,
    },

    /// Referenced configuration file not found
    #[error("file not found: {path}")]
    MissingFile {
        /// Path to the missing file
        path: PathBuf,
    },

    /// Field has an invalid value
    #[error("invalid value for '{field}': got '{value}', expected {expected}")]
    InvalidValue {
        /// Name of the field with invalid value
        field: String,
        /// The actual value provided
        value: String,
        /// Description of what was expected
        expected: String,
    },

    /// Environment variable referenced in configuration is not set
    #[error("environment variable '{var}' not set (referenced at {location})")]
    EnvVarNotSet {
        /// Name of the environment variable
        var: String,
        /// Location in the configuration where it was referenced
        location: String,
    },
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ============================================================================
// Validation Types
// ============================================================================

/// A single validation issue found during configuration validation.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Path to the problematic field (e.g., "sequence[2]")
    pub path: String,
    /// Description of the validation issue
    pub message: String,
    /// Severity level of the issue
    pub severity: Severity,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{}: {} at {}", prefix, self.message, self.path)
    }
}

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Error - validation failure that prevents configuration from being used
    Error,
    /// Warning - potential issue that does not prevent configuration loading
    Warning,
}

// ============================================================================
// Listener Errors
// ============================================================================

/// Listener pool errors.
///
/// A bind failure for any knock port is fatal: with one listener missing
/// the sequence can never complete, or worse, completes on a port some other
/// process answers.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Binding a knock port failed
    #[error("failed to bind knock port {addr}: {source}")]
    Bind {
        /// Address that could not be bound
        addr: SocketAddr,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The bound socket could not report its local address
    #[error("failed to read local address of knock listener: {0}")]
    LocalAddr(#[source] std::io::Error),
}

// ============================================================================
// Gateway Errors
// ============================================================================

/// Firewall gateway errors.
///
/// Raised by [`FirewallGateway`](crate::firewall::FirewallGateway)
/// implementations. Apart from the CLI, callers log these and carry on.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The firewall tool is not installed or not on `PATH`
    #[error("firewall tool '{binary}' is unavailable: {reason}")]
    Unavailable {
        /// Binary that could not be executed
        binary: String,
        /// Reason reported by the OS
        reason: String,
    },

    /// The firewall command could not be spawned
    #[error("failed to run firewall command: {0}")]
    SpawnFailed(String),

    /// The firewall command exited unsuccessfully
    #[error("firewall command exited with {code:?}: {stderr}")]
    NonZeroExit {
        /// Exit code, if the process was not killed by a signal
        code: Option<i32>,
        /// Captured stderr
        stderr: String,
    },

    /// The firewall command did not finish in time
    #[error("firewall command timed out after {0:?}")]
    Timeout(std::time::Duration),
}

// ============================================================================
// Client Errors
// ============================================================================

/// Knock client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The target host could not be resolved
    #[error("could not resolve target '{target}': {reason}")]
    Resolve {
        /// Host as given on the command line
        target: String,
        /// Resolver error
        reason: String,
    },

    /// The protected port stayed unreachable after knocking
    #[error("protected port {port} on {target} is not reachable")]
    ProtectedPortClosed {
        /// Target host
        target: String,
        /// Protected port
        port: u16,
    },
}

// ============================================================================
// Result Type Alias
// ============================================================================

/// Result type alias for `knockgate` operations.
pub type Result<T> = std::result::Result<T, KnockGateError>;

// ============================================================================
// Tests
// ============================================================================
