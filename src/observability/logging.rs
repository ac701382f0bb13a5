//! Logging initialization for `knockgate`.
//!
//! Structured logging via `tracing` with human-readable and JSON output
//! formats. The `-v` count picks a filter scoped to this crate so dependency
//! chatter stays at `warn`; `KNOCKGATE_LOG_LEVEL` replaces the filter
//! entirely when it parses.
//!
//! Grant decisions and firewall rule changes are logged at `info` even
//! without `-v`: they are the audit trail of who was let through.

use std::io::IsTerminal;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::cli::args::ColorChoice;

/// Environment variable that overrides the verbosity flags.
pub const LOG_LEVEL_ENV: &str = "KNOCKGATE_LOG_LEVEL";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable format with optional ANSI colors.
    #[default]
    Human,
    /// Newline-delimited JSON for machine consumption.
    Json,
}

/// Maps a verbosity level to the default filter directives.
///
/// | `-v` | directives |
/// |------|------------|
/// | 0 | `warn`, grants and firewall changes at `info` |
/// | 1 | `knockgate=info` |
/// | 2 | `knockgate=debug` (per-knock progress) |
/// | 3+ | `knockgate=trace`, dependencies at `debug` |
#[must_use]
pub const fn verbosity_to_directives(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn,knockgate::knock::granter=info,knockgate::firewall=info",
        1 => "warn,knockgate=info",
        2 => "warn,knockgate=debug",
        _ => "debug,knockgate=trace",
    }
}

/// Builds the log filter from an optional `KNOCKGATE_LOG_LEVEL` value.
///
/// A blank value counts as unset. A value that does not parse is returned as
/// the second element so it can be reported once logging is up.
#[must_use]
pub fn build_filter(env_value: Option<&str>, verbosity: u8) -> (EnvFilter, Option<String>) {
    let fallback = || EnvFilter::new(verbosity_to_directives(verbosity));

    match env_value.map(str::trim).filter(|v| !v.is_empty()) {
        None => (fallback(), None),
        Some(value) => match EnvFilter::try_new(value) {
            Ok(filter) => (filter, None),
            Err(_) => (fallback(), Some(value.to_string())),
        },
    }
}

/// Initializes the global tracing subscriber.
///
/// If `KNOCKGATE_LOG_LEVEL` is set it takes precedence over `verbosity`.
/// Uses `try_init()` so calling this more than once (e.g. in tests) is safe.
pub fn init_logging(format: LogFormat, verbosity: u8, color: ColorChoice) {
    let env_value = std::env::var(LOG_LEVEL_ENV).ok();
    let (filter, rejected) = build_filter(env_value.as_deref(), verbosity);

    let show_target = verbosity >= 2;

    let use_ansi = match color {
        ColorChoice::Auto => {
            std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none()
        }
        ColorChoice::Always => true,
        ColorChoice::Never => false,
    };

    match format {
        LogFormat::Human => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(use_ansi)
                .with_target(show_target)
                .with_writer(std::io::stderr)
                .try_init();
        }
        LogFormat::Json => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_target(show_target)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }

    if let Some(value) = rejected {
        warn!(
            variable = LOG_LEVEL_ENV,
            value = %value,
            "invalid log filter, using verbosity flags"
        );
    }
}
