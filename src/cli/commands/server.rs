//! Server command handlers
//!
//! Implements `server run` and `server validate`.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::cli::args::{OutputFormat, ServerRunArgs, ServerValidateArgs};
use crate::config::loader::{ConfigLoader, LoadResult, LoadWarning};
use crate::config::schema::{FirewallConfig, GateConfig};
use crate::error::{ConfigError, KnockGateError, Severity, ValidationIssue};
use crate::firewall;
use crate::observability::events::EventEmitter;
use crate::server::{KnockServer, ServerOptions};

/// Label used in errors for configurations built from flags only.
const CLI_LABEL: &str = "<cli>";

/// Start the knock gate.
///
/// # Errors
///
/// Returns a config error if the resolved configuration is invalid, or a
/// listener error if a knock port cannot be bound.
pub async fn run(
    args: &ServerRunArgs,
    quiet: bool,
    cancel: CancellationToken,
) -> Result<(), KnockGateError> {
    if let Some(port) = args.metrics_port {
        crate::observability::init_metrics(Some(port))?;
        tracing::info!(port, "Prometheus metrics endpoint started");
    }

    let loader = ConfigLoader::default();
    let (label, loaded) = if let Some(ref path) = args.config {
        tracing::info!(config = %path.display(), "loading configuration");
        (path.display().to_string(), loader.parse_file(path)?)
    } else {
        (
            CLI_LABEL.to_string(),
            LoadResult {
                config: GateConfig::default(),
                warnings: Vec::new(),
            },
        )
    };

    let loaded = ConfigLoader::validate(
        &label,
        LoadResult {
            config: apply_overrides(loaded.config, args),
            warnings: loaded.warnings,
        },
    )?;
    log_warnings(&loaded.warnings);
    let config = loaded.config;

    let events = if let Some(ref path) = args.events_file {
        EventEmitter::from_file(path)?
    } else if quiet {
        EventEmitter::noop()
    } else {
        EventEmitter::stderr()
    };

    let server = KnockServer::new(ServerOptions {
        config: Arc::new(config.sequence_config()),
        bind_address: config.bind_address(),
        sweep_interval: config.sweep_interval(),
        gateway: firewall::from_config(&config.firewall()),
        events: Arc::new(events),
        cancel,
    });
    server.run().await
}

/// Layers command-line flags over a file configuration.
fn apply_overrides(mut config: GateConfig, args: &ServerRunArgs) -> GateConfig {
    if let Some(ref sequence) = args.sequence {
        config.sequence = Some(sequence.clone());
    }
    if let Some(window) = args.window {
        config.window = Some(window);
    }
    if let Some(port) = args.protected_port {
        config.protected_port = Some(port);
    }
    if let Some(bind) = args.bind {
        config.bind_address = Some(bind);
    }
    if let Some(backend) = args.firewall {
        let firewall = config.firewall.get_or_insert_with(FirewallConfig::default);
        firewall.backend = Some(backend);
    }
    config
}

fn log_warnings(warnings: &[LoadWarning]) {
    for warning in warnings {
        tracing::warn!(
            location = warning.location.as_deref().unwrap_or("<unknown>"),
            "{}",
            warning.message
        );
    }
}

/// Validation outcome for one file.
#[derive(Debug, Serialize)]
struct FileReport {
    file: String,
    valid: bool,
    errors: Vec<String>,
    warnings: Vec<String>,
}

/// Validate configuration files without starting the server.
///
/// Every file is checked and reported; the first failure is returned.
///
/// # Errors
///
/// Returns an I/O error if a file does not exist, or a config error if a
/// file fails to parse or validate (including warnings under `--strict`).
pub fn validate(args: &ServerValidateArgs) -> Result<(), KnockGateError> {
    let loader = ConfigLoader::default();
    let mut reports = Vec::with_capacity(args.files.len());
    let mut failure: Option<KnockGateError> = None;

    for path in &args.files {
        tracing::info!(file = %path.display(), "validating configuration");
        match validate_file(&loader, path, args.strict) {
            Ok(loaded) => {
                log_warnings(&loaded.warnings);
                reports.push(FileReport {
                    file: path.display().to_string(),
                    valid: true,
                    errors: Vec::new(),
                    warnings: loaded.warnings.iter().map(ToString::to_string).collect(),
                });
            }
            Err(e) => {
                reports.push(FileReport {
                    file: path.display().to_string(),
                    valid: false,
                    errors: error_lines(&e),
                    warnings: Vec::new(),
                });
                failure.get_or_insert(e);
            }
        }
    }

    match args.format {
        OutputFormat::Human => {
            for report in &reports {
                if report.valid {
                    println!("{}: valid", report.file);
                } else {
                    println!("{}: invalid", report.file);
                }
                for error in &report.errors {
                    println!("  error: {error}");
                }
                for warning in &report.warnings {
                    println!("  warning: {warning}");
                }
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&reports)?),
    }

    failure.map_or(Ok(()), Err)
}

fn validate_file(
    loader: &ConfigLoader,
    path: &Path,
    strict: bool,
) -> Result<LoadResult, KnockGateError> {
    if !path.exists() {
        return Err(KnockGateError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("file not found: {}", path.display()),
        )));
    }

    let loaded = loader.load(path)?;
    if strict && !loaded.warnings.is_empty() {
        return Err(ConfigError::ValidationError {
            path: path.display().to_string(),
            errors: loaded
                .warnings
                .into_iter()
                .map(|w| ValidationIssue {
                    path: w.location.unwrap_or_default(),
                    message: w.message,
                    severity: Severity::Error,
                })
                .collect(),
        }
        .into());
    }
    Ok(loaded)
}

fn error_lines(error: &KnockGateError) -> Vec<String> {
    match error {
        KnockGateError::Config(ConfigError::ValidationError { errors, .. }) => {
            errors.iter().map(ToString::to_string).collect()
        }
        other => vec![other.to_string()],
    }
}
