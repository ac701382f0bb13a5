//! CLI argument definitions
//!
//! All Clap derive structs for `knockgate` command-line parsing.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use crate::config::schema::{DurationValue, FirewallBackend};
use crate::observability::LogFormat;

// ============================================================================
// Root CLI
// ============================================================================

/// Port-knocking gate: opens a protected port to sources that knock the
/// right sequence.
#[derive(Parser, Debug)]
#[command(name = "knockgate", author, version, about)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all non-error output.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Color output control.
    #[arg(long, default_value = "auto", global = true, env = "KNOCKGATE_COLOR")]
    pub color: ColorChoice,

    /// Log output format.
    #[arg(
        long,
        default_value = "human",
        global = true,
        env = "KNOCKGATE_LOG_FORMAT"
    )]
    pub log_format: LogFormat,
}

// ============================================================================
// Top-Level Commands
// ============================================================================

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run or check the knock gate server.
    Server(ServerCommand),

    /// Send a knock sequence to a gate.
    Knock(KnockArgs),

    /// Generate shell completion scripts.
    Completions(CompletionsArgs),

    /// Display version and build information.
    Version(VersionArgs),
}

// ============================================================================
// Server Command
// ============================================================================

/// Server management commands.
#[derive(Args, Debug)]
pub struct ServerCommand {
    /// Server subcommand.
    #[command(subcommand)]
    pub subcommand: ServerSubcommand,
}

/// Server subcommands.
#[derive(Subcommand, Debug)]
pub enum ServerSubcommand {
    /// Start the knock gate.
    Run(ServerRunArgs),

    /// Validate configuration files without starting the server.
    Validate(ServerValidateArgs),
}

/// Arguments for `server run`.
///
/// Flags override the matching configuration file values.
#[derive(Args, Debug, Default)]
pub struct ServerRunArgs {
    /// Path to YAML configuration file.
    #[arg(short, long, env = "KNOCKGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Knock ports in order, comma separated.
    #[arg(long, value_delimiter = ',', env = "KNOCKGATE_SEQUENCE")]
    pub sequence: Option<Vec<u16>>,

    /// Maximum time from first to last knock (e.g. `10s`, `1m`, `2.5`).
    #[arg(long, env = "KNOCKGATE_WINDOW")]
    pub window: Option<DurationValue>,

    /// Port opened for sources that complete the sequence.
    #[arg(long, env = "KNOCKGATE_PROTECTED_PORT")]
    pub protected_port: Option<u16>,

    /// Local address the knock listeners bind to.
    #[arg(long, env = "KNOCKGATE_BIND")]
    pub bind: Option<IpAddr>,

    /// Firewall backend.
    #[arg(long, env = "KNOCKGATE_FIREWALL")]
    pub firewall: Option<FirewallBackend>,

    /// Write the JSONL event stream to this file instead of stderr.
    #[arg(long, env = "KNOCKGATE_EVENTS_FILE")]
    pub events_file: Option<PathBuf>,

    /// Serve Prometheus metrics on `127.0.0.1:<port>`.
    #[arg(long, env = "KNOCKGATE_METRICS_PORT")]
    pub metrics_port: Option<u16>,
}

/// Arguments for `server validate`.
#[derive(Args, Debug)]
pub struct ServerValidateArgs {
    /// Configuration files to validate.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Output format.
    #[arg(short, long, default_value = "human")]
    pub format: OutputFormat,

    /// Treat warnings as errors.
    #[arg(long)]
    pub strict: bool,
}

// ============================================================================
// Knock Command
// ============================================================================

/// Arguments for `knock`.
#[derive(Args, Debug)]
pub struct KnockArgs {
    /// Target host name or address.
    #[arg(short, long)]
    pub target: String,

    /// Knock ports in order, comma separated.
    #[arg(long, value_delimiter = ',', default_value = "1234,5678,9012")]
    pub sequence: Vec<u16>,

    /// Pause after each knock.
    #[arg(long, default_value = "300ms")]
    pub delay: DurationValue,

    /// Protected port checked by `--check`.
    #[arg(long, default_value_t = 2222)]
    pub protected_port: u16,

    /// Check the protected port after knocking.
    #[arg(long)]
    pub check: bool,

    /// Connect timeout for each knock.
    #[arg(long, default_value = "1s")]
    pub connect_timeout: DurationValue,

    /// Output format.
    #[arg(short, long, default_value = "human")]
    pub format: OutputFormat,
}

// ============================================================================
// Utility Commands
// ============================================================================

/// Arguments for shell completion generation.
#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Target shell for completion script.
    pub shell: Shell,
}

/// Arguments for version display.
#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Output format.
    #[arg(short, long, default_value = "human")]
    pub format: OutputFormat,
}

// ============================================================================
// CLI-Local Enums
// ============================================================================

/// Color output choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ColorChoice {
    /// Auto-detect terminal support.
    #[default]
    Auto,
    /// Always use color.
    Always,
    /// Never use color.
    Never,
}

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output.
    #[default]
    Human,
    /// JSON output.
    Json,
}

/// Supported shells for completion generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Shell {
    /// Bash shell.
    Bash,
    /// Zsh shell.
    Zsh,
    /// Fish shell.
    Fish,
    /// `PowerShell`.
    #[value(name = "powershell")]
    PowerShell,
    /// Elvish shell.
    Elvish,
}

// ============================================================================
// Tests
// ============================================================================
