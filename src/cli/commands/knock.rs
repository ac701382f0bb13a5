//! Knock command handler
//!
//! Implements `knock`: send a sequence, optionally check the protected port.

use serde_json::json;

use crate::cli::args::{KnockArgs, OutputFormat};
use crate::client::{self, CHECK_TIMEOUT, KnockClient};
use crate::error::{ClientError, KnockGateError};

/// Send a knock sequence to the target.
///
/// # Errors
///
/// Returns a usage error for an empty sequence, a client error if the
/// target cannot be resolved, or [`ClientError::ProtectedPortClosed`] when
/// `--check` finds the protected port unreachable.
pub async fn run(args: &KnockArgs) -> Result<(), KnockGateError> {
    if args.sequence.is_empty() {
        return Err(KnockGateError::Usage(
            "--sequence needs at least one port".to_string(),
        ));
    }

    let target = client::resolve(&args.target).await?;
    let knock_client = KnockClient::new(target)
        .with_delay(args.delay.get())
        .with_connect_timeout(args.connect_timeout.get());

    let report = knock_client.knock_sequence(&args.sequence).await;

    let check = if args.check {
        Some(client::check_port(target, args.protected_port, CHECK_TIMEOUT).await)
    } else {
        None
    };

    match args.format {
        OutputFormat::Human => {
            let total = report.knocks.len();
            for (i, knock) in report.knocks.iter().enumerate() {
                println!("[{}/{total}] knocked {target}:{} ({})", i + 1, knock.port, knock.status);
            }
            if let Some(ref status) = check {
                println!("protected port {}: {status}", args.protected_port);
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "target": report.target,
                "knocks": report.knocks,
                "check": check.as_ref().map(|status| json!({
                    "port": args.protected_port,
                    "status": status,
                })),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    match check {
        Some(status) if !status.is_open() => Err(ClientError::ProtectedPortClosed {
            target: args.target.clone(),
            port: args.protected_port,
        }
        .into()),
        _ => Ok(()),
    }
}
