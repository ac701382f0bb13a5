//! `iptables` firewall gateway.
//!
//! Every rule is applied check-then-insert: `-C` checks for an identical rule
//! and the rule is only added when the check fails, so repeated grants never
//! stack duplicate rules. Rule mutation is serialized by a gateway-local
//! mutex; it has nothing to do with the knock state map.

use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{FirewallGateway, FirewallRule, Result};
use crate::error::GatewayError;

const IPTABLES: &str = "iptables";
const IP6TABLES: &str = "ip6tables";

/// Gateway that shells out to `iptables` (and `ip6tables` for IPv6 sources).
#[derive(Debug)]
pub struct IptablesGateway {
    binary: String,
    chain: String,
    timeout: Duration,
    lock: Mutex<()>,
}

impl IptablesGateway {
    /// Creates a gateway running `binary` against `chain`.
    #[must_use]
    pub fn new(binary: impl Into<String>, chain: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            chain: chain.into(),
            timeout,
            lock: Mutex::new(()),
        }
    }

    /// Binary used for rules about `source`.
    ///
    /// With the stock `iptables` binary, IPv6 sources go to `ip6tables`.
    /// A custom binary is used as-is for both families.
    fn binary_for(&self, source: Option<IpAddr>) -> &str {
        match source {
            Some(IpAddr::V6(_)) if self.binary == IPTABLES => IP6TABLES,
            _ => self.binary.as_str(),
        }
    }

    /// Arguments that check for `rule` (`-C`).
    fn check_args(&self, rule: &FirewallRule) -> Vec<String> {
        let mut args = vec!["-C".to_string(), self.chain.clone()];
        args.extend(match_args(rule));
        args
    }

    /// Arguments that add `rule`.
    ///
    /// Accept rules are inserted at the top of the chain so they win over
    /// the default drop; drop rules are appended.
    fn add_args(&self, rule: &FirewallRule) -> Vec<String> {
        let mut args = match rule {
            FirewallRule::Drop { .. } => vec!["-A".to_string(), self.chain.clone()],
            FirewallRule::Accept { .. } => {
                vec!["-I".to_string(), self.chain.clone(), "1".to_string()]
            }
        };
        args.extend(match_args(rule));
        args
    }

    /// Applies `rule` unless it is already present.
    ///
    /// Returns `true` when the rule was added.
    async fn ensure(&self, binary: &str, rule: &FirewallRule) -> Result<bool> {
        let _guard = self.lock.lock().await;

        match self.run(binary, &self.check_args(rule)).await {
            Ok(()) => {
                debug!(%rule, binary, "firewall rule already present");
                return Ok(false);
            }
            // -C exits non-zero when the rule does not exist
            Err(GatewayError::NonZeroExit { .. }) => {}
            Err(e) => return Err(e),
        }

        self.run(binary, &self.add_args(rule)).await?;
        info!(%rule, binary, chain = %self.chain, "firewall rule added");
        Ok(true)
    }

    async fn run(&self, binary: &str, args: &[String]) -> Result<()> {
        debug!(binary, ?args, "running firewall command");

        let child = tokio::process::Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    GatewayError::Unavailable {
                        binary: binary.to_string(),
                        reason: e.to_string(),
                    }
                } else {
                    GatewayError::SpawnFailed(e.to_string())
                }
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| GatewayError::Timeout(self.timeout))?
            .map_err(|e| GatewayError::SpawnFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(GatewayError::NonZeroExit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

fn match_args(rule: &FirewallRule) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        "tcp".to_string(),
        "--dport".to_string(),
        rule.port().to_string(),
    ];
    match rule {
        FirewallRule::Drop { .. } => args.extend(["-j".to_string(), "DROP".to_string()]),
        FirewallRule::Accept { source, .. } => args.extend([
            "-s".to_string(),
            source.to_string(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ]),
    }
    args
}

#[async_trait::async_trait]
impl FirewallGateway for IptablesGateway {
    async fn block_by_default(&self, port: u16) -> Result<()> {
        let rule = FirewallRule::Drop { port };
        self.ensure(&self.binary, &rule).await?;

        // Close the IPv6 side too when running the stock tooling. Hosts
        // without ip6tables only lose the IPv6 half.
        if self.binary == IPTABLES {
            if let Err(e) = self.ensure(IP6TABLES, &rule).await {
                warn!(error = %e, port, "could not apply IPv6 default drop");
            }
        }
        Ok(())
    }

    async fn allow(&self, port: u16, source: IpAddr) -> Result<()> {
        let rule = FirewallRule::Accept { port, source };
        self.ensure(self.binary_for(Some(source)), &rule).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "iptables"
    }
}
