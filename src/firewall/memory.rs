//! In-memory firewall gateway.
//!
//! Records rules instead of applying them. Backs the `dry-run` backend and
//! every test that needs to observe grants.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::info;

use super::{FirewallGateway, FirewallRule, Result};

/// Gateway that keeps its rule set in memory.
///
/// The rule set is a set: re-applying a rule leaves it unchanged, which is
/// the idempotence every gateway must provide. Per-rule call counts are kept
/// separately so tests can assert how often the core asked for a rule.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    calls: DashMap<FirewallRule, u64>,
    total_calls: AtomicU64,
    log_rules: bool,
}

impl MemoryGateway {
    /// Creates a silent in-memory gateway.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a gateway that logs every rule it would have applied.
    #[must_use]
    pub fn dry_run() -> Self {
        Self {
            log_rules: true,
            ..Self::default()
        }
    }

    fn record(&self, rule: FirewallRule) {
        let mut count = self.calls.entry(rule).or_insert(0);
        *count += 1;
        let first = *count == 1;
        drop(count);
        self.total_calls.fetch_add(1, Ordering::SeqCst);

        if self.log_rules {
            if first {
                info!(%rule, "dry-run: would apply firewall rule");
            } else {
                info!(%rule, "dry-run: firewall rule already present");
            }
        }
    }

    /// Rules currently in effect, in no particular order.
    #[must_use]
    pub fn rules(&self) -> Vec<FirewallRule> {
        self.calls.iter().map(|entry| *entry.key()).collect()
    }

    /// Whether `rule` is in effect.
    #[must_use]
    pub fn contains(&self, rule: &FirewallRule) -> bool {
        self.calls.contains_key(rule)
    }

    /// Whether `source` may reach `port`.
    #[must_use]
    pub fn is_allowed(&self, port: u16, source: IpAddr) -> bool {
        self.contains(&FirewallRule::Accept { port, source })
    }

    /// How many times `allow(port, source)` was called.
    #[must_use]
    pub fn allow_calls(&self, port: u16, source: IpAddr) -> u64 {
        self.calls
            .get(&FirewallRule::Accept { port, source })
            .map_or(0, |count| *count)
    }

    /// Total number of gateway calls of either kind.
    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl FirewallGateway for MemoryGateway {
    async fn block_by_default(&self, port: u16) -> Result<()> {
        self.record(FirewallRule::Drop { port });
        Ok(())
    }

    async fn allow(&self, port: u16, source: IpAddr) -> Result<()> {
        self.record(FirewallRule::Accept { port, source });
        Ok(())
    }

    fn name(&self) -> &'static str {
        if self.log_rules { "dry-run" } else { "memory" }
    }
}
