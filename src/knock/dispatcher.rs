//! Knock dispatcher.
//!
//! Every accept loop hands its knocks to one shared [`Dispatcher`]. The
//! state transition runs synchronously under the tracker's shard lock; a
//! completed sequence is handed to the [`AccessGranter`] on its own task so
//! a slow firewall never stalls an accept loop or a shard.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::granter::AccessGranter;
use super::tracker::{KnockOutcome, StateTracker, Step};
use super::{KnockEvent, SequenceConfig};
use crate::firewall::FirewallGateway;
use crate::observability::events::{Event, EventEmitter, ResetReason};
use crate::observability::metrics;

/// Routes knock events through the state tracker and triggers grants.
pub struct Dispatcher {
    tracker: StateTracker,
    granter: Arc<AccessGranter>,
    events: Arc<EventEmitter>,
    grants: TaskTracker,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("tracker", &self.tracker)
            .field("granter", &self.granter)
            .field("pending_grants", &self.grants.len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher enforcing `config` and granting through
    /// `gateway`.
    #[must_use]
    pub fn new(
        config: Arc<SequenceConfig>,
        gateway: Arc<dyn FirewallGateway>,
        events: Arc<EventEmitter>,
    ) -> Self {
        let granter = AccessGranter::new(gateway, config.protected_port(), Arc::clone(&events));
        Self {
            tracker: StateTracker::new(config),
            granter: Arc::new(granter),
            events,
            grants: TaskTracker::new(),
        }
    }

    /// The state tracker owned by this dispatcher.
    #[must_use]
    pub const fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    /// Applies one knock.
    ///
    /// Must be called from within a Tokio runtime: a completing knock spawns
    /// the grant.
    pub fn dispatch(&self, event: KnockEvent) -> KnockOutcome {
        let source = event.source;
        let port = event.port;

        metrics::record_knock(port);
        self.events.emit(Event::KnockReceived {
            timestamp: Utc::now(),
            source,
            port,
        });

        let outcome = self.tracker.apply(&event);

        if let Some(age) = outcome.expired {
            info!(source = %source, age = ?age, "knock sequence expired");
            metrics::record_sequence_reset("expired", 1);
            self.events.emit(Event::SequenceReset {
                timestamp: Utc::now(),
                source,
                reason: ResetReason::Expired,
            });
        }

        match outcome.step {
            Step::Unmatched => {
                debug!(source = %source, port, "knock does not start a sequence");
                metrics::record_unmatched();
            }
            Step::Started => {
                info!(source = %source, port, "knock sequence started");
                metrics::record_sequence_started();
                self.events.emit(Event::SequenceStarted {
                    timestamp: Utc::now(),
                    source,
                });
            }
            Step::Advanced { next_index } => {
                debug!(
                    source = %source,
                    port,
                    progress = next_index,
                    total = self.tracker.config().len(),
                    "knock sequence advanced"
                );
            }
            Step::OutOfOrder { expected, progress } => {
                info!(
                    source = %source,
                    port,
                    expected,
                    progress,
                    "out-of-order knock, sequence reset"
                );
                metrics::record_sequence_reset("out_of_order", 1);
                self.events.emit(Event::SequenceReset {
                    timestamp: Utc::now(),
                    source,
                    reason: ResetReason::OutOfOrder,
                });
            }
            Step::Completed { elapsed } => {
                info!(source = %source, elapsed = ?elapsed, "knock sequence completed");
                metrics::record_sequence_completed(elapsed);
                self.events.emit(Event::SequenceCompleted {
                    timestamp: Utc::now(),
                    source,
                    elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                });

                let granter = Arc::clone(&self.granter);
                self.grants.spawn(async move {
                    granter.grant(source).await;
                });
            }
        }

        metrics::set_tracked_sources(self.tracker.len());
        outcome
    }

    /// Purges abandoned attempts older than the window.
    ///
    /// Returns the number of attempts removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let removed = self.tracker.purge_expired(now);
        if removed > 0 {
            debug!(removed, "purged abandoned knock sequences");
            metrics::record_sequence_reset("swept", u64::try_from(removed).unwrap_or(u64::MAX));
        }
        metrics::set_tracked_sources(self.tracker.len());
        removed
    }

    /// Waits up to `timeout` for in-flight grants to finish.
    ///
    /// Returns `true` when every grant finished in time. Grants dispatched
    /// after the call are still tracked and waited for.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.grants.close();
        let finished = tokio::time::timeout(timeout, self.grants.wait())
            .await
            .is_ok();
        if !finished {
            warn!(
                pending = self.grants.len(),
                timeout = ?timeout,
                "grants still in flight at shutdown"
            );
        }
        self.grants.reopen();
        finished
    }

    /// Number of grants currently in flight.
    #[must_use]
    pub fn pending_grants(&self) -> usize {
        self.grants.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    use tokio::sync::Notify;

    use crate::error::GatewayError;
    use crate::firewall::MemoryGateway;
    use crate::observability::events::tests::TestWriter;

    const DRAIN: Duration = Duration::from_secs(5);

    fn config() -> Arc<SequenceConfig> {
        Arc::new(
            SequenceConfig::new(vec![1234, 5678, 9012], Duration::from_secs(10), 2222).unwrap(),
        )
    }

    fn setup() -> (Dispatcher, Arc<MemoryGateway>, TestWriter) {
        let gateway = Arc::new(MemoryGateway::new());
        let tw = TestWriter::new();
        let dispatcher = Dispatcher::new(
            config(),
            gateway.clone(),
            Arc::new(EventEmitter::new(Box::new(tw.clone()))),
        );
        (dispatcher, gateway, tw)
    }

    fn knock(source: IpAddr, port: u16, base: Instant, secs: u64) -> KnockEvent {
        KnockEvent::new(source, port, base + Duration::from_secs(secs))
    }

    async fn flushed_lines(dispatcher: &Dispatcher, tw: &TestWriter) -> Vec<serde_json::Value> {
        assert!(dispatcher.events.flush().await);
        tw.lines()
    }

    async fn event_types(dispatcher: &Dispatcher, tw: &TestWriter) -> Vec<String> {
        flushed_lines(dispatcher, tw)
            .await
            .iter()
            .map(|l| l["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    const X: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10));
    const Y: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 11));
    const Z: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 12));

    #[tokio::test]
    async fn correct_sequence_grants_once() {
        let (dispatcher, gateway, tw) = setup();
        let t0 = Instant::now();

        dispatcher.dispatch(knock(X, 1234, t0, 0));
        dispatcher.dispatch(knock(X, 5678, t0, 2));
        let outcome = dispatcher.dispatch(knock(X, 9012, t0, 4));
        assert!(outcome.is_complete());
        assert!(dispatcher.drain(DRAIN).await);

        assert_eq!(gateway.allow_calls(2222, X), 1);
        assert_eq!(gateway.total_calls(), 1);
        assert!(dispatcher.tracker().get(&X).is_none());

        let types = event_types(&dispatcher, &tw).await;
        assert!(types.contains(&"SequenceStarted".to_string()));
        assert!(types.contains(&"SequenceCompleted".to_string()));
        assert_eq!(types.last().map(String::as_str), Some("AccessGranted"));
    }

    #[tokio::test]
    async fn late_knock_resets_without_grant() {
        let (dispatcher, gateway, tw) = setup();
        let t0 = Instant::now();

        dispatcher.dispatch(knock(Y, 1234, t0, 0));
        let late = dispatcher.dispatch(knock(Y, 5678, t0, 11));
        assert_eq!(late.expired, Some(Duration::from_secs(11)));
        assert_eq!(late.step, Step::Unmatched);

        let after = dispatcher.dispatch(knock(Y, 9012, t0, 12));
        assert_eq!(after.step, Step::Unmatched);
        assert!(dispatcher.drain(DRAIN).await);

        assert_eq!(gateway.total_calls(), 0);
        assert!(dispatcher.tracker().is_empty());

        let resets: Vec<_> = flushed_lines(&dispatcher, &tw)
            .await
            .into_iter()
            .filter(|l| l["type"] == "SequenceReset")
            .collect();
        assert_eq!(resets.len(), 1);
        assert_eq!(resets[0]["reason"], "expired");
    }

    #[tokio::test]
    async fn wrong_first_knock_is_ignored() {
        let (dispatcher, gateway, _tw) = setup();
        let t0 = Instant::now();

        assert_eq!(dispatcher.dispatch(knock(Z, 5678, t0, 0)).step, Step::Unmatched);
        assert!(dispatcher.tracker().is_empty());

        dispatcher.dispatch(knock(Z, 1234, t0, 1));
        dispatcher.dispatch(knock(Z, 5678, t0, 3));
        dispatcher.dispatch(knock(Z, 9012, t0, 5));
        assert!(dispatcher.drain(DRAIN).await);

        assert_eq!(gateway.allow_calls(2222, Z), 1);
    }

    #[tokio::test]
    async fn out_of_order_knock_emits_reset() {
        let (dispatcher, gateway, tw) = setup();
        let t0 = Instant::now();

        dispatcher.dispatch(knock(X, 1234, t0, 0));
        let outcome = dispatcher.dispatch(knock(X, 9012, t0, 1));
        assert_eq!(
            outcome.step,
            Step::OutOfOrder {
                expected: 5678,
                progress: 1
            }
        );
        assert!(dispatcher.drain(DRAIN).await);
        assert_eq!(gateway.total_calls(), 0);

        let reset = flushed_lines(&dispatcher, &tw)
            .await
            .into_iter()
            .find(|l| l["type"] == "SequenceReset")
            .unwrap();
        assert_eq!(reset["reason"], "out_of_order");
    }

    #[tokio::test]
    async fn repeated_completion_grants_each_time() {
        let (dispatcher, gateway, _tw) = setup();
        let t0 = Instant::now();

        for round in 0..2 {
            let base = round * 20;
            dispatcher.dispatch(knock(X, 1234, t0, base));
            dispatcher.dispatch(knock(X, 5678, t0, base + 1));
            dispatcher.dispatch(knock(X, 9012, t0, base + 2));
        }
        assert!(dispatcher.drain(DRAIN).await);

        // Two allow calls, one rule: the gateway is idempotent.
        assert_eq!(gateway.allow_calls(2222, X), 2);
        assert_eq!(gateway.rules().len(), 1);
    }

    #[tokio::test]
    async fn grant_failure_does_not_affect_other_sources() {
        struct FlakyGateway {
            inner: MemoryGateway,
        }

        #[async_trait::async_trait]
        impl FirewallGateway for FlakyGateway {
            async fn block_by_default(&self, port: u16) -> crate::firewall::Result<()> {
                self.inner.block_by_default(port).await
            }

            async fn allow(&self, port: u16, source: IpAddr) -> crate::firewall::Result<()> {
                if source == X {
                    return Err(GatewayError::Timeout(Duration::from_secs(5)));
                }
                self.inner.allow(port, source).await
            }

            fn name(&self) -> &'static str {
                "flaky"
            }
        }

        let gateway = Arc::new(FlakyGateway {
            inner: MemoryGateway::new(),
        });
        let tw = TestWriter::new();
        let dispatcher = Dispatcher::new(
            config(),
            gateway.clone(),
            Arc::new(EventEmitter::new(Box::new(tw.clone()))),
        );
        let t0 = Instant::now();

        for source in [X, Y] {
            dispatcher.dispatch(knock(source, 1234, t0, 0));
            dispatcher.dispatch(knock(source, 5678, t0, 1));
            dispatcher.dispatch(knock(source, 9012, t0, 2));
        }
        assert!(dispatcher.drain(DRAIN).await);

        assert!(!gateway.inner.is_allowed(2222, X));
        assert!(gateway.inner.is_allowed(2222, Y));

        let types = event_types(&dispatcher, &tw).await;
        assert!(types.contains(&"GrantFailed".to_string()));
        assert!(types.contains(&"AccessGranted".to_string()));
    }

    /// Holds `allow` for one source until released.
    struct ParkedGateway {
        inner: MemoryGateway,
        parked: IpAddr,
        entered: Notify,
        release: Notify,
    }

    #[async_trait::async_trait]
    impl FirewallGateway for ParkedGateway {
        async fn block_by_default(&self, port: u16) -> crate::firewall::Result<()> {
            self.inner.block_by_default(port).await
        }

        async fn allow(&self, port: u16, source: IpAddr) -> crate::firewall::Result<()> {
            if source == self.parked {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.allow(port, source).await
        }

        fn name(&self) -> &'static str {
            "parked"
        }
    }

    #[tokio::test]
    async fn hung_grant_does_not_block_other_sources() {
        let gateway = Arc::new(ParkedGateway {
            inner: MemoryGateway::new(),
            parked: X,
            entered: Notify::new(),
            release: Notify::new(),
        });
        let dispatcher = Dispatcher::new(
            config(),
            gateway.clone(),
            Arc::new(EventEmitter::new(Box::new(TestWriter::new()))),
        );
        let t0 = Instant::now();

        dispatcher.dispatch(knock(X, 1234, t0, 0));
        dispatcher.dispatch(knock(X, 5678, t0, 1));
        assert!(dispatcher.dispatch(knock(X, 9012, t0, 2)).is_complete());
        tokio::time::timeout(DRAIN, gateway.entered.notified())
            .await
            .expect("grant for X never reached the gateway");
        assert_eq!(dispatcher.pending_grants(), 1);

        // X's entry is free while its grant is parked.
        assert_eq!(dispatcher.dispatch(knock(X, 1234, t0, 3)).step, Step::Started);

        dispatcher.dispatch(knock(Y, 1234, t0, 3));
        dispatcher.dispatch(knock(Y, 5678, t0, 4));
        assert!(dispatcher.dispatch(knock(Y, 9012, t0, 5)).is_complete());
        tokio::time::timeout(DRAIN, async {
            while !gateway.inner.is_allowed(2222, Y) || dispatcher.pending_grants() > 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("grant for Y waited on the parked grant");

        assert!(!gateway.inner.is_allowed(2222, X));

        gateway.release.notify_one();
        assert!(dispatcher.drain(DRAIN).await);
        assert_eq!(gateway.inner.allow_calls(2222, X), 1);
        assert_eq!(dispatcher.pending_grants(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sources_each_grant_once() {
        let (dispatcher, gateway, _tw) = setup();
        let dispatcher = Arc::new(dispatcher);
        let t0 = Instant::now();
        let sources: Vec<IpAddr> = (0..300u32)
            .map(|i| IpAddr::V4(Ipv4Addr::from(0x0a01_0000 + i)))
            .collect();

        let mut tasks = tokio::task::JoinSet::new();
        for &source in &sources {
            let dispatcher = Arc::clone(&dispatcher);
            tasks.spawn(async move {
                for (port, secs) in [(1234, 0), (5678, 1), (9012, 2)] {
                    dispatcher.dispatch(knock(source, port, t0, secs));
                    tokio::task::yield_now().await;
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }
        assert!(dispatcher.drain(DRAIN).await);

        for source in &sources {
            assert_eq!(gateway.allow_calls(2222, *source), 1, "source {source}");
        }
        assert_eq!(gateway.total_calls(), 300);
        assert!(dispatcher.tracker().is_empty());
    }

    #[tokio::test]
    async fn sweep_purges_abandoned_attempts() {
        let (dispatcher, _gateway, _tw) = setup();
        let t0 = Instant::now();

        dispatcher.dispatch(knock(X, 1234, t0, 0));
        dispatcher.dispatch(knock(Y, 1234, t0, 8));
        assert_eq!(dispatcher.tracker().len(), 2);

        let removed = dispatcher.sweep(t0 + Duration::from_secs(15));
        assert_eq!(removed, 1);
        assert!(dispatcher.tracker().get(&X).is_none());
        assert!(dispatcher.tracker().get(&Y).is_some());
    }
}
