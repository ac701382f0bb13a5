//! Server runtime.
//!
//! [`KnockServer`] wires the listener pool, dispatcher, expiry sweeper and
//! firewall gateway into a running knock gate.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{KnockGateError, ListenerError};
use crate::firewall::FirewallGateway;
use crate::knock::{Dispatcher, SequenceConfig};
use crate::listener::ListenerPool;
use crate::observability::events::{Event, EventEmitter};

/// Upper bound on waiting for in-flight grants at shutdown.
const GRANT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on waiting for each background task at shutdown.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Options for constructing a [`KnockServer`].
pub struct ServerOptions {
    /// Validated knock configuration.
    pub config: Arc<SequenceConfig>,
    /// Local address the knock listeners bind to.
    pub bind_address: IpAddr,
    /// How often abandoned attempts are purged.
    pub sweep_interval: Duration,
    /// Firewall gateway used for default-deny and grants.
    pub gateway: Arc<dyn FirewallGateway>,
    /// Event emitter for structured events.
    pub events: Arc<EventEmitter>,
    /// Token for cooperative shutdown.
    pub cancel: CancellationToken,
}

/// Knock gate runtime.
pub struct KnockServer {
    config: Arc<SequenceConfig>,
    bind_address: IpAddr,
    sweep_interval: Duration,
    gateway: Arc<dyn FirewallGateway>,
    events: Arc<EventEmitter>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for KnockServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnockServer")
            .field("config", &self.config)
            .field("bind_address", &self.bind_address)
            .field("gateway", &self.gateway.name())
            .finish_non_exhaustive()
    }
}

impl KnockServer {
    /// Creates a server from the given options.
    #[must_use]
    pub fn new(opts: ServerOptions) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&opts.config),
            Arc::clone(&opts.gateway),
            Arc::clone(&opts.events),
        ));
        Self {
            config: opts.config,
            bind_address: opts.bind_address,
            sweep_interval: opts.sweep_interval,
            gateway: opts.gateway,
            events: opts.events,
            dispatcher,
            cancel: opts.cancel,
        }
    }

    /// The dispatcher shared by every accept loop.
    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Binds every knock port on the configured address.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::Bind`] if any knock port cannot be bound.
    pub async fn bind(&self) -> Result<ListenerPool, ListenerError> {
        ListenerPool::bind(self.bind_address, self.config.sequence()).await
    }

    /// Binds the knock ports, closes the protected port and serves until
    /// the cancellation token fires.
    ///
    /// The protected port is only closed once every knock port is bound, so
    /// a failed start never leaves it unreachable with no gate to open it.
    ///
    /// # Errors
    ///
    /// Returns an error if a knock port cannot be bound. Gateway faults are
    /// logged and never returned.
    pub async fn run(&self) -> Result<(), KnockGateError> {
        let pool = match self.bind().await {
            Ok(pool) => pool,
            Err(e) => {
                error!(error = %e, "failed to bind knock listeners");
                self.events.emit(Event::ServerStopped {
                    timestamp: Utc::now(),
                    reason: format!("error: {e}"),
                });
                self.events.flush().await;
                return Err(e.into());
            }
        };

        self.serve(pool).await;
        Ok(())
    }

    /// Closes the protected port and serves on an already bound pool until
    /// the cancellation token fires.
    pub async fn serve(&self, pool: ListenerPool) {
        self.block_protected_port().await;
        self.start(pool).await;
    }

    async fn block_protected_port(&self) {
        let port = self.config.protected_port();
        match self.gateway.block_by_default(port).await {
            Ok(()) => info!(port, gateway = self.gateway.name(), "protected port closed by default"),
            Err(e) => error!(
                port,
                gateway = self.gateway.name(),
                error = %e,
                "failed to close protected port; continuing"
            ),
        }
    }

    async fn start(&self, pool: ListenerPool) {
        let addrs = pool.local_addrs();
        let accept_handles = pool.spawn(&self.dispatcher, &self.cancel);
        let sweeper = self.spawn_sweeper();

        info!(
            listeners = ?addrs,
            protected_port = self.config.protected_port(),
            window = ?self.config.window(),
            "knockgate server started"
        );
        self.events.emit(Event::ServerStarted {
            timestamp: Utc::now(),
            sequence: self.config.sequence().to_vec(),
            protected_port: self.config.protected_port(),
            window_ms: u64::try_from(self.config.window().as_millis()).unwrap_or(u64::MAX),
            firewall: self.gateway.name().to_string(),
        });

        self.cancel.cancelled().await;
        info!("shutting down knockgate server");

        for handle in accept_handles.into_iter().chain(std::iter::once(sweeper)) {
            await_task(handle).await;
        }

        let pending = self.dispatcher.pending_grants();
        if pending > 0 {
            info!(pending, "waiting for in-flight grants");
        }
        self.dispatcher.drain(GRANT_DRAIN_TIMEOUT).await;
        self.dispatcher.tracker().clear();

        self.events.emit(Event::ServerStopped {
            timestamp: Utc::now(),
            reason: "cancelled".to_string(),
        });
        if !self.events.flush().await {
            warn!("event writer did not flush before shutdown");
        }
        let dropped = self.events.dropped_count();
        if dropped > 0 {
            warn!(dropped, "events were dropped because the event writer fell behind");
        }
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let cancel = self.cancel.clone();
        let period = self.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        dispatcher.sweep(Instant::now());
                    }
                }
            }
            debug!("expiry sweeper stopped");
        })
    }
}

async fn await_task(handle: JoinHandle<()>) {
    match tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_cancelled() => {}
        Ok(Err(e)) => warn!(error = %e, "server task panicked"),
        Err(_) => warn!(timeout = ?TASK_SHUTDOWN_TIMEOUT, "server task did not stop in time"),
    }
}
