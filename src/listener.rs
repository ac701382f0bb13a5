//! Knock listener pool.
//!
//! One TCP listener per knock port. Accepting a connection *is* the knock:
//! the stream is dropped immediately without reading a byte, and the peer
//! address is handed to the [`Dispatcher`].

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ListenerError;
use crate::knock::{Dispatcher, KnockEvent};
use crate::observability::metrics;

/// Pause after an accept error before accepting again.
///
/// Errors such as `EMFILE` repeat immediately; without a pause the loop
/// would spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A bound knock listener.
#[derive(Debug)]
struct KnockListener {
    port: u16,
    local_addr: SocketAddr,
    listener: TcpListener,
}

/// All knock listeners, bound together.
#[derive(Debug)]
pub struct ListenerPool {
    listeners: Vec<KnockListener>,
}

impl ListenerPool {
    /// Binds one listener per port on `addr`.
    ///
    /// All-or-nothing: if any port fails to bind, the listeners bound so far
    /// are dropped (closing their sockets) and the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::Bind`] for the first port that could not be
    /// bound.
    pub async fn bind(addr: IpAddr, ports: &[u16]) -> Result<Self, ListenerError> {
        let mut listeners = Vec::with_capacity(ports.len());
        for &port in ports {
            let socket_addr = SocketAddr::new(addr, port);
            let listener = TcpListener::bind(socket_addr)
                .await
                .map_err(|source| ListenerError::Bind {
                    addr: socket_addr,
                    source,
                })?;
            let local_addr = listener.local_addr().map_err(ListenerError::LocalAddr)?;
            debug!(%local_addr, "knock listener bound");
            listeners.push(KnockListener {
                port,
                local_addr,
                listener,
            });
        }
        Ok(Self { listeners })
    }

    /// Wraps listeners that are already bound.
    ///
    /// Each listener's knock port is its local port. Binding to port 0 first
    /// and building the sequence from the assigned ports lets tests run
    /// without fixed ports.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::LocalAddr`] if a listener's address cannot
    /// be read.
    pub fn from_listeners(listeners: Vec<TcpListener>) -> Result<Self, ListenerError> {
        let listeners = listeners
            .into_iter()
            .map(|listener| {
                let local_addr = listener.local_addr().map_err(ListenerError::LocalAddr)?;
                Ok(KnockListener {
                    port: local_addr.port(),
                    local_addr,
                    listener,
                })
            })
            .collect::<Result<Vec<_>, ListenerError>>()?;
        Ok(Self { listeners })
    }

    /// Knock ports, in bind order.
    #[must_use]
    pub fn ports(&self) -> Vec<u16> {
        self.listeners.iter().map(|l| l.port).collect()
    }

    /// Bound local addresses, in bind order.
    #[must_use]
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|l| l.local_addr).collect()
    }

    /// Starts one accept loop per listener.
    ///
    /// Each loop runs until `cancel` fires; its listener socket is closed
    /// when the loop returns.
    #[must_use]
    pub fn spawn(
        self,
        dispatcher: &Arc<Dispatcher>,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        self.listeners
            .into_iter()
            .map(|knock_listener| {
                let dispatcher = Arc::clone(dispatcher);
                let cancel = cancel.clone();
                tokio::spawn(accept_loop(knock_listener, dispatcher, cancel))
            })
            .collect()
    }
}

async fn accept_loop(
    knock_listener: KnockListener,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
) {
    let KnockListener {
        port,
        local_addr,
        listener,
    } = knock_listener;
    info!(%local_addr, port, "listening for knocks");

    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                drop(stream);
                debug!(peer = %peer, port, "knock accepted");
                dispatcher.dispatch(KnockEvent::new(peer.ip(), port, Instant::now()));
            }
            Err(e) => {
                warn!(port, error = %e, "accept failed on knock port");
                metrics::record_accept_error(port);
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                }
            }
        }
    }

    debug!(%local_addr, port, "knock listener stopped");
}
