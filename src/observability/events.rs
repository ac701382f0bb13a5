//! Structured event stream for `knockgate`.
//!
//! Security-relevant moments of the gate (knocks, resets, grants) as typed
//! events serialized to newline-delimited JSON. Each line carries a
//! monotonically increasing sequence number. Writing happens off the knock
//! path on a dedicated thread.

use std::io::{BufWriter, Write};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::observability::metrics;

// ---------------------------------------------------------------------------
// Event variants
// ---------------------------------------------------------------------------

/// Why an in-progress attempt was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetReason {
    /// A knock arrived on the wrong port for the current position.
    OutOfOrder,
    /// The attempt outlived the window.
    Expired,
}

/// A discrete event emitted while the gate runs.
///
/// Tagged with `"type"` when serialized.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    /// All knock listeners are bound and accepting.
    ServerStarted {
        /// When the server started.
        timestamp: DateTime<Utc>,
        /// Knock ports, in sequence order.
        sequence: Vec<u16>,
        /// Port opened on completion.
        protected_port: u16,
        /// Window in milliseconds.
        window_ms: u64,
        /// Firewall backend name.
        firewall: String,
    },

    /// The server has stopped.
    ServerStopped {
        /// When the server stopped.
        timestamp: DateTime<Utc>,
        /// Human-readable stop reason.
        reason: String,
    },

    /// A connection was accepted on a knock port.
    KnockReceived {
        /// When the knock was accepted.
        timestamp: DateTime<Utc>,
        /// Knocking address.
        source: IpAddr,
        /// Knock port.
        port: u16,
    },

    /// A correct first knock started an attempt.
    SequenceStarted {
        /// When the attempt started.
        timestamp: DateTime<Utc>,
        /// Knocking address.
        source: IpAddr,
    },

    /// An attempt was discarded.
    SequenceReset {
        /// When the reset happened.
        timestamp: DateTime<Utc>,
        /// Knocking address.
        source: IpAddr,
        /// Why the attempt was discarded.
        reason: ResetReason,
    },

    /// A full sequence was knocked in order within the window.
    SequenceCompleted {
        /// When the final knock arrived.
        timestamp: DateTime<Utc>,
        /// Knocking address.
        source: IpAddr,
        /// Time from first to final knock in milliseconds.
        elapsed_ms: u64,
    },

    /// The protected port was opened for a source.
    AccessGranted {
        /// When the gateway confirmed the rule.
        timestamp: DateTime<Utc>,
        /// Address granted access.
        source: IpAddr,
        /// Port opened.
        port: u16,
    },

    /// The gateway failed to open the protected port.
    GrantFailed {
        /// When the failure was observed.
        timestamp: DateTime<Utc>,
        /// Address that completed the sequence.
        source: IpAddr,
        /// Port that should have been opened.
        port: u16,
        /// Gateway error message.
        error: String,
    },
}

// ---------------------------------------------------------------------------
// Envelope (adds sequence number via serde flatten)
// ---------------------------------------------------------------------------

/// Wraps an [`Event`] with a monotonically increasing sequence number.
#[derive(Debug, Serialize)]
struct EventEnvelope {
    /// Zero-based, monotonically increasing sequence counter.
    sequence: u64,
    /// The wrapped event (flattened into the same JSON object).
    #[serde(flatten)]
    event: Event,
}

// ---------------------------------------------------------------------------
// Emitter
// ---------------------------------------------------------------------------

/// Events buffered between the knock path and the writer thread.
pub const DEFAULT_EVENT_CAPACITY: usize = 4096;

/// Upper bound on [`EventEmitter::flush`].
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

enum WriterCommand {
    Event(EventEnvelope),
    Flush(oneshot::Sender<()>),
}

/// Non-blocking JSONL event writer.
///
/// [`emit`](Self::emit) only enqueues; a dedicated thread serializes and
/// writes. When the queue is full (a stalled pipe or slow disk) the event is
/// dropped and counted, so a sink can never hold up a knock. Dropped events
/// leave gaps in the `sequence` numbers of the written lines.
pub struct EventEmitter {
    tx: Option<mpsc::Sender<WriterCommand>>,
    sequence: AtomicU64,
    dropped: AtomicU64,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("sequence", &self.sequence.load(Ordering::Relaxed))
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EventEmitter {
    /// Creates an emitter that writes to the given writer.
    #[must_use]
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self::with_capacity(writer, DEFAULT_EVENT_CAPACITY)
    }

    /// Creates an emitter buffering at most `capacity` pending events.
    #[must_use]
    pub fn with_capacity(writer: Box<dyn Write + Send>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let spawned = std::thread::Builder::new()
            .name("knockgate-events".to_string())
            .spawn(move || write_events(rx, BufWriter::new(writer)));

        let tx = match spawned {
            Ok(_) => Some(tx),
            Err(e) => {
                warn!(error = %e, "could not start event writer; events will be dropped");
                None
            }
        };
        Self {
            tx,
            sequence: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Creates an emitter that writes to stderr.
    #[must_use]
    pub fn stderr() -> Self {
        Self::new(Box::new(std::io::stderr()))
    }

    /// Creates an emitter that silently discards all events.
    #[must_use]
    pub fn noop() -> Self {
        Self {
            tx: None,
            sequence: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Creates an emitter that writes to a file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be created.
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self::new(Box::new(file)))
    }

    /// Queues an event for writing. Never blocks.
    pub fn emit(&self, event: Event) {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let Some(tx) = &self.tx else {
            return;
        };

        let envelope = EventEnvelope {
            sequence: seq,
            event,
        };
        if tx.try_send(WriterCommand::Event(envelope)).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::record_event_dropped();
        }
    }

    /// Waits until every event queued so far has been written and flushed.
    ///
    /// Returns `false` if the writer did not catch up within two seconds.
    pub async fn flush(&self) -> bool {
        let Some(tx) = &self.tx else {
            return true;
        };
        let (ack, done) = oneshot::channel();
        let flushed = async {
            tx.send(WriterCommand::Flush(ack)).await.is_ok() && done.await.is_ok()
        };
        tokio::time::timeout(FLUSH_TIMEOUT, flushed)
            .await
            .unwrap_or(false)
    }

    /// Returns the number of events emitted so far, dropped ones included.
    #[must_use]
    pub fn event_count(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    /// Returns the number of events dropped because the writer fell behind.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Writer thread body. Runs until every sender is gone.
fn write_events(mut rx: mpsc::Receiver<WriterCommand>, mut writer: BufWriter<Box<dyn Write + Send>>) {
    while let Some(command) = rx.blocking_recv() {
        match command {
            WriterCommand::Event(envelope) => {
                if let Ok(line) = serde_json::to_string(&envelope) {
                    let _ = writeln!(writer, "{line}");
                    let _ = writer.flush();
                }
            }
            WriterCommand::Flush(ack) => {
                let _ = writer.flush();
                let _ = ack.send(());
            }
        }
    }
    let _ = writer.flush();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
