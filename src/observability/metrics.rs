//! Metrics collection for `knockgate`.
//!
//! Prometheus-compatible metrics with typed recording functions. Port labels
//! only ever carry configured knock ports, which keeps label cardinality
//! bounded no matter what an attacker sends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::KnockGateError;

/// Guard to prevent double-initialization of the metrics recorder.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initializes the global metrics recorder.
///
/// When `port` is `Some`, a Prometheus HTTP listener is started on
/// `127.0.0.1:<port>`. When `None`, the recorder is installed without
/// an HTTP endpoint.
///
/// # Errors
///
/// Returns `KnockGateError::Io` if the recorder or HTTP listener
/// cannot be installed (e.g. port already in use).
pub fn init_metrics(port: Option<u16>) -> Result<(), KnockGateError> {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        tracing::debug!("metrics already initialized, skipping");
        return Ok(());
    }
    port.map_or_else(
        || PrometheusBuilder::new().install_recorder().map(|_| ()),
        |p| {
            PrometheusBuilder::new()
                .with_http_listener(([127, 0, 0, 1], p))
                .install()
        },
    )
    .map_err(|e| KnockGateError::Io(std::io::Error::other(e.to_string())))?;

    describe_metrics();
    Ok(())
}

/// Registers metric descriptions with the global recorder.
fn describe_metrics() {
    describe_counter!(
        "knockgate_knocks_total",
        "Connections accepted on knock ports"
    );
    describe_counter!(
        "knockgate_unmatched_knocks_total",
        "Knocks from sources with no attempt that did not hit the first port"
    );
    describe_counter!(
        "knockgate_sequences_started_total",
        "Knock attempts started"
    );
    describe_counter!(
        "knockgate_sequences_completed_total",
        "Knock sequences completed in order within the window"
    );
    describe_counter!(
        "knockgate_sequence_resets_total",
        "Knock attempts discarded, by reason"
    );
    describe_counter!(
        "knockgate_grants_total",
        "Firewall grants attempted, by status"
    );
    describe_counter!(
        "knockgate_accept_errors_total",
        "Accept errors on knock listeners"
    );
    describe_counter!(
        "knockgate_events_dropped_total",
        "Events dropped because the event writer fell behind"
    );
    describe_gauge!(
        "knockgate_tracked_sources",
        "Sources with a knock attempt in progress"
    );
    describe_histogram!(
        "knockgate_sequence_duration_ms",
        "Time from first to final knock of completed sequences"
    );
}

/// Records an accepted knock.
pub fn record_knock(port: u16) {
    counter!("knockgate_knocks_total", "port" => port.to_string()).increment(1);
}

/// Records a knock that neither continued nor started an attempt.
pub fn record_unmatched() {
    counter!("knockgate_unmatched_knocks_total").increment(1);
}

/// Records a newly started attempt.
pub fn record_sequence_started() {
    counter!("knockgate_sequences_started_total").increment(1);
}

/// Records a completed sequence and how long it took.
pub fn record_sequence_completed(elapsed: Duration) {
    counter!("knockgate_sequences_completed_total").increment(1);
    histogram!("knockgate_sequence_duration_ms").record(elapsed.as_secs_f64() * 1000.0);
}

/// Records a discarded attempt. `reason` is `"out_of_order"`, `"expired"`
/// or `"swept"`.
pub fn record_sequence_reset(reason: &'static str, count: u64) {
    counter!("knockgate_sequence_resets_total", "reason" => reason).increment(count);
}

/// Records a grant attempt.
pub fn record_grant(success: bool) {
    let status = if success { "success" } else { "error" };
    counter!("knockgate_grants_total", "status" => status).increment(1);
}

/// Records an accept error on a knock listener.
pub fn record_accept_error(port: u16) {
    counter!("knockgate_accept_errors_total", "port" => port.to_string()).increment(1);
}

/// Records an event dropped by a full event queue.
pub fn record_event_dropped() {
    counter!("knockgate_events_dropped_total").increment(1);
}

/// Sets the number of sources with an attempt in progress.
#[allow(clippy::cast_precision_loss)]
pub fn set_tracked_sources(count: usize) {
    gauge!("knockgate_tracked_sources").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        // metrics macros silently no-op when no global recorder is installed
        record_knock(1234);
        record_unmatched();
        record_sequence_started();
        record_sequence_completed(Duration::from_millis(640));
        record_sequence_reset("out_of_order", 1);
        record_sequence_reset("swept", 3);
        record_grant(true);
        record_grant(false);
        record_accept_error(5678);
        record_event_dropped();
        set_tracked_sources(12);
    }
}
