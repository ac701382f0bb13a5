//! Shared integration-test harness: runs the `knockgate` binary and sets up
//! loopback knock listeners.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

use serde_json::Value;
use tokio::net::{TcpListener, TcpSocket};

/// Loopback address the gate listens on in tests.
pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Default timeout when waiting for something to happen.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs the compiled binary to completion.
#[allow(clippy::missing_panics_doc)]
pub fn run_knockgate(args: &[&str]) -> Output {
    run_knockgate_with_env(args, &[])
}

/// Runs the compiled binary with extra environment variables.
#[allow(clippy::missing_panics_doc)]
pub fn run_knockgate_with_env(args: &[&str], env: &[(&str, &str)]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_knockgate"))
        .args(args)
        .envs(env.iter().copied())
        .env_remove("KNOCKGATE_LOG_LEVEL")
        .output()
        .expect("failed to run knockgate")
}

/// Returns the path to a test fixture.
#[must_use]
pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

/// Binds `count` loopback listeners on ephemeral ports.
#[allow(clippy::missing_panics_doc)]
pub async fn bind_knock_ports(count: usize) -> Vec<TcpListener> {
    let mut listeners = Vec::with_capacity(count);
    for _ in 0..count {
        listeners.push(
            TcpListener::bind((LOOPBACK, 0))
                .await
                .expect("failed to bind loopback listener"),
        );
    }
    listeners
}

/// Reserves `count` distinct free loopback ports and releases them.
#[allow(clippy::missing_panics_doc)]
pub async fn free_ports(count: usize) -> Vec<u16> {
    let listeners = bind_knock_ports(count).await;
    listeners
        .iter()
        .map(|l| l.local_addr().expect("local_addr").port())
        .collect()
}

/// Connects to `LOOPBACK:port` from the loopback address `source` and
/// closes the connection at once.
///
/// Any `127.0.0.0/8` source works on Linux without extra setup, which lets
/// one test play several knocking hosts.
#[allow(clippy::missing_panics_doc)]
pub async fn knock_from(source: Ipv4Addr, port: u16) {
    let socket = TcpSocket::new_v4().expect("socket");
    socket
        .bind(SocketAddr::new(IpAddr::V4(source), 0))
        .expect("bind knock source");
    let stream = socket
        .connect(SocketAddr::new(LOOPBACK, port))
        .await
        .expect("knock connect");
    drop(stream);
}

/// Polls `condition` until it holds or [`DEFAULT_TIMEOUT`] elapses.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + DEFAULT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Parses a JSONL events file into values, skipping a partial last line.
#[must_use]
pub fn read_events(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

/// Types of every event in `events`, in order.
#[must_use]
pub fn event_types(events: &[Value]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| e["type"].as_str().map(ToString::to_string))
        .collect()
}
