//! End-to-end knock sequences over loopback against a running
//! [`KnockServer`] with the in-memory firewall gateway.

mod common;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{LOOPBACK, bind_knock_ports, knock_from, wait_until};
use knockgate::client::KnockClient;
use knockgate::firewall::{FirewallRule, MemoryGateway};
use knockgate::knock::SequenceConfig;
use knockgate::listener::ListenerPool;
use knockgate::observability::events::EventEmitter;
use knockgate::server::{KnockServer, ServerOptions};

const PROTECTED_PORT: u16 = 2222;

struct Gate {
    server: Arc<KnockServer>,
    gateway: Arc<MemoryGateway>,
    ports: Vec<u16>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
    events_file: tempfile::NamedTempFile,
}

impl Gate {
    async fn start(knocks: usize, window: Duration) -> Self {
        let pool = ListenerPool::from_listeners(bind_knock_ports(knocks).await).unwrap();
        let ports = pool.ports();
        let config = SequenceConfig::new(ports.clone(), window, PROTECTED_PORT).unwrap();

        let gateway = Arc::new(MemoryGateway::new());
        let events_file = tempfile::NamedTempFile::new().unwrap();
        let cancel = CancellationToken::new();
        let server = Arc::new(KnockServer::new(ServerOptions {
            config: Arc::new(config),
            bind_address: LOOPBACK,
            sweep_interval: Duration::from_millis(50),
            gateway: gateway.clone(),
            events: Arc::new(EventEmitter::from_file(events_file.path()).unwrap()),
            cancel: cancel.clone(),
        }));

        let task = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(pool).await })
        };

        Self {
            server,
            gateway,
            ports,
            cancel,
            task,
            events_file,
        }
    }

    fn allowed(&self, source: Ipv4Addr) -> bool {
        self.gateway
            .is_allowed(PROTECTED_PORT, IpAddr::V4(source))
    }

    async fn stop(self) -> Vec<serde_json::Value> {
        self.cancel.cancel();
        self.task.await.unwrap();
        common::read_events(self.events_file.path())
    }
}

#[tokio::test]
async fn correct_sequence_opens_protected_port() {
    let gate = Gate::start(3, Duration::from_secs(10)).await;

    let client = KnockClient::new(LOOPBACK).with_delay(Duration::from_millis(20));
    let report = client.knock_sequence(&gate.ports).await;
    assert_eq!(report.accepted(), 3);

    assert!(wait_until(|| gate.allowed(Ipv4Addr::LOCALHOST)).await);
    assert!(gate.gateway.contains(&FirewallRule::Drop {
        port: PROTECTED_PORT
    }));
    assert_eq!(
        gate.gateway
            .allow_calls(PROTECTED_PORT, IpAddr::V4(Ipv4Addr::LOCALHOST)),
        1
    );

    let types = common::event_types(&gate.stop().await);
    assert_eq!(types.first().map(String::as_str), Some("ServerStarted"));
    assert!(types.iter().any(|t| t == "SequenceCompleted"));
    assert!(types.iter().any(|t| t == "AccessGranted"));
    assert_eq!(types.last().map(String::as_str), Some("ServerStopped"));
}

#[tokio::test]
async fn knock_after_window_does_not_grant() {
    let gate = Gate::start(3, Duration::from_millis(300)).await;
    let source = Ipv4Addr::new(127, 0, 0, 2);

    knock_from(source, gate.ports[0]).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    knock_from(source, gate.ports[1]).await;
    knock_from(source, gate.ports[2]).await;

    // Let the last knocks reach the dispatcher before checking.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!gate.allowed(source));
    assert_eq!(gate.gateway.total_calls(), 1, "only the default drop rule");

    gate.stop().await;
}

#[tokio::test]
async fn wrong_first_knock_then_correct_sequence_grants() {
    let gate = Gate::start(3, Duration::from_secs(10)).await;
    let source = Ipv4Addr::new(127, 0, 0, 3);

    knock_from(source, gate.ports[1]).await;
    for &port in &gate.ports {
        knock_from(source, port).await;
    }

    assert!(wait_until(|| gate.allowed(source)).await);
    gate.stop().await;
}

#[tokio::test]
async fn out_of_order_sequence_does_not_grant() {
    let gate = Gate::start(3, Duration::from_secs(10)).await;
    let source = Ipv4Addr::new(127, 0, 0, 4);

    for port in [gate.ports[0], gate.ports[2], gate.ports[1]] {
        knock_from(source, port).await;
    }

    let events_path = gate.events_file.path().to_path_buf();
    let knocks_seen = wait_until(|| {
        common::read_events(&events_path)
            .iter()
            .filter(|e| e["type"] == "KnockReceived")
            .count()
            == 3
    })
    .await;
    assert!(knocks_seen);
    assert!(!gate.allowed(source));
    assert!(
        gate.server
            .dispatcher()
            .tracker()
            .get(&IpAddr::V4(source))
            .is_none()
    );

    let events = gate.stop().await;
    assert!(
        events
            .iter()
            .any(|e| e["type"] == "SequenceReset" && e["reason"] == "out_of_order")
    );
}

#[tokio::test]
async fn interleaved_sources_are_independent() {
    let gate = Gate::start(3, Duration::from_secs(10)).await;
    let good = Ipv4Addr::new(127, 0, 0, 5);
    let noisy = Ipv4Addr::new(127, 0, 0, 6);

    // The noisy source hammers the wrong ports between every good knock.
    for &port in &gate.ports {
        knock_from(noisy, gate.ports[2]).await;
        knock_from(good, port).await;
        knock_from(noisy, gate.ports[1]).await;
    }

    assert!(wait_until(|| gate.allowed(good)).await);
    assert!(!gate.allowed(noisy));
    gate.stop().await;
}

#[tokio::test]
async fn shutdown_closes_knock_ports_and_clears_state() {
    let gate = Gate::start(2, Duration::from_secs(10)).await;
    knock_from(Ipv4Addr::new(127, 0, 0, 7), gate.ports[0]).await;

    let server = Arc::clone(&gate.server);
    assert!(wait_until(|| !server.dispatcher().tracker().is_empty()).await);

    let ports = gate.ports.clone();
    gate.stop().await;

    assert!(server.dispatcher().tracker().is_empty());
    for port in ports {
        assert!(
            tokio::net::TcpStream::connect((LOOPBACK, port)).await.is_err(),
            "knock port {port} still accepting after shutdown"
        );
    }
}
