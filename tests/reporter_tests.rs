use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use hpc_agent::reporter::{udp_target, HttpTransport, Reporter, ReportSource, Transport, UdpTransport};

use harness::spawn_head_stub;

struct CountingSource {
    uri: String,
    fetches: Arc<AtomicUsize>,
    failures: Arc<AtomicUsize>,
}

#[async_trait]
impl ReportSource for CountingSource {
    type Payload = Value;

    async fn resolve_uri(&self, _cancel: &CancellationToken) -> Option<String> {
        Some(self.uri.clone())
    }

    async fn fetch(&self) -> Option<Value> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst);
        Some(json!({ "Tick": n }))
    }

    async fn on_failure(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

fn counting_source(uri: String) -> (CountingSource, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let fetches = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(AtomicUsize::new(0));
    (
        CountingSource {
            uri,
            fetches: fetches.clone(),
            failures: failures.clone(),
        },
        fetches,
        failures,
    )
}

async fn wait_for(counter: &AtomicUsize, at_least: usize, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if counter.load(Ordering::SeqCst) >= at_least {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_reporter_posts_on_every_tick() {
    let stub = spawn_head_stub(200).await;
    let (source, fetches, failures) = counting_source(stub.uri("/heartbeat"));
    let cancel = CancellationToken::new();

    let reporter = Reporter::start(
        "test",
        Duration::ZERO,
        Duration::from_millis(30),
        source,
        HttpTransport::new(reqwest::Client::new()),
        &cancel,
    );

    assert!(wait_for(&fetches, 3, Duration::from_secs(5)).await);
    reporter.stop().await;

    assert!(stub.request_count() >= 3);
    assert_eq!(failures.load(Ordering::SeqCst), 0);

    // Payloads arrive in tick order: a reporter never overlaps itself.
    let ticks: Vec<u64> = stub
        .requests()
        .iter()
        .map(|r| r["Tick"].as_u64().unwrap())
        .collect();
    let mut sorted = ticks.clone();
    sorted.sort_unstable();
    assert_eq!(ticks, sorted);
}

#[tokio::test]
async fn test_non_success_invokes_failure_hook() {
    let stub = spawn_head_stub(500).await;
    let (source, _fetches, failures) = counting_source(stub.uri("/heartbeat"));
    let cancel = CancellationToken::new();

    let reporter = Reporter::start(
        "test",
        Duration::ZERO,
        Duration::from_millis(30),
        source,
        HttpTransport::new(reqwest::Client::new()),
        &cancel,
    );

    assert!(wait_for(&failures, 2, Duration::from_secs(5)).await);
    reporter.stop().await;
}

#[tokio::test]
async fn test_transport_error_invokes_failure_hook() {
    // Nothing listens here.
    let (source, _fetches, failures) = counting_source("http://127.0.0.1:9/heartbeat".to_string());
    let cancel = CancellationToken::new();

    let reporter = Reporter::start(
        "test",
        Duration::ZERO,
        Duration::from_millis(30),
        source,
        HttpTransport::new(reqwest::Client::new()),
        &cancel,
    );

    assert!(wait_for(&failures, 1, Duration::from_secs(5)).await);
    reporter.stop().await;
}

#[tokio::test]
async fn test_hold_delays_the_first_send() {
    let stub = spawn_head_stub(200).await;
    let (source, fetches, _failures) = counting_source(stub.uri("/heartbeat"));
    let cancel = CancellationToken::new();

    let reporter = Reporter::start(
        "test",
        Duration::from_secs(60),
        Duration::from_millis(30),
        source,
        HttpTransport::new(reqwest::Client::new()),
        &cancel,
    );

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(fetches.load(Ordering::SeqCst), 0);
    reporter.stop().await;
}

#[tokio::test]
async fn test_stop_halts_the_worker() {
    let stub = spawn_head_stub(200).await;
    let (source, fetches, _failures) = counting_source(stub.uri("/heartbeat"));
    let cancel = CancellationToken::new();

    let reporter = Reporter::start(
        "test",
        Duration::ZERO,
        Duration::from_millis(20),
        source,
        HttpTransport::new(reqwest::Client::new()),
        &cancel,
    );

    assert!(wait_for(&fetches, 1, Duration::from_secs(5)).await);
    reporter.stop().await;

    let after_stop = fetches.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fetches.load(Ordering::SeqCst), after_stop);
}

#[tokio::test]
async fn test_udp_transport_delivers_the_datagram() {
    let receiver = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = receiver.local_addr().unwrap();
    let cancel = CancellationToken::new();

    let payload = vec![1u8, 2, 3, 4];
    UdpTransport
        .send(
            &format!("udp://{}/api/node/metricreported", addr),
            payload.clone(),
            &cancel,
        )
        .await
        .unwrap();

    let mut buffer = [0u8; 64];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), receiver.recv_from(&mut buffer))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buffer[..len], payload.as_slice());
}

#[test]
fn test_udp_target_extracts_host_and_port() {
    assert_eq!(
        udp_target("udp://head:9999/api/uuid/metricreported").unwrap(),
        "head:9999"
    );
    assert_eq!(udp_target("udp://10.0.0.1:500").unwrap(), "10.0.0.1:500");
    assert!(udp_target("udp:///api").is_err());
    assert!(udp_target("udp://nohostport").is_err());
}
