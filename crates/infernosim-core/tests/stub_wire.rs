//! Wire-level tests for the stub proxy in explicit mode: a proxy-aware
//! client sends absolute-form requests and the stub answers from the
//! captured sequence.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use infernosim_core::event::load_outbound;
use infernosim_core::inject::parse_rules;
use infernosim_core::stub::StubProxy;

use common::{outbound_record, write_incident};

async fn start_stub(outbound: &[&str], rules: &[&str]) -> (Arc<StubProxy>, std::net::SocketAddr) {
    let dir = tempfile::tempdir().unwrap();
    let (_, outbound_log) = write_incident(dir.path(), &[], outbound);
    let raw: Vec<String> = rules.iter().map(ToString::to_string).collect();
    let stub = Arc::new(StubProxy::from_log(&outbound_log, None, parse_rules(&raw).unwrap()).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = Arc::clone(&stub);
    tokio::spawn(async move {
        let _ = serving.serve_explicit(listener).await;
    });
    (stub, addr)
}

fn proxied_client(proxy: std::net::SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{proxy}")).unwrap())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_proxied_client_receives_captured_sequence() {
    let (stub, addr) = start_stub(
        &[
            outbound_record(1, "http://worldtimeapi.org/api/timezone/Etc/UTC", 200).as_str(),
            outbound_record(2, "http://worldtimeapi.org/api/timezone/Etc/UTC", 503).as_str(),
        ],
        &[],
    )
    .await;
    let client = proxied_client(addr);

    let first = client
        .get("http://worldtimeapi.org/api/timezone/Etc/UTC")
        .send()
        .await
        .unwrap();
    assert_eq!(first.status().as_u16(), 200);

    let second = client
        .get("http://worldtimeapi.org/api/timezone/Etc/UTC")
        .send()
        .await
        .unwrap();
    assert_eq!(second.status().as_u16(), 503);

    // Sequence exhausted: further calls are unexpected.
    let third = client
        .get("http://worldtimeapi.org/api/timezone/Etc/UTC")
        .send()
        .await
        .unwrap();
    assert_eq!(third.status().as_u16(), 502);

    assert_eq!(stub.observed_count(), 3);
    assert_eq!(stub.expected_count(), 2);
    assert_eq!(stub.forward_errors(), 0);
    assert!(stub.forward_success() >= 3);
    assert!(stub.unexpected_outbound());
}

#[tokio::test]
async fn test_timeout_injection_serves_504_after_delay() {
    let (stub, addr) = start_stub(
        &[outbound_record(1, "http://worldtimeapi.org/api/timezone/Etc/UTC", 200).as_str()],
        &["dep=worldtimeapi.org timeout=50ms"],
    )
    .await;
    let client = proxied_client(addr);

    let started = Instant::now();
    let response = client
        .get("http://worldtimeapi.org/api/timezone/Etc/UTC")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 504);
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(stub.observed_count(), 1);
}

#[tokio::test]
async fn test_latency_injection_delays_the_captured_status() {
    let (_stub, addr) = start_stub(
        &[outbound_record(1, "http://worldtimeapi.org/api/timezone/Etc/UTC", 200).as_str()],
        &["dep=worldtimeapi.org latency=+80ms"],
    )
    .await;
    let client = proxied_client(addr);

    let started = Instant::now();
    let response = client
        .get("http://worldtimeapi.org/api/timezone/Etc/UTC")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert!(started.elapsed() >= Duration::from_millis(80));
}

#[tokio::test]
async fn test_retry_injection_forces_early_failures_per_dependency() {
    let (_stub, addr) = start_stub(
        &[
            outbound_record(1, "http://worldtimeapi.org/api/timezone/Etc/UTC", 200).as_str(),
            outbound_record(2, "http://worldtimeapi.org/api/timezone/Etc/UTC", 200).as_str(),
        ],
        &["dep=worldtimeapi.org retries=1"],
    )
    .await;
    let client = proxied_client(addr);

    let first = client
        .get("http://worldtimeapi.org/api/timezone/Etc/UTC")
        .send()
        .await
        .unwrap();
    assert_eq!(first.status().as_u16(), 502);
    let retry = client
        .get("http://worldtimeapi.org/api/timezone/Etc/UTC")
        .send()
        .await
        .unwrap();
    assert_eq!(retry.status().as_u16(), 200);
}

#[tokio::test]
async fn test_method_mismatch_is_observed_not_fatal() {
    let (stub, addr) = start_stub(
        &[outbound_record(1, "http://worldtimeapi.org/api/timezone/Etc/UTC", 200).as_str()],
        &[],
    )
    .await;
    let client = proxied_client(addr);

    let response = client
        .post("http://worldtimeapi.org/api/timezone/Etc/UTC")
        .body("payload")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let reasons = stub.divergence_reasons();
    assert_eq!(reasons.len(), 1);
    assert!(reasons[0].contains("method_mismatch"));
}

#[tokio::test]
async fn test_raw_socket_receives_minimal_response_form() {
    let (_stub, addr) = start_stub(
        &[outbound_record(1, "http://worldtimeapi.org/api/timezone/Etc/UTC", 200).as_str()],
        &[],
    )
    .await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"GET http://worldtimeapi.org/api/timezone/Etc/UTC HTTP/1.1\r\n\
              Host: worldtimeapi.org\r\n\r\n",
        )
        .await
        .unwrap();
    stream.shutdown().await.unwrap();

    let mut reader = BufReader::new(stream);
    let mut raw = String::new();
    reader.read_to_string(&mut raw).await.unwrap();
    assert_eq!(raw, "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
}

#[tokio::test]
async fn test_observation_log_records_arrivals_without_touching_the_incident() {
    let dir = tempfile::tempdir().unwrap();
    let (_, outbound_log) = write_incident(
        dir.path(),
        &[],
        &[outbound_record(1, "http://worldtimeapi.org/api/timezone/Etc/UTC", 200).as_str()],
    );
    let observed_log = dir.path().join("observed.log");
    let stub = Arc::new(
        StubProxy::from_log(&outbound_log, Some(&observed_log), Vec::new()).unwrap(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = Arc::clone(&stub);
    tokio::spawn(async move {
        let _ = serving.serve_explicit(listener).await;
    });

    let client = proxied_client(addr);
    client
        .get("http://worldtimeapi.org/api/timezone/Etc/UTC")
        .send()
        .await
        .unwrap();

    let observed = load_outbound(&observed_log).unwrap();
    assert_eq!(observed.len(), 1);
    assert_eq!(observed[0].method, "GET");
    assert_eq!(observed[0].service, "worldtimeapi.org");
    // The captured incident itself is untouched.
    assert_eq!(load_outbound(&outbound_log).unwrap().len(), 1);
}

#[tokio::test]
async fn test_reset_between_runs_replays_the_same_wire_sequence() {
    let (stub, addr) = start_stub(
        &[
            outbound_record(1, "http://worldtimeapi.org/api/timezone/Etc/UTC", 200).as_str(),
            outbound_record(2, "http://worldtimeapi.org/api/timezone/Etc/UTC", 404).as_str(),
        ],
        &[],
    )
    .await;
    let client = proxied_client(addr);

    let mut first_run = Vec::new();
    for _ in 0..2 {
        let response = client
            .get("http://worldtimeapi.org/api/timezone/Etc/UTC")
            .send()
            .await
            .unwrap();
        first_run.push(response.status().as_u16());
    }

    stub.reset();
    assert_eq!(stub.observed_count(), 0);

    let mut second_run = Vec::new();
    for _ in 0..2 {
        let response = client
            .get("http://worldtimeapi.org/api/timezone/Etc/UTC")
            .send()
            .await
            .unwrap();
        second_run.push(response.status().as_u16());
    }

    assert_eq!(first_run, vec![200, 404]);
    assert_eq!(first_run, second_run);
    assert!(stub.divergence_reasons().is_empty());
}
