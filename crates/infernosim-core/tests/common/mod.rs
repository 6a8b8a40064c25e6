//! Shared helpers for the replay integration tests: disposable incident
//! logs, a minimal target service, and a service variant that exercises a
//! dependency through the stub proxy.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::TcpListener;

use infernosim_core::http1;

/// Writes `inbound.log` and `outbound.log` under `dir`.
pub fn write_incident(dir: &Path, inbound: &[&str], outbound: &[&str]) -> (PathBuf, PathBuf) {
    let inbound_log = dir.join("inbound.log");
    let outbound_log = dir.join("outbound.log");
    std::fs::write(&inbound_log, lines(inbound)).unwrap();
    std::fs::write(&outbound_log, lines(outbound)).unwrap();
    (inbound_log, outbound_log)
}

fn lines(records: &[&str]) -> String {
    let mut out = String::new();
    for record in records {
        out.push_str(record);
        out.push('\n');
    }
    out
}

/// One captured inbound request at `offset_ms` past a fixed origin.
pub fn inbound_record(id: u32, offset_ms: u32, path: &str) -> String {
    format!(
        r#"{{"id":"{id}","type":"InboundRequest","timestamp":"2026-02-02T08:30:43.{offset_ms:03}Z","method":"GET","url":"http://localhost:18081{path}"}}"#
    )
}

/// One captured outbound call with the given status.
pub fn outbound_record(id: u32, url: &str, status: u16) -> String {
    format!(
        r#"{{"id":"{id}","type":"OutboundCall","timestamp":"2026-02-02T08:30:43.100Z","method":"GET","url":"{url}","status":{status}}}"#
    )
}

/// Spawns a target that answers every request with `status_of(n)` where `n`
/// counts requests from zero across all connections.
pub async fn spawn_target<F>(status_of: F) -> SocketAddr
where
    F: Fn(usize) -> u16 + Send + Sync + 'static,
{
    spawn_service_inner(None, status_of).await
}

/// Spawns a service under test that, for every inbound request, first calls
/// a recorded dependency through the stub proxy at `stub_proxy`, then
/// answers with `status_of(n)`.
pub async fn spawn_service<F>(stub_proxy: SocketAddr, status_of: F) -> SocketAddr
where
    F: Fn(usize) -> u16 + Send + Sync + 'static,
{
    spawn_service_inner(Some(stub_proxy), status_of).await
}

async fn spawn_service_inner<F>(stub_proxy: Option<SocketAddr>, status_of: F) -> SocketAddr
where
    F: Fn(usize) -> u16 + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let status_of = Arc::new(status_of);
    let counter = Arc::new(AtomicUsize::new(0));
    let dependency_client = stub_proxy.map(|proxy| {
        reqwest::Client::builder()
            .proxy(reqwest::Proxy::http(format!("http://{proxy}")).unwrap())
            .build()
            .unwrap()
    });

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let status_of = Arc::clone(&status_of);
            let counter = Arc::clone(&counter);
            let dependency_client = dependency_client.clone();
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut reader = BufReader::new(read);
                while let Ok(Some(_head)) = http1::read_request_head(&mut reader).await {
                    if let Some(client) = &dependency_client {
                        let _ = client
                            .get("http://worldtimeapi.org/api/timezone/Etc/UTC")
                            .send()
                            .await;
                    }
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if http1::write_empty_response(&mut write, status_of(n))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            });
        }
    });
    addr
}

/// Spawns a listener that accepts connections and never answers.
pub async fn spawn_black_hole() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            held.push(stream);
        }
    });
    addr
}

/// Reserves an ephemeral port for a listener the code under test will bind
/// itself.
pub async fn reserve_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}
