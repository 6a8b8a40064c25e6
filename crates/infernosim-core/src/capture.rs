//! Incident capture proxies.
//!
//! Capture wraps a live service with two interception points. The *inbound
//! reverse proxy* sits in front of the service: it records every client
//! request as an `InboundRequest` event, forwards it, records the
//! `InboundResponse`, and relays the answer. The *outbound forward proxy*
//! sits between the service and its dependencies: proxy-aware clients send
//! absolute-form requests which are recorded as `OutboundCall` events and
//! forwarded upstream. `CONNECT` tunnels are piped byte-for-byte without
//! inspection and recorded only as endpoints.
//!
//! A correlation header is injected on the inbound path so a trace
//! identifier survives through the service under capture.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::event::{generate_id, Event, EventKind, EventLogWriter};
use crate::http1::{self, RequestHead};

/// Correlation header injected on the inbound path.
pub const TRACE_HEADER: &str = "X-Inferno-Traceid";

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Serves the inbound reverse proxy: every accepted request is logged and
/// forwarded to `target`, and the response is logged and relayed back.
pub async fn run_inbound_proxy(
    listener: TcpListener,
    target: Url,
    logger: Arc<EventLogWriter>,
) -> std::io::Result<()> {
    let client = relay_client();
    info!(target = %target, "inbound capture proxy active");
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "inbound capture connection");
        let target = target.clone();
        let logger = Arc::clone(&logger);
        let client = client.clone();
        tokio::spawn(async move {
            handle_inbound_conn(stream, target, logger, client).await;
        });
    }
}

async fn handle_inbound_conn(
    stream: TcpStream,
    target: Url,
    logger: Arc<EventLogWriter>,
    client: reqwest::Client,
) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    loop {
        let head = match http1::read_request_head(&mut reader).await {
            Ok(Some(head)) => head,
            Ok(None) => return,
            Err(err) => {
                debug!(error = %err, "inbound capture dropped unparseable request");
                return;
            }
        };
        let body = match head.content_length() {
            Ok(0) => Vec::new(),
            Ok(len) => match http1::read_body(&mut reader, len).await {
                Ok(body) => body,
                Err(_) => return,
            },
            Err(_) => {
                let _ = http1::write_empty_response(&mut write, 411).await;
                return;
            }
        };

        let trace_id = head
            .header(TRACE_HEADER)
            .map_or_else(generate_id, ToString::to_string);

        let mut request_event = Event::new(EventKind::InboundRequest);
        request_event.service = target_authority(&target);
        request_event.method = head.method.clone();
        request_event.url = head.target.clone();
        request_event.headers = clone_headers(&head);
        request_event.body_size = body.len() as i64;
        request_event.trace_id = trace_id.clone();
        log_event(&logger, &request_event);
        debug!(method = %head.method, url = %head.target, "captured inbound request");

        let Ok(outgoing) = target.join(&head.target) else {
            let _ = http1::write_empty_response(&mut write, 400).await;
            continue;
        };
        let Ok(method) = reqwest::Method::from_bytes(head.method.as_bytes()) else {
            let _ = http1::write_empty_response(&mut write, 400).await;
            continue;
        };
        let mut builder = client.request(method, outgoing);
        for (name, value) in &head.headers {
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case(TRACE_HEADER) {
                continue;
            }
            builder = builder.header(name, value);
        }
        builder = builder.header(TRACE_HEADER, &trace_id).body(body);

        match builder.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let headers: Vec<(String, String)> = response
                    .headers()
                    .iter()
                    .filter(|(name, _)| !name.as_str().eq_ignore_ascii_case("connection"))
                    .filter_map(|(name, value)| {
                        value
                            .to_str()
                            .ok()
                            .map(|v| (name.as_str().to_string(), v.to_string()))
                    })
                    .collect();
                let Ok(payload) = response.bytes().await else {
                    let _ = http1::write_empty_response(&mut write, 502).await;
                    continue;
                };

                let mut response_event = Event::new(EventKind::InboundResponse);
                response_event.service = target_authority(&target);
                response_event.method = head.method.clone();
                response_event.url = head.target.clone();
                response_event.status = status;
                response_event.trace_id = trace_id.clone();
                log_event(&logger, &response_event);

                if http1::write_response(&mut write, status, &headers, &payload)
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(err) => {
                warn!(error = %err, url = %head.target, "inbound capture forward failed");
                if http1::write_empty_response(&mut write, 502).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Serves the outbound forward proxy for proxy-aware clients.
pub async fn run_forward_proxy(
    listener: TcpListener,
    logger: Arc<EventLogWriter>,
) -> std::io::Result<()> {
    let client = relay_client();
    info!("outbound capture proxy active");
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "outbound capture connection");
        let logger = Arc::clone(&logger);
        let client = client.clone();
        tokio::spawn(async move {
            handle_forward_conn(stream, logger, client).await;
        });
    }
}

async fn handle_forward_conn(stream: TcpStream, logger: Arc<EventLogWriter>, client: reqwest::Client) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    loop {
        let head = match http1::read_request_head(&mut reader).await {
            Ok(Some(head)) => head,
            Ok(None) => return,
            Err(err) => {
                debug!(error = %err, "outbound capture dropped unparseable request");
                return;
            }
        };

        if head.method == "CONNECT" {
            // The tunnel consumes the connection; nothing more is parsed.
            handle_connect(reader, write, head, &logger).await;
            return;
        }

        let body = match head.content_length() {
            Ok(0) => Vec::new(),
            Ok(len) => match http1::read_body(&mut reader, len).await {
                Ok(body) => body,
                Err(_) => return,
            },
            Err(_) => {
                let _ = http1::write_empty_response(&mut write, 411).await;
                return;
            }
        };

        // A forward proxy only accepts absolute-form targets.
        let Ok(method) = reqwest::Method::from_bytes(head.method.as_bytes()) else {
            let _ = http1::write_empty_response(&mut write, 400).await;
            continue;
        };
        if Url::parse(&head.target).map(|u| u.host_str().is_none()).unwrap_or(true) {
            let _ = http1::write_empty_response(&mut write, 400).await;
            continue;
        }

        let mut event = Event::new(EventKind::OutboundCall);
        event.method = head.method.clone();
        event.url = head.target.clone();
        event.headers = clone_headers(&head);
        event.body_size = body.len() as i64;

        let mut builder = client.request(method, head.target.as_str());
        for (name, value) in &head.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            builder = builder.header(name, value);
        }
        let started = Instant::now();
        match builder.body(body).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let headers: Vec<(String, String)> = response
                    .headers()
                    .iter()
                    .filter(|(name, _)| !name.as_str().eq_ignore_ascii_case("connection"))
                    .filter_map(|(name, value)| {
                        value
                            .to_str()
                            .ok()
                            .map(|v| (name.as_str().to_string(), v.to_string()))
                    })
                    .collect();
                let payload = response.bytes().await.unwrap_or_default();

                event.status = status;
                event.duration = elapsed_ns(started);
                log_event(&logger, &event);
                debug!(method = %event.method, url = %event.url, status, "captured outbound call");

                if http1::write_response(&mut write, status, &headers, &payload)
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(err) => {
                // Status zero marks a captured error; replay answers these
                // with a synthesized 502.
                event.error = err.to_string();
                event.duration = elapsed_ns(started);
                log_event(&logger, &event);
                warn!(error = %err, url = %event.url, "outbound capture forward failed");
                if http1::write_empty_response(&mut write, 502).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn handle_connect<R>(
    mut reader: BufReader<R>,
    mut write: tokio::net::tcp::OwnedWriteHalf,
    head: RequestHead,
    logger: &EventLogWriter,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let upstream = match TcpStream::connect(&head.target).await {
        Ok(upstream) => upstream,
        Err(err) => {
            warn!(error = %err, target = %head.target, "connect tunnel dial failed");
            let _ = http1::write_empty_response(&mut write, 503).await;
            return;
        }
    };
    if write
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .is_err()
    {
        return;
    }

    // Encrypted traffic is observed only as an endpoint, never inspected.
    let mut event = Event::new(EventKind::OutboundCall);
    event.method = "CONNECT".to_string();
    event.url = head.target.clone();
    event.status = 200;
    log_event(logger, &event);
    info!(target = %head.target, "connect tunnel established");

    let (mut up_read, mut up_write) = upstream.into_split();
    tokio::select! {
        _ = tokio::io::copy(&mut reader, &mut up_write) => {}
        _ = tokio::io::copy(&mut up_read, &mut write) => {}
    }
}

/// Upstream client for relaying captured traffic. Redirects are relayed to
/// the caller, never followed on its behalf.
fn relay_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap_or_default()
}

fn clone_headers(head: &RequestHead) -> HashMap<String, Vec<String>> {
    let mut headers: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in &head.headers {
        headers.entry(name.clone()).or_default().push(value.clone());
    }
    headers
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

fn target_authority(target: &Url) -> String {
    match (target.host_str(), target.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        _ => String::new(),
    }
}

fn elapsed_ns(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

fn log_event(logger: &EventLogWriter, event: &Event) {
    if let Err(err) = logger.append(event) {
        warn!(error = %err, "event log append failed");
    }
}
