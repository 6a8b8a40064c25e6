//! Driver-level integration tests: golden fingerprints, truncation, and the
//! wall-clock / idle safety bounds, all against real local sockets.

mod common;

use std::time::Duration;

use infernosim_core::event::load_inbound;
use infernosim_core::replay::{replay_events, ReplayConfig};

use common::{inbound_record, spawn_black_hole, spawn_target, write_incident};

fn faithful() -> ReplayConfig {
    ReplayConfig::default()
}

#[tokio::test]
async fn test_golden_fingerprint_is_stable_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let (inbound_log, _) = write_incident(
        dir.path(),
        &[inbound_record(1, 0, "/api/test?q=verify").as_str()],
        &[],
    );
    let events = load_inbound(&inbound_log).unwrap();
    let target = spawn_target(|_| 200).await;
    let base = format!("http://{target}");

    let first = replay_events(&events, &base, &faithful()).await.unwrap();
    let second = replay_events(&events, &base, &faithful()).await.unwrap();

    assert_eq!(first.fingerprint, second.fingerprint);
    assert_ne!(first.fingerprint, [0u8; 32]);
    assert_eq!(first.completed_events, 1);
    assert_eq!(
        first.response_signatures,
        vec!["GET /api/test?q=verify 200".to_string()]
    );
    assert_eq!(first.error_count, 0);
}

#[tokio::test]
async fn test_error_classes_fingerprint_identically() {
    let dir = tempfile::tempdir().unwrap();
    let (inbound_log, _) = write_incident(
        dir.path(),
        &[
            inbound_record(1, 0, "/api/test?q=verify").as_str(),
            inbound_record(2, 10, "/api/other").as_str(),
        ],
        &[],
    );
    let events = load_inbound(&inbound_log).unwrap();
    // A reserved-but-unbound port refuses connections.
    let unbound = common::reserve_port().await;
    let base = format!("http://{unbound}");

    let first = replay_events(&events, &base, &faithful()).await.unwrap();
    let second = replay_events(&events, &base, &faithful()).await.unwrap();

    assert_eq!(first.error_count, 2);
    assert_eq!(first.completed_events, 2);
    assert!(first.response_signatures[0].starts_with("GET /api/test?q=verify ERR:"));
    // Same failure class on both runs, so the digests agree.
    assert_eq!(first.fingerprint, second.fingerprint);
}

#[tokio::test]
async fn test_status_changes_diverge_the_fingerprint() {
    let dir = tempfile::tempdir().unwrap();
    let (inbound_log, _) = write_incident(
        dir.path(),
        &[inbound_record(1, 0, "/api/test?q=verify").as_str()],
        &[],
    );
    let events = load_inbound(&inbound_log).unwrap();
    // Alternates 200 and 500 across requests.
    let target = spawn_target(|n| if n % 2 == 0 { 200 } else { 500 }).await;
    let base = format!("http://{target}");

    let first = replay_events(&events, &base, &faithful()).await.unwrap();
    let second = replay_events(&events, &base, &faithful()).await.unwrap();
    assert_ne!(first.fingerprint, second.fingerprint);
}

#[tokio::test]
async fn test_max_events_truncates_before_scheduling() {
    let dir = tempfile::tempdir().unwrap();
    let records: Vec<String> = (0..10)
        .map(|i| inbound_record(i, i * 2, "/api/test"))
        .collect();
    let record_refs: Vec<&str> = records.iter().map(String::as_str).collect();
    let (inbound_log, _) = write_incident(dir.path(), &record_refs, &[]);
    let events = load_inbound(&inbound_log).unwrap();
    assert_eq!(events.len(), 10);

    let target = spawn_target(|_| 200).await;
    let cfg = ReplayConfig {
        max_events: 3,
        ..ReplayConfig::default()
    };
    let result = replay_events(&events, &format!("http://{target}"), &cfg)
        .await
        .unwrap();

    assert_eq!(result.total_events, 3);
    assert_eq!(result.completed_events, 3);
    assert_eq!(result.response_signatures.len(), 3);
}

#[tokio::test]
async fn test_tight_wall_clock_returns_time_expanded_with_partial_counters() {
    let dir = tempfile::tempdir().unwrap();
    let (inbound_log, _) = write_incident(
        dir.path(),
        &[
            inbound_record(1, 0, "/api/test?q=verify").as_str(),
            inbound_record(2, 50, "/api/test?q=verify2").as_str(),
        ],
        &[],
    );
    let events = load_inbound(&inbound_log).unwrap();
    let target = spawn_target(|_| 200).await;

    let cfg = ReplayConfig {
        max_wall_clock: Duration::from_millis(1),
        ..ReplayConfig::default()
    };
    let result = replay_events(&events, &format!("http://{target}"), &cfg)
        .await
        .unwrap();

    let reason = result.time_expanded.expect("wall-clock bound should fire");
    assert!(reason.contains("wall-clock"));
    assert!(result.completed_events < result.total_events);
    assert_eq!(result.response_signatures.len(), result.completed_events);
    assert!(result.stalled.is_none());
}

#[tokio::test]
async fn test_unresponsive_target_stalls_within_idle_bound() {
    let dir = tempfile::tempdir().unwrap();
    let (inbound_log, _) = write_incident(
        dir.path(),
        &[
            inbound_record(1, 0, "/api/test").as_str(),
            inbound_record(2, 10, "/api/test").as_str(),
        ],
        &[],
    );
    let events = load_inbound(&inbound_log).unwrap();
    let black_hole = spawn_black_hole().await;

    let cfg = ReplayConfig {
        max_idle_time: Duration::from_millis(100),
        ..ReplayConfig::default()
    };
    let started = std::time::Instant::now();
    let result = replay_events(&events, &format!("http://{black_hole}"), &cfg)
        .await
        .unwrap();

    let reason = result.stalled.expect("idle bound should fire");
    assert!(reason.contains("idle"));
    assert!(result.completed_events < result.total_events);
    assert_eq!(result.response_signatures.len(), result.completed_events);
    // The stall verdict arrives near the idle bound, not the 15s request
    // ceiling.
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_long_scheduled_gap_does_not_stall_a_healthy_target() {
    let dir = tempfile::tempdir().unwrap();
    // Captured inter-arrival gap (2s) far exceeds the idle bound (100ms):
    // the scheduled silence is intentional replay fidelity, not a stall.
    let (inbound_log, _) = write_incident(
        dir.path(),
        &[
            r#"{"id":"1","type":"InboundRequest","timestamp":"2026-02-02T08:30:43Z","method":"GET","url":"/api/test?q=verify"}"#,
            r#"{"id":"2","type":"InboundRequest","timestamp":"2026-02-02T08:30:45Z","method":"GET","url":"/api/test?q=verify"}"#,
        ],
        &[],
    );
    let events = load_inbound(&inbound_log).unwrap();
    let target = spawn_target(|_| 200).await;

    let cfg = ReplayConfig {
        max_idle_time: Duration::from_millis(100),
        ..ReplayConfig::default()
    };
    let result = replay_events(&events, &format!("http://{target}"), &cfg)
        .await
        .unwrap();

    assert!(result.stalled.is_none());
    assert_eq!(result.completed_events, result.total_events);
    assert_eq!(result.error_count, 0);
    assert_eq!(result.response_signatures.len(), 2);
}

#[tokio::test]
async fn test_scheduled_delay_honors_min_gap_floor() {
    let dir = tempfile::tempdir().unwrap();
    let (inbound_log, _) = write_incident(
        dir.path(),
        &[
            inbound_record(1, 0, "/a").as_str(),
            inbound_record(2, 0, "/b").as_str(),
            inbound_record(3, 0, "/c").as_str(),
        ],
        &[],
    );
    let events = load_inbound(&inbound_log).unwrap();
    let target = spawn_target(|_| 200).await;

    let cfg = ReplayConfig {
        min_gap: Duration::from_millis(30),
        ..ReplayConfig::default()
    };
    let started = std::time::Instant::now();
    let result = replay_events(&events, &format!("http://{target}"), &cfg)
        .await
        .unwrap();

    assert_eq!(result.completed_events, 3);
    // Three scheduled slots, each floored at 30ms.
    assert!(started.elapsed() >= Duration::from_millis(90));
    assert_eq!(result.expected_duration, Duration::from_millis(90));
}
