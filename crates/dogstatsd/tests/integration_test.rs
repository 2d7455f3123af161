// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use dogstatsd::{
    agent::Agent,
    aggregator::{Aggregator, AggregatorConfig, FlushSnapshot},
    config::Config,
    datadog::{DdApi, DdDdUrl, Endpoint, MetricsIntakeUrlPrefix, RetryStrategy, Series},
    flusher::{ForwarderStatus, ShippingError},
    metric::{parse, SortedTags},
    scheduler::BackpressurePolicy,
};
use mockito::{Matcher, Server};
use std::net::SocketAddr;
use tokio::{
    net::UdpSocket,
    time::{sleep, timeout, Duration},
};

/// Agent pointed at `intake_url`, listening on an ephemeral loopback port,
/// sending plain JSON so request bodies can be matched.
fn test_config(intake_url: String) -> Config {
    let mut config = Config {
        api_key: "mock-api-key".to_string(),
        dd_url: Some(intake_url),
        flush_interval: Duration::from_secs(1),
        ..Config::default()
    };
    config.listener.port = Some(0);
    config.health.enabled = false;
    config.forwarder.compression_level = None;
    config.forwarder.max_linger = Duration::from_millis(10);
    config.forwarder.retry_strategy = RetryStrategy::Immediate(1);
    config
}

async fn send_udp(addr: SocketAddr, payload: &str) {
    let socket = UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("unable to bind UDP socket");
    socket
        .send_to(payload.as_bytes(), addr)
        .await
        .expect("unable to send metric");
}

/// Waits until the agent has counted `n` received packets.
async fn wait_for_packets(agent: &Agent, n: u64) {
    let wait = async {
        while agent.telemetry().snapshot().packets_received < n {
            sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(Duration::from_secs(2), wait)
        .await
        .expect("packets never arrived");
    // give the decoder a moment to hand the samples over
    sleep(Duration::from_millis(50)).await;
}

async fn wait_for_match(mock: &mockito::Mock, within: Duration) {
    let wait = async {
        while !mock.matched_async().await {
            sleep(Duration::from_millis(50)).await;
        }
    };
    if timeout(within, wait).await.is_err() {
        panic!("timed out before the intake received the expected payload");
    }
}

fn series_value(snapshot: &FlushSnapshot, name: &str) -> Option<f64> {
    snapshot
        .series
        .iter()
        .find(|p| p.name.as_str() == name)
        .map(|p| p.value)
}

#[tokio::test]
async fn counters_in_one_window_are_summed() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v2/series")
        .match_header("DD-API-KEY", "mock-api-key")
        .match_header("Content-Type", "application/json")
        .match_body(Matcher::Regex(
            r#""metric":"foo","type":1,"points":\[\{"timestamp":\d+,"value":3\.0\}\]"#.to_string(),
        ))
        .with_status(202)
        .expect_at_least(1)
        .create_async()
        .await;

    let agent = Agent::start(test_config(server.url()))
        .await
        .expect("agent failed to start");
    let addr = agent.udp_addr().expect("UDP not bound");
    send_udp(addr, "foo:1|c").await;
    send_udp(addr, "foo:2|c").await;

    wait_for_match(&mock, Duration::from_secs(5)).await;
    agent.stop(Duration::from_secs(1)).await;
    mock.assert_async().await;
}

#[tokio::test]
async fn service_check_ships_with_health_check() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v1/check_run")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(r#""check":"test\.check","host_name":"[^"]*","timestamp":\d+,"status":0"#.to_string()),
            Matcher::Regex(
                r#""check":"datadog\.agent\.up","host_name":"[^"]*","timestamp":\d+,"status":0"#
                    .to_string(),
            ),
        ]))
        .with_status(202)
        .expect_at_least(1)
        .create_async()
        .await;

    let mut config = test_config(server.url());
    config.health.enabled = true;
    config.health.interval = Duration::from_millis(200);
    let agent = Agent::start(config).await.expect("agent failed to start");
    send_udp(agent.udp_addr().expect("UDP not bound"), "_sc|test.check|0").await;

    wait_for_match(&mock, Duration::from_secs(5)).await;
    agent.stop(Duration::from_secs(1)).await;
    mock.assert_async().await;
}

#[tokio::test]
async fn gauges_persist_and_counters_reset() {
    let mut config = test_config("http://127.0.0.1:1".to_string());
    config.flush_interval = Duration::from_secs(3600);
    let agent = Agent::start(config).await.expect("agent failed to start");
    send_udp(agent.udp_addr().expect("UDP not bound"), "bar:5|g\nbaz:4|c").await;
    wait_for_packets(&agent, 1).await;

    let handle = agent.aggregator_handle();
    let window1 = handle.flush(Duration::from_secs(10)).await.expect("flush");
    assert_eq!(series_value(&window1, "bar"), Some(5.0));
    assert_eq!(series_value(&window1, "baz"), Some(4.0));

    let window2 = handle.flush(Duration::from_secs(10)).await.expect("flush");
    assert_eq!(series_value(&window2, "bar"), Some(5.0));
    assert_eq!(series_value(&window2, "baz"), Some(0.0));

    agent.stop(Duration::from_millis(200)).await;
}

#[cfg(unix)]
#[tokio::test]
async fn socket_only_agent_leaves_network_port_unbound() {
    use tokio::net::UnixDatagram;

    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("dsd.socket");
    let mut config = test_config("http://127.0.0.1:1".to_string());
    config.flush_interval = Duration::from_secs(3600);
    config.listener.port = None;
    config.listener.socket_path = Some(socket_path.clone());

    // a port nobody listens on once this socket is dropped
    let free_port = {
        let placeholder = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        placeholder.local_addr().expect("addr")
    };

    let agent = Agent::start(config).await.expect("agent failed to start");
    assert!(agent.udp_addr().is_none());

    send_udp(free_port, "net.only:1|c").await;
    let client = UnixDatagram::unbound().expect("unbound socket");
    client
        .send_to(b"uds.only:1|c", &socket_path)
        .await
        .expect("unable to send over the socket");
    wait_for_packets(&agent, 1).await;

    let snapshot = agent
        .aggregator_handle()
        .flush(Duration::from_secs(10))
        .await
        .expect("flush");
    assert_eq!(series_value(&snapshot, "uds.only"), Some(1.0));
    assert_eq!(series_value(&snapshot, "net.only"), None);
    assert_eq!(agent.telemetry().snapshot().packets_received, 1);

    agent.stop(Duration::from_millis(200)).await;
    assert!(!socket_path.exists());
}

#[tokio::test]
async fn event_length_mismatch_drops_only_that_line() {
    let mut config = test_config("http://127.0.0.1:1".to_string());
    config.flush_interval = Duration::from_secs(3600);
    let agent = Agent::start(config).await.expect("agent failed to start");
    send_udp(
        agent.udp_addr().expect("UDP not bound"),
        "_e{5,4}:hello|world\nsibling:1|c\n_e{5,5}:hello|world",
    )
    .await;
    wait_for_packets(&agent, 1).await;

    let snapshot = agent
        .aggregator_handle()
        .flush(Duration::from_secs(10))
        .await
        .expect("flush");
    assert_eq!(series_value(&snapshot, "sibling"), Some(1.0));
    assert_eq!(snapshot.events.len(), 1);
    assert_eq!(snapshot.events[0].text, "world");
    assert_eq!(agent.telemetry().snapshot().decode_errors, 1);

    agent.stop(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn pending_snapshots_stay_bounded_when_intake_fails() {
    let mut server = Server::new_async().await;
    let _failing = server
        .mock("POST", "/api/v2/series")
        .with_status(503)
        .create_async()
        .await;

    let mut config = test_config(server.url());
    config.flush_interval = Duration::from_millis(50);
    config.forwarder.degraded_after = Duration::ZERO;
    config.forwarder.max_in_flight = 1;
    config.forwarder.queue_size = 1;
    config.forwarder.backpressure = BackpressurePolicy::Buffer { max_pending: 2 };
    let agent = Agent::start(config).await.expect("agent failed to start");

    for i in 0..40 {
        agent
            .ingestor()
            .ingest_payload(format!("load:{i}|c").as_bytes())
            .await
            .expect("ingest");
        sleep(Duration::from_millis(25)).await;
        assert!(agent.pending_snapshots() <= 2);
    }
    assert_eq!(agent.forwarder_status(), ForwarderStatus::Degraded);
    assert!(agent.telemetry().snapshot().batches_failed > 0);

    agent.stop(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn stop_flushes_the_open_window() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v2/series")
        .match_header("Content-Encoding", "zstd")
        .with_status(202)
        .expect(1)
        .create_async()
        .await;

    let mut config = test_config(server.url());
    config.flush_interval = Duration::from_secs(3600);
    config.forwarder.compression_level = Some(3);
    let agent = Agent::start(config).await.expect("agent failed to start");
    agent
        .ingestor()
        .ingest_payload(b"on.shutdown:1|c")
        .await
        .expect("ingest");

    agent.stop(Duration::from_secs(2)).await;
    mock.assert_async().await;
}

fn dd_api(url: String, retry_strategy: RetryStrategy) -> DdApi {
    DdApi::new(
        "test_key".to_string(),
        MetricsIntakeUrlPrefix::new(None, Some(DdDdUrl::new(url).expect("failed to create URL")))
            .expect("failed to create URL"),
        None,
        Duration::from_secs(1),
        retry_strategy,
        Some(6),
    )
}

fn one_window() -> FlushSnapshot {
    let mut aggregator = Aggregator::new(
        AggregatorConfig::default(),
        None,
        SortedTags::parse("test:value").expect("tags"),
    )
    .expect("failed to create aggregator");
    let metric = parse("test:1|c").expect("failed to parse metric");
    aggregator
        .insert_metric(&metric)
        .expect("failed to insert metric");
    aggregator.flush(1_700_000_000, Duration::from_secs(10))
}

fn series_body(snapshot: &FlushSnapshot) -> Vec<u8> {
    let series: Vec<Series<'_>> = snapshot
        .series
        .iter()
        .map(|p| Series::new(p, snapshot.timestamp, snapshot.interval))
        .collect();
    serde_json::to_vec(&serde_json::json!({ "series": series })).unwrap()
}

#[tokio::test]
async fn test_send_with_retry_immediate_failure() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v2/series")
        .with_status(500)
        .with_body("Internal Server Error")
        .expect(3)
        .create_async()
        .await;

    let snapshot = one_window();
    let result = dd_api(server.url(), RetryStrategy::Immediate(3))
        .ship(Endpoint::Series, series_body(&snapshot))
        .await;

    assert!(result.is_err());
    mock.assert_async().await;
}

#[tokio::test]
async fn test_send_with_retry_linear_backoff_success() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v2/series")
        .with_status(500)
        .with_body("Internal Server Error")
        .expect(1)
        .create_async()
        .await;

    let success_mock = server
        .mock("POST", "/api/v2/series")
        .with_status(200)
        .with_body("Success")
        .expect(1)
        .create_async()
        .await;

    let snapshot = one_window();
    // 3 attempts, 1ms delay
    let result = dd_api(server.url(), RetryStrategy::LinearBackoff(3, 1))
        .ship(Endpoint::Series, series_body(&snapshot))
        .await;

    match result {
        Ok(response) => assert_eq!(response.status(), reqwest::StatusCode::OK),
        Err(e) => panic!("Expected Ok result, got {e}"),
    }
    mock.assert_async().await;
    success_mock.assert_async().await;
}

#[tokio::test]
async fn test_send_with_retry_immediate_failure_after_one_attempt() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v2/series")
        .with_status(500)
        .with_body("Internal Server Error")
        .expect(1)
        .create_async()
        .await;

    let snapshot = one_window();
    let result = dd_api(server.url(), RetryStrategy::Immediate(1))
        .ship(Endpoint::Series, series_body(&snapshot))
        .await;

    if let Err(ShippingError::Destination(Some(status), msg)) = result {
        assert_eq!(status, reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(msg, "Failed to send request after 1 attempts");
    } else {
        panic!("Expected ShippingError::Destination with status 500");
    }
    mock.assert_async().await;
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v2/series")
        .with_status(403)
        .with_body("Forbidden")
        .expect(1)
        .create_async()
        .await;

    let snapshot = one_window();
    let result = dd_api(server.url(), RetryStrategy::Immediate(5))
        .ship(Endpoint::Series, series_body(&snapshot))
        .await;

    match result {
        Err(e @ ShippingError::Destination(Some(reqwest::StatusCode::FORBIDDEN), _)) => {
            assert!(e.is_permanent());
        }
        other => panic!("Expected a permanent 403 failure, got {other:?}"),
    }
    mock.assert_async().await;
}

#[tokio::test]
async fn test_too_many_requests_is_retried() {
    let mut server = Server::new_async().await;
    let throttled = server
        .mock("POST", "/api/v2/series")
        .with_status(429)
        .expect(2)
        .create_async()
        .await;

    let snapshot = one_window();
    let result = dd_api(server.url(), RetryStrategy::LinearBackoff(2, 1))
        .ship(Endpoint::Series, series_body(&snapshot))
        .await;

    assert!(matches!(
        result,
        Err(ShippingError::Destination(
            Some(reqwest::StatusCode::TOO_MANY_REQUESTS),
            _
        ))
    ));
    throttled.assert_async().await;
}
