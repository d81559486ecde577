//! Connector against a real child process speaking newline-delimited JSON.

use std::time::{Duration, Instant};

use serde_json::json;
use tokio::time::timeout;
use toolwire_connector::{Connector, ConnectorConfig, ConnectorError, ConnectorState, InitializeConfig};
use toolwire_core::BackoffPolicy;
use toolwire_transport::PipeCommand;

const WAIT: Duration = Duration::from_secs(10);

fn echo_peer(config: ConnectorConfig) -> Connector {
    Connector::pipe(
        "echo",
        PipeCommand::new(env!("CARGO_BIN_EXE_echo-peer")),
        config,
    )
}

async fn wait_for_state(connector: &Connector, wanted: ConnectorState) {
    let mut state = connector.watch_state();
    timeout(WAIT, state.wait_for(|s| *s == wanted))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_concurrent_echoes_are_not_swapped() {
    let connector = echo_peer(ConnectorConfig::default());
    connector.connect().await.unwrap();

    // The first answer arrives last.
    let (first, second) = tokio::join!(
        connector.request("echo", Some(json!({ "n": 1, "delayMs": 100 }))),
        connector.request("echo", Some(json!({ "n": 2 }))),
    );
    assert_eq!(first.unwrap()["n"], 1);
    assert_eq!(second.unwrap()["n"], 2);

    connector.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_many_concurrent_requests_each_resolve_once() {
    let connector = echo_peer(ConnectorConfig::default());
    connector.connect().await.unwrap();

    let calls = (0..32).map(|n| {
        let connector = connector.clone();
        async move {
            let delay = (32 - n) * 2;
            connector
                .request("echo", Some(json!({ "n": n, "delayMs": delay })))
                .await
        }
    });
    let results = futures::future::join_all(calls).await;
    for (n, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap()["n"], n);
    }
    assert_eq!(connector.stats().pending, 0);
    assert_eq!(connector.stats().resolved, 32);

    connector.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_timeout_on_silent_peer_leaves_no_pending_entry() {
    let connector = echo_peer(ConnectorConfig::default());
    connector.connect().await.unwrap();

    let started = Instant::now();
    let err = connector
        .request_with_timeout("silence", None, Duration::from_millis(50))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, ConnectorError::Timeout { timeout_ms: 50, .. }));
    assert!(elapsed >= Duration::from_millis(50), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");
    assert_eq!(connector.stats().pending, 0);

    // The connection survives the timeout.
    assert_eq!(
        connector.request("echo", Some(json!("still here"))).await.unwrap(),
        json!("still here")
    );
    connector.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_notifications_arrive_in_send_order() {
    let connector = echo_peer(ConnectorConfig::default());
    let mut inbound = connector.subscribe();
    connector.connect().await.unwrap();

    let result = connector
        .request("notify", Some(json!({ "count": 100 })))
        .await
        .unwrap();
    assert_eq!(result, json!({ "sent": 100 }));

    for seq in 0..100 {
        let message = timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
        assert_eq!(message.method(), "tick");
        assert_eq!(message.params(), Some(&json!({ "seq": seq })));
    }
    connector.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_unknown_method_is_a_peer_error() {
    let connector = echo_peer(ConnectorConfig::default());
    connector.connect().await.unwrap();

    let err = connector.request("nope", None).await.unwrap_err();
    assert!(matches!(err, ConnectorError::Rpc(ref e) if e.code == -32601));
    assert_eq!(connector.state(), ConnectorState::Connected);
    connector.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_rejects_in_flight_requests() {
    let connector = echo_peer(ConnectorConfig::default());
    connector.connect().await.unwrap();

    let call = connector.send_request("silence", None, None).await.unwrap();
    connector.disconnect().await.unwrap();

    assert_eq!(call.wait().await, Err(ConnectorError::ConnectionClosed));
    assert_eq!(connector.state(), ConnectorState::Closed);
    connector.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_initialize_handshake_records_peer_info() {
    let connector = echo_peer(ConnectorConfig::default().with_initialize(InitializeConfig::default()));
    connector.connect().await.unwrap();

    assert_eq!(
        connector.peer_info().unwrap()["serverInfo"]["name"],
        "echo-peer"
    );
    connector.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_peer_exit_fails_pending_requests() {
    let connector = echo_peer(ConnectorConfig::default());
    connector.connect().await.unwrap();

    let call = connector.send_request("silence", None, None).await.unwrap();
    connector.notify("exit", None).await.unwrap();

    assert_eq!(
        timeout(WAIT, call.wait()).await.unwrap(),
        Err(ConnectorError::ConnectionClosed)
    );
    wait_for_state(&connector, ConnectorState::Failed).await;
}

#[tokio::test]
async fn test_reconnects_after_peer_exit() {
    let config = ConnectorConfig::default()
        .with_reconnect(BackoffPolicy::fixed(5, Duration::from_millis(200)))
        .with_initialize(InitializeConfig::default());
    let connector = echo_peer(config);
    connector.connect().await.unwrap();

    let mut state = connector.watch_state();
    connector.notify("exit", None).await.unwrap();
    timeout(WAIT, state.wait_for(|s| *s == ConnectorState::Connecting))
        .await
        .unwrap()
        .unwrap();

    // Joins the reconnect in flight.
    connector.connect().await.unwrap();
    assert_eq!(connector.state(), ConnectorState::Connected);
    assert_eq!(
        connector.request("echo", Some(json!({ "n": 3 }))).await.unwrap(),
        json!({ "n": 3 })
    );
    connector.disconnect().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_invalid_utf8_line_is_dropped_not_fatal() {
    let connector = Connector::pipe(
        "printf",
        PipeCommand::new("sh")
            .arg("-c")
            .arg(r#"printf '\377\n{"method":"x"}\n'; cat > /dev/null"#),
        ConnectorConfig::default(),
    );
    let mut inbound = connector.subscribe();
    connector.connect().await.unwrap();

    let message = timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
    assert_eq!(message.method(), "x");
    assert_eq!(connector.state(), ConnectorState::Connected);
    connector.disconnect().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_child_that_stops_reading_cannot_stall_timeout_or_disconnect() {
    let connector = Connector::pipe(
        "sleeper",
        PipeCommand::new("sleep").arg("30"),
        ConnectorConfig::default(),
    );
    connector.connect().await.unwrap();

    let big = "x".repeat(1 << 20);
    let started = Instant::now();
    let err = connector
        .request_with_timeout("echo", Some(json!({ "blob": big })), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectorError::Timeout { timeout_ms: 100, .. }));
    assert!(started.elapsed() < Duration::from_secs(1));

    let call = connector
        .send_request("echo", Some(json!("queued")), None)
        .await
        .unwrap();
    timeout(Duration::from_secs(3), connector.disconnect())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(call.wait().await, Err(ConnectorError::ConnectionClosed));
}
