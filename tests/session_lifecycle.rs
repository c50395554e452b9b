//! Connection lifecycle: encrypted sessions, disconnect propagation, and
//! keep-alive supervision, all over the in-process adapter pair.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crosstalk::{
    CrosstalkError, CryptoConfig, InMemoryAdapter, KeepAliveConfig, Payload, RequestConfig,
    Session, SessionBuilder, SessionEvent, SessionState,
};

#[derive(Debug, Serialize, Deserialize)]
struct Echo {
    text: String,
}

impl Payload for Echo {
    const TYPE_NAME: &'static str = "Echo";
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

async fn connected_pair_with(
    client: impl FnOnce(SessionBuilder) -> SessionBuilder,
    server: impl FnOnce(SessionBuilder) -> SessionBuilder,
) -> (Session, Session) {
    init_tracing();
    let (client_end, server_end) = InMemoryAdapter::pair();
    let client_session = client(Session::builder().with_adapter(client_end))
        .build()
        .unwrap();
    let server_session = server(Session::builder().with_adapter(server_end))
        .build()
        .unwrap();
    server_session.connect().await.unwrap();
    client_session.connect().await.unwrap();
    (client_session, server_session)
}

fn register_echo_responder(server: &Session) {
    server.register_request_handler(|_session, request: Echo| async move { Ok(request.text) });
}

async fn wait_until(predicate: impl Fn() -> bool) {
    for _ in 0..400 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 4s");
}

#[tokio::test]
async fn test_two_way_encrypted_session() {
    let (client, server) = connected_pair_with(
        |b| b.with_crypto(CryptoConfig::enabled()),
        |b| b.with_crypto(CryptoConfig::enabled()),
    )
    .await;
    register_echo_responder(&server);

    let echoed: String = client
        .send_request(
            &Echo {
                text: "over the sealed channel".to_string(),
            },
            RequestConfig::default(),
        )
        .await
        .unwrap();
    assert_eq!(echoed, "over the sealed channel");
}

#[tokio::test]
async fn test_one_way_encryption_requirement_encrypts_both_directions() {
    // Only the client demands encryption; the server adopts the channel
    // password during the handshake and traffic still flows both ways.
    let (client, server) =
        connected_pair_with(|b| b.with_crypto(CryptoConfig::enabled()), |b| b).await;
    register_echo_responder(&server);

    let echoed: String = client
        .send_request(
            &Echo {
                text: "asymmetric requirement".to_string(),
            },
            RequestConfig::default(),
        )
        .await
        .unwrap();
    assert_eq!(echoed, "asymmetric requirement");
}

#[tokio::test]
async fn test_encrypted_session_survives_many_requests() {
    let (client, server) = connected_pair_with(
        |b| b.with_crypto(CryptoConfig::enabled()),
        |b| b.with_crypto(CryptoConfig::enabled()),
    )
    .await;
    register_echo_responder(&server);

    for i in 0..50 {
        let text = format!("frame {i}");
        let echoed: String = client
            .send_request(&Echo { text: text.clone() }, RequestConfig::default())
            .await
            .unwrap();
        assert_eq!(echoed, text);
    }
}

#[tokio::test]
async fn test_graceful_disconnect_notifies_peer() {
    let (client, server) = connected_pair_with(|b| b, |b| b).await;

    let reasons = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reasons);
    server.on_event(move |event| {
        if let SessionEvent::Disconnected { reason } = event {
            sink.lock().unwrap().push(reason.clone());
        }
    });

    client
        .disconnect_with_reason(Some("maintenance window".to_string()))
        .await
        .unwrap();
    assert_eq!(client.state(), SessionState::Disconnected);

    wait_until(|| server.state() == SessionState::Failed).await;
    let failure = server.failure().unwrap();
    assert!(failure.contains("maintenance window"), "got {failure:?}");
    let reasons = reasons.lock().unwrap().clone();
    assert_eq!(reasons, vec![Some("maintenance window".to_string())]);
}

#[tokio::test]
async fn test_silent_disconnect_fails_peer_via_adapter() {
    let (client, server) =
        connected_pair_with(|b| b.with_notify_on_disconnect(false), |b| b).await;

    client.disconnect().await.unwrap();
    wait_until(|| server.state() == SessionState::Failed).await;
    assert!(server.failure().is_some());
}

#[tokio::test]
async fn test_disconnect_aborts_pending_requests() {
    let (client, server) = connected_pair_with(|b| b, |b| b).await;
    // The server never answers; the entry must resolve on disconnect, not
    // linger until its deadline.
    let waiter = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .send_request::<Echo, String>(
                    &Echo {
                        text: "never answered".to_string(),
                    },
                    RequestConfig::default().with_timeout(Duration::from_secs(30)),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.disconnect().await.unwrap();
    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(CrosstalkError::Disconnected)));
    assert_eq!(client.pending_count(), 0);
    drop(server);
}

#[tokio::test]
async fn test_connection_loss_veto_keeps_session_up() {
    let (client, server) = connected_pair_with(|b| b, |b| b).await;
    server.on_connection_lost(|_cause, decision| decision.retain());

    client.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_keep_alive_sustains_idle_session() {
    let keep_alive = KeepAliveConfig {
        enabled: true,
        delay: Duration::from_millis(50),
        interval: Duration::from_millis(50),
        timeout: Duration::from_millis(200),
        retries: 2,
        ..KeepAliveConfig::default()
    };
    // The server answers probes automatically (the default).
    let (client, server) =
        connected_pair_with(|b| b.with_keep_alive(keep_alive), |b| b).await;

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(client.state(), SessionState::Connected);
    assert_eq!(server.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_keep_alive_exhaustion_fails_session() {
    let keep_alive = KeepAliveConfig {
        enabled: true,
        delay: Duration::from_millis(50),
        interval: Duration::from_millis(50),
        timeout: Duration::from_millis(100),
        retries: 2,
        ..KeepAliveConfig::default()
    };
    let mute = KeepAliveConfig {
        auto_respond: false,
        ..KeepAliveConfig::default()
    };
    let (client, _server) = connected_pair_with(
        |b| b.with_keep_alive(keep_alive),
        |b| b.with_keep_alive(mute),
    )
    .await;

    wait_until(|| client.state() == SessionState::Failed).await;
    let failure = client.failure().unwrap();
    assert!(failure.contains("Keep-alive"), "got {failure:?}");
}

#[tokio::test]
async fn test_reconnect_after_graceful_disconnect() {
    init_tracing();
    let (client_end, server_end) = InMemoryAdapter::pair();
    let client = Session::builder()
        .with_adapter(Arc::clone(&client_end) as _)
        .build()
        .unwrap();
    let server = Session::builder()
        .with_adapter(Arc::clone(&server_end) as _)
        .with_notify_on_disconnect(false)
        .build()
        .unwrap();
    register_echo_responder(&server);

    for round in 0..3 {
        server.connect().await.unwrap();
        client.connect().await.unwrap();
        let text = format!("round {round}");
        let echoed: String = client
            .send_request(&Echo { text: text.clone() }, RequestConfig::default())
            .await
            .unwrap();
        assert_eq!(echoed, text);
        client.disconnect().await.unwrap();
        // The notification fails the server side; wait for it before
        // reconnecting so the old workers have wound down.
        wait_until(|| server.state() != SessionState::Connected).await;
    }
}
