//! Service registration and remote calls end to end.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crosstalk::{
    CreationPolicy, CrosstalkError, EventEmitter, InMemoryAdapter, ServiceClient,
    ServiceDescriptor, Session,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Reading {
    celsius: f64,
}

struct Thermostat {
    target: Mutex<f64>,
    readings: EventEmitter<Reading>,
}

impl Thermostat {
    fn new() -> Self {
        Self {
            target: Mutex::new(20.0),
            readings: EventEmitter::new(),
        }
    }
}

fn thermostat_descriptor() -> ServiceDescriptor<Thermostat> {
    ServiceDescriptor::new("Thermostat", Thermostat::new)
        .method("Nudge", |service: Arc<Thermostat>, delta: f64| async move {
            let mut target = service.target.lock().unwrap();
            *target += delta;
            Ok(*target)
        })
        .notification("Reset", |service: Arc<Thermostat>, value: f64| async move {
            *service.target.lock().unwrap() = value;
            Ok(())
        })
        .property_get("Target", |service: Arc<Thermostat>| async move {
            Ok(*service.target.lock().unwrap())
        })
        .property_set("Target", |service: Arc<Thermostat>, value: f64| async move {
            *service.target.lock().unwrap() = value;
            Ok(())
        })
        .method(
            "Publish",
            |service: Arc<Thermostat>, celsius: f64| async move {
                service.readings.emit(&Reading { celsius })?;
                Ok(())
            },
        )
        .method("Subscribers", |service: Arc<Thermostat>, (): ()| async move {
            Ok(service.readings.subscriber_count())
        })
        .event("Readings", |service| service.readings.subscribe_raw())
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

async fn connected_pair() -> (Session, Session) {
    init_tracing();
    let (client_end, server_end) = InMemoryAdapter::pair();
    let client = Session::builder().with_adapter(client_end).build().unwrap();
    let server = Session::builder().with_adapter(server_end).build().unwrap();
    server.connect().await.unwrap();
    client.connect().await.unwrap();
    (client, server)
}

async fn wait_until(predicate: impl Fn() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn test_method_call_roundtrip() {
    let (client, server) = connected_pair().await;
    server.register_service(thermostat_descriptor()).unwrap();

    let thermostat = ServiceClient::new(&client, "Thermostat");
    let target: f64 = thermostat.call("Nudge", &1.5).await.unwrap();
    assert!((target - 21.5).abs() < f64::EPSILON);

    // Singleton policy: state persists across calls.
    let target: f64 = thermostat.call("Nudge", &0.5).await.unwrap();
    assert!((target - 22.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_property_access() {
    let (client, server) = connected_pair().await;
    server.register_service(thermostat_descriptor()).unwrap();

    let thermostat = ServiceClient::new(&client, "Thermostat");
    let initial: f64 = thermostat.get_property("Target").await.unwrap();
    assert!((initial - 20.0).abs() < f64::EPSILON);

    thermostat.set_property("Target", &18.5).await.unwrap();
    let updated: f64 = thermostat.get_property("Target").await.unwrap();
    assert!((updated - 18.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_notification_with_ack() {
    let (client, server) = connected_pair().await;
    server.register_service(thermostat_descriptor()).unwrap();

    let thermostat = ServiceClient::new(&client, "Thermostat");
    thermostat.notify("Reset", &25.0).await.unwrap();
    // Service notifications are acknowledged after the notifier runs, so
    // the effect is visible as soon as notify resolves.
    let target: f64 = thermostat.get_property("Target").await.unwrap();
    assert!((target - 25.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_notify_to_missing_service_reports_error() {
    let (client, _server) = connected_pair().await;

    // Nothing registered on the peer: the acknowledgment must carry the
    // dispatch failure back even under the default ack behavior.
    let ghost = ServiceClient::new(&client, "Ghost");
    match ghost.notify("Reset", &1.0).await {
        Err(CrosstalkError::Remote(message)) => {
            assert!(message.contains("Ghost"), "got {message:?}");
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_notify_to_missing_member_reports_error() {
    let (client, server) = connected_pair().await;
    server.register_service(thermostat_descriptor()).unwrap();

    let thermostat = ServiceClient::new(&client, "Thermostat");
    match thermostat.notify("Vanish", &1.0).await {
        Err(CrosstalkError::Remote(message)) => {
            assert!(message.contains("Thermostat.Vanish"), "got {message:?}");
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_event_subscription_streams_events() {
    let (client, server) = connected_pair().await;
    server.register_service(thermostat_descriptor()).unwrap();

    let thermostat = ServiceClient::new(&client, "Thermostat");
    let mut readings = thermostat.subscribe("Readings").await.unwrap();

    // The forwarder attaches asynchronously; wait until the service sees
    // the subscriber before publishing.
    loop {
        let subscribers: usize = thermostat.call("Subscribers", &()).await.unwrap();
        if subscribers > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for celsius in [21.0, 21.5, 22.0] {
        thermostat.call::<_, ()>("Publish", &celsius).await.unwrap();
    }
    for expected in [21.0, 21.5, 22.0] {
        let reading: Reading = readings.next_as().await.unwrap().unwrap();
        assert!((reading.celsius - expected).abs() < f64::EPSILON);
    }
}

#[tokio::test]
async fn test_event_fan_in() {
    let (client, server) = connected_pair().await;

    // The emitter is owned outside the service so the test can publish
    // directly while remote subscribers listen through the service.
    let emitter: Arc<EventEmitter<Reading>> = Arc::new(EventEmitter::new());
    let source = Arc::clone(&emitter);
    server
        .register_service(
            ServiceDescriptor::new("Sensor", || ())
                .event("Readings", move |_service: &()| source.subscribe_raw()),
        )
        .unwrap();

    let sensor = ServiceClient::new(&client, "Sensor");
    let mut readings = sensor.subscribe("Readings").await.unwrap();
    wait_until(|| emitter.subscriber_count() > 0).await;

    for celsius in [19.5, 20.0, 20.5] {
        emitter.emit(&Reading { celsius }).unwrap();
    }
    for expected in [19.5, 20.0, 20.5] {
        let reading: Reading = readings.next_as().await.unwrap().unwrap();
        assert!((reading.celsius - expected).abs() < f64::EPSILON);
    }
}

#[tokio::test]
async fn test_unregistered_service_rejected_fast() {
    let (client, _server) = connected_pair().await;

    let ghost = ServiceClient::new(&client, "Ghost");
    let started = std::time::Instant::now();
    let result: crosstalk::Result<f64> = ghost.call("Anything", &1.0).await;
    match result {
        Err(CrosstalkError::Remote(message)) => {
            assert!(message.contains("Ghost"), "got {message:?}");
        }
        other => panic!("expected remote error, got {other:?}"),
    }
    // Error response, not a timeout.
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn test_unknown_member_rejected() {
    let (client, server) = connected_pair().await;
    server.register_service(thermostat_descriptor()).unwrap();

    let thermostat = ServiceClient::new(&client, "Thermostat");
    let result: crosstalk::Result<f64> = thermostat.call("Missing", &1.0).await;
    match result {
        Err(CrosstalkError::Remote(message)) => {
            assert!(message.contains("Thermostat.Missing"), "got {message:?}");
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unregister_ends_subscriptions_and_calls() {
    let (client, server) = connected_pair().await;
    server.register_service(thermostat_descriptor()).unwrap();

    let thermostat = ServiceClient::new(&client, "Thermostat");
    let mut readings = thermostat.subscribe("Readings").await.unwrap();
    let _: f64 = thermostat.get_property("Target").await.unwrap();

    assert!(server.unregister_service("Thermostat"));
    // The live subscription ends with a terminal frame instead of hanging.
    match tokio::time::timeout(Duration::from_secs(2), readings.next()).await {
        Ok(_last_item) => {}
        Err(_) => panic!("subscription did not end after unregistration"),
    }

    // Subsequent calls fail fast with an error response.
    let result: crosstalk::Result<f64> = thermostat.get_property("Target").await;
    assert!(matches!(result, Err(CrosstalkError::Remote(_))));
    assert!(!server.unregister_service("Thermostat"));
}

#[tokio::test]
async fn test_transient_policy_gets_fresh_instances() {
    let (client, server) = connected_pair().await;
    server
        .register_service(
            thermostat_descriptor().with_policy(CreationPolicy::Transient),
        )
        .unwrap();

    let thermostat = ServiceClient::new(&client, "Thermostat");
    let first: f64 = thermostat.call("Nudge", &5.0).await.unwrap();
    let second: f64 = thermostat.call("Nudge", &5.0).await.unwrap();
    // No shared state between calls.
    assert!((first - 25.0).abs() < f64::EPSILON);
    assert!((second - 25.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_call_timeout_applies() {
    let (client, server) = connected_pair().await;
    server
        .register_service(
            ServiceDescriptor::new("Sluggish", || ()).method(
                "Stall",
                |_service: Arc<()>, _arg: u8| async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(0u8)
                },
            ),
        )
        .unwrap();

    let sluggish =
        ServiceClient::new(&client, "Sluggish").with_timeout(Duration::from_millis(150));
    let result: crosstalk::Result<u8> = sluggish.call("Stall", &0u8).await;
    assert!(matches!(result, Err(CrosstalkError::Timeout(_))));
}

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let (_client, server) = connected_pair().await;
    server.register_service(thermostat_descriptor()).unwrap();
    assert!(server.register_service(thermostat_descriptor()).is_err());
}
