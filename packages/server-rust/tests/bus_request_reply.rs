//! Request/reply and notifications between two bus clients sharing a broker.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use shopmesh_core::MessageEnvelope;
use shopmesh_server::bus::{
    BackoffConfig, BusConfig, BusError, ConnectionState, MemoryBroker, MessageBusClient,
    MessageHandler, PublishOptions, RequestHandler, RequestMeta, RequestOptions,
};
use shopmesh_server::service::{LifecycleContext, LifecycleRegistry};
use tokio::sync::mpsc;

fn client(broker: &MemoryBroker, service: &str) -> MessageBusClient {
    let config = BusConfig {
        uri: "memory://integration".to_string(),
        backoff: BackoffConfig {
            base: Duration::from_millis(10),
            max: Duration::from_millis(50),
            ..BackoffConfig::default()
        },
        ..BusConfig::for_service(service)
    };
    MessageBusClient::new(config, Arc::new(broker.clone()))
}

fn echo_handler() -> Arc<dyn RequestHandler> {
    Arc::new(|data: Value, meta: RequestMeta| async move {
        anyhow::Ok(json!({ "echo": data, "from": meta.publisher }))
    })
}

async fn wait_for(bus: &MessageBusClient, wanted: ConnectionState) {
    let mut states = bus.watch_state();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == wanted))
        .await
        .expect("state not reached")
        .unwrap();
}

#[tokio::test]
async fn ping_echo_across_services() {
    let broker = MemoryBroker::new();
    let server = client(&broker, "pricing-service");
    let caller = client(&broker, "cart-service");
    server.connect().await.unwrap();
    caller.connect().await.unwrap();

    server
        .register_request_handler("ping", echo_handler())
        .await
        .unwrap();

    let reply = caller
        .request("ping", json!({"x": 1}), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(reply, json!({"echo": {"x": 1}, "from": "cart-service"}));
    assert_eq!(caller.pending_requests(), 0);

    caller.disconnect().await;
    server.disconnect().await;
}

#[tokio::test]
async fn failing_handler_replies_with_remote_error() {
    let broker = MemoryBroker::new();
    let server = client(&broker, "payment-service");
    let caller = client(&broker, "order-service");
    server.connect().await.unwrap();
    caller.connect().await.unwrap();

    let failing: Arc<dyn RequestHandler> = Arc::new(|_data: Value, _meta: RequestMeta| async move {
        Err::<Value, _>(anyhow::anyhow!("card declined"))
    });
    server
        .register_request_handler("payment.charge", failing)
        .await
        .unwrap();

    let err = caller
        .request("payment.charge", json!({"amount": 10}), RequestOptions::default())
        .await
        .unwrap_err();
    match err {
        BusError::Remote { kind, message } => {
            assert_eq!(kind, "payment.charge");
            assert!(message.contains("card declined"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(broker.ready_count("rpc.payment.charge"), 0);

    caller.disconnect().await;
    server.disconnect().await;
}

#[tokio::test]
async fn request_without_handler_times_out() {
    let broker = MemoryBroker::new();
    let caller = client(&broker, "order-service");
    caller.connect().await.unwrap();

    let options = RequestOptions {
        timeout: Some(Duration::from_millis(100)),
        ..RequestOptions::default()
    };
    let err = caller
        .request("inventory.reserve", json!({}), options)
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::RequestTimeout { timeout_ms: 100, .. }));
    assert_eq!(caller.pending_requests(), 0);

    // Nothing was bound when the request went out, so a late handler has
    // nothing to answer and the caller stays healthy.
    let server = client(&broker, "inventory-service");
    server.connect().await.unwrap();
    server
        .register_request_handler("inventory.reserve", echo_handler())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(caller.pending_requests(), 0);
    assert!(caller.is_connected());

    caller.disconnect().await;
    server.disconnect().await;
}

#[tokio::test]
async fn both_sides_recover_after_broker_drop() {
    let broker = MemoryBroker::new();
    let server = client(&broker, "pricing-service");
    let caller = client(&broker, "cart-service");
    server.connect().await.unwrap();
    caller.connect().await.unwrap();
    server
        .register_request_handler("ping", echo_handler())
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<MessageEnvelope>();
    let handler: Arc<dyn MessageHandler> = Arc::new(move |envelope: MessageEnvelope| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(envelope);
            anyhow::Ok(())
        }
    });
    server.subscribe("cart.updated", handler).await.unwrap();
    server.start_listening().await.unwrap();

    broker.drop_connections();
    assert_eq!(broker.connection_count(), 0);
    // New connections only appear after each supervisor has seen the loss.
    for _ in 0..500 {
        if broker.connection_count() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(broker.connection_count(), 2);
    wait_for(&server, ConnectionState::Connected).await;
    wait_for(&caller, ConnectionState::Connected).await;

    let reply = caller
        .request("ping", json!({"after": "reconnect"}), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(reply["echo"], json!({"after": "reconnect"}));

    let id = caller
        .publish("cart.updated", json!({"cartId": "c-1"}), None, PublishOptions::default())
        .await
        .unwrap();
    let delivered = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered.id, id);
    assert_eq!(delivered.publisher, "cart-service");

    caller.disconnect().await;
    server.disconnect().await;
    assert_eq!(caller.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn lifecycle_registry_owns_the_connection() {
    let broker = MemoryBroker::new();
    let lifecycle = LifecycleRegistry::new();
    lifecycle.register(client(&broker, "order-service"));

    lifecycle
        .init_all(&LifecycleContext::new("order-service"))
        .await
        .unwrap();
    let bus = lifecycle.get::<MessageBusClient>().unwrap();
    assert!(bus.is_connected());
    assert_eq!(broker.connection_count(), 1);

    lifecycle.shutdown_all().await.unwrap();
    assert_eq!(bus.state(), ConnectionState::Closed);
    assert_eq!(broker.connection_count(), 0);
}
