//! # Broker Failures
//!
//! Connection and channel failures surface through the operation that hit
//! them, and nothing is cached in a broken state.

use std::time::Duration;

use tokio::time::timeout;

use txn_outcome::{
    Broker, BrokerError, ClientConfig, ExchangeKind, ExchangeOptions, InMemoryBroker,
    TransactionClient, TransactionError,
};

use super::{client, client_with, next_delivery, ObservedBroker, Recorder};

#[tokio::test]
async fn test_unreachable_broker_fails_every_operation() {
    let broker = InMemoryBroker::new();
    broker.set_reachable(false);
    let client = client(&broker);
    let id = client.generate_id();

    let err = client.commit(&id).await.unwrap_err();
    assert!(matches!(
        err,
        TransactionError::Publish {
            source: BrokerError::Connection(_),
            ..
        }
    ));

    assert!(matches!(
        client.bind("svc", &id).await,
        Err(TransactionError::Connection(_))
    ));
    assert!(matches!(
        client.unbind("svc", &id).await,
        Err(TransactionError::Connection(_))
    ));
    let (handler, _rx) = Recorder::channel();
    assert!(matches!(
        client.create_listener("svc", handler).await,
        Err(TransactionError::Connection(_))
    ));
    assert!(client.active_listeners().is_empty());
}

#[tokio::test]
async fn test_client_recovers_when_broker_returns() {
    let broker = InMemoryBroker::new();
    let client = client(&broker);
    let id = client.generate_id();

    broker.set_reachable(false);
    assert!(client.commit(&id).await.is_err());

    broker.set_reachable(true);
    let (handler, mut rx) = Recorder::channel();
    client.create_listener("svc", handler).await.unwrap();
    client.bind("svc", &id).await.unwrap();
    client.commit(&id).await.unwrap();

    assert_eq!(next_delivery(&mut rx).await.message.id, id);
}

#[tokio::test]
async fn test_conflicting_exchange_is_a_channel_error() {
    let broker = InMemoryBroker::new();
    let channel = broker
        .connect("memory://admin")
        .await
        .unwrap()
        .open_channel()
        .await
        .unwrap();
    channel
        .assert_exchange("transactions", ExchangeKind::Fanout, ExchangeOptions { durable: true })
        .await
        .unwrap();

    let client = client(&broker);
    let id = client.generate_id();

    let err = client.rollback(&id).await.unwrap_err();
    assert!(matches!(
        err,
        TransactionError::Publish {
            source: BrokerError::Channel(_),
            ..
        }
    ));
    assert!(matches!(
        client.bind("svc", &id).await,
        Err(TransactionError::Channel(_))
    ));

    // A client on its own exchange is unaffected
    let other = client_with(&broker, ClientConfig::default().with_exchange("transactions.v2"));
    assert!(other.commit(&id).await.is_ok());
}

#[tokio::test]
async fn test_second_attach_on_same_client_is_rejected() {
    let broker = InMemoryBroker::new();
    let client = client(&broker);

    let (first, _rx1) = Recorder::channel();
    let (second, _rx2) = Recorder::channel();
    client.create_listener("svc", first).await.unwrap();

    let err = client.create_listener("svc", second).await.unwrap_err();
    assert!(matches!(
        err,
        TransactionError::AlreadyConsuming { ref endpoint } if endpoint == "svc"
    ));
    assert_eq!(client.active_listeners(), vec!["svc".to_string()]);

    // After cancelling, the endpoint can be consumed again
    assert!(client.cancel_listener("svc").await);
    let (third, _rx3) = Recorder::channel();
    client.create_listener("svc", third).await.unwrap();
}

#[tokio::test]
async fn test_listener_stops_when_endpoint_is_deleted() {
    let broker = InMemoryBroker::new();
    let client = client(&broker);
    let (handler, _rx) = Recorder::channel();
    client.create_listener("svc", handler).await.unwrap();

    assert!(broker.delete_queue("svc"));

    super::eventually(|| client.active_listeners().is_empty()).await;
    let (handler, _rx) = Recorder::channel();
    client.create_listener("svc", handler).await.unwrap();
    assert!(broker.queue_exists("svc"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let broker = InMemoryBroker::new();
    let result = TransactionClient::new(
        std::sync::Arc::new(broker),
        ClientConfig::default().with_url(""),
    );
    assert!(matches!(result, Err(TransactionError::Config(_))));
}

#[tokio::test]
async fn test_unsupported_url_is_a_connection_error() {
    let broker = InMemoryBroker::new();
    let client = client_with(&broker, ClientConfig::default().with_url("http://localhost"));
    let id = client.generate_id();

    assert!(matches!(
        client.bind("svc", &id).await,
        Err(TransactionError::Connection(_))
    ));
}

#[tokio::test]
async fn test_timed_out_attach_frees_the_endpoint() {
    let broker = InMemoryBroker::new();
    let slow = ObservedBroker::slow(&broker, Duration::from_millis(200));
    let client = slow.client();

    let (abandoned, _rx) = Recorder::channel();
    let attempt = timeout(
        Duration::from_millis(50),
        client.create_listener("svc", abandoned),
    )
    .await;
    assert!(attempt.is_err());
    assert!(client.active_listeners().is_empty());

    let (handler, mut rx) = Recorder::channel();
    client.create_listener("svc", handler).await.unwrap();
    assert_eq!(client.active_listeners(), vec!["svc".to_string()]);

    let id = client.generate_id();
    client.bind("svc", &id).await.unwrap();
    client.commit(&id).await.unwrap();
    assert_eq!(next_delivery(&mut rx).await.message.id, id);
}

#[tokio::test]
async fn test_failed_operations_close_their_channels() {
    let broker = InMemoryBroker::new();
    let channel = broker
        .connect("memory://admin")
        .await
        .unwrap()
        .open_channel()
        .await
        .unwrap();
    channel
        .assert_exchange("transactions", ExchangeKind::Fanout, ExchangeOptions { durable: true })
        .await
        .unwrap();

    let observed = ObservedBroker::new(&broker);
    let client = observed.client();
    let id = client.generate_id();

    assert!(client.commit(&id).await.is_err());
    assert!(client.bind("svc", &id).await.is_err());
    assert!(client.unbind("svc", &id).await.is_err());
    let (handler, _rx) = Recorder::channel();
    assert!(client.create_listener("svc", handler).await.is_err());

    assert_eq!(observed.opened(), 4);
    assert_eq!(observed.closed(), 4);
}

#[tokio::test]
async fn test_successful_operations_close_their_channels() {
    let broker = InMemoryBroker::new();
    let observed = ObservedBroker::new(&broker);
    let client = observed.client();
    let id = client.generate_id();

    client.bind("svc", &id).await.unwrap();
    client.commit(&id).await.unwrap();
    client.unbind("svc", &id).await.unwrap();

    assert_eq!(observed.opened(), 3);
    assert_eq!(observed.closed(), 3);
}
