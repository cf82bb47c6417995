//! # Delivery & Retry
//!
//! Under explicit ack a failed handler gets the same outcome again with a
//! higher attempt count; under auto-ack the outcome is gone after the first
//! try.

use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use txn_outcome::{Broker, HandlerError, InMemoryBroker, Outcome, OutcomeDelivery};

use super::{
    assert_silent, client, eventually, explicit_client, next_delivery, within, Flaky, Recorder,
};

fn queue_drained(broker: &InMemoryBroker, queue: &str) -> bool {
    broker
        .queue_stats(queue)
        .is_some_and(|stats| stats.ready == 0 && stats.unacked == 0)
}

#[tokio::test]
async fn test_rejected_delivery_is_redelivered_once() {
    let broker = InMemoryBroker::new();
    let client = explicit_client(&broker);
    let id = client.generate_id();

    let (handler, mut rx) = Flaky::succeed_at(2);
    client.create_listener("svc-a", handler).await.unwrap();
    client.bind("svc-a", &id).await.unwrap();
    client.commit(&id).await.unwrap();

    let first = next_delivery(&mut rx).await;
    assert_eq!(first.attempt, 1);
    assert!(!first.redelivered);

    let second = next_delivery(&mut rx).await;
    assert_eq!(second.attempt, 2);
    assert!(second.redelivered);
    assert_eq!(second.message, first.message);
    assert_eq!(second.message.action, Outcome::Commit);

    assert_silent(&mut rx).await;
    eventually(|| queue_drained(&broker, "svc-a")).await;
}

#[tokio::test]
async fn test_handler_can_give_up_after_attempts() {
    let broker = InMemoryBroker::new();
    let client = explicit_client(&broker);
    let id = client.generate_id();

    let (handler, mut rx) = Flaky::succeed_at(3);
    client.create_listener("svc-a", handler).await.unwrap();
    client.bind("svc-a", &id).await.unwrap();
    client.rollback(&id).await.unwrap();

    let attempts: Vec<u32> = vec![
        next_delivery(&mut rx).await.attempt,
        next_delivery(&mut rx).await.attempt,
        next_delivery(&mut rx).await.attempt,
    ];
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_silent(&mut rx).await;
    eventually(|| queue_drained(&broker, "svc-a")).await;
}

#[tokio::test]
async fn test_auto_ack_failure_loses_outcome() {
    let broker = InMemoryBroker::new();
    let client = client(&broker);
    let id = client.generate_id();

    let (handler, mut rx) = Flaky::always();
    client.create_listener("svc-a", handler).await.unwrap();
    client.bind("svc-a", &id).await.unwrap();
    client.commit(&id).await.unwrap();

    assert_eq!(next_delivery(&mut rx).await.attempt, 1);
    assert_silent(&mut rx).await;
    assert!(queue_drained(&broker, "svc-a"));
}

#[tokio::test]
async fn test_undecodable_payload_does_not_block_endpoint() {
    let broker = InMemoryBroker::new();
    let client = explicit_client(&broker);
    let id = client.generate_id();

    let (handler, mut rx) = Recorder::channel();
    client.create_listener("svc-a", handler).await.unwrap();
    client.bind("svc-a", &id).await.unwrap();

    // Someone else publishes junk under the same routing key
    let channel = broker
        .connect("amqp://localhost")
        .await
        .unwrap()
        .open_channel()
        .await
        .unwrap();
    channel
        .publish("transactions", id.as_str(), br#"{"id":"x","action":"maybe"}"#.to_vec())
        .await
        .unwrap();
    client.commit(&id).await.unwrap();

    let delivery = next_delivery(&mut rx).await;
    assert_eq!(delivery.message.id, id);
    assert_silent(&mut rx).await;
    eventually(|| queue_drained(&broker, "svc-a")).await;
}

#[tokio::test]
async fn test_outcomes_wait_for_restarted_participant() {
    let broker = InMemoryBroker::new();
    let id = {
        let before = explicit_client(&broker);
        let id = before.generate_id();
        let (handler, _rx) = Recorder::channel();
        before.create_listener("svc-a", handler).await.unwrap();
        before.bind("svc-a", &id).await.unwrap();
        before.shutdown().await;
        id
    };

    // Participant is down; the endpoint and binding persist in the broker
    let authority = client(&broker);
    authority.commit(&id).await.unwrap();
    assert_eq!(broker.queue_stats("svc-a").unwrap().ready, 1);

    let after = explicit_client(&broker);
    let (handler, mut rx) = Recorder::channel();
    after.create_listener("svc-a", handler).await.unwrap();

    assert_eq!(next_delivery(&mut rx).await.message.id, id);
    eventually(|| queue_drained(&broker, "svc-a")).await;
}

#[tokio::test]
async fn test_cancel_settles_in_flight_delivery_first() {
    let broker = InMemoryBroker::new();
    let client = Arc::new(explicit_client(&broker));
    let id = client.generate_id();

    let release = Arc::new(Notify::new());
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let gate = Arc::clone(&release);
    let handler = move |delivery: OutcomeDelivery| {
        let gate = Arc::clone(&gate);
        let started = started_tx.clone();
        async move {
            let _ = started.send(delivery.attempt);
            if delivery.attempt == 1 {
                gate.notified().await;
            }
            Err::<(), HandlerError>(HandlerError::new("interrupted"))
        }
    };

    client.create_listener("svc-a", handler).await.unwrap();
    client.bind("svc-a", &id).await.unwrap();
    client.commit(&id).await.unwrap();
    assert_eq!(within(started_rx.recv()).await, Some(1));

    let canceller = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.cancel_listener("svc-a").await })
    };
    release.notify_one();

    assert!(within(canceller).await.unwrap());
    let stats = broker.queue_stats("svc-a").unwrap();
    assert_eq!((stats.ready, stats.unacked, stats.consumers), (1, 0, 0));
}
