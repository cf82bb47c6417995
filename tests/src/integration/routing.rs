//! # Routing
//!
//! The broker's binding table decides who hears an outcome: exactly the
//! endpoints bound to its transaction id at publish time.

use std::collections::HashSet;

use txn_outcome::{InMemoryBroker, Outcome};

use super::{assert_silent, client, next_delivery, Recorder};

#[tokio::test]
async fn test_outcome_reaches_only_endpoint_bound_to_its_id() {
    let broker = InMemoryBroker::new();
    let client = client(&broker);
    let x = client.generate_id();
    let y = client.generate_id();

    let (h1, mut e1) = Recorder::channel();
    let (h2, mut e2) = Recorder::channel();
    client.create_listener("e1", h1).await.unwrap();
    client.create_listener("e2", h2).await.unwrap();
    client.bind("e1", &x).await.unwrap();
    client.bind("e2", &y).await.unwrap();

    client.commit(&x).await.unwrap();

    assert_eq!(next_delivery(&mut e1).await.message.id, x);
    assert_silent(&mut e2).await;
}

#[tokio::test]
async fn test_unbind_stops_delivery() {
    let broker = InMemoryBroker::new();
    let client = client(&broker);
    let x = client.generate_id();
    let y = client.generate_id();

    let (h1, mut e1) = Recorder::channel();
    let (h2, mut e2) = Recorder::channel();
    client.create_listener("e1", h1).await.unwrap();
    client.create_listener("e2", h2).await.unwrap();
    client.bind("e1", &x).await.unwrap();
    client.bind("e2", &y).await.unwrap();

    client.unbind("e1", &x).await.unwrap();
    client.commit(&x).await.unwrap();

    assert_silent(&mut e1).await;
    assert_silent(&mut e2).await;
    assert!(!broker.has_binding("transactions", "e1", x.as_str()));
}

#[tokio::test]
async fn test_bind_twice_then_unbind_once_leaves_no_binding() {
    let broker = InMemoryBroker::new();
    let client = client(&broker);
    let id = client.generate_id();
    let (handler, mut rx) = Recorder::channel();
    client.create_listener("svc", handler).await.unwrap();

    client.bind("svc", &id).await.unwrap();
    client.bind("svc", &id).await.unwrap();
    assert_eq!(broker.bindings("transactions").len(), 1);

    client.unbind("svc", &id).await.unwrap();
    assert!(broker.bindings("transactions").is_empty());

    client.commit(&id).await.unwrap();
    assert_silent(&mut rx).await;
}

#[tokio::test]
async fn test_duplicate_bind_delivers_once() {
    let broker = InMemoryBroker::new();
    let client = client(&broker);
    let id = client.generate_id();
    let (handler, mut rx) = Recorder::channel();
    client.create_listener("svc", handler).await.unwrap();

    client.bind("svc", &id).await.unwrap();
    client.bind("svc", &id).await.unwrap();
    client.commit(&id).await.unwrap();

    next_delivery(&mut rx).await;
    assert_silent(&mut rx).await;
}

#[tokio::test]
async fn test_fan_out_to_every_interested_endpoint() {
    let broker = InMemoryBroker::new();
    let client = client(&broker);
    let id = client.generate_id();

    let mut receivers = Vec::new();
    for endpoint in ["billing", "inventory", "shipping"] {
        let (handler, rx) = Recorder::channel();
        client.create_listener(endpoint, handler).await.unwrap();
        client.bind(endpoint, &id).await.unwrap();
        receivers.push(rx);
    }

    client.rollback(&id).await.unwrap();

    let mut endpoints = HashSet::new();
    for rx in &mut receivers {
        let delivery = next_delivery(rx).await;
        assert_eq!(delivery.message.id, id);
        assert_eq!(delivery.message.action, Outcome::Rollback);
        endpoints.insert(delivery.endpoint);
    }
    assert_eq!(endpoints.len(), 3);
}

#[tokio::test]
async fn test_fan_in_from_many_transactions() {
    let broker = InMemoryBroker::new();
    let client = client(&broker);
    let (handler, mut rx) = Recorder::channel();
    client.create_listener("ledger", handler).await.unwrap();

    let ids: Vec<_> = (0..5).map(|_| client.generate_id()).collect();
    for id in &ids {
        client.bind("ledger", id).await.unwrap();
    }
    for (i, id) in ids.iter().enumerate() {
        if i % 2 == 0 {
            client.commit(id).await.unwrap();
        } else {
            client.rollback(id).await.unwrap();
        }
    }

    let mut seen = Vec::new();
    for _ in 0..ids.len() {
        let delivery = next_delivery(&mut rx).await;
        seen.push((delivery.message.id, delivery.message.action));
    }
    seen.sort_by(|a, b| a.0.cmp(&b.0));
    let mut expected: Vec<_> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let action = if i % 2 == 0 {
                Outcome::Commit
            } else {
                Outcome::Rollback
            };
            (id.clone(), action)
        })
        .collect();
    expected.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_bind_before_listener_exists() {
    let broker = InMemoryBroker::new();
    let client = client(&broker);
    let id = client.generate_id();

    // Binding declares the endpoint, so the outcome is buffered
    client.bind("late", &id).await.unwrap();
    client.commit(&id).await.unwrap();
    assert_eq!(broker.queue_stats("late").unwrap().ready, 1);

    let (handler, mut rx) = Recorder::channel();
    client.create_listener("late", handler).await.unwrap();

    assert_eq!(next_delivery(&mut rx).await.message.id, id);
}

#[tokio::test]
async fn test_competing_listeners_share_an_endpoint() {
    let broker = InMemoryBroker::new();
    let first = client(&broker);
    let second = client(&broker);

    let (h1, mut rx1) = Recorder::channel();
    let (h2, mut rx2) = Recorder::channel();
    first.create_listener("workers", h1).await.unwrap();
    second.create_listener("workers", h2).await.unwrap();

    let ids: Vec<_> = (0..4).map(|_| first.generate_id()).collect();
    for id in &ids {
        first.bind("workers", id).await.unwrap();
        first.commit(id).await.unwrap();
    }

    let mut seen = HashSet::new();
    for _ in 0..2 {
        seen.insert(next_delivery(&mut rx1).await.message.id);
        seen.insert(next_delivery(&mut rx2).await.message.id);
    }
    assert_eq!(seen.len(), 4);
    assert_silent(&mut rx1).await;
    assert_silent(&mut rx2).await;
}
