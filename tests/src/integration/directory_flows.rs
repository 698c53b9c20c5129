//! # Directory Flows
//!
//! Peers register through the directory client and route with the cache it
//! keeps, while directory events flow over the shared bus.

use crate::harness::{bounded, descriptor_for, eventually, Cluster, OrderPlaced, StockChecked};
use shared_bus::{BusEvent, EventFilter, EventTopic};
use shared_types::{BindingKey, ErrorCode, MessageBinding, PeerId, SubscriptionsForType};
use std::time::Duration;
use tokio::sync::watch;

fn ids(peers: Vec<shared_types::Peer>) -> Vec<String> {
    let mut ids: Vec<String> = peers.into_iter().map(|p| p.id.as_str().to_string()).collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn test_routing_follows_binding_keys() {
    let cluster = Cluster::start();
    cluster
        .join(descriptor_for::<OrderPlaced>("A", false, &["1"]))
        .await
        .unwrap();
    cluster
        .join(descriptor_for::<OrderPlaced>("B", false, &[""]))
        .await
        .unwrap();
    let sender = cluster
        .join(descriptor_for::<StockChecked>("Sender", false, &[""]))
        .await
        .unwrap();

    assert_eq!(
        ids(sender.get_peers_handling_message(&OrderPlaced::new("1", 10))),
        vec!["A", "B"]
    );
    assert_eq!(
        ids(sender.get_peers_handling_message(&OrderPlaced::new("2", 10))),
        vec!["B"]
    );
    assert_eq!(
        ids(sender.get_peers_handling_message(&StockChecked { sku: "x".into() })),
        vec!["Sender"]
    );
}

#[tokio::test]
async fn test_late_joiner_is_learned_from_events() {
    let cluster = Cluster::start();
    let sender = cluster
        .join(descriptor_for::<StockChecked>("Sender", false, &[""]))
        .await
        .unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let event_loop = tokio::spawn(sender.clone().run_event_loop(
        cluster.bus.subscribe(EventFilter::topics(vec![EventTopic::Directory])),
        shutdown_rx,
    ));

    cluster
        .join(descriptor_for::<OrderPlaced>("A", true, &["1"]))
        .await
        .unwrap();

    assert!(
        eventually(Duration::from_secs(2), || {
            !sender
                .get_peers_handling_message(&OrderPlaced::new("1", 1))
                .is_empty()
        })
        .await
    );
    assert!(sender.is_persistent(&PeerId::new("A")));

    shutdown_tx.send(true).unwrap();
    bounded(event_loop).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_dynamic_subscription_removal_reaches_other_peers() {
    let cluster = Cluster::start();
    let mut events = cluster.bus.subscribe(EventFilter::all());
    let a = cluster
        .join(descriptor_for::<OrderPlaced>("A", false, &["1"]))
        .await
        .unwrap();
    let sender = cluster
        .join(descriptor_for::<StockChecked>("Sender", false, &[""]))
        .await
        .unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let event_loop = tokio::spawn(
        sender
            .clone()
            .run_event_loop(cluster.bus.subscribe(EventFilter::all()), shutdown_rx),
    );
    let stock = MessageBinding::of(&StockChecked { sku: "x".into() });

    a.update_subscriptions(vec![SubscriptionsForType::new(
        stock.message_type_id.clone(),
        vec![BindingKey::any()],
    )])
    .await
    .unwrap();
    assert!(
        eventually(Duration::from_secs(2), || sender.get_peers_handling(&stock).len() == 2).await
    );

    events.drain();
    a.update_subscriptions(vec![SubscriptionsForType::removal(
        stock.message_type_id.clone(),
    )])
    .await
    .unwrap();

    assert!(
        eventually(Duration::from_secs(2), || sender.get_peers_handling(&stock).len() == 1).await
    );
    let published = events.drain();
    assert!(published.iter().any(|e| matches!(
        e,
        BusEvent::PeerSubscriptionsForTypesUpdated(u)
            if u.peer_id == PeerId::new("A") && u.subscriptions_for_types[0].is_removal()
    )));

    shutdown_tx.send(true).unwrap();
    bounded(event_loop).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unregister_keeps_persistent_peers_only() {
    let cluster = Cluster::start();
    let persistent = cluster
        .join(descriptor_for::<OrderPlaced>("P", true, &[""]))
        .await
        .unwrap();
    let transient = cluster
        .join(descriptor_for::<OrderPlaced>("T", false, &[""]))
        .await
        .unwrap();

    persistent.unregister().await.unwrap();
    transient.unregister().await.unwrap();

    let sender = cluster
        .join(descriptor_for::<StockChecked>("Sender", false, &[""]))
        .await
        .unwrap();
    let handling = sender.get_peers_handling_message(&OrderPlaced::new("1", 1));
    assert_eq!(handling.len(), 1);
    assert_eq!(handling[0].id, PeerId::new("P"));
    assert!(!handling[0].is_up);
}

#[tokio::test]
async fn test_same_peer_from_another_machine_is_refused() {
    let cluster = Cluster::start();
    cluster
        .join(descriptor_for::<OrderPlaced>("A", false, &[""]))
        .await
        .unwrap();

    let mut impostor = descriptor_for::<OrderPlaced>("A", false, &[""]);
    impostor.peer.endpoint = "tcp://elsewhere:1".into();
    let err = cluster.join(impostor).await.unwrap_err();

    let pb_01_directory::DirectoryClientError::Domain(domain) = err else {
        panic!("expected a domain error");
    };
    assert_eq!(domain.code(), ErrorCode::PeerAlreadyExists);
}
