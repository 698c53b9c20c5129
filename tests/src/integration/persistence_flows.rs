//! # Persistence Flows
//!
//! Messages for down persistent peers are stored, acked and replayed through
//! the persistence command handlers.

use crate::harness::{bounded, descriptor_for, originator, Cluster, OrderPlaced, StockChecked};
use pb_02_persistence::{MessageReplayer, ReplayStatus};
use proptest::prelude::*;
use shared_bus::{BusEvent, EventFilter};
use shared_types::messages::{
    MessageHandled, PersistMessageCommand, ReplayPhaseEnded, SafetyPhaseEnded,
    StartMessageReplayCommand,
};
use shared_types::{BusMessage, MessageId, PeerId, TransportMessage};
use std::sync::Arc;
use uuid::Uuid;

impl Cluster {
    async fn send_to_persistence<M: BusMessage>(&self, message: &M, from: &str) {
        let envelope = TransportMessage::from_message(message, originator(from)).unwrap();
        self.persistence_handlers
            .dispatch(self.persistence.clone(), &envelope)
            .await
            .unwrap();
    }

    /// Persist an order for every target.
    async fn persist_order(&self, targets: &[PeerId]) -> MessageId {
        let message =
            TransportMessage::from_message(&OrderPlaced::new("1", 5), originator("Sender")).unwrap();
        let id = message.id;
        self.send_to_persistence(
            &PersistMessageCommand {
                transport_message: message,
                targets: targets.to_vec(),
            },
            "Sender",
        )
        .await;
        id
    }

    async fn request_replay(&self, peer: &str) -> Arc<MessageReplayer> {
        self.send_to_persistence(
            &StartMessageReplayCommand {
                replay_id: Uuid::new_v4(),
            },
            peer,
        )
        .await;
        self.persistence
            .repository()
            .get_active_message_replayer(&PeerId::new(peer))
            .unwrap()
    }

    fn delivered(&self, peer: &str) -> Vec<MessageId> {
        self.peers
            .sent_to(&PeerId::new(peer))
            .into_iter()
            .filter(|m| !m.is::<ReplayPhaseEnded>() && !m.is::<SafetyPhaseEnded>())
            .map(|m| m.id)
            .collect()
    }
}

#[tokio::test]
async fn test_down_peer_receives_backlog_then_live_message_once() {
    let cluster = Cluster::start();
    let peer = cluster
        .join(descriptor_for::<OrderPlaced>("P", true, &[""]))
        .await
        .unwrap();
    peer.unregister().await.unwrap();
    let sender = cluster
        .join(descriptor_for::<StockChecked>("Sender", false, &[""]))
        .await
        .unwrap();
    let targets: Vec<PeerId> = sender
        .get_peers_handling_message(&OrderPlaced::new("1", 5))
        .into_iter()
        .filter(|p| !p.is_up && sender.is_persistent(&p.id))
        .map(|p| p.id)
        .collect();
    assert_eq!(targets, vec![PeerId::new("P")]);

    let mut backlog = Vec::new();
    for _ in 0..5 {
        backlog.push(cluster.persist_order(&targets).await);
    }

    cluster
        .join(descriptor_for::<OrderPlaced>("P", true, &[""]))
        .await
        .unwrap();
    cluster.peers.set_delay_ms(10);
    let replayer = cluster.request_replay("P").await;
    let live = cluster.persist_order(&targets).await;

    assert_eq!(
        bounded(replayer.wait_for_completion()).await,
        Some(ReplayStatus::Completed)
    );
    let delivered = cluster.delivered("P");
    assert_eq!(&delivered[..5], &backlog[..]);
    assert_eq!(delivered.iter().filter(|id| **id == live).count(), 1);
    assert_eq!(delivered.len(), 6);
}

#[tokio::test]
async fn test_acked_message_leaves_non_acked_count() {
    let cluster = Cluster::start();
    let mut events = cluster.bus.subscribe(EventFilter::all());
    let p = PeerId::new("P");
    let first = cluster.persist_order(&[p.clone()]).await;
    cluster.persist_order(&[p.clone()]).await;

    cluster
        .send_to_persistence(&MessageHandled { message_id: first }, "P")
        .await;
    cluster.persistence.matcher().flush().await.unwrap();
    cluster.persistence.publish_non_ack_messages_count().await.unwrap();

    let counts: Vec<_> = events
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            BusEvent::NonAckMessagesCountChanged(c) => Some(c.non_ack_messages),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].peer_id, p);
    assert_eq!(counts[0].count, 1);
}

#[tokio::test]
async fn test_second_replay_request_supersedes_first() {
    let cluster = Cluster::start();
    let mut events = cluster.bus.subscribe(EventFilter::all());
    for _ in 0..3 {
        cluster.persist_order(&[PeerId::new("P")]).await;
    }
    cluster.peers.set_delay_ms(30);

    let first = cluster.request_replay("P").await;
    let second = cluster.request_replay("P").await;

    assert_eq!(first.status(), ReplayStatus::Cancelled);
    assert_eq!(
        bounded(second.wait_for_completion()).await,
        Some(ReplayStatus::Completed)
    );

    let published = events.drain();
    let started = published
        .iter()
        .filter(|e| matches!(e, BusEvent::ReplaySessionStarted(_)))
        .count();
    let ended: Vec<_> = published
        .iter()
        .filter_map(|e| match e {
            BusEvent::ReplaySessionEnded(ended) => Some(ended.session_id),
            _ => None,
        })
        .collect();
    assert_eq!(started, 2);
    assert_eq!(ended, vec![second.replay_id()]);
}

#[tokio::test]
async fn test_shutdown_lets_running_replay_finish() {
    let cluster = Cluster::start();
    cluster.persist_order(&[PeerId::new("P")]).await;
    let replayer = cluster.request_replay("P").await;

    bounded(cluster.persistence.shutdown()).await.unwrap();

    assert_eq!(replayer.status(), ReplayStatus::Completed);
    assert!(!cluster.persistence.repository().has_active_message_replayers());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn prop_replay_delivers_exactly_the_unacked_messages(acked in proptest::collection::vec(any::<bool>(), 1..8)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (expected, delivered) = runtime.block_on(async {
            let cluster = Cluster::start();
            let p = PeerId::new("P");
            let mut expected = Vec::new();
            for ack in &acked {
                let id = cluster.persist_order(&[p.clone()]).await;
                if *ack {
                    cluster.send_to_persistence(&MessageHandled { message_id: id }, "P").await;
                } else {
                    expected.push(id);
                }
            }
            let replayer = cluster.request_replay("P").await;
            replayer.wait_for_completion().await;
            (expected, cluster.delivered("P"))
        });
        prop_assert_eq!(delivered, expected);
    }
}
