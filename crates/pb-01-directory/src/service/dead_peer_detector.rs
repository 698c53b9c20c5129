//! # Dead-Peer Detection
//!
//! Timer-driven liveness checks run next to the directory server.

use crate::domain::DirectoryConfig;
use crate::ports::PeerPinger;
use crate::service::DirectoryServer;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use shared_types::{PeerDescriptor, PeerId, Timestamp};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Outcome of one detection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectionReport {
    /// Peers pinged during the pass.
    pub pinged: usize,
    /// Peers that answer again.
    pub responding: Vec<PeerId>,
    /// Peers newly marked not responding.
    pub not_responding: Vec<PeerId>,
    /// Peers removed after a long silence.
    pub decommissioned: Vec<PeerId>,
}

impl DetectionReport {
    /// `true` when the pass changed nothing.
    #[must_use]
    pub fn is_quiet(&self) -> bool {
        self.responding.is_empty() && self.not_responding.is_empty() && self.decommissioned.is_empty()
    }
}

/// Periodically pings every up peer and ages out the silent ones.
///
/// - A peer silent for longer than `peer_ping_timeout_ms` is marked not
///   responding; a successful ping marks it responding again.
/// - A transient peer silent for longer than
///   `transient_peer_decommission_timeout_ms` is decommissioned.
/// - A persistent peer is decommissioned only when
///   `persistent_peer_decommission_timeout_ms` is set.
/// - Peers with a debugger attached are never pinged.
pub struct DeadPeerDetector {
    server: Arc<DirectoryServer>,
    pinger: Arc<dyn PeerPinger>,
    config: DirectoryConfig,
    /// Last successful ping, or first observation, per peer.
    last_seen: DashMap<PeerId, Timestamp>,
    /// Peers registered earlier are considered seen at this time.
    started_at: Timestamp,
}

impl DeadPeerDetector {
    /// Create a detector over `server`'s registry.
    pub fn new(
        server: Arc<DirectoryServer>,
        pinger: Arc<dyn PeerPinger>,
        config: DirectoryConfig,
    ) -> Self {
        Self {
            started_at: server.now(),
            server,
            pinger,
            config,
            last_seen: DashMap::new(),
        }
    }

    /// Run one detection pass.
    pub async fn detect_dead_peers(&self) -> DetectionReport {
        let now = self.server.now();
        let snapshot = self.server.registry().snapshot();
        self.last_seen.retain(|peer_id, _| snapshot.contains_key(peer_id));

        let candidates: Vec<PeerDescriptor> = snapshot
            .values()
            .filter(|d| d.peer.is_up && !d.has_debugger_attached)
            .map(|d| PeerDescriptor::clone(d))
            .collect();

        let pinger = &self.pinger;
        let results: Vec<(PeerDescriptor, bool)> = stream::iter(candidates)
            .map(|descriptor| async move {
                let outcome = pinger.ping(&descriptor.peer).await;
                if let Err(error) = &outcome {
                    debug!(peer_id = %descriptor.peer_id(), %error, "Ping failed");
                }
                (descriptor, outcome.is_ok())
            })
            .buffer_unordered(self.config.max_concurrent_pings.max(1))
            .collect()
            .await;

        let mut report = DetectionReport {
            pinged: results.len(),
            ..DetectionReport::default()
        };

        for (descriptor, answered) in results {
            let peer_id = descriptor.peer_id().clone();
            if answered {
                self.last_seen.insert(peer_id.clone(), now);
                if !descriptor.peer.is_responding
                    && self.server.set_peer_responding(&peer_id, true).await
                {
                    report.responding.push(peer_id);
                }
                continue;
            }

            let first_seen = descriptor
                .timestamp_utc
                .map_or(self.started_at, |registered| registered.max(self.started_at))
                .min(now);
            let last_seen = *self.last_seen.entry(peer_id.clone()).or_insert(first_seen);
            let silence = now.millis_since(last_seen);

            if let Some(timeout) = self.decommission_timeout(&descriptor) {
                if silence > timeout {
                    warn!(peer_id = %peer_id, silence_ms = silence, "Decommissioning silent peer");
                    if self.server.decommission(&peer_id).await {
                        self.last_seen.remove(&peer_id);
                        report.decommissioned.push(peer_id);
                    }
                    continue;
                }
            }

            if silence > self.config.peer_ping_timeout_ms
                && descriptor.peer.is_responding
                && self.server.set_peer_responding(&peer_id, false).await
            {
                report.not_responding.push(peer_id);
            }
        }

        report
    }

    fn decommission_timeout(&self, descriptor: &PeerDescriptor) -> Option<u64> {
        if descriptor.is_persistent {
            self.config.persistent_peer_decommission_timeout_ms
        } else {
            Some(self.config.transient_peer_decommission_timeout_ms)
        }
    }

    /// Run detection passes until `shutdown` turns `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.dead_peer_check_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_ms = self.config.dead_peer_check_interval_ms,
            "Dead peer detector started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.detect_dead_peers().await;
                    if !report.is_quiet() {
                        info!(
                            pinged = report.pinged,
                            responding = report.responding.len(),
                            not_responding = report.not_responding.len(),
                            decommissioned = report.decommissioned.len(),
                            "Dead peer detection pass"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Dead peer detector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedPinger;
    use shared_bus::{BusEvent, EventFilter, InMemoryEventBus};
    use shared_types::{ControllableTimeSource, OriginatorInfo};

    struct Fixture {
        clock: Arc<ControllableTimeSource>,
        bus: Arc<InMemoryEventBus>,
        server: Arc<DirectoryServer>,
        pinger: Arc<ScriptedPinger>,
        detector: DeadPeerDetector,
    }

    fn fixture(config: DirectoryConfig) -> Fixture {
        let clock = Arc::new(ControllableTimeSource::new(1_000));
        let bus = Arc::new(InMemoryEventBus::new());
        let server = Arc::new(DirectoryServer::new(
            OriginatorInfo::new(PeerId::new("Peerbus.Directory.0"), "tcp://dir:1"),
            bus.clone(),
            clock.clone(),
        ));
        let pinger = Arc::new(ScriptedPinger::new());
        let detector = DeadPeerDetector::new(server.clone(), pinger.clone(), config);
        Fixture {
            clock,
            bus,
            server,
            pinger,
            detector,
        }
    }

    async fn register(server: &DirectoryServer, id: &str, persistent: bool) {
        let descriptor = PeerDescriptor::new(
            PeerId::new(id),
            format!("tcp://{id}:1"),
            persistent,
            vec![],
            Timestamp::from_millis(500),
        );
        server.register(descriptor).await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_peer_marked_not_responding_then_recovers() {
        let f = fixture(DirectoryConfig::for_testing());
        register(&f.server, "A", true).await;
        let id = PeerId::new("A");
        let mut events = f.bus.subscribe(EventFilter::all());

        f.pinger.set_unreachable(&id, true);
        assert!(f.detector.detect_dead_peers().await.is_quiet());

        f.clock.advance(150);
        let report = f.detector.detect_dead_peers().await;
        assert_eq!(report.not_responding, vec![id.clone()]);
        assert!(!f.server.registry().get(&id).unwrap().peer.is_responding);

        f.pinger.set_unreachable(&id, false);
        f.clock.advance(10);
        let report = f.detector.detect_dead_peers().await;
        assert_eq!(report.responding, vec![id.clone()]);

        let kinds: Vec<_> = events.drain();
        assert!(kinds
            .iter()
            .any(|e| matches!(e, BusEvent::PeerNotResponding(_))));
        assert!(kinds.iter().any(|e| matches!(e, BusEvent::PeerResponding(_))));
    }

    #[tokio::test]
    async fn test_silence_counts_from_registration() {
        let f = fixture(DirectoryConfig::for_testing());
        f.clock.advance(1_000);
        let id = PeerId::new("Late");
        f.server
            .register(PeerDescriptor::new(
                id.clone(),
                "tcp://late:1",
                true,
                vec![],
                Timestamp::from_millis(2_000),
            ))
            .await
            .unwrap();
        f.pinger.set_unreachable(&id, true);

        f.clock.advance(150);
        let report = f.detector.detect_dead_peers().await;

        assert_eq!(report.not_responding, vec![id]);
    }

    #[tokio::test]
    async fn test_transient_peer_decommissioned_after_timeout() {
        let f = fixture(DirectoryConfig::for_testing());
        register(&f.server, "T", false).await;
        let id = PeerId::new("T");
        f.pinger.set_unreachable(&id, true);

        f.detector.detect_dead_peers().await;
        f.clock.advance(600);
        let report = f.detector.detect_dead_peers().await;

        assert_eq!(report.decommissioned, vec![id.clone()]);
        assert!(f.server.registry().get(&id).is_none());
    }

    #[tokio::test]
    async fn test_persistent_peer_kept_without_configured_timeout() {
        let f = fixture(DirectoryConfig::for_testing());
        register(&f.server, "P", true).await;
        let id = PeerId::new("P");
        f.pinger.set_unreachable(&id, true);

        f.detector.detect_dead_peers().await;
        f.clock.advance(10_000);
        let report = f.detector.detect_dead_peers().await;

        assert!(report.decommissioned.is_empty());
        assert!(f.server.registry().get(&id).is_some());
    }

    #[tokio::test]
    async fn test_persistent_peer_decommissioned_with_configured_timeout() {
        let config = DirectoryConfig {
            persistent_peer_decommission_timeout_ms: Some(1_000),
            ..DirectoryConfig::for_testing()
        };
        let f = fixture(config);
        register(&f.server, "P", true).await;
        let id = PeerId::new("P");
        f.pinger.set_unreachable(&id, true);

        f.detector.detect_dead_peers().await;
        f.clock.advance(1_001);
        let report = f.detector.detect_dead_peers().await;

        assert_eq!(report.decommissioned, vec![id]);
    }

    #[tokio::test]
    async fn test_debugged_and_down_peers_are_not_pinged() {
        let f = fixture(DirectoryConfig::for_testing());
        let mut debugged = PeerDescriptor::new(
            PeerId::new("D"),
            "tcp://d:1",
            false,
            vec![],
            Timestamp::from_millis(500),
        );
        debugged.has_debugger_attached = true;
        f.server.register(debugged).await.unwrap();
        register(&f.server, "P", true).await;
        f.server
            .unregister(&PeerId::new("P"), Timestamp::from_millis(600), None)
            .await;

        let report = f.detector.detect_dead_peers().await;
        assert_eq!(report.pinged, 0);
        assert_eq!(f.pinger.ping_count(), 0);
    }

    #[tokio::test]
    async fn test_pings_are_bounded_in_flight() {
        let f = fixture(DirectoryConfig::for_testing());
        for i in 0..30 {
            register(&f.server, &format!("Peer.{i}"), false).await;
        }
        f.pinger.set_delay_ms(5);

        let report = f.detector.detect_dead_peers().await;

        assert_eq!(report.pinged, 30);
        assert!(f.pinger.max_in_flight() <= 10);
        assert!(f.pinger.max_in_flight() > 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture(DirectoryConfig::for_testing());
        let detector = Arc::new(f.detector);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(detector.run(rx));

        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("detector did not stop")
            .unwrap();
    }
}
