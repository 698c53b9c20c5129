//! Shared wiring for the integration scenarios.

use pb_01_directory::{
    DirectoryClientError, DirectoryConfig, DirectoryServer, LocalDirectoryTransport,
    PeerDirectoryClient,
};
use pb_02_persistence::test_utils::RecordingTransport;
use pb_02_persistence::{InMemoryStorage, PersistenceConfig, PersistenceService};
use serde::{Deserialize, Serialize};
use shared_bus::{HandlerRegistry, InMemoryEventBus};
use shared_types::{
    BindingKey, BusMessage, MessageTypeId, OriginatorInfo, PeerDescriptor, PeerId, RoutingPart,
    Subscription, SystemTimeSource, TimeSource,
};
use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Routable sample message, keyed by region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub region: String,
    pub amount: u64,
}

impl OrderPlaced {
    pub fn new(region: &str, amount: u64) -> Self {
        Self {
            region: region.to_string(),
            amount,
        }
    }
}

impl BusMessage for OrderPlaced {
    const TYPE_NAME: &'static str = "Abc.Orders.OrderPlaced";

    fn binding_key(&self) -> BindingKey {
        BindingKey::from_parts([self.region.to_routing_part()])
    }
}

/// Non-routable sample message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockChecked {
    pub sku: String,
}

impl BusMessage for StockChecked {
    const TYPE_NAME: &'static str = "Abc.Stock.StockChecked";
}

pub fn endpoint(peer: &str) -> String {
    format!("tcp://{peer}:1")
}

pub fn originator(peer: &str) -> OriginatorInfo {
    OriginatorInfo::new(PeerId::new(peer), endpoint(peer))
}

/// Descriptor subscribing to `M` with each of `keys`.
pub fn descriptor_for<M: BusMessage>(peer: &str, persistent: bool, keys: &[&str]) -> PeerDescriptor {
    let subscriptions = keys
        .iter()
        .map(|key| {
            let key = if key.is_empty() {
                BindingKey::any()
            } else {
                BindingKey::from_parts([*key])
            };
            Subscription::new(M::message_type_id(), key)
        })
        .collect();
    let time_source = SystemTimeSource::new();
    PeerDescriptor::new(
        PeerId::new(peer),
        endpoint(peer),
        persistent,
        subscriptions,
        time_source.now(),
    )
}

/// A directory and a persistence tier sharing one event bus.
pub struct Cluster {
    pub bus: Arc<InMemoryEventBus>,
    pub directory: Arc<DirectoryServer>,
    pub directory_transport: Arc<LocalDirectoryTransport>,
    pub storage: Arc<InMemoryStorage>,
    pub peers: Arc<RecordingTransport>,
    pub persistence: Arc<PersistenceService>,
    pub persistence_handlers: HandlerRegistry<PersistenceService>,
}

impl Cluster {
    /// Wire a cluster. Must run inside a Tokio runtime.
    pub fn start() -> Self {
        init_tracing();
        let bus = Arc::new(InMemoryEventBus::new());
        let time_source: Arc<dyn TimeSource> = Arc::new(SystemTimeSource::new());

        let directory = Arc::new(DirectoryServer::new(
            originator("Peerbus.Directory.0"),
            bus.clone(),
            time_source.clone(),
        ));
        let directory_handlers = Arc::new(DirectoryServer::handler_registry(bus.clone()));
        let directory_transport = Arc::new(LocalDirectoryTransport::new(
            directory.clone(),
            directory_handlers,
        ));

        let storage = Arc::new(InMemoryStorage::new(time_source));
        let peers = Arc::new(RecordingTransport::new());
        let persistence = Arc::new(PersistenceService::new(
            originator("Peerbus.Persistence.0"),
            storage.clone(),
            peers.clone(),
            bus.clone(),
            PersistenceConfig::for_testing(),
        ));

        Self {
            persistence_handlers: PersistenceService::handler_registry(bus.clone()),
            bus,
            directory,
            directory_transport,
            storage,
            peers,
            persistence,
        }
    }

    /// A client registered as `descriptor`.
    pub async fn join(
        &self,
        descriptor: PeerDescriptor,
    ) -> Result<Arc<PeerDirectoryClient>, DirectoryClientError> {
        let client = Arc::new(PeerDirectoryClient::new(
            DirectoryConfig::for_testing(),
            self.directory_transport.clone(),
            Arc::new(SystemTimeSource::new()),
        ));
        client.register(descriptor).await?;
        Ok(client)
    }
}

/// Poll `condition` until it holds or `within` elapses.
pub async fn eventually<F>(within: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Run `future` with a generous upper bound.
pub async fn bounded<T>(future: impl Future<Output = T>) -> Option<T> {
    tokio::time::timeout(Duration::from_secs(5), future).await.ok()
}

/// The type id of `M`.
pub fn type_of<M: BusMessage>() -> MessageTypeId {
    M::message_type_id()
}
