//! Bridges listener output into the service registry
//!
//! A DiscoveryService owns a [`Listener`] and a [`ServiceRegistry`]. Its
//! background task feeds every decoded descriptor into the registry, sweeps
//! expired entries on a fixed interval, and reports changes to subscribers as
//! [`RegistryEvent`]s. The registry digest is republished on a watch channel
//! whenever its content changes. Presentation layers subscribe to those and
//! poll [`DiscoveryService::metrics`] on their own schedule.

use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use shared::ServiceDescriptor;
use crate::config::{Config, ListenerConfig, MulticastConfig, RegistryConfig};
use crate::error::{DescriptorError, Result};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::multicast::Listener;
use crate::registry::{ServiceEntry, ServiceRegistry, Upsert};
use crate::worker::{Lifecycle, WorkerHandle};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Change to the set of known services
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Discovered(ServiceEntry),
    Updated(ServiceEntry),
    Expired(String),
    /// Registry emptied by `refresh()`
    Cleared,
}

type EventSubscribers = Arc<Mutex<Vec<flume::Sender<RegistryEvent>>>>;

fn broadcast(subscribers: &EventSubscribers, event: RegistryEvent) {
    subscribers.lock().retain(|tx| match tx.try_send(event.clone()) {
        Ok(()) => true,
        Err(flume::TrySendError::Full(_)) => {
            tracing::warn!("Registry event subscriber is not keeping up, dropping event");
            true
        }
        Err(flume::TrySendError::Disconnected(_)) => false,
    });
}

/// Recompute the registry digest, notifying watchers only if it moved
fn publish_digest(registry: &ServiceRegistry, digest_tx: &watch::Sender<String>) {
    let digest = registry.digest();
    digest_tx.send_if_modified(|current| {
        if *current == digest {
            return false;
        }
        tracing::debug!("Registry digest: {}", digest);
        *current = digest;
        true
    });
}

pub struct DiscoveryService {
    listener: Listener,
    registry: Arc<ServiceRegistry>,
    sweep_interval: Duration,
    subscribers: EventSubscribers,
    digest_tx: Arc<watch::Sender<String>>,
    worker: WorkerHandle,
}

impl DiscoveryService {
    pub fn new(
        multicast: MulticastConfig,
        listener: ListenerConfig,
        registry: RegistryConfig,
    ) -> Result<Self> {
        let sweep_interval = registry.sweep_interval();
        let registry = ServiceRegistry::new(&registry)?;
        let (digest_tx, _) = watch::channel(registry.digest());
        Ok(Self {
            listener: Listener::new(multicast, listener)?,
            registry: Arc::new(registry),
            sweep_interval,
            subscribers: Arc::new(Mutex::new(Vec::new())),
            digest_tx: Arc::new(digest_tx),
            worker: WorkerHandle::new("discovery"),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.multicast.clone(),
            config.listener.clone(),
            config.registry.clone(),
        )
    }

    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Channel of registry changes from now on
    pub fn events(&self) -> flume::Receiver<RegistryEvent> {
        let (tx, rx) = flume::bounded(EVENT_CHANNEL_CAPACITY);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Registry content hash, updated only when the set of services changes
    pub fn watch_digest(&self) -> watch::Receiver<String> {
        self.digest_tx.subscribe()
    }

    pub fn services(&self) -> Vec<ServiceEntry> {
        self.registry.snapshot()
    }

    /// Listener counters, with `active_services` taken from the registry's live entries
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.listener.metrics();
        snapshot.active_services = self.registry.alive_count();
        snapshot
    }

    pub fn reset_metrics(&self) {
        self.listener.reset_metrics();
    }

    /// Forget every known service and start counting afresh
    pub fn refresh(&self) {
        self.registry.reset();
        self.listener.reset_metrics();
        publish_digest(&self.registry, &self.digest_tx);
        broadcast(&self.subscribers, RegistryEvent::Cleared);
        tracing::info!("Service list cleared for refresh");
    }

    /// Like `start()`, but the listener receives on `socket` instead of
    /// opening its own group socket
    pub fn start_with(&self, socket: UdpSocket) -> Result<()> {
        self.listener.start_with(socket)?;
        self.spawn_bridge()
    }

    fn spawn_bridge(&self) -> Result<()> {
        self.worker.spawn(|cancel| {
            let bridge = Bridge {
                registry: self.registry.clone(),
                subscribers: self.subscribers.clone(),
                digest_tx: self.digest_tx.clone(),
                metrics: self.listener.metrics_handle(),
                sweep_interval: self.sweep_interval,
            };
            bridge.run(self.listener.subscribe(), cancel)
        })?;
        Ok(())
    }
}

impl Lifecycle for DiscoveryService {
    fn start(&self) -> Result<()> {
        self.listener.start()?;
        self.spawn_bridge()?;
        tracing::info!("Discovery service started");
        Ok(())
    }

    async fn stop(&self, timeout: Duration) {
        self.worker.stop(timeout, || {}).await;
        self.listener.stop(timeout).await;
        tracing::info!("Discovery service stopped");
    }

    fn is_running(&self) -> bool {
        self.worker.is_running() && self.listener.is_running()
    }
}

struct Bridge {
    registry: Arc<ServiceRegistry>,
    subscribers: EventSubscribers,
    digest_tx: Arc<watch::Sender<String>>,
    metrics: Arc<Metrics>,
    sweep_interval: Duration,
}

impl Bridge {
    async fn run(self, rx: flume::Receiver<ServiceDescriptor>, cancel: CancellationToken) {
        let mut sweep = tokio::time::interval_at(
            tokio::time::Instant::now() + self.sweep_interval,
            self.sweep_interval,
        );
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = rx.recv_async() => {
                    match received {
                        Ok(descriptor) => self.on_descriptor(&descriptor),
                        Err(_) => {
                            tracing::warn!("Listener subscription closed");
                            break;
                        }
                    }
                }
                _ = sweep.tick() => {
                    let expired = self.registry.sweep();
                    if !expired.is_empty() {
                        publish_digest(&self.registry, &self.digest_tx);
                    }
                    for addr in expired {
                        broadcast(&self.subscribers, RegistryEvent::Expired(addr));
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Discovery bridge shutting down");
                    break;
                }
            }
        }
    }

    fn on_descriptor(&self, descriptor: &ServiceDescriptor) {
        let upsert = match self.registry.on_descriptor(descriptor) {
            Ok(upsert) => upsert,
            Err(e @ DescriptorError::Filtered { .. }) => {
                tracing::debug!("Ignoring descriptor: {}", e);
                return;
            }
            Err(e) => {
                tracing::warn!("Invalid service descriptor: {}", e);
                self.metrics.record_error();
                return;
            }
        };

        publish_digest(&self.registry, &self.digest_tx);

        let Some(entry) = descriptor.addr().and_then(|addr| self.registry.get(addr)) else {
            return;
        };
        let event = match upsert {
            Upsert::Discovered => RegistryEvent::Discovered(entry),
            Upsert::Refreshed => RegistryEvent::Updated(entry),
        };
        broadcast(&self.subscribers, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use crate::config::PublisherConfig;
    use crate::multicast::Publisher;

    const RECV: Duration = Duration::from_secs(2);

    fn service(registry: RegistryConfig) -> DiscoveryService {
        DiscoveryService::new(MulticastConfig::default(), ListenerConfig::default(), registry).unwrap()
    }

    async fn started(registry: RegistryConfig) -> (DiscoveryService, UdpSocket, SocketAddr) {
        let discovery = service(registry);
        discovery
            .start_with(UdpSocket::bind("127.0.0.1:0").await.unwrap())
            .unwrap();
        let addr = discovery.listener().local_addr().unwrap();
        (discovery, UdpSocket::bind("127.0.0.1:0").await.unwrap(), addr)
    }

    async fn next_event(rx: &flume::Receiver<RegistryEvent>) -> RegistryEvent {
        tokio::time::timeout(RECV, rx.recv_async()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_descriptors_populate_registry() {
        let (discovery, sender, addr) = started(RegistryConfig::default()).await;
        let events = discovery.events();
        assert!(discovery.is_running());

        let payload = br#"{"type":"vault-test","addr":"127.0.0.1:2004","name":"vault"}"#;
        sender.send_to(payload, addr).await.unwrap();
        match next_event(&events).await {
            RegistryEvent::Discovered(entry) => {
                assert_eq!(entry.addr, "127.0.0.1:2004");
                assert_eq!(entry.name(), "vault");
            }
            other => panic!("unexpected event {:?}", other),
        }

        sender.send_to(payload, addr).await.unwrap();
        assert!(matches!(next_event(&events).await, RegistryEvent::Updated(e) if e.seen_count == 2));

        assert_eq!(discovery.services().len(), 1);
        assert_eq!(discovery.metrics().active_services, 1);

        discovery.stop(Duration::from_secs(5)).await;
        assert!(!discovery.is_running());
    }

    #[tokio::test]
    async fn test_invalid_descriptor_is_counted_not_stored() {
        let (discovery, sender, addr) = started(RegistryConfig::default()).await;
        let events = discovery.events();

        sender.send_to(br#"{"addr":"127.0.0.1:1"}"#, addr).await.unwrap();
        sender.send_to(br#"{"type":"t","addr":"127.0.0.1:2"}"#, addr).await.unwrap();

        match next_event(&events).await {
            RegistryEvent::Discovered(entry) => assert_eq!(entry.addr, "127.0.0.1:2"),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(discovery.metrics().errors, 1);
        assert_eq!(discovery.services().len(), 1);

        discovery.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_filtered_type_is_ignored_silently() {
        let registry = RegistryConfig {
            type_filter: "vault".into(),
            ..Default::default()
        };
        let (discovery, sender, addr) = started(registry).await;
        let events = discovery.events();

        sender.send_to(br#"{"type":"printer","addr":"127.0.0.1:1"}"#, addr).await.unwrap();
        sender.send_to(br#"{"type":"vault","addr":"127.0.0.1:2"}"#, addr).await.unwrap();

        assert!(matches!(next_event(&events).await, RegistryEvent::Discovered(e) if e.addr == "127.0.0.1:2"));
        assert_eq!(discovery.metrics().errors, 0);
        assert_eq!(discovery.services().len(), 1);

        discovery.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_silent_service_expires() {
        let registry = RegistryConfig {
            liveness_secs: 0.2,
            sweep_interval_secs: 0.05,
            ..Default::default()
        };
        let (discovery, sender, addr) = started(registry).await;
        let events = discovery.events();

        sender.send_to(br#"{"type":"t","addr":"127.0.0.1:9"}"#, addr).await.unwrap();
        assert!(matches!(next_event(&events).await, RegistryEvent::Discovered(_)));

        match next_event(&events).await {
            RegistryEvent::Expired(gone) => assert_eq!(gone, "127.0.0.1:9"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(discovery.services().is_empty());
        assert_eq!(discovery.metrics().active_services, 0);

        discovery.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_digest_moves_only_on_change() {
        let registry = RegistryConfig {
            liveness_secs: 0.3,
            sweep_interval_secs: 0.05,
            ..Default::default()
        };
        let (discovery, sender, addr) = started(registry).await;
        let events = discovery.events();
        let mut digest = discovery.watch_digest();
        let empty = digest.borrow_and_update().clone();

        let payload = br#"{"type":"t","addr":"127.0.0.1:9"}"#;
        sender.send_to(payload, addr).await.unwrap();
        assert!(matches!(next_event(&events).await, RegistryEvent::Discovered(_)));
        assert!(digest.has_changed().unwrap());
        let populated = digest.borrow_and_update().clone();
        assert_ne!(populated, empty);
        assert_eq!(populated, discovery.registry().digest());

        // Same descriptor again: refreshed, but the content is unchanged
        sender.send_to(payload, addr).await.unwrap();
        assert!(matches!(next_event(&events).await, RegistryEvent::Updated(_)));
        assert!(!digest.has_changed().unwrap());

        assert!(matches!(next_event(&events).await, RegistryEvent::Expired(_)));
        assert!(digest.has_changed().unwrap());
        assert_eq!(*digest.borrow_and_update(), empty);

        discovery.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_refresh_clears_everything() {
        let (discovery, sender, addr) = started(RegistryConfig::default()).await;
        let events = discovery.events();

        sender.send_to(br#"{"type":"t","addr":"127.0.0.1:9"}"#, addr).await.unwrap();
        assert!(matches!(next_event(&events).await, RegistryEvent::Discovered(_)));

        discovery.refresh();
        assert!(matches!(next_event(&events).await, RegistryEvent::Cleared));
        assert!(discovery.services().is_empty());
        assert_eq!(discovery.metrics().packets_received, 0);
        assert!(discovery.listener().seen_addresses().is_empty());

        discovery.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    #[ignore = "requires a multicast-capable network interface"]
    async fn test_publisher_to_listener_over_multicast() {
        let multicast = MulticastConfig::default();
        let message = r#"{"type":"vault-test","addr":"127.0.0.1:2004"}"#;
        let publisher_config = PublisherConfig::default();
        let deadline = publisher_config.grace_period() + publisher_config.interval() + Duration::from_secs(1);

        let discovery = DiscoveryService::new(
            multicast.clone(),
            ListenerConfig::default(),
            RegistryConfig::default(),
        )
        .unwrap();
        let received = discovery.listener().subscribe();
        discovery.start().unwrap();

        let publisher = Publisher::new(multicast, publisher_config, message).unwrap();
        publisher.start().unwrap();

        let descriptor = tokio::time::timeout(deadline, received.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(descriptor, ServiceDescriptor::from_payload(message.as_bytes()).unwrap());
        assert!(publisher.metrics().packets_sent >= 1);

        publisher.stop(Duration::from_secs(5)).await;
        discovery.stop(Duration::from_secs(5)).await;
    }
}
