use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use shared::protocol::MAX_RECOMMENDED_PAYLOAD;
use shared::ServiceDescriptor;
use crate::config::{MulticastConfig, PublisherConfig};
use crate::error::Result;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::multicast::socket::{open_sender, SenderState, SocketSlot};
use crate::worker::{ensure_runtime, wait_or_cancelled, Lifecycle, WorkerHandle};

/// Anything the publish loop can push a datagram through
pub trait DatagramSend {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> impl Future<Output = io::Result<usize>> + Send;
}

impl DatagramSend for UdpSocket {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> impl Future<Output = io::Result<usize>> + Send {
        UdpSocket::send_to(self, buf, target)
    }
}

/// Periodically multicasts the current message.
///
/// The message can be replaced at any time; the new text goes out on the
/// next scheduled send.
pub struct Publisher {
    multicast: MulticastConfig,
    config: PublisherConfig,
    message: Arc<Mutex<String>>,
    metrics: Arc<Metrics>,
    socket: Arc<SocketSlot<UdpSocket>>,
    worker: WorkerHandle,
}

impl Publisher {
    pub fn new(
        multicast: MulticastConfig,
        config: PublisherConfig,
        message: impl Into<String>,
    ) -> Result<Self> {
        multicast.validate()?;
        config.validate()?;

        let message = message.into();
        warn_if_oversized(&message);

        Ok(Self {
            multicast,
            config,
            message: Arc::new(Mutex::new(message)),
            metrics: Arc::new(Metrics::new()),
            socket: Arc::new(SocketSlot::default()),
            worker: WorkerHandle::new("publisher"),
        })
    }

    /// Announce `descriptor` instead of a raw message
    pub fn for_descriptor(
        multicast: MulticastConfig,
        config: PublisherConfig,
        descriptor: &ServiceDescriptor,
    ) -> Result<Self> {
        Self::new(multicast, config, descriptor.to_payload())
    }

    /// Current outgoing message
    pub fn message(&self) -> String {
        self.message.lock().clone()
    }

    pub fn update_message(&self, message: impl Into<String>) {
        let message = message.into();
        warn_if_oversized(&message);
        tracing::debug!("Publisher message updated: {}", preview(&message));
        *self.message.lock() = message;
    }

    pub fn update_descriptor(&self, descriptor: &ServiceDescriptor) {
        self.update_message(descriptor.to_payload());
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
        tracing::info!("Publisher metrics reset");
    }

    /// Address of the live sender socket, if running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn multicast(&self) -> &MulticastConfig {
        &self.multicast
    }
}

impl Lifecycle for Publisher {
    fn start(&self) -> Result<()> {
        if self.worker.is_running() {
            return Ok(());
        }
        ensure_runtime()?;

        let socket = Arc::new(open_sender(&self.multicast, self.config.ttl)?);

        let publish = PublishLoop {
            target: self.multicast.target(),
            interval: self.config.interval(),
            grace_period: self.config.grace_period(),
            reinit_backoff: self.config.reinit_backoff(),
            message: self.message.clone(),
            metrics: self.metrics.clone(),
        };
        let multicast = self.multicast.clone();
        let ttl = self.config.ttl;
        let connect = move || open_sender(&multicast, ttl).map(Arc::new);
        let slot = self.socket.clone();

        // Only the start that actually spawns the loop publishes its socket
        self.worker.spawn(move |cancel| {
            slot.open(socket.clone());
            publish.run(socket, connect, slot, cancel)
        })?;
        Ok(())
    }

    async fn stop(&self, timeout: Duration) {
        self.worker
            .stop(timeout, || {
                if self.socket.close() {
                    tracing::debug!("Publisher socket closed");
                }
            })
            .await
    }

    fn is_running(&self) -> bool {
        self.worker.is_running()
    }
}

/// Everything the background send loop needs, detached from the Publisher
pub(crate) struct PublishLoop {
    pub(crate) target: SocketAddr,
    pub(crate) interval: Duration,
    pub(crate) grace_period: Duration,
    pub(crate) reinit_backoff: Duration,
    pub(crate) message: Arc<Mutex<String>>,
    pub(crate) metrics: Arc<Metrics>,
}

impl PublishLoop {
    pub(crate) async fn run<S, C>(
        self,
        socket: Arc<S>,
        connect: C,
        slot: Arc<SocketSlot<S>>,
        cancel: CancellationToken,
    ) where
        S: DatagramSend + Send + Sync + 'static,
        C: Fn() -> Result<Arc<S>> + Send + Sync + 'static,
    {
        tracing::info!(target_addr = %self.target, "Starting advertisement loop");

        // Rapid restarts must not flood the group
        if wait_or_cancelled(&cancel, self.grace_period).await {
            return;
        }

        let mut state = SenderState::Ready(socket);

        while !cancel.is_cancelled() {
            if let Some(socket) = state.socket().cloned() {
                let payload = self.message.lock().clone();
                match socket.send_to(payload.as_bytes(), self.target).await {
                    Ok(sent) => {
                        self.metrics.record_sent(sent);
                        tracing::debug!(bytes = sent, "Published: {}", preview(&payload));
                    }
                    Err(e) => {
                        tracing::error!("Error sending multicast: {}", e);
                        self.metrics.record_error();
                        state.fail();
                        slot.release();
                    }
                }
            }

            if !state.is_ready() {
                if wait_or_cancelled(&cancel, self.reinit_backoff).await {
                    break;
                }
                if !state.reinit(&connect) {
                    tracing::error!("Publisher stopped: socket could not be reinitialized");
                    break;
                }
                if let Some(socket) = state.socket() {
                    if !slot.set_if_open(socket.clone()) {
                        tracing::debug!("Publisher stopped while reconnecting, dropping new socket");
                        break;
                    }
                }
            }

            if wait_or_cancelled(&cancel, self.interval).await {
                break;
            }
        }

        tracing::info!("Advertisement loop finished");
    }
}

fn warn_if_oversized(message: &str) {
    if message.len() > MAX_RECOMMENDED_PAYLOAD {
        tracing::warn!(
            bytes = message.len(),
            "Message exceeds {} bytes and may be fragmented",
            MAX_RECOMMENDED_PAYLOAD
        );
    }
}

fn preview(message: &str) -> String {
    message.chars().take(100).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use crate::error::MulticastError;

    fn quick_config() -> PublisherConfig {
        PublisherConfig {
            interval_secs: 0.02,
            grace_period_secs: 0.0,
            reinit_backoff_secs: 0.01,
            ..Default::default()
        }
    }

    fn publish_loop(target: SocketAddr, message: &str, metrics: Arc<Metrics>) -> PublishLoop {
        let config = quick_config();
        PublishLoop {
            target,
            interval: config.interval(),
            grace_period: config.grace_period(),
            reinit_backoff: config.reinit_backoff(),
            message: Arc::new(Mutex::new(message.to_string())),
            metrics,
        }
    }

    #[derive(Default)]
    struct FlakySocket {
        broken: AtomicBool,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl DatagramSend for FlakySocket {
        fn send_to(&self, buf: &[u8], _target: SocketAddr) -> impl Future<Output = io::Result<usize>> + Send {
            let result = if self.broken.load(Ordering::SeqCst) {
                Err(io::Error::new(io::ErrorKind::Other, "network down"))
            } else {
                self.sent.lock().push(buf.to_vec());
                Ok(buf.len())
            };
            async move { result }
        }
    }

    fn unreachable_target() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[tokio::test]
    async fn test_sends_current_message_over_udp() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();
        let metrics = Arc::new(Metrics::new());
        let message = r#"{"type":"vault-test","addr":"127.0.0.1:2004"}"#;

        let sender = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let worker = WorkerHandle::new("publisher-test");
        let publish = publish_loop(target, message, metrics.clone());
        worker
            .spawn(move |cancel| {
                publish.run(sender, || Err(MulticastError::NoRuntime), Arc::new(SocketSlot::default()), cancel)
            })
            .unwrap();

        let mut buf = [0u8; 1400];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], message.as_bytes());

        worker.stop(Duration::from_secs(1), || {}).await;
        let snap = metrics.snapshot();
        assert!(snap.packets_sent >= 1);
        assert_eq!(snap.bytes_sent, snap.packets_sent * message.len() as u64);
        assert_eq!(snap.errors, 0);
    }

    #[tokio::test]
    async fn test_recovers_by_reopening_socket() {
        let metrics = Arc::new(Metrics::new());
        let broken = Arc::new(FlakySocket::default());
        broken.broken.store(true, Ordering::SeqCst);
        let healthy = Arc::new(FlakySocket::default());
        let connects = Arc::new(AtomicUsize::new(0));
        let slot = Arc::new(SocketSlot::default());

        let connect = {
            let healthy = healthy.clone();
            let connects = connects.clone();
            move || {
                connects.fetch_add(1, Ordering::SeqCst);
                Ok(healthy.clone())
            }
        };

        let worker = WorkerHandle::new("publisher-test");
        let publish = publish_loop(unreachable_target(), "hello", metrics.clone());
        let loop_slot = slot.clone();
        worker
            .spawn(move |cancel| publish.run(broken, connect, loop_slot, cancel))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(worker.is_running());
        worker.stop(Duration::from_secs(1), || {}).await;

        let snap = metrics.snapshot();
        assert_eq!(snap.errors, 1);
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert!(snap.packets_sent >= 1);
        assert!(healthy.sent.lock().iter().all(|p| p == b"hello"));
        assert!(Arc::ptr_eq(&slot.get().unwrap(), &healthy));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_during_reconnect_releases_socket() {
        let metrics = Arc::new(Metrics::new());
        let broken = Arc::new(FlakySocket::default());
        broken.broken.store(true, Ordering::SeqCst);
        let healthy = Arc::new(FlakySocket::default());
        let slot = Arc::new(SocketSlot::default());
        slot.open(broken.clone());

        let connect = {
            let healthy = healthy.clone();
            move || {
                std::thread::sleep(Duration::from_millis(200));
                Ok(healthy.clone())
            }
        };

        let worker = WorkerHandle::new("publisher-test");
        let publish = publish_loop(unreachable_target(), "hello", metrics.clone());
        let loop_slot = slot.clone();
        worker
            .spawn(move |cancel| publish.run(broken, connect, loop_slot, cancel))
            .unwrap();

        // Land the stop while connect() is still blocked
        tokio::time::sleep(Duration::from_millis(60)).await;
        let stop_slot = slot.clone();
        worker
            .stop(Duration::from_secs(2), move || {
                stop_slot.close();
            })
            .await;

        assert!(!worker.is_running());
        assert!(slot.get().is_none());
        assert!(healthy.sent.lock().is_empty());
        assert_eq!(metrics.snapshot().errors, 1);
    }

    #[tokio::test]
    async fn test_gives_up_when_reinit_fails() {
        let metrics = Arc::new(Metrics::new());
        let broken = Arc::new(FlakySocket::default());
        broken.broken.store(true, Ordering::SeqCst);

        let worker = WorkerHandle::new("publisher-test");
        let publish = publish_loop(unreachable_target(), "hello", metrics.clone());
        worker
            .spawn(move |cancel| {
                publish.run(
                    broken,
                    || Err(MulticastError::InvalidConfig("no interface".into())),
                    Arc::new(SocketSlot::default()),
                    cancel,
                )
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!worker.is_running());
        assert_eq!(metrics.snapshot().errors, 1);
        assert_eq!(metrics.snapshot().packets_sent, 0);
    }

    #[tokio::test]
    async fn test_stop_during_grace_period_sends_nothing() {
        let metrics = Arc::new(Metrics::new());
        let socket = Arc::new(FlakySocket::default());
        let mut publish = publish_loop(unreachable_target(), "hello", metrics.clone());
        publish.grace_period = Duration::from_secs(3600);

        let worker = WorkerHandle::new("publisher-test");
        let loop_socket = socket.clone();
        worker
            .spawn(move |cancel| {
                publish.run(loop_socket, || Err(MulticastError::NoRuntime), Arc::new(SocketSlot::default()), cancel)
            })
            .unwrap();

        let started = std::time::Instant::now();
        worker.stop(Duration::from_secs(5), || {}).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(socket.sent.lock().is_empty());
        assert_eq!(metrics.snapshot().packets_sent, 0);
    }

    #[tokio::test]
    async fn test_update_takes_effect_on_next_send() {
        let metrics = Arc::new(Metrics::new());
        let socket = Arc::new(FlakySocket::default());
        let publish = publish_loop(unreachable_target(), "first", metrics);
        let message = publish.message.clone();

        let worker = WorkerHandle::new("publisher-test");
        let loop_socket = socket.clone();
        worker
            .spawn(move |cancel| {
                publish.run(loop_socket, || Err(MulticastError::NoRuntime), Arc::new(SocketSlot::default()), cancel)
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        *message.lock() = "second".to_string();
        tokio::time::sleep(Duration::from_millis(80)).await;
        worker.stop(Duration::from_secs(1), || {}).await;

        let sent = socket.sent.lock();
        assert_eq!(sent.first().map(Vec::as_slice), Some(&b"first"[..]));
        assert_eq!(sent.last().map(Vec::as_slice), Some(&b"second"[..]));
    }

    #[test]
    fn test_message_round_trip_under_concurrent_reads() {
        let publisher = Arc::new(
            Publisher::new(MulticastConfig::default(), PublisherConfig::default(), "initial").unwrap(),
        );
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let publisher = publisher.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    while !done.load(Ordering::SeqCst) {
                        let msg = publisher.message();
                        assert!(msg == "initial" || msg.starts_with("message-"));
                    }
                })
            })
            .collect();

        for i in 0..1000 {
            publisher.update_message(format!("message-{}", i));
        }
        done.store(true, Ordering::SeqCst);
        for reader in readers {
            reader.join().unwrap();
        }

        assert_eq!(publisher.message(), "message-999");
    }

    #[test]
    fn test_descriptor_message() {
        let descriptor = ServiceDescriptor::announce("vault-test", "127.0.0.1:2004");
        let publisher = Publisher::for_descriptor(
            MulticastConfig::default(),
            PublisherConfig::default(),
            &descriptor,
        )
        .unwrap();

        let sent = ServiceDescriptor::from_payload(publisher.message().as_bytes()).unwrap();
        assert_eq!(sent, descriptor);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = PublisherConfig {
            ttl: 300,
            ..Default::default()
        };
        assert!(Publisher::new(MulticastConfig::default(), config, "x").is_err());
    }

    #[tokio::test]
    async fn test_lifecycle_with_real_socket() {
        let config = PublisherConfig {
            grace_period_secs: 3600.0,
            ..Default::default()
        };
        let publisher = Publisher::new(MulticastConfig::default(), config, "idle").unwrap();
        assert!(!publisher.is_running());

        publisher.start().unwrap();
        publisher.start().unwrap();
        assert!(publisher.is_running());
        assert!(publisher.local_addr().is_some());

        publisher.stop(Duration::from_secs(5)).await;
        publisher.stop(Duration::from_secs(5)).await;
        assert!(!publisher.is_running());
        assert!(publisher.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_repeated_start_keeps_live_socket() {
        let config = PublisherConfig {
            grace_period_secs: 3600.0,
            ..Default::default()
        };
        let publisher = Publisher::new(MulticastConfig::default(), config, "idle").unwrap();

        publisher.start().unwrap();
        let first = publisher.local_addr().unwrap();
        publisher.start().unwrap();
        assert_eq!(publisher.local_addr(), Some(first));

        // Restart after stop installs a fresh socket
        publisher.stop(Duration::from_secs(5)).await;
        publisher.start().unwrap();
        assert!(publisher.local_addr().is_some());
        assert!(publisher.is_running());
        publisher.stop(Duration::from_secs(5)).await;
    }
}
