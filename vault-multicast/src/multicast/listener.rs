use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use shared::ServiceDescriptor;
use crate::config::{ListenerConfig, MulticastConfig};
use crate::error::Result;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::multicast::socket::{open_receiver, SocketSlot};
use crate::worker::{ensure_runtime, panic_message, wait_or_cancelled, Lifecycle, WorkerHandle};

/// Events buffered per subscriber before new ones are dropped
const SUBSCRIBER_CAPACITY: usize = 1024;

/// Pause after a transient receive error
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(100);

/// Anything the receive loop can pull a datagram from
pub trait DatagramRecv {
    fn recv_from(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;
}

impl DatagramRecv for UdpSocket {
    fn recv_from(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send {
        UdpSocket::recv_from(self, buf)
    }
}

/// Callback invoked for every decoded descriptor. An `Err` or a panic is
/// logged and counted; it never stops the listener.
pub type DescriptorCallback = Arc<dyn Fn(&ServiceDescriptor) -> anyhow::Result<()> + Send + Sync>;

/// Consumers of decoded descriptors
#[derive(Default)]
pub(crate) struct Observers {
    subscribers: Mutex<Vec<flume::Sender<ServiceDescriptor>>>,
    callbacks: Mutex<Vec<DescriptorCallback>>,
}

impl Observers {
    fn subscribe(&self) -> flume::Receiver<ServiceDescriptor> {
        let (tx, rx) = flume::bounded(SUBSCRIBER_CAPACITY);
        self.subscribers.lock().push(tx);
        rx
    }

    fn add_callback(&self, callback: DescriptorCallback) {
        self.callbacks.lock().push(callback);
    }

    /// Deliver to every observer; returns how many callbacks failed
    fn emit(&self, descriptor: &ServiceDescriptor) -> usize {
        self.subscribers.lock().retain(|tx| match tx.try_send(descriptor.clone()) {
            Ok(()) => true,
            Err(flume::TrySendError::Full(_)) => {
                tracing::warn!("Subscriber is not keeping up, dropping descriptor");
                true
            }
            Err(flume::TrySendError::Disconnected(_)) => false,
        });

        // User code runs without our locks held
        let callbacks = self.callbacks.lock().clone();
        callbacks
            .iter()
            .filter(|callback| !invoke(callback, descriptor))
            .count()
    }
}

fn invoke(callback: &DescriptorCallback, descriptor: &ServiceDescriptor) -> bool {
    match catch_unwind(AssertUnwindSafe(|| callback(descriptor))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::error!("Callback error: {:#}", e);
            false
        }
        Err(panic) => {
            tracing::error!("Callback panicked: {}", panic_message(&*panic));
            false
        }
    }
}

/// Joins the multicast group and turns incoming datagrams into descriptors.
pub struct Listener {
    multicast: MulticastConfig,
    config: ListenerConfig,
    metrics: Arc<Metrics>,
    observers: Arc<Observers>,
    addresses: Arc<Mutex<HashSet<String>>>,
    socket: Arc<SocketSlot<UdpSocket>>,
    worker: WorkerHandle,
}

impl Listener {
    pub fn new(multicast: MulticastConfig, config: ListenerConfig) -> Result<Self> {
        multicast.validate()?;
        config.validate()?;

        Ok(Self {
            multicast,
            config,
            metrics: Arc::new(Metrics::new()),
            observers: Arc::new(Observers::default()),
            addresses: Arc::new(Mutex::new(HashSet::new())),
            socket: Arc::new(SocketSlot::default()),
            worker: WorkerHandle::new("listener"),
        })
    }

    /// Channel receiving every decoded descriptor from now on
    pub fn subscribe(&self) -> flume::Receiver<ServiceDescriptor> {
        self.observers.subscribe()
    }

    pub fn on_descriptor<F>(&self, callback: F)
    where
        F: Fn(&ServiceDescriptor) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.observers.add_callback(Arc::new(callback));
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn metrics_handle(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Reset counters and forget every address seen so far
    pub fn reset_metrics(&self) {
        let mut addresses = self.addresses.lock();
        addresses.clear();
        self.metrics.reset();
        tracing::info!("Listener metrics reset");
    }

    /// Distinct `addr` values seen since the last reset
    pub fn seen_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<_> = self.addresses.lock().iter().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn multicast(&self) -> &MulticastConfig {
        &self.multicast
    }

    /// Run the receive loop on an already configured socket.
    ///
    /// `start()` uses this with a socket joined to the configured group.
    pub fn start_with(&self, socket: UdpSocket) -> Result<()> {
        let socket = Arc::new(socket);
        let receive = self.receive_loop();
        let slot = self.socket.clone();
        self.worker.spawn(move |cancel| {
            slot.open(socket.clone());
            receive.run(socket, cancel)
        })?;
        Ok(())
    }

    fn receive_loop(&self) -> ReceiveLoop {
        ReceiveLoop {
            recv_timeout: self.config.recv_timeout(),
            buffer_size: self.config.buffer_size,
            metrics: self.metrics.clone(),
            observers: self.observers.clone(),
            addresses: self.addresses.clone(),
        }
    }
}

impl Lifecycle for Listener {
    fn start(&self) -> Result<()> {
        if self.worker.is_running() {
            return Ok(());
        }
        ensure_runtime()?;
        let socket = open_receiver(&self.multicast)?;
        self.start_with(socket)
    }

    async fn stop(&self, timeout: Duration) {
        self.worker
            .stop(timeout, || {
                if self.socket.close() {
                    tracing::debug!("Listener socket closed");
                }
            })
            .await
    }

    fn is_running(&self) -> bool {
        self.worker.is_running()
    }
}

pub(crate) struct ReceiveLoop {
    recv_timeout: Duration,
    buffer_size: usize,
    metrics: Arc<Metrics>,
    observers: Arc<Observers>,
    addresses: Arc<Mutex<HashSet<String>>>,
}

impl ReceiveLoop {
    async fn run<S>(self, socket: Arc<S>, cancel: CancellationToken)
    where
        S: DatagramRecv + Send + Sync + 'static,
    {
        tracing::info!("Entering receive loop");
        let mut buf = vec![0u8; self.buffer_size];

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                r = tokio::time::timeout(self.recv_timeout, socket.recv_from(&mut buf)) => r,
            };

            match received {
                // Idle: nothing announced within the timeout
                Err(_) => continue,
                Ok(Ok((len, from))) => self.handle_datagram(&buf[..len], from),
                Ok(Err(_)) if cancel.is_cancelled() => break,
                Ok(Err(e)) if is_transient(&e) => {
                    tracing::warn!("Transient receive error: {}", e);
                    self.metrics.record_error();
                    if wait_or_cancelled(&cancel, TRANSIENT_BACKOFF).await {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    tracing::error!("Socket error: {}", e);
                    self.metrics.record_error();
                    break;
                }
            }
        }

        tracing::info!("Receive loop finished");
    }

    fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        self.metrics.record_received(data.len());

        let descriptor = match ServiceDescriptor::from_payload(data) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                tracing::warn!(%from, "Discarding datagram: {}", e);
                self.metrics.record_error();
                return;
            }
        };
        tracing::debug!(%from, bytes = data.len(), "Received {}", descriptor);

        if let Some(addr) = descriptor.addr() {
            let mut addresses = self.addresses.lock();
            addresses.insert(addr.to_string());
            self.metrics.set_active_services(addresses.len());
        }

        for _ in 0..self.observers.emit(&descriptor) {
            self.metrics.record_error();
        }
    }
}

/// Errors worth retrying after a short pause; any other receive error ends the loop
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
    )
}
