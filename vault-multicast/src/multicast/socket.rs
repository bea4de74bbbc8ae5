use std::fmt::Display;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use crate::config::MulticastConfig;
use crate::error::{MulticastError, Result};

/// Open the UDP socket a publisher sends announcements from.
///
/// Must be called from within a tokio runtime.
pub fn open_sender(multicast: &MulticastConfig, ttl: u32) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(MulticastError::socket("create sender socket"))?;
    socket
        .set_multicast_ttl_v4(ttl)
        .map_err(MulticastError::socket("set multicast TTL"))?;
    // Same-host listeners must see our announcements too
    socket
        .set_multicast_loop_v4(true)
        .map_err(MulticastError::socket("enable multicast loopback"))?;
    socket
        .set_nonblocking(true)
        .map_err(MulticastError::socket("make sender socket non-blocking"))?;
    socket
        .bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())
        .map_err(MulticastError::socket("bind sender socket"))?;

    let socket = UdpSocket::from_std(socket.into())
        .map_err(MulticastError::socket("register sender socket with runtime"))?;

    tracing::debug!(
        group = %multicast.group,
        port = multicast.port,
        ttl,
        "Sender socket initialized"
    );
    Ok(socket)
}

/// Open a socket bound to the group port and joined to the group on all interfaces.
///
/// Must be called from within a tokio runtime.
pub fn open_receiver(multicast: &MulticastConfig) -> Result<UdpSocket> {
    tracing::info!("Starting multicast listener on {}:{}", multicast.group, multicast.port);

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(MulticastError::socket("create listener socket"))?;
    socket
        .set_reuse_address(true)
        .map_err(MulticastError::socket("enable address reuse"))?;
    socket
        .bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, multicast.port)).into())
        .map_err(MulticastError::socket("bind listener socket"))?;
    socket
        .join_multicast_v4(&multicast.group, &Ipv4Addr::UNSPECIFIED)
        .map_err(MulticastError::socket("join multicast group"))?;
    socket
        .set_nonblocking(true)
        .map_err(MulticastError::socket("make listener socket non-blocking"))?;

    let socket = UdpSocket::from_std(socket.into())
        .map_err(MulticastError::socket("register listener socket with runtime"))?;

    tracing::debug!("Listener socket initialized");
    Ok(socket)
}

/// Sender socket recovery: `Ready -> Reinitializing -> Ready | Failed`.
///
/// `Failed` is terminal for the running loop.
#[derive(Debug)]
pub enum SenderState<S> {
    Ready(S),
    Reinitializing,
    Failed,
}

impl<S> SenderState<S> {
    pub fn socket(&self) -> Option<&S> {
        match self {
            SenderState::Ready(socket) => Some(socket),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, SenderState::Ready(_))
    }

    /// A send failed: drop the socket and wait for reinitialization
    pub fn fail(&mut self) {
        if self.is_ready() {
            *self = SenderState::Reinitializing;
        }
    }

    /// Reopen the socket. Only acts in `Reinitializing`; returns whether the
    /// state is `Ready` afterwards.
    pub fn reinit<E: Display>(&mut self, connect: impl FnOnce() -> std::result::Result<S, E>) -> bool {
        if !matches!(self, SenderState::Reinitializing) {
            return self.is_ready();
        }
        match connect() {
            Ok(socket) => {
                tracing::info!("Sender socket reinitialized");
                *self = SenderState::Ready(socket);
                true
            }
            Err(e) => {
                tracing::error!("Failed to reinitialize socket: {}", e);
                *self = SenderState::Failed;
                false
            }
        }
    }
}

/// The socket a running worker owns, reachable from `stop()`.
///
/// `close()` marks the slot closed until the next `open()`, so a loop that
/// finishes reconnecting after stop cannot put its socket back. Closing is
/// idempotent; the second close is a no-op.
#[derive(Debug)]
pub struct SocketSlot<S> {
    inner: Mutex<Slot<S>>,
}

#[derive(Debug)]
struct Slot<S> {
    socket: Option<Arc<S>>,
    closed: bool,
}

impl<S> Default for SocketSlot<S> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Slot {
                socket: None,
                closed: false,
            }),
        }
    }
}

impl<S> SocketSlot<S> {
    /// Install the socket of a freshly started worker
    pub fn open(&self, socket: Arc<S>) {
        let mut slot = self.inner.lock();
        slot.socket = Some(socket);
        slot.closed = false;
    }

    /// Swap in a reconnected socket unless the slot was closed meanwhile.
    /// Returns false, dropping `socket`, if it was.
    pub fn set_if_open(&self, socket: Arc<S>) -> bool {
        let mut slot = self.inner.lock();
        if slot.closed {
            return false;
        }
        slot.socket = Some(socket);
        true
    }

    /// Drop the current handle without closing the slot
    pub fn release(&self) {
        self.inner.lock().socket = None;
    }

    pub fn get(&self) -> Option<Arc<S>> {
        self.inner.lock().socket.clone()
    }

    /// Release the handle and refuse new ones until reopened.
    /// Returns false if there was nothing to release.
    pub fn close(&self) -> bool {
        let mut slot = self.inner.lock();
        slot.closed = true;
        slot.socket.take().is_some()
    }
}

impl SocketSlot<UdpSocket> {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.get().and_then(|s| s.local_addr().ok())
    }
}
