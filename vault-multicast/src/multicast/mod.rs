//! Multicast transport: socket set-up, the announcing publisher and the
//! receiving listener

pub mod listener;
pub mod publisher;
pub mod socket;

pub use listener::{DatagramRecv, DescriptorCallback, Listener};
pub use publisher::{DatagramSend, Publisher};
pub use socket::{open_receiver, open_sender, SenderState, SocketSlot};
