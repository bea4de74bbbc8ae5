use std::net::Ipv4Addr;

/// Well-known multicast group services announce on
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 1, 1, 1);
pub const DEFAULT_PORT: u16 = 5004;

/// Router hops an announcement may cross
pub const DEFAULT_TTL: u32 = 2;

/// Seconds between two announcements
pub const DEFAULT_PUBLISH_INTERVAL_SECS: f64 = 2.0;

/// Seconds a publisher waits before its first announcement
pub const DEFAULT_GRACE_PERIOD_SECS: f64 = 5.0;

/// Seconds to wait before reopening a socket after a send failure
pub const DEFAULT_REINIT_BACKOFF_SECS: f64 = 1.0;

/// Receive timeout; an idle listener wakes up this often
pub const DEFAULT_RECV_TIMEOUT_SECS: f64 = 2.0;

pub const DEFAULT_BUFFER_SIZE: usize = 1400;

/// Payloads above this size risk IP fragmentation
pub const MAX_RECOMMENDED_PAYLOAD: usize = 1400;

/// A service not heard from for this long is considered gone
pub const DEFAULT_LIVENESS_SECS: f64 = 30.0;
pub const DEFAULT_SWEEP_INTERVAL_SECS: f64 = 5.0;
pub const DEFAULT_STOP_TIMEOUT_SECS: f64 = 5.0;

/// Descriptor fields the registry depends on
pub const FIELD_TYPE: &str = "type";
pub const FIELD_ADDR: &str = "addr";
pub const FIELD_NAME: &str = "name";
pub const FIELD_TIMESTAMP: &str = "timestamp";
