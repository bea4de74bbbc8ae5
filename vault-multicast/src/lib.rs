//! Service announcement and discovery over IPv4 multicast
//!
//! A [`Publisher`] periodically multicasts a JSON descriptor on a well-known
//! group and port. A [`Listener`] joins that group and decodes what it hears,
//! and a [`DiscoveryService`] feeds the descriptors into a [`ServiceRegistry`]
//! that forgets services once they stop announcing themselves.
//!
//! Delivery is best-effort: nothing is acknowledged or ordered, and a lost
//! announcement is simply replaced by the next one.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use vault_multicast::{Config, DiscoveryService, Lifecycle, Publisher};
//! use shared::ServiceDescriptor;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!
//!     let discovery = DiscoveryService::from_config(&config)?;
//!     discovery.start()?;
//!
//!     let me = ServiceDescriptor::announce("vault", "10.0.0.5:2004").with_name("vault-a");
//!     let publisher = Publisher::for_descriptor(config.multicast.clone(), config.publisher.clone(), &me)?;
//!     publisher.start()?;
//!
//!     tokio::time::sleep(Duration::from_secs(10)).await;
//!     for service in discovery.services() {
//!         println!("{} at {}", service.name(), service.addr);
//!     }
//!
//!     publisher.stop(Duration::from_secs(5)).await;
//!     discovery.stop(Duration::from_secs(5)).await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod metrics;
pub mod multicast;
pub mod registry;
pub mod worker;

pub use config::Config;
pub use discovery::{DiscoveryService, RegistryEvent};
pub use error::{DescriptorError, MulticastError, Result};
pub use metrics::{Metrics, MetricsSnapshot};
pub use multicast::{Listener, Publisher};
pub use registry::{ServiceEntry, ServiceRegistry, Upsert};
pub use worker::{scoped, Lifecycle, WorkerHandle};
