pub mod protocol;
pub mod types;

pub use types::{PayloadError, ServiceDescriptor};
