//! Worker pool for Crucible.
//!
//! Picks a registered container host that satisfies a container spec,
//! allocates containers tagged with identifying properties, and keeps them
//! alive with a keepalive heartbeat until released.

mod heartbeat;
mod http;
mod pool;

pub use heartbeat::HeartbeatedContainer;
pub use http::{HttpContainerHost, HttpDialer};
pub use pool::{ContainerHost, HostContainerSpec, HostDialer, Pool};
