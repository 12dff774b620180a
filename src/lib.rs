//! tunnox-core: the storage substrate and cross-node data-plane transport
//! for the Tunnox reverse-tunneling service.
//!
//! Two halves, composed but independently usable:
//! - [`storage`]: a tiered key-value abstraction ([`storage::Hybrid`])
//!   routing each key to an in-process, cross-node, or durable tier by
//!   prefix-based classification.
//! - [`transport`]: a pooled, frame-multiplexed TCP transport
//!   ([`transport::NodeConnPool`], [`transport::FrameStream`]) tunnels use
//!   to stream data between cluster nodes.

pub mod core;
pub mod lifecycle;
pub mod metrics;
pub mod storage;
pub mod transport;

pub use crate::core::error::{Error, NetworkError, Result};
pub use crate::lifecycle::{Closeable, ResourceSupervisor};

/// Re-exports the most commonly used types with a single
/// `use tunnox_core::prelude::*`.
pub mod prelude {
    pub use crate::core::clock::{Clock, SystemClock, TestClock};
    pub use crate::core::config::{Category, HybridConfig};
    pub use crate::core::error::{Error, NetworkError, Result};
    pub use crate::lifecycle::{Closeable, ResourceSupervisor};
    pub use crate::metrics::{self, MetricsBackend, MetricsStore};
    pub use crate::storage::{Hybrid, LocalCache, NullPersistent, Persistent, SharedCache, SharedMemory, Typed, TypedJson, Value};
    pub use crate::transport::{CommandMessage, Conn, FrameStream, FrameType, NodeConnPool, PoolConfig, TunnelId};
}
