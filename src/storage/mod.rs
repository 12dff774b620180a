//! The tiered key-value substrate: local cache, shared cache, persistent
//! store, the hybrid router that ties them together, and typed façades
//! over the router.

pub mod hybrid;
pub mod local;
pub mod persistent;
pub mod shared;
pub mod typed;
pub mod value;

pub use hybrid::Hybrid;
pub use local::LocalCache;
pub use persistent::{MemoryPersistent, NullPersistent, Persistent};
pub use shared::{SharedCache, SharedMemory};
pub use typed::{Typed, TypedJson};
pub use value::{Entry, Value};
