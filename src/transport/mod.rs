//! Pooled, frame-multiplexed TCP transport used by tunnels to stream data
//! between cluster nodes.

pub mod conn;
pub mod frame;
pub mod pool;
pub mod stream;

pub use conn::Conn;
pub use frame::{read_frame, write_frame, CommandMessage, FrameType, TunnelId, HEADER_SIZE, MAX_FRAME_SIZE};
pub use pool::{NodeConnPool, PoolConfig, PoolStatsSnapshot};
pub use stream::{FrameStream, TunnelStateTracker};
