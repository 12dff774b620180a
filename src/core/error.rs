//! Crate-wide error taxonomy.
//!
//! Each subsystem keeps its own `thiserror` enum for the errors only it can
//! produce; this module rolls them into the single [`Error`] that crosses
//! component boundaries, following the same one-enum-per-subsystem-plus-a-
//! top-level-enum shape the rest of the crate's ambient stack uses.

use thiserror::Error;

/// Errors surfaced by the TCP transport layer (dial, read, write, pool wait).
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("operation timed out")]
    Timeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection refused")]
    ConnectionRefused,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// Classifies an I/O error using the "connection-closed" allowlist from
    /// §4.7/§4.9: these never mark a [`super::super::transport::conn::Conn`]
    /// broken because they represent a clean or expected teardown rather
    /// than a protocol-desyncing failure.
    pub fn is_closed_not_broken(err: &std::io::Error) -> bool {
        use std::io::ErrorKind::*;
        matches!(
            err.kind(),
            UnexpectedEof
                | ConnectionReset
                | BrokenPipe
                | NotConnected
                | ConnectionAborted
                | ConnectionRefused
                | TimedOut
        )
    }
}

/// Crate-wide error type returned by every public fallible operation.
#[derive(Debug, Error)]
pub enum Error {
    /// A lookup found no entry for the key. Recoverable; callers may treat
    /// this as "absent" rather than a hard failure.
    #[error("key not found")]
    KeyNotFound,

    /// A [`crate::storage::typed::Typed`] facade saw a value of the wrong
    /// underlying shape.
    #[error("invalid type: expected {expected}, found {actual}")]
    InvalidType {
        expected: &'static str,
        actual: &'static str,
    },

    /// A frame's length exceeded `MaxFrameSize` or a control message failed
    /// to parse. Fatal for the connection it was read from.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// Any transport I/O failure, further classified by [`NetworkError`].
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// A shared-cache or persistent-backend operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Aggregated failures from a multi-component `close()`.
    #[error("cleanup error: {0:?}")]
    Cleanup(Vec<String>),

    /// [`crate::metrics::try_global`] was called before [`crate::metrics::set_global`].
    #[error("metrics store not initialized")]
    NotInitialized,

    /// Reserved for taxonomy parity with spec.md §7's `ErrNilMetrics`. An
    /// `Arc<dyn MetricsStore>` has no null representation, so
    /// [`crate::metrics::set_global`] can't actually be called with one —
    /// the Rust type system makes this variant unreachable rather than a
    /// runtime check.
    #[error("metrics store must not be nil")]
    NilMetrics,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
