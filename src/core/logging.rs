//! Optional tracing-subscriber bootstrap.
//!
//! The crate itself never installs a global subscriber on its own —
//! components just call `tracing::{debug,info,warn,error}!` and let
//! whatever binary embeds this crate decide. `init_tracing` is offered as a
//! convenience for examples, tests, and small standalone binaries, mirroring
//! the teacher SDK's `init_module()` without coupling library behavior to
//! it.

use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber reading `RUST_LOG` (default `info`). Safe to
/// call more than once; later calls are no-ops if a subscriber is already
/// set.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
