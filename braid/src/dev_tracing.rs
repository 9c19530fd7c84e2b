//! Development tracing helpers.
//!
//! Tests and benches call [`init_tracing`] to watch the engine work.
//! Multipath bugs usually hide in the handshake/mapping/reassembly
//! interplay, so the default filter enables the engine crates at
//! `debug` and leaves per-segment wire logging behind `trace`.

use tracing_subscriber::EnvFilter;

/// Default directives: the engine crates at `debug`, everything else
/// quiet. Raise a single target to `trace` via `RUST_LOG` when chasing
/// per-segment behavior, e.g. `RUST_LOG=braid_mptcp::mapping=trace`.
const ENGINE_TARGETS: &str = "braid=debug,braid_core=debug,braid_mptcp=debug";

/// Initialize a development subscriber.
///
/// `RUST_LOG` wins when set; otherwise only the engine targets are
/// enabled. Output goes through the test writer so it is captured per
/// test and shown only on failure. A no-op when a global subscriber is
/// already installed, so every test can call it unconditionally.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(ENGINE_TARGETS));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
