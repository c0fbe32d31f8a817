// esdb-test-utils: shared helpers for exercising the client against an
// in-process server.

pub mod fake_node;

pub use fake_node::{FakeNode, NodeBehavior};

/// Install a fmt subscriber honoring `RUST_LOG`; repeated calls are no-ops.
pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
