//! Test harness: stub slaves and in-memory database collaborators
//!
//! Enabled by the `testing` feature for integration tests.

mod database;
mod loopback;
mod slave;

pub use database::{MemoryLogManager, RecordingRawStore, StaticDataFactory};
pub use loopback::{LoopbackFactory, LoopbackSlave, LoopbackTransport};
pub use slave::StubSlave;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install a test-friendly subscriber once; `RUST_LOG` overrides the filter
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "logship_core=info".into());
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
