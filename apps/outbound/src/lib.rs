//! Outbound worker internals, separated from the NATS consumer loop so the
//! dispatch semantics are testable in-process.

pub mod backoff;
pub mod bootstrap_sink;
pub mod config;
pub mod dispatcher;

pub use bootstrap_sink::{BootstrapSink, InMemoryBootstrapSink, JetStreamBootstrapSink, SharedBootstrapSink};
pub use config::WorkerConfig;
pub use dispatcher::Dispatcher;
