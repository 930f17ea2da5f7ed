//! Bootstrap worker internals.

pub mod config;
pub mod worker;

pub use config::BootstrapConfig;
pub use worker::BootstrapWorker;
