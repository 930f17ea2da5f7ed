//! Wagate core contracts and value types.
//!
//! This crate exposes the shared data structures exchanged between the
//! webhook gateway, the outbound worker, and the bootstrap worker. It also
//! provides phone-number canonicalization, NATS subject naming, the provider
//! HTTP client, and the fixed catalog of user-facing texts.

pub mod bus;
pub mod catalog;
pub mod phone;
pub mod provider;
pub mod subjects;
pub mod telemetry;
pub mod testkit;
pub mod texts;
pub mod types;

pub use bus::*;
pub use catalog::*;
pub use phone::*;
pub use provider::*;
pub use subjects::*;
pub use types::*;
