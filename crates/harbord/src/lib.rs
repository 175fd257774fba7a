//! Daemon wiring for the Harbor control plane.
//!
//! The binary runs in master mode (catalog, RPC, per-pool schedulers),
//! agent mode (host agent plus the traffic mux), or both in one process.
//! This library crate exists so the integration tests can drive the same
//! wiring the binary uses.

pub mod agent_mode;
pub mod fs;
pub mod master;
pub mod runtime;
