//! Cascata Server - node binary wiring for the tiered context store.

pub mod config;
pub mod server;
pub mod telemetry;
