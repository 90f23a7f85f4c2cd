//! Shared test utilities for integration, property and chaos tests.
//!
//! This module provides:
//! - Catalog model and row fixtures
//! - A fault-injecting catalog wrapper

#![allow(dead_code)]

pub mod faulty;
pub mod fixtures;

pub use faulty::*;
pub use fixtures::*;

/// Route engine logs to the test harness. `RUST_LOG=catalog_replication=debug` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
