//! Common test utilities for integration tests.

pub mod harness;

pub use harness::*;
