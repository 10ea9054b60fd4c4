//! Shared test utilities for atlas integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated service instances over temp storage roots
//! - Fake stage adapters that stand in for the external reconstruction tools
//! - Fixture builders for uploads and GLB artifacts

pub mod adapters;
pub mod fixtures;
pub mod harness;

pub use adapters::*;
pub use fixtures::*;
pub use harness::{wait_for_report, TestHarness};
