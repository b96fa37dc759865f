//! Shared test utilities for graphidx integration tests.
//!
//! This module provides:
//! - `TestHarness` wiring a manager, scheduler and SQLite store in a temp dir
//! - Scripted indexing operations and a flaky store for failure injection

pub mod fakes;
pub mod harness;

pub use fakes::*;
pub use harness::{fast_settings, TestHarness};
