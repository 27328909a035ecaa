//! Shared test utilities for leadscout integration tests.
//!
//! This module provides:
//! - `TestHarness` wiring a `SearchService` over an in-memory database
//! - Fake stage runners with scripted behavior
//! - Builders for search requests and stage sets

pub mod builders;
pub mod harness;
pub mod runners;

pub use builders::*;
pub use harness::TestHarness;
pub use runners::*;
