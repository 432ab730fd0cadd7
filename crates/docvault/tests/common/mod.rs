//! Shared test utilities for docvault integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated test execution with a temp storage root and database
//! - Builders that generate upload fixtures (JPEG, PNG, DOCX) at runtime

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
