//! Test utilities for txcoord integration tests
//!
//! CoordinatorFixture starts a coordinator on a private log directory with
//! timings short enough for tests.

pub mod coordinator_fixture;
