// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Functional tests for the upgrade reconciler.
//!
//! These tests run the production reconciler against an in-memory store
//! WITHOUT requiring a live Kubernetes cluster. Machines are simulated by
//! reading back the config patches the reconciler writes.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run a specific test
//! cargo test --test functional test_full_upgrade_follows_component_order
//! ```

mod scenario_tests;

pub use mock_state::*;
