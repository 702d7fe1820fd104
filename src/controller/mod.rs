//! Controller module for kube-upgrade-operator.
//!
//! Contains the reconciliation loop, upgrade planning, the phase state
//! machine, image pre-pull gating and error handling.

// Shared modules
pub mod common;
pub mod component;
pub mod context;
pub mod error;

// Planning
pub mod patches;
pub mod topology;
pub mod upgrade_path;

// Upgrade controller
pub mod prepull;
pub mod upgrade_reconciler;
pub mod upgrade_state_machine;
