//! Shared types for the shadowfleet workspace.
//!
//! Keep cross-crate entities and wire DTOs here so the control-plane daemon
//! and any future tooling agree on one schema.

#![warn(missing_docs)]

/// Shared API DTOs for cross-crate use.
pub mod api;
