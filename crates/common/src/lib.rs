//! Shared wire types for the PaaS control plane workspace.
//!
//! Everything that crosses the HTTP boundary lives here so that clients and
//! the server agree on one definition.

#![warn(missing_docs)]

/// API DTOs used by the control plane and its clients.
pub mod api;
