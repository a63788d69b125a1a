//! Core library for the pod resource controller
//!
//! This crate provides the core functionality for:
//! - Resource quantity parsing and compliance comparison
//! - The policy index and instance matching
//! - The reconcile loop and its delete-then-recreate corrective action
//! - Health checks and structured logging
//!
//! It has no Kubernetes dependency; the cluster is reached through the
//! [`reconcile::ClusterClient`] and [`reconcile::StatusSink`] traits.

pub mod health;
pub mod models;
pub mod observability;
pub mod policy;
pub mod reconcile;
pub mod resources;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::StructuredLogger;
pub use policy::{Phase, Policy, PolicyIndex, PolicySnapshot, PolicyStatus};
