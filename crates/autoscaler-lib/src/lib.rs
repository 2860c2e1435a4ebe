//! Docker Swarm fleet autoscaler
//!
//! This crate provides the core functionality for:
//! - Grouping swarm nodes and services into pools by placement constraints
//! - Slot accounting of each pool against its limits
//! - Spawning and destroying worker nodes through provisioning commands
//! - Health checks and observability

pub mod autoscale;
pub mod command;
pub mod constraints;
pub mod container;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;

pub use autoscale::{
    AutoscaleConfig, AutoscaleManager, AutoscaleManagerBuilder, RunOutcome, TickOutcome,
};
pub use constraints::{Constraint, ConstraintSet, Operator};
pub use container::{ContainerInterface, SwarmCli, SwarmConfig, SwarmSnapshot};
pub use error::{AutoscaleError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AutoscalerMetrics, StructuredLogger};
