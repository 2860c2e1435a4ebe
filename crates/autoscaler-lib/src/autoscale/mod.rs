//! Autoscaling of swarm worker pools
//!
//! Nodes are grouped into pools by the constraint set their labels
//! satisfy. [`AutoscaleState`] does the slot accounting of each pool and
//! [`AutoscaleManager`] acts on it.

mod clock;
mod config;
mod manager;
mod state;

#[cfg(test)]
mod tests;

pub use clock::{elapsed_since, Clock, ManualClock, SystemClock};
pub use config::{AutoscaleConfig, Limits, LimitsOverride};
pub use manager::{AutoscaleManager, AutoscaleManagerBuilder, RunOutcome, TickOutcome};
pub use state::{AutoscaleState, ConstraintSlots, SpawningNode};
