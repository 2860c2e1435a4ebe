//! Autoscaler configuration and per-pool limits

use crate::constraints::ConstraintSet;
use crate::error::AutoscaleError;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Options of the autoscaling control loop
///
/// Durations are given in whole seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct AutoscaleConfig {
    /// CPUs making up one slot; zero disables capacity accounting
    #[serde(default)]
    pub cpus_per_slot: f64,

    /// Waiting services tolerated before their demand is counted
    #[serde(default)]
    pub service_wait_count_limit: usize,

    /// Seconds services must wait before their demand is counted
    #[serde(default = "default_service_wait_time_limit")]
    pub service_wait_time_limit: u64,

    /// Minimum slots kept per pool
    #[serde(default)]
    pub slots_min_limit: u32,

    /// Maximum slots per pool, 0 for unbounded
    #[serde(default)]
    pub slots_max_limit: u32,

    /// Free slots kept above current usage
    #[serde(default)]
    pub slots_min_spare: u32,

    /// Seconds a node must stay idle before it may be destroyed
    #[serde(default = "default_node_idle_limit")]
    pub node_idle_limit: u64,

    /// Per-pool overrides of the limits above
    #[serde(default)]
    pub limits: Vec<LimitsOverride>,

    /// Seconds to wait for a requested node to join the swarm
    #[serde(default = "default_spawn_wait_time")]
    pub spawn_wait_time: u64,

    #[serde(default)]
    pub spawn_command: String,

    #[serde(default)]
    pub destroy_command: String,

    #[serde(default)]
    pub command_failure_command: String,

    /// Extra attempts for a failing command
    #[serde(default)]
    pub command_retries: u32,

    #[serde(default = "default_command_retry_wait")]
    pub command_retry_wait: u64,

    /// Upper bound for a single command attempt
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,

    /// Exit once nothing is left to manage
    #[serde(default)]
    pub terminate_when_idle: bool,

    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Minimum seconds between two cluster status reports
    #[serde(default = "default_log_interval")]
    pub log_interval: u64,
}

fn default_service_wait_time_limit() -> u64 {
    5
}

fn default_node_idle_limit() -> u64 {
    120
}

fn default_spawn_wait_time() -> u64 {
    300
}

fn default_command_retry_wait() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    10
}

fn default_log_interval() -> u64 {
    60
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            cpus_per_slot: 0.0,
            service_wait_count_limit: 0,
            service_wait_time_limit: default_service_wait_time_limit(),
            slots_min_limit: 0,
            slots_max_limit: 0,
            slots_min_spare: 0,
            node_idle_limit: default_node_idle_limit(),
            limits: Vec::new(),
            spawn_wait_time: default_spawn_wait_time(),
            spawn_command: String::new(),
            destroy_command: String::new(),
            command_failure_command: String::new(),
            command_retries: 0,
            command_retry_wait: default_command_retry_wait(),
            command_timeout: default_command_timeout(),
            terminate_when_idle: false,
            poll_interval: default_poll_interval(),
            log_interval: default_log_interval(),
        }
    }
}

impl AutoscaleConfig {
    /// Limits applying when no override matches
    pub fn default_limits(&self) -> Limits {
        Limits {
            slots_min_limit: self.slots_min_limit,
            slots_max_limit: self.slots_max_limit,
            slots_min_spare: self.slots_min_spare,
            node_idle_limit: Duration::from_secs(self.node_idle_limit),
        }
    }

    /// Resolve the override blocks against the global defaults
    pub fn resolved_limits(&self) -> HashMap<ConstraintSet, Limits> {
        let defaults = self.default_limits();
        self.limits
            .iter()
            .map(|o| (o.constraints.clone(), o.apply(&defaults)))
            .collect()
    }

    /// Check the options for contradictions
    pub fn validate(&self) -> Result<(), AutoscaleError> {
        if !self.cpus_per_slot.is_finite() || self.cpus_per_slot < 0.0 {
            return Err(AutoscaleError::Configuration(format!(
                "cpus_per_slot must be a non-negative number, got {}",
                self.cpus_per_slot
            )));
        }

        if self.poll_interval == 0 {
            return Err(AutoscaleError::Configuration(
                "poll_interval must be at least one second".to_string(),
            ));
        }

        let defaults = self.default_limits();
        defaults.validate("global")?;

        let mut seen = std::collections::HashSet::new();
        for block in &self.limits {
            if !seen.insert(&block.constraints) {
                return Err(AutoscaleError::Configuration(format!(
                    "duplicate limits block for {}",
                    block.constraints
                )));
            }
            block
                .apply(&defaults)
                .validate(&block.constraints.to_string())?;
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn log_interval(&self) -> Duration {
        Duration::from_secs(self.log_interval)
    }

    pub fn spawn_wait_time(&self) -> Duration {
        Duration::from_secs(self.spawn_wait_time)
    }

    pub fn service_wait_time_limit(&self) -> Duration {
        Duration::from_secs(self.service_wait_time_limit)
    }

    pub fn command_retry_wait(&self) -> Duration {
        Duration::from_secs(self.command_retry_wait)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout)
    }
}

/// One `limits` block overriding the global limits for a pool
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsOverride {
    pub constraints: ConstraintSet,
    pub slots_min_limit: Option<u32>,
    pub slots_max_limit: Option<u32>,
    pub slots_min_spare: Option<u32>,
    pub node_idle_limit: Option<u64>,
}

impl LimitsOverride {
    fn apply(&self, defaults: &Limits) -> Limits {
        Limits {
            slots_min_limit: self.slots_min_limit.unwrap_or(defaults.slots_min_limit),
            slots_max_limit: self.slots_max_limit.unwrap_or(defaults.slots_max_limit),
            slots_min_spare: self.slots_min_spare.unwrap_or(defaults.slots_min_spare),
            node_idle_limit: self
                .node_idle_limit
                .map(Duration::from_secs)
                .unwrap_or(defaults.node_idle_limit),
        }
    }
}

/// Effective limits of a single pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub slots_min_limit: u32,
    pub slots_max_limit: u32,
    pub slots_min_spare: u32,
    pub node_idle_limit: Duration,
}

impl Limits {
    /// Clamp a slot demand into `[slots_min_limit, slots_max_limit]`
    pub fn clamp(&self, needed: f64) -> f64 {
        let needed = needed.max(self.slots_min_limit as f64);
        if self.slots_max_limit > 0 {
            needed.min(self.slots_max_limit as f64)
        } else {
            needed
        }
    }

    /// Slots a fully idle pool shrinks down to
    pub fn idle_floor(&self) -> u32 {
        self.slots_min_limit.max(self.slots_min_spare)
    }

    fn validate(&self, pool: &str) -> Result<(), AutoscaleError> {
        if self.slots_max_limit > 0 && self.slots_max_limit < self.slots_min_limit {
            return Err(AutoscaleError::Configuration(format!(
                "slots_max_limit ({}) is below slots_min_limit ({}) for {}",
                self.slots_max_limit, self.slots_min_limit, pool
            )));
        }
        Ok(())
    }
}
