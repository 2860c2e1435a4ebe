//! Metrics and event logging of the autoscaler
//!
//! Provides:
//! - Prometheus metrics (tick latency, per-pool slots, spawning/idle nodes, command failures)
//! - Structured event logging with tracing

use crate::command::CommandKind;
use crate::constraints::ConstraintSet;
use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, GaugeVec, Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for tick latency (in seconds)
///
/// A tick shells out to docker several times, so the range is wide.
const TICK_LATENCY_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AutoscalerMetricsInner> = OnceLock::new();

struct AutoscalerMetricsInner {
    tick_latency_seconds: Histogram,
    slots_total: GaugeVec,
    slots_needed: GaugeVec,
    spawning_nodes: IntGauge,
    idle_nodes: IntGauge,
    nodes_spawned: IntCounter,
    nodes_destroyed: IntCounter,
    command_failures: IntCounterVec,
    tick_errors: IntCounter,
}

impl AutoscalerMetricsInner {
    fn new() -> Self {
        Self {
            tick_latency_seconds: register_histogram!(
                "swarm_autoscaler_tick_latency_seconds",
                "Time spent in one pass of the autoscaling loop",
                TICK_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_latency_seconds"),

            slots_total: register_gauge_vec!(
                "swarm_autoscaler_slots_total",
                "Slots provided by the active nodes of a pool",
                &["constraints"]
            )
            .expect("Failed to register slots_total"),

            slots_needed: register_gauge_vec!(
                "swarm_autoscaler_slots_needed",
                "Slots a pool should grow (positive) or shrink (negative) by",
                &["constraints"]
            )
            .expect("Failed to register slots_needed"),

            spawning_nodes: register_int_gauge!(
                "swarm_autoscaler_spawning_nodes",
                "Nodes requested but not yet ready"
            )
            .expect("Failed to register spawning_nodes"),

            idle_nodes: register_int_gauge!(
                "swarm_autoscaler_idle_nodes",
                "Nodes currently counting down their idle limit"
            )
            .expect("Failed to register idle_nodes"),

            nodes_spawned: register_int_counter!(
                "swarm_autoscaler_nodes_spawned_total",
                "Nodes requested from the spawn command"
            )
            .expect("Failed to register nodes_spawned"),

            nodes_destroyed: register_int_counter!(
                "swarm_autoscaler_nodes_destroyed_total",
                "Nodes handed to the destroy command"
            )
            .expect("Failed to register nodes_destroyed"),

            command_failures: register_int_counter_vec!(
                "swarm_autoscaler_command_failures_total",
                "Provisioning commands that failed after all retries",
                &["kind"]
            )
            .expect("Failed to register command_failures"),

            tick_errors: register_int_counter!(
                "swarm_autoscaler_tick_errors_total",
                "Loop passes aborted by an error"
            )
            .expect("Failed to register tick_errors"),
        }
    }
}

/// Autoscaler metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct AutoscalerMetrics {
    _private: (),
}

impl Default for AutoscalerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AutoscalerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AutoscalerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AutoscalerMetricsInner {
        GLOBAL_METRICS.get_or_init(AutoscalerMetricsInner::new)
    }

    pub fn observe_tick_latency(&self, duration_secs: f64) {
        self.inner().tick_latency_seconds.observe(duration_secs);
    }

    /// Update the slot gauges of one pool
    pub fn set_pool_slots(&self, constraints: &ConstraintSet, needed: i64, total: i64) {
        let label = constraints.to_string();
        let inner = self.inner();
        inner
            .slots_needed
            .with_label_values(&[&label])
            .set(needed as f64);
        inner.slots_total.with_label_values(&[&label]).set(total as f64);
    }

    /// Drop the slot gauges of a pool that no longer exists
    pub fn remove_pool_slots(&self, constraints: &ConstraintSet) {
        let label = constraints.to_string();
        let inner = self.inner();
        let _ = inner.slots_needed.remove_label_values(&[&label]);
        let _ = inner.slots_total.remove_label_values(&[&label]);
    }

    pub fn set_node_counts(&self, spawning: usize, idle: usize) {
        self.inner().spawning_nodes.set(spawning as i64);
        self.inner().idle_nodes.set(idle as i64);
    }

    pub fn inc_nodes_spawned(&self, count: usize) {
        self.inner().nodes_spawned.inc_by(count as u64);
    }

    pub fn inc_nodes_destroyed(&self, count: usize) {
        self.inner().nodes_destroyed.inc_by(count as u64);
    }

    pub fn inc_command_failures(&self, kind: CommandKind) {
        self.inner()
            .command_failures
            .with_label_values(&[&kind.to_string()])
            .inc();
    }

    pub fn inc_tick_errors(&self) {
        self.inner().tick_errors.inc();
    }
}

/// Structured logger for autoscaler events
///
/// Every event carries an `event` field so log pipelines can filter on
/// it, and the `cluster` the autoscaler manages.
#[derive(Clone)]
pub struct StructuredLogger {
    cluster: String,
}

impl StructuredLogger {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }

    pub fn log_startup(&self, version: &str, poll_interval_secs: u64) {
        info!(
            event = "autoscaler_started",
            cluster = %self.cluster,
            version = %version,
            poll_interval_secs = poll_interval_secs,
            "Swarm autoscaler started"
        );
    }

    /// Log nodes returned by the spawn command
    pub fn log_spawn_requested(
        &self,
        constraints: &ConstraintSet,
        nodes: &[String],
        services: usize,
        slots: i64,
    ) {
        info!(
            event = "nodes_spawn_requested",
            cluster = %self.cluster,
            constraints = %constraints,
            nodes = ?nodes,
            services = services,
            slots = slots,
            "Requested new nodes"
        );
    }

    pub fn log_nodes_destroyed(&self, constraints: &ConstraintSet, nodes: &[String], slots: u64) {
        info!(
            event = "nodes_destroyed",
            cluster = %self.cluster,
            constraints = %constraints,
            nodes = ?nodes,
            slots = slots,
            "Destroyed idle nodes"
        );
    }

    pub fn log_spawn_timeout(&self, node: &str, constraints: &ConstraintSet, waited_secs: u64) {
        warn!(
            event = "spawn_timeout",
            cluster = %self.cluster,
            node = %node,
            constraints = %constraints,
            waited_secs = waited_secs,
            "Requested node never joined the swarm"
        );
    }

    pub fn log_command_failed(&self, kind: CommandKind, command: &str) {
        warn!(
            event = "command_failed",
            cluster = %self.cluster,
            kind = %kind,
            command = %command,
            "Provisioning command failed"
        );
    }

    pub fn log_idle_termination(&self) {
        info!(
            event = "idle_termination",
            cluster = %self.cluster,
            "Nothing left to manage, terminating"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "autoscaler_shutdown",
            cluster = %self.cluster,
            reason = %reason,
            "Swarm autoscaler shutting down"
        );
    }
}
