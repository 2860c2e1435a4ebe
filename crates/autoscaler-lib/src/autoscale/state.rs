//! In-memory bookkeeping of the autoscaler
//!
//! Tracks, per constraint set, how long services have been waiting and
//! which nodes have been requested but not yet seen, plus which nodes are
//! idle and which services already triggered a spawn. Nothing here is
//! persisted; a restarted autoscaler rebuilds it from the live cluster.

use super::clock::{elapsed_since, Clock};
use super::config::{AutoscaleConfig, Limits};
use crate::constraints::ConstraintSet;
use crate::error::AutoscaleError;
use crate::models::{Node, Service};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A node whose creation was requested but not yet confirmed
#[derive(Debug, Clone)]
pub struct SpawningNode {
    pub name: String,
    pub constraints: ConstraintSet,
    pub requested_at: DateTime<Utc>,
    pub last_state: Option<String>,
    pub slots: u32,
    /// Spawn command that requested the node
    pub command: String,
    /// Whether the slow-start warning was already logged
    pub warned: bool,
}

/// Slot demand of one pool for the current tick
#[derive(Debug, Clone)]
pub struct ConstraintSlots {
    pub constraints: ConstraintSet,
    /// Waiting services not yet handled
    pub services: Vec<Service>,
    /// Active nodes of the pool
    pub nodes: Vec<Node>,
    /// Positive to grow the pool, negative to shrink it
    pub slots_needed: i64,
    pub slots_total: i64,
}

#[derive(Debug, Default)]
struct PoolState {
    wait_since: Option<DateTime<Utc>>,
    spawning: HashMap<String, SpawningNode>,
}

/// Autoscaler bookkeeping, owned by the manager
pub struct AutoscaleState {
    config: AutoscaleConfig,
    limits: HashMap<ConstraintSet, Limits>,
    /// Whether services get their constraints assigned at creation time
    per_service_constraints: bool,
    clock: Arc<dyn Clock>,
    pools: HashMap<ConstraintSet, PoolState>,
    idle_nodes: HashMap<String, DateTime<Utc>>,
    handled_services: HashSet<String>,
}

impl AutoscaleState {
    pub fn new(config: AutoscaleConfig, per_service_constraints: bool, clock: Arc<dyn Clock>) -> Self {
        let limits = config.resolved_limits();
        Self {
            config,
            limits,
            per_service_constraints,
            clock,
            pools: HashMap::new(),
            idle_nodes: HashMap::new(),
            handled_services: HashSet::new(),
        }
    }

    pub fn config(&self) -> &AutoscaleConfig {
        &self.config
    }

    /// Limits of a pool, falling back to the global limits
    pub fn limits_for(&self, constraints: &ConstraintSet) -> Limits {
        self.limits
            .get(constraints)
            .copied()
            .unwrap_or_else(|| self.config.default_limits())
    }

    /// Compute `(needed, total)` slots of a pool
    ///
    /// `needed` is relative to `total`: positive means more capacity is
    /// required, negative means the pool has surplus. Slots of nodes still
    /// being spawned count as capacity already on its way.
    pub fn slots_delta(
        &self,
        constraints: &ConstraintSet,
        services: &[Service],
        nodes: &[Node],
    ) -> (i64, i64) {
        let cpus_per_slot = self.config.cpus_per_slot;
        if cpus_per_slot <= 0.0 {
            return (0, 0);
        }

        let limits = self.limits_for(constraints);
        let used = nodes.iter().map(Node::non_terminal_task_cpus).sum::<f64>() / cpus_per_slot;
        let total = nodes.iter().map(|n| n.cpus).sum::<f64>() / cpus_per_slot;

        let mut needed = used + limits.slots_min_spare as f64;
        if services.len() > self.config.service_wait_count_limit && self.waited_long_enough(constraints) {
            needed += services
                .iter()
                .map(|s| service_slots(s, cpus_per_slot))
                .sum::<f64>();
        }

        let needed = limits.clamp(needed) - self.spawning_slots(constraints) as f64;

        let total = total.round() as i64;
        (needed.round() as i64 - total, total)
    }

    /// Compute the slot demand of every known pool
    ///
    /// Pools are the union of those with waiting services, those with
    /// active nodes and those with configured limits.
    pub fn slots_needed(
        &mut self,
        mut waiting: HashMap<ConstraintSet, Vec<Service>>,
        mut active: HashMap<ConstraintSet, Vec<Node>>,
    ) -> Result<Vec<ConstraintSlots>, AutoscaleError> {
        let mut keys: BTreeSet<ConstraintSet> = waiting
            .keys()
            .chain(active.keys())
            .chain(self.limits.keys())
            .cloned()
            .collect();

        if keys.is_empty() {
            if self.config.slots_min_limit > 0 && self.per_service_constraints {
                return Err(AutoscaleError::Configuration(
                    "slots_min_limit is set but service constraints are only known once services \
                     are created; configure `limits` blocks for the pools instead"
                        .to_string(),
                ));
            }
            keys.insert(ConstraintSet::empty());
        }

        let mut result = Vec::with_capacity(keys.len());
        for constraints in keys {
            let services: Vec<Service> = waiting
                .remove(&constraints)
                .unwrap_or_default()
                .into_iter()
                .filter(|s| !self.handled_services.contains(&s.id))
                .collect();
            let nodes = active.remove(&constraints).unwrap_or_default();

            self.update_wait_timer(&constraints, !services.is_empty());
            let (slots_needed, slots_total) = self.slots_delta(&constraints, &services, &nodes);

            debug!(
                constraints = %constraints,
                services = services.len(),
                nodes = nodes.len(),
                slots_needed,
                slots_total,
                "Computed pool demand"
            );

            result.push(ConstraintSlots {
                constraints,
                services,
                nodes,
                slots_needed,
                slots_total,
            });
        }

        Ok(result)
    }

    fn update_wait_timer(&mut self, constraints: &ConstraintSet, waiting: bool) {
        let now = self.clock.now();
        if waiting {
            let pool = self.pools.entry(constraints.clone()).or_default();
            if pool.wait_since.is_none() {
                debug!(constraints = %constraints, "Services started waiting");
                pool.wait_since = Some(now);
            }
        } else if let Some(pool) = self.pools.get_mut(constraints) {
            pool.wait_since = None;
        }
    }

    fn waited_long_enough(&self, constraints: &ConstraintSet) -> bool {
        self.pools
            .get(constraints)
            .and_then(|p| p.wait_since)
            .map(|since| {
                elapsed_since(self.clock.as_ref(), since) >= self.config.service_wait_time_limit()
            })
            .unwrap_or(false)
    }

    fn spawning_slots(&self, constraints: &ConstraintSet) -> u32 {
        self.pools
            .get(constraints)
            .map(|p| p.spawning.values().map(|n| n.slots).sum())
            .unwrap_or(0)
    }

    pub fn mark_services_handled(&mut self, services: &[Service]) {
        self.handled_services
            .extend(services.iter().map(|s| s.id.clone()));
    }

    /// Forget services that are gone from the cluster
    pub fn clean_services(&mut self, services: &[Service]) {
        for service in services {
            self.handled_services.remove(&service.id);
        }
    }

    pub fn is_handled(&self, service_id: &str) -> bool {
        self.handled_services.contains(service_id)
    }

    /// Register nodes returned by a spawn command
    ///
    /// Each token is a node name, optionally suffixed with `:slots`.
    /// Returns the registered node names.
    pub fn nodes_requested<S: AsRef<str>>(
        &mut self,
        constraints: &ConstraintSet,
        tokens: &[S],
        command: &str,
    ) -> Vec<String> {
        let now = self.clock.now();
        let default_slots = self.default_node_slots();
        let pool = self.pools.entry(constraints.clone()).or_default();

        let mut names = Vec::with_capacity(tokens.len());
        for token in tokens {
            let (name, slots) = parse_node_token(token.as_ref(), default_slots);
            if pool.spawning.contains_key(name) {
                warn!(node = %name, "Node already spawning, replacing entry");
            }
            pool.spawning.insert(
                name.to_string(),
                SpawningNode {
                    name: name.to_string(),
                    constraints: constraints.clone(),
                    requested_at: now,
                    last_state: None,
                    slots,
                    command: command.to_string(),
                    warned: false,
                },
            );
            names.push(name.to_string());
        }

        info!(constraints = %constraints, nodes = ?names, "Nodes requested");
        names
    }

    fn default_node_slots(&self) -> u32 {
        if self.config.cpus_per_slot > 0.0 {
            (1.0 / self.config.cpus_per_slot).round() as u32
        } else {
            0
        }
    }

    /// Snapshot of every spawning node
    pub fn spawning_nodes(&self) -> Vec<SpawningNode> {
        self.pools
            .values()
            .flat_map(|p| p.spawning.values().cloned())
            .collect()
    }

    pub fn spawning_count(&self) -> usize {
        self.pools.values().map(|p| p.spawning.len()).sum()
    }

    pub fn spawning_node(&self, name: &str) -> Option<&SpawningNode> {
        self.pools.values().find_map(|p| p.spawning.get(name))
    }

    fn spawning_node_mut(&mut self, name: &str) -> Option<&mut SpawningNode> {
        self.pools.values_mut().find_map(|p| p.spawning.get_mut(name))
    }

    fn remove_spawning_node(&mut self, name: &str) -> Option<SpawningNode> {
        self.pools.values_mut().find_map(|p| p.spawning.remove(name))
    }

    /// The node joined the swarm and is ready
    pub fn mark_spawning_node_ready(&mut self, name: &str) -> Option<SpawningNode> {
        self.remove_spawning_node(name)
    }

    /// The node never showed up in time
    pub fn mark_spawning_node_timeout(&mut self, name: &str) -> Option<SpawningNode> {
        self.remove_spawning_node(name)
    }

    /// Record the last observed state; returns true if it changed
    pub fn mark_spawning_node_state(&mut self, name: &str, state: &str) -> bool {
        match self.spawning_node_mut(name) {
            Some(node) if node.last_state.as_deref() != Some(state) => {
                node.last_state = Some(state.to_string());
                true
            }
            _ => false,
        }
    }

    /// Flag the slow-start warning; returns true the first time
    pub fn mark_spawning_node_warned(&mut self, name: &str) -> bool {
        match self.spawning_node_mut(name) {
            Some(node) if !node.warned => {
                node.warned = true;
                true
            }
            _ => false,
        }
    }

    /// Start the idle timer of a node; returns true the first time
    ///
    /// A node still in the spawning table is never marked idle.
    pub fn mark_node_idle(&mut self, name: &str) -> bool {
        if self.spawning_node(name).is_some() || self.idle_nodes.contains_key(name) {
            return false;
        }
        self.idle_nodes.insert(name.to_string(), self.clock.now());
        true
    }

    /// Stop the idle timer of a node; returns true if it was idle
    pub fn clear_node_idle(&mut self, name: &str) -> bool {
        self.idle_nodes.remove(name).is_some()
    }

    pub fn idle_since(&self, name: &str) -> Option<DateTime<Utc>> {
        self.idle_nodes.get(name).copied()
    }

    pub fn idle_count(&self) -> usize {
        self.idle_nodes.len()
    }

    /// Drop idle timers of nodes that are no longer present
    pub fn prune_idle(&mut self, present: &HashSet<&str>) {
        self.idle_nodes.retain(|name, _| present.contains(name.as_str()));
    }

    /// Whether the node has been idle for at least its pool's idle limit
    pub fn is_destruction_time(&self, node: &Node) -> bool {
        let Some(since) = self.idle_nodes.get(&node.name) else {
            return false;
        };
        let limit = self.limits_for(&node.constraints()).node_idle_limit;
        elapsed_since(self.clock.as_ref(), *since) >= limit
    }
}

/// Slots a waiting service asks for
///
/// Services without a CPU reservation count as one slot.
fn service_slots(service: &Service, cpus_per_slot: f64) -> f64 {
    if service.cpus > 0.0 {
        service.cpus / cpus_per_slot
    } else {
        1.0
    }
}

fn parse_node_token(token: &str, default_slots: u32) -> (&str, u32) {
    match token.rsplit_once(':') {
        Some((name, slots)) if !name.is_empty() => match slots.parse() {
            Ok(slots) => (name, slots),
            Err(_) => (token, default_slots),
        },
        _ => (token, default_slots),
    }
}
