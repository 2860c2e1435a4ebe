//! The autoscaling control loop
//!
//! Each tick reads a fresh snapshot of the swarm, compares the slot demand
//! of every pool against its capacity, and asks the provisioning commands
//! for more nodes or for the removal of idle ones. Requested nodes are
//! tracked until they join the swarm, at which point they get the labels
//! of the pool they were spawned for.

use super::clock::{elapsed_since, Clock, SystemClock};
use super::config::AutoscaleConfig;
use super::state::{AutoscaleState, ConstraintSlots};
use crate::command::{
    CommandExecutor, CommandKind, CommandRunner, CommandTemplate, ShellExecutor, EXIT_RETRY_LATER,
};
use crate::constraints::{ConstraintSet, CPUS_LABEL, IMAGE_LABEL};
use crate::container::{ContainerInterface, SwarmSnapshot};
use crate::error::{AutoscaleError, Result};
use crate::health::{components, HealthRegistry};
use crate::models::{Node, Service};
use crate::observability::{AutoscalerMetrics, StructuredLogger};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// What the loop should do after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// Nothing is left to manage and `terminate_when_idle` is set
    Terminate,
}

/// Why [`AutoscaleManager::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Shutdown,
    IdleTermination,
}

/// Drives the swarm towards the slot demand of its services
pub struct AutoscaleManager {
    container: Arc<dyn ContainerInterface>,
    runner: CommandRunner,
    state: AutoscaleState,
    spawn_command: CommandTemplate,
    destroy_command: CommandTemplate,
    clock: Arc<dyn Clock>,
    health: HealthRegistry,
    metrics: AutoscalerMetrics,
    logger: StructuredLogger,
    last_state_log: Option<DateTime<Utc>>,
    reported_pools: HashSet<ConstraintSet>,
}

impl AutoscaleManager {
    pub fn state(&self) -> &AutoscaleState {
        &self.state
    }

    fn config(&self) -> &AutoscaleConfig {
        self.state.config()
    }

    /// Run the loop until shutdown, idle termination or a fatal error
    pub async fn run(
        mut self,
        poll_interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<RunOutcome> {
        if poll_interval.is_zero() {
            return Err(AutoscaleError::Configuration(
                "poll interval must be non-zero".to_string(),
            ));
        }

        info!(
            poll_interval_secs = poll_interval.as_secs(),
            terminate_when_idle = self.config().terminate_when_idle,
            "Starting autoscaler loop"
        );

        for component in [
            components::MANAGER,
            components::CONTAINER_INTERFACE,
            components::PROVISIONER,
        ] {
            self.health.register(component).await;
        }

        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(TickOutcome::Continue) => {
                            self.health.set_healthy(components::MANAGER).await;
                        }
                        Ok(TickOutcome::Terminate) => {
                            self.logger.log_idle_termination();
                            return Ok(RunOutcome::IdleTermination);
                        }
                        Err(e) if e.is_fatal() => {
                            error!(error = %e, "Stopping autoscaler loop");
                            self.health.set_unhealthy(components::MANAGER, e.to_string()).await;
                            return Err(e);
                        }
                        Err(e) => {
                            error!(error = %e, "Autoscaler tick failed");
                            self.metrics.inc_tick_errors();
                            if matches!(e, AutoscaleError::Docker { .. } | AutoscaleError::Parse { .. }) {
                                self.health
                                    .set_degraded(components::CONTAINER_INTERFACE, e.to_string())
                                    .await;
                            }
                            self.health.set_degraded(components::MANAGER, e.to_string()).await;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down autoscaler loop");
                    return Ok(RunOutcome::Shutdown);
                }
            }
        }
    }

    /// One pass of the control loop
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        let start = Instant::now();

        let snapshot = self.container.snapshot().await?;

        self.maintain_pool(&snapshot).await?;
        self.check_for_new_nodes(&snapshot.nodes).await;
        let removed = self.clean_services(&snapshot.services).await?;
        self.log_state(&snapshot, &removed);
        let terminate = self.terminate_if_idle(&snapshot);

        self.health.set_healthy(components::CONTAINER_INTERFACE).await;
        self.metrics
            .set_node_counts(self.state.spawning_count(), self.state.idle_count());
        self.metrics
            .observe_tick_latency(start.elapsed().as_secs_f64());

        Ok(if terminate {
            TickOutcome::Terminate
        } else {
            TickOutcome::Continue
        })
    }

    /// Track idle nodes, then grow or shrink every pool
    async fn maintain_pool(&mut self, snapshot: &SwarmSnapshot) -> Result<()> {
        let waiting = snapshot.services_waiting();
        let active = snapshot.nodes_active();

        let present: HashSet<&str> = active.values().flatten().map(|n| n.name.as_str()).collect();
        self.state.prune_idle(&present);

        for node in active.values().flatten() {
            if node.destroyable() {
                if self.state.mark_node_idle(&node.name) {
                    debug!(node = %node.name, "Node became idle");
                }
            } else if self.state.clear_node_idle(&node.name) {
                debug!(node = %node.name, "Node is busy again");
            }
        }

        let pools = self.state.slots_needed(waiting, active)?;
        for pool in &pools {
            self.metrics
                .set_pool_slots(&pool.constraints, pool.slots_needed, pool.slots_total);
        }
        let current: HashSet<ConstraintSet> = pools.iter().map(|p| p.constraints.clone()).collect();
        for gone in self.reported_pools.difference(&current) {
            self.metrics.remove_pool_slots(gone);
        }
        self.reported_pools = current;

        for pool in &pools {
            if pool.slots_needed > 0 {
                self.spawn_nodes(pool).await;
            } else if pool.slots_needed < 0 {
                self.destroy_nodes(pool).await;
            }
        }

        Ok(())
    }

    async fn spawn_nodes(&mut self, pool: &ConstraintSlots) {
        let (image, cpus) = match pool.services.first() {
            Some(service) => (service.image.clone(), service.cpus.to_string()),
            None => (
                pool.constraints.value_of(IMAGE_LABEL).unwrap_or_default().to_string(),
                pool.constraints.value_of(CPUS_LABEL).unwrap_or_default().to_string(),
            ),
        };
        let service_ids: Vec<&str> = pool.services.iter().map(|s| s.id.as_str()).collect();

        let vars = [
            ("service_ids", service_ids.join(" ")),
            ("service_count", pool.services.len().to_string()),
            ("image", image),
            ("cpus", cpus),
            ("slots", pool.slots_needed.to_string()),
        ];
        let rendered = self.spawn_command.render(&vars);

        info!(
            constraints = %pool.constraints,
            slots = pool.slots_needed,
            services = pool.services.len(),
            "Pool needs more slots"
        );

        let Some(output) = self
            .runner
            .run(CommandKind::Spawn, &self.spawn_command, &vars, &[EXIT_RETRY_LATER])
            .await
        else {
            self.provisioning_failed(CommandKind::Spawn, &rendered).await;
            return;
        };

        if output.code == EXIT_RETRY_LATER {
            info!(constraints = %pool.constraints, "Spawn command asked to retry later");
            return;
        }

        let tokens: Vec<&str> = output.stdout.split_whitespace().collect();
        if tokens.is_empty() {
            info!(constraints = %pool.constraints, "Spawn command returned no nodes");
        } else {
            let names = self
                .state
                .nodes_requested(&pool.constraints, &tokens, &rendered);
            self.metrics.inc_nodes_spawned(names.len());
            self.logger.log_spawn_requested(
                &pool.constraints,
                &names,
                pool.services.len(),
                pool.slots_needed,
            );
        }

        self.state.mark_services_handled(&pool.services);
        self.health.set_healthy(components::PROVISIONER).await;
    }

    /// Drain and destroy nodes idle past their limit, up to the surplus
    async fn destroy_nodes(&mut self, pool: &ConstraintSlots) {
        let surplus = pool.slots_needed.unsigned_abs();
        let cpus_per_slot = self.config().cpus_per_slot;

        let mut candidates: Vec<&Node> = pool
            .nodes
            .iter()
            .filter(|n| n.destroyable() && self.state.is_destruction_time(n))
            .collect();
        candidates.sort_by_key(|n| self.state.idle_since(&n.name));

        let mut accumulated = 0u64;
        let mut selected = Vec::new();
        for node in candidates {
            let slots = node.slots(cpus_per_slot).round() as u64;
            if accumulated + slots > surplus {
                continue;
            }
            accumulated += slots;
            selected.push(node);
        }

        if selected.is_empty() {
            return;
        }

        let mut drained = Vec::with_capacity(selected.len());
        for node in selected {
            match self.container.drain_node(node).await {
                Ok(()) => drained.push(node.name.clone()),
                Err(e) => warn!(node = %node.name, error = %e, "Could not drain node"),
            }
        }

        if drained.is_empty() {
            return;
        }

        let vars = [("nodes", drained.join(" "))];
        let rendered = self.destroy_command.render(&vars);

        match self
            .runner
            .run(CommandKind::Destroy, &self.destroy_command, &vars, &[])
            .await
        {
            Some(_) => {
                for name in &drained {
                    self.state.clear_node_idle(name);
                }
                self.metrics.inc_nodes_destroyed(drained.len());
                self.logger
                    .log_nodes_destroyed(&pool.constraints, &drained, accumulated);
                self.health.set_healthy(components::PROVISIONER).await;
            }
            None => self.provisioning_failed(CommandKind::Destroy, &rendered).await,
        }
    }

    async fn provisioning_failed(&self, kind: CommandKind, command: &str) {
        self.metrics.inc_command_failures(kind);
        self.logger.log_command_failed(kind, command);
        self.health
            .set_degraded(components::PROVISIONER, format!("{kind} command failed"))
            .await;
    }

    /// Reconcile spawning nodes against the nodes of the swarm
    async fn check_for_new_nodes(&mut self, nodes: &[Node]) {
        let spawning = self.state.spawning_nodes();
        if spawning.is_empty() {
            return;
        }

        let by_name: HashMap<&str, &Node> = nodes.iter().map(|n| (n.name.as_str(), n)).collect();
        let spawn_wait_time = self.config().spawn_wait_time();

        for entry in spawning {
            let waited = elapsed_since(self.clock.as_ref(), entry.requested_at);

            match by_name.get(entry.name.as_str()) {
                None if waited >= spawn_wait_time => {
                    self.logger
                        .log_spawn_timeout(&entry.name, &entry.constraints, waited.as_secs());
                    self.runner.notify_failure(&entry.command).await;
                    self.metrics.inc_command_failures(CommandKind::Spawn);
                    self.state.mark_spawning_node_timeout(&entry.name);
                }
                None => {
                    debug!(node = %entry.name, waited_secs = waited.as_secs(), "Node not in swarm yet");
                }
                Some(node) if node.is_ok() => {
                    if let Err(e) = self
                        .container
                        .set_node_labels(node, &entry.constraints)
                        .await
                    {
                        warn!(node = %node.name, error = %e, "Could not label new node");
                        continue;
                    }
                    self.state.mark_spawning_node_ready(&entry.name);
                    info!(
                        node = %node.name,
                        constraints = %entry.constraints,
                        waited_secs = waited.as_secs(),
                        "Node joined the swarm"
                    );
                }
                Some(node) => {
                    let observed = format!("{}/{}", node.status, node.availability);
                    if self.state.mark_spawning_node_state(&entry.name, &observed) {
                        info!(node = %node.name, state = %observed, "Spawning node changed state");
                    }
                    if waited >= spawn_wait_time && self.state.mark_spawning_node_warned(&entry.name) {
                        warn!(
                            node = %node.name,
                            state = %observed,
                            waited_secs = waited.as_secs(),
                            "Node joined but is still not ready"
                        );
                    }
                }
            }
        }
    }

    /// Remove terminal services; returns the ids of the removed ones
    async fn clean_services(&mut self, services: &[Service]) -> Result<HashSet<String>> {
        let removed = self.container.clean_terminal_services(services).await?;
        if !removed.is_empty() {
            debug!(count = removed.len(), "Removed terminal services");
            self.state.clean_services(&removed);
        }
        Ok(removed.into_iter().map(|s| s.id).collect())
    }

    /// Report cluster counts, at most once per `log_interval`
    fn log_state(&mut self, snapshot: &SwarmSnapshot, removed: &HashSet<String>) {
        let now = self.clock.now();
        if let Some(last) = self.last_state_log {
            if elapsed_since(self.clock.as_ref(), last) < self.config().log_interval() {
                return;
            }
        }
        self.last_state_log = Some(now);

        let SwarmSnapshot { nodes, services } = snapshot;
        let tasks: usize = services.iter().map(|s| s.tasks.len()).sum();

        info!(
            nodes = nodes.len(),
            services = services.len(),
            tasks = tasks,
            spawning = self.state.spawning_count(),
            idle = self.state.idle_count(),
            "Cluster state"
        );

        for service in services
            .iter()
            .filter(|s| s.terminal() && !removed.contains(&s.id))
        {
            warn!(
                service = %service.name,
                state = service.state().unwrap_or("unknown"),
                "Terminal service still present"
            );
        }
        for service in services {
            for task in service.unassigned_tasks() {
                warn!(
                    service = %service.name,
                    task = %task.id,
                    state = %task.state,
                    "Task not assigned to a node"
                );
            }
        }
    }

    /// Whether the swarm has nothing left for the autoscaler to do
    fn terminate_if_idle(&self, snapshot: &SwarmSnapshot) -> bool {
        if !self.config().terminate_when_idle {
            return false;
        }

        if self.state.spawning_count() > 0 {
            debug!("Not terminating, nodes are spawning");
            return false;
        }

        if let Some(node) = snapshot
            .nodes
            .iter()
            .find(|n| n.non_terminal_tasks().next().is_some())
        {
            debug!(node = %node.name, "Not terminating, node has running tasks");
            return false;
        }

        if snapshot.services.iter().any(|s| s.is_waiting()) {
            debug!("Not terminating, services are waiting");
            return false;
        }

        for (constraints, nodes) in snapshot.nodes_active() {
            let (needed, total) = self.state.slots_delta(&constraints, &[], &nodes);
            if needed > 0 {
                debug!(
                    constraints = %constraints,
                    slots_needed = needed,
                    slots_total = total,
                    "Not terminating, pool needs slots"
                );
                return false;
            }
            let floor = self.state.limits_for(&constraints).idle_floor() as i64;
            if needed < 0 && total + needed < floor {
                debug!(
                    constraints = %constraints,
                    slots_needed = needed,
                    slots_total = total,
                    "Not terminating, pool still shrinking"
                );
                return false;
            }
        }

        info!("Swarm is idle");
        true
    }
}

/// Builder for [`AutoscaleManager`]
pub struct AutoscaleManagerBuilder {
    config: AutoscaleConfig,
    container: Option<Arc<dyn ContainerInterface>>,
    executor: Option<Arc<dyn CommandExecutor>>,
    clock: Arc<dyn Clock>,
    per_service_constraints: bool,
    health: HealthRegistry,
    logger: StructuredLogger,
}

impl AutoscaleManagerBuilder {
    pub fn new(config: AutoscaleConfig) -> Self {
        Self {
            config,
            container: None,
            executor: None,
            clock: Arc::new(SystemClock),
            per_service_constraints: false,
            health: HealthRegistry::new(),
            logger: StructuredLogger::new("swarm"),
        }
    }

    /// Set the container interface
    pub fn container(mut self, container: Arc<dyn ContainerInterface>) -> Self {
        self.container = Some(container);
        self
    }

    /// Set the executor for provisioning commands (default: `sh -c`)
    pub fn executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Whether services receive their constraints at creation time
    pub fn per_service_constraints(mut self, enabled: bool) -> Self {
        self.per_service_constraints = enabled;
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn build(self) -> anyhow::Result<AutoscaleManager> {
        let container = self
            .container
            .ok_or_else(|| anyhow::anyhow!("Container interface is required"))?;
        self.config.validate()?;

        let executor = self.executor.unwrap_or_else(|| {
            Arc::new(ShellExecutor::new(self.config.command_timeout())) as Arc<dyn CommandExecutor>
        });
        let runner = CommandRunner::new(
            executor,
            self.config.command_retries,
            self.config.command_retry_wait(),
            CommandTemplate::new(self.config.command_failure_command.as_str()),
        );

        Ok(AutoscaleManager {
            container,
            runner,
            spawn_command: CommandTemplate::new(self.config.spawn_command.as_str()),
            destroy_command: CommandTemplate::new(self.config.destroy_command.as_str()),
            state: AutoscaleState::new(self.config, self.per_service_constraints, self.clock.clone()),
            clock: self.clock,
            health: self.health,
            metrics: AutoscalerMetrics::new(),
            logger: self.logger,
            last_state_log: None,
            reported_pools: HashSet::new(),
        })
    }
}
