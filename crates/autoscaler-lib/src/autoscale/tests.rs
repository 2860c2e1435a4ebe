//! End-to-end tests of the autoscaling loop
//!
//! The swarm is an in-memory fake and provisioning commands are recorded
//! instead of run, so every scenario is driven tick by tick with a manual
//! clock.

use super::*;
use crate::command::{CommandExecutor, CommandOutput};
use crate::constraints::ConstraintSet;
use crate::container::{ContainerInterface, SwarmSnapshot};
use crate::error::{AutoscaleError, Result};
use crate::health::{components, ComponentStatus, HealthRegistry};
use crate::models::{Node, NodeAvailability, NodeStatus, Service, Task};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Default)]
struct FakeState {
    nodes: Vec<Node>,
    services: Vec<Service>,
    drained: Vec<String>,
    labelled: Vec<(String, ConstraintSet)>,
    docker_down: bool,
    snapshots: usize,
}

/// In-memory swarm
#[derive(Default)]
struct FakeSwarm {
    state: Mutex<FakeState>,
}

impl FakeSwarm {
    fn with(nodes: Vec<Node>, services: Vec<Service>) -> Arc<Self> {
        let swarm = Self::default();
        {
            let mut state = swarm.state.lock().unwrap();
            state.nodes = nodes;
            state.services = services;
        }
        Arc::new(swarm)
    }

    fn add_node(&self, node: Node) {
        self.state.lock().unwrap().nodes.push(node);
    }

    fn set_docker_down(&self, down: bool) {
        self.state.lock().unwrap().docker_down = down;
    }

    fn drained(&self) -> Vec<String> {
        self.state.lock().unwrap().drained.clone()
    }

    fn labelled(&self) -> Vec<(String, ConstraintSet)> {
        self.state.lock().unwrap().labelled.clone()
    }

    fn check(&self) -> Result<()> {
        if self.state.lock().unwrap().docker_down {
            return Err(AutoscaleError::Docker {
                operation: "node ls".to_string(),
                message: "Cannot connect to the Docker daemon".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerInterface for FakeSwarm {
    async fn snapshot(&self) -> Result<SwarmSnapshot> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.snapshots += 1;
        Ok(SwarmSnapshot {
            nodes: state.nodes.clone(),
            services: state.services.clone(),
        })
    }

    async fn clean_terminal_services(&self, services: &[Service]) -> Result<Vec<Service>> {
        self.check()?;
        let terminal: Vec<Service> = services.iter().filter(|s| s.terminal()).cloned().collect();
        self.state
            .lock()
            .unwrap()
            .services
            .retain(|s| !terminal.iter().any(|t| t.id == s.id));
        Ok(terminal)
    }

    async fn set_node_labels(&self, node: &Node, constraints: &ConstraintSet) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(n) = state.nodes.iter_mut().find(|n| n.id == node.id) {
            n.labels.extend(constraints.as_labels());
        }
        state.labelled.push((node.name.clone(), constraints.clone()));
        Ok(())
    }

    async fn drain_node(&self, node: &Node) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(n) = state.nodes.iter_mut().find(|n| n.id == node.id) {
            n.availability = NodeAvailability::Drain;
        }
        state.drained.push(node.name.clone());
        Ok(())
    }
}

/// Records commands and answers by command prefix
#[derive(Default)]
struct RecordingExecutor {
    replies: Mutex<HashMap<String, CommandOutput>>,
    calls: Mutex<Vec<String>>,
}

impl RecordingExecutor {
    fn reply(&self, prefix: &str, code: i32, stdout: &str) {
        self.replies.lock().unwrap().insert(
            prefix.to_string(),
            CommandOutput {
                code,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        );
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn execute(&self, command: &str) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(command.to_string());
        let replies = self.replies.lock().unwrap();
        Ok(replies
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }
}

fn node(name: &str, cpus: f64) -> Node {
    Node {
        id: format!("id-{name}"),
        name: name.to_string(),
        cpus,
        status: NodeStatus::Ready,
        availability: NodeAvailability::Active,
        manager: false,
        labels: HashMap::new(),
        tasks: vec![],
    }
}

fn waiting_service(id: &str, cpus: f64) -> Service {
    Service {
        id: id.to_string(),
        name: format!("{id}-name"),
        image: "galaxy/tool".to_string(),
        cpus,
        tasks: vec![Task {
            id: format!("{id}-task"),
            service_id: id.to_string(),
            node_id: None,
            desired_state: "running".to_string(),
            state: "pending".to_string(),
            cpus,
        }],
        constraints: ConstraintSet::empty(),
    }
}

fn config() -> AutoscaleConfig {
    AutoscaleConfig {
        cpus_per_slot: 1.0,
        service_wait_time_limit: 0,
        spawn_command: "spawn {slots} {service_ids}".to_string(),
        destroy_command: "destroy {nodes}".to_string(),
        command_failure_command: "notify {failed_command}".to_string(),
        ..Default::default()
    }
}

struct Harness {
    manager: AutoscaleManager,
    swarm: Arc<FakeSwarm>,
    executor: Arc<RecordingExecutor>,
    clock: Arc<ManualClock>,
}

fn harness(config: AutoscaleConfig, swarm: Arc<FakeSwarm>) -> Harness {
    let executor = Arc::new(RecordingExecutor::default());
    let clock = Arc::new(ManualClock::default());
    let manager = AutoscaleManagerBuilder::new(config)
        .container(swarm.clone())
        .executor(executor.clone())
        .clock(clock.clone())
        .build()
        .unwrap();
    Harness {
        manager,
        swarm,
        executor,
        clock,
    }
}

#[test]
fn test_waiting_service_needs_its_slots() {
    let clock = Arc::new(ManualClock::default());
    let mut state = AutoscaleState::new(config(), false, clock);

    let mut waiting = HashMap::new();
    waiting.insert(ConstraintSet::empty(), vec![waiting_service("svc-1", 2.0)]);
    let pools = state.slots_needed(waiting, HashMap::new()).unwrap();

    assert_eq!(pools.len(), 1);
    assert_eq!(pools[0].slots_needed, 2);
}

#[test]
fn test_spawning_slots_cover_waiting_service() {
    let clock = Arc::new(ManualClock::default());
    let mut state = AutoscaleState::new(config(), false, clock);
    state.nodes_requested(&ConstraintSet::empty(), &["n1:2"], "spawn 2 svc-1");

    let mut waiting = HashMap::new();
    waiting.insert(ConstraintSet::empty(), vec![waiting_service("svc-1", 2.0)]);
    let pools = state.slots_needed(waiting, HashMap::new()).unwrap();

    assert_eq!(pools[0].slots_needed, 0);
}

#[tokio::test]
async fn test_tick_spawns_for_waiting_service() {
    let swarm = FakeSwarm::with(vec![], vec![waiting_service("svc-1", 2.0)]);
    let mut h = harness(config(), swarm);
    h.executor.reply("spawn", 0, "n1:2\n");

    assert_eq!(h.manager.tick().await.unwrap(), TickOutcome::Continue);
    assert_eq!(h.executor.calls(), vec!["spawn 2 svc-1"]);
    assert_eq!(h.manager.state().spawning_node("n1").unwrap().slots, 2);
    assert!(h.manager.state().is_handled("svc-1"));

    // Still waiting, but already handled and covered by the spawning node
    h.manager.tick().await.unwrap();
    assert_eq!(h.executor.calls_starting_with("spawn").len(), 1);
}

#[tokio::test]
async fn test_retry_later_leaves_services_unhandled() {
    let swarm = FakeSwarm::with(vec![], vec![waiting_service("svc-1", 1.0)]);
    let mut h = harness(config(), swarm);
    h.executor.reply("spawn", 2, "");

    h.manager.tick().await.unwrap();
    assert!(!h.manager.state().is_handled("svc-1"));
    assert_eq!(h.manager.state().spawning_count(), 0);

    h.manager.tick().await.unwrap();
    assert_eq!(h.executor.calls_starting_with("spawn").len(), 2);
    assert!(h.executor.calls_starting_with("notify").is_empty());
}

#[tokio::test]
async fn test_declined_spawn_marks_services_handled() {
    let swarm = FakeSwarm::with(vec![], vec![waiting_service("svc-1", 1.0)]);
    let mut h = harness(config(), swarm);
    h.executor.reply("spawn", 0, "   \n");

    h.manager.tick().await.unwrap();
    assert!(h.manager.state().is_handled("svc-1"));
    assert_eq!(h.manager.state().spawning_count(), 0);
}

#[tokio::test]
async fn test_failed_spawn_fires_failure_command() {
    let swarm = FakeSwarm::with(vec![], vec![waiting_service("svc-1", 1.0)]);
    let mut h = harness(config(), swarm);
    h.executor.reply("spawn", 1, "");

    h.manager.tick().await.unwrap();
    assert_eq!(
        h.executor.calls_starting_with("notify"),
        vec!["notify spawn 1 svc-1"]
    );
    assert!(!h.manager.state().is_handled("svc-1"));
}

#[tokio::test]
async fn test_idle_node_destroyed_after_limit() {
    let swarm = FakeSwarm::with(vec![node("n1", 4.0)], vec![]);
    let mut h = harness(
        AutoscaleConfig {
            node_idle_limit: 120,
            ..config()
        },
        swarm,
    );

    h.manager.tick().await.unwrap();
    assert!(h.manager.state().idle_since("n1").is_some());

    h.clock.advance(Duration::from_secs(60));
    h.manager.tick().await.unwrap();
    assert!(h.swarm.drained().is_empty());
    assert!(h.executor.calls_starting_with("destroy").is_empty());

    h.clock.advance(Duration::from_secs(61));
    h.manager.tick().await.unwrap();
    assert_eq!(h.swarm.drained(), vec!["n1"]);
    assert_eq!(h.executor.calls_starting_with("destroy"), vec!["destroy n1"]);
    assert!(h.manager.state().idle_since("n1").is_none());

    // The drained node has left the pool
    h.manager.tick().await.unwrap();
    assert_eq!(h.executor.calls_starting_with("destroy").len(), 1);
}

#[tokio::test]
async fn test_destroy_keeps_min_limit() {
    let swarm = FakeSwarm::with(vec![node("n1", 2.0), node("n2", 2.0)], vec![]);
    let mut h = harness(
        AutoscaleConfig {
            node_idle_limit: 0,
            slots_min_limit: 2,
            ..config()
        },
        swarm,
    );

    h.manager.tick().await.unwrap();
    assert_eq!(h.swarm.drained().len(), 1);
    assert_eq!(h.executor.calls_starting_with("destroy").len(), 1);
}

#[tokio::test]
async fn test_busy_node_clears_idle_timer() {
    let swarm = FakeSwarm::with(vec![node("n1", 4.0)], vec![]);
    let mut h = harness(
        AutoscaleConfig {
            node_idle_limit: 120,
            ..config()
        },
        swarm.clone(),
    );

    h.manager.tick().await.unwrap();
    assert!(h.manager.state().idle_since("n1").is_some());

    {
        let mut state = swarm.state.lock().unwrap();
        state.nodes[0].tasks.push(Task {
            id: "t1".to_string(),
            service_id: "svc-1".to_string(),
            node_id: Some("id-n1".to_string()),
            desired_state: "running".to_string(),
            state: "running".to_string(),
            cpus: 1.0,
        });
    }
    h.manager.tick().await.unwrap();
    assert!(h.manager.state().idle_since("n1").is_none());
}

#[tokio::test]
async fn test_missing_spawned_node_times_out() {
    let swarm = FakeSwarm::with(vec![], vec![waiting_service("svc-1", 1.0)]);
    let mut h = harness(
        AutoscaleConfig {
            spawn_wait_time: 300,
            ..config()
        },
        swarm,
    );
    h.executor.reply("spawn", 0, "n1");

    h.manager.tick().await.unwrap();
    assert!(h.manager.state().spawning_node("n1").is_some());

    h.clock.advance(Duration::from_secs(299));
    h.manager.tick().await.unwrap();
    assert!(h.executor.calls_starting_with("notify").is_empty());

    h.clock.advance(Duration::from_secs(2));
    h.manager.tick().await.unwrap();
    assert_eq!(
        h.executor.calls_starting_with("notify"),
        vec!["notify spawn 1 svc-1"]
    );
    assert!(h.manager.state().spawning_node("n1").is_none());

    h.manager.tick().await.unwrap();
    assert_eq!(h.executor.calls_starting_with("notify").len(), 1);
}

#[tokio::test]
async fn test_ready_node_is_labelled() {
    let constraints = ConstraintSet::from_placement(&["node.labels.image == galaxy/tool"]).unwrap();
    let mut service = waiting_service("svc-1", 1.0);
    service.constraints = constraints.clone();

    let swarm = FakeSwarm::with(vec![], vec![service]);
    let mut h = harness(config(), swarm);
    h.executor.reply("spawn", 0, "n1");

    h.manager.tick().await.unwrap();
    assert_eq!(h.manager.state().spawning_node("n1").unwrap().constraints, constraints);

    let mut joining = node("n1", 1.0);
    joining.status = NodeStatus::Down;
    h.swarm.add_node(joining);
    h.manager.tick().await.unwrap();
    assert_eq!(
        h.manager.state().spawning_node("n1").unwrap().last_state.as_deref(),
        Some("down/active")
    );

    h.swarm.state.lock().unwrap().nodes[0].status = NodeStatus::Ready;
    h.manager.tick().await.unwrap();
    assert!(h.manager.state().spawning_node("n1").is_none());
    assert_eq!(h.swarm.labelled(), vec![("n1".to_string(), constraints.clone())]);

    let nodes = h.swarm.list_nodes().await.unwrap();
    assert_eq!(nodes[0].constraints(), constraints);
}

#[tokio::test]
async fn test_slow_node_is_not_reported_as_failure() {
    let swarm = FakeSwarm::with(vec![], vec![waiting_service("svc-1", 1.0)]);
    let mut h = harness(
        AutoscaleConfig {
            spawn_wait_time: 10,
            ..config()
        },
        swarm,
    );
    h.executor.reply("spawn", 0, "n1");
    h.manager.tick().await.unwrap();

    let mut joining = node("n1", 1.0);
    joining.availability = NodeAvailability::Pause;
    h.swarm.add_node(joining);

    h.clock.advance(Duration::from_secs(20));
    h.manager.tick().await.unwrap();
    h.manager.tick().await.unwrap();

    assert!(h.manager.state().spawning_node("n1").unwrap().warned);
    assert!(h.executor.calls_starting_with("notify").is_empty());
}

#[tokio::test]
async fn test_terminal_services_are_forgotten() {
    let mut finished = waiting_service("svc-1", 1.0);
    finished.tasks[0].desired_state = "shutdown".to_string();
    finished.tasks[0].state = "complete".to_string();

    let swarm = FakeSwarm::with(vec![], vec![waiting_service("svc-1", 1.0)]);
    let mut h = harness(config(), swarm);
    h.executor.reply("spawn", 0, "");

    h.manager.tick().await.unwrap();
    assert!(h.manager.state().is_handled("svc-1"));

    h.swarm.state.lock().unwrap().services = vec![finished];
    h.manager.tick().await.unwrap();
    assert!(!h.manager.state().is_handled("svc-1"));
    assert!(h.swarm.list_services().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_terminates_when_idle() {
    let swarm = FakeSwarm::with(vec![], vec![]);
    let mut h = harness(
        AutoscaleConfig {
            terminate_when_idle: true,
            ..config()
        },
        swarm,
    );

    assert_eq!(h.manager.tick().await.unwrap(), TickOutcome::Terminate);
}

#[tokio::test]
async fn test_terminates_when_node_does_not_fit_the_floor() {
    let swarm = FakeSwarm::with(vec![node("n1", 4.0)], vec![]);
    let mut h = harness(
        AutoscaleConfig {
            terminate_when_idle: true,
            slots_min_limit: 2,
            node_idle_limit: 0,
            ..config()
        },
        swarm,
    );

    // 4 slots can not shrink to 2, the node stays
    assert_eq!(h.manager.tick().await.unwrap(), TickOutcome::Terminate);
    assert!(h.swarm.drained().is_empty());
    assert!(h.executor.calls().is_empty());
}

#[tokio::test]
async fn test_no_termination_while_pool_below_minimum() {
    let swarm = FakeSwarm::with(vec![node("n1", 4.0)], vec![]);
    let mut h = harness(
        AutoscaleConfig {
            terminate_when_idle: true,
            slots_min_limit: 8,
            ..config()
        },
        swarm,
    );

    assert_eq!(h.manager.tick().await.unwrap(), TickOutcome::Continue);
    assert_eq!(h.executor.calls_starting_with("spawn 4").len(), 1);
}

#[tokio::test]
async fn test_no_termination_while_shrink_goes_below_spare() {
    let swarm = FakeSwarm::with(vec![node("n1", 4.0)], vec![]);
    let mut h = harness(
        AutoscaleConfig {
            terminate_when_idle: true,
            slots_min_spare: 4,
            slots_max_limit: 2,
            ..config()
        },
        swarm,
    );

    // Capped at 2 slots, which leaves less than the 4 spare ones
    assert_eq!(h.manager.tick().await.unwrap(), TickOutcome::Continue);
}

#[tokio::test]
async fn test_no_termination_while_spawning() {
    let swarm = FakeSwarm::with(vec![], vec![waiting_service("svc-1", 1.0)]);
    let mut h = harness(
        AutoscaleConfig {
            terminate_when_idle: true,
            ..config()
        },
        swarm,
    );
    h.executor.reply("spawn", 0, "n1");

    assert_eq!(h.manager.tick().await.unwrap(), TickOutcome::Continue);
    h.swarm.state.lock().unwrap().services.clear();
    assert_eq!(h.manager.tick().await.unwrap(), TickOutcome::Continue);
}

#[tokio::test]
async fn test_configuration_error_stops_run() {
    let swarm = FakeSwarm::with(vec![], vec![]);
    let manager = AutoscaleManagerBuilder::new(AutoscaleConfig {
        slots_min_limit: 2,
        ..config()
    })
    .container(swarm)
    .executor(Arc::new(RecordingExecutor::default()))
    .per_service_constraints(true)
    .build()
    .unwrap();

    let (_tx, rx) = broadcast::channel(1);
    let result = manager.run(Duration::from_millis(10), rx).await;
    assert!(matches!(result, Err(AutoscaleError::Configuration(_))));
}

#[tokio::test]
async fn test_docker_errors_do_not_stop_run() {
    let swarm = FakeSwarm::with(vec![], vec![]);
    swarm.set_docker_down(true);
    let health = HealthRegistry::new();
    let manager = AutoscaleManagerBuilder::new(config())
        .container(swarm)
        .executor(Arc::new(RecordingExecutor::default()))
        .health(health.clone())
        .build()
        .unwrap();

    let (tx, rx) = broadcast::channel(1);
    let handle = tokio::spawn(manager.run(Duration::from_millis(10), rx));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        health.status_of(components::CONTAINER_INTERFACE).await,
        Some(ComponentStatus::Degraded)
    );
    assert_eq!(
        health.status_of(components::MANAGER).await,
        Some(ComponentStatus::Degraded)
    );

    tx.send(()).unwrap();
    assert_eq!(handle.await.unwrap().unwrap(), RunOutcome::Shutdown);
}

#[tokio::test]
async fn test_run_returns_on_idle_termination() {
    let swarm = FakeSwarm::with(vec![], vec![]);
    let manager = AutoscaleManagerBuilder::new(AutoscaleConfig {
        terminate_when_idle: true,
        ..config()
    })
    .container(swarm)
    .executor(Arc::new(RecordingExecutor::default()))
    .build()
    .unwrap();

    let (_tx, rx) = broadcast::channel(1);
    let outcome = manager.run(Duration::from_millis(10), rx).await.unwrap();
    assert_eq!(outcome, RunOutcome::IdleTermination);
}

#[test]
fn test_builder_requires_container() {
    let result = AutoscaleManagerBuilder::new(config()).build();
    assert!(result.is_err());
}

#[test]
fn test_builder_rejects_invalid_limits() {
    let swarm = FakeSwarm::with(vec![], vec![]);
    let result = AutoscaleManagerBuilder::new(AutoscaleConfig {
        slots_min_limit: 4,
        slots_max_limit: 2,
        ..config()
    })
    .container(swarm)
    .build();
    assert!(result.is_err());
}

#[test]
fn test_builder_rejects_zero_poll_interval() {
    let swarm = FakeSwarm::with(vec![], vec![]);
    let result = AutoscaleManagerBuilder::new(AutoscaleConfig {
        poll_interval: 0,
        ..config()
    })
    .container(swarm)
    .build();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_run_rejects_zero_poll_interval() {
    let swarm = FakeSwarm::with(vec![], vec![]);
    let manager = AutoscaleManagerBuilder::new(config())
        .container(swarm)
        .executor(Arc::new(RecordingExecutor::default()))
        .build()
        .unwrap();

    let (_tx, rx) = broadcast::channel(1);
    let result = manager.run(Duration::ZERO, rx).await;
    assert!(matches!(result, Err(AutoscaleError::Configuration(_))));
}

fn pool_gauge_present(label: &str) -> bool {
    prometheus::gather()
        .iter()
        .filter(|f| f.get_name() == "swarm_autoscaler_slots_needed")
        .flat_map(|f| f.get_metric())
        .any(|m| m.get_label().iter().any(|l| l.get_value() == label))
}

#[tokio::test]
async fn test_vanished_pool_drops_its_gauges() {
    let constraints = ConstraintSet::from_placement(&["node.labels.image == short-lived"]).unwrap();
    let mut worker = node("n1", 2.0);
    worker.labels = constraints.as_labels().into_iter().collect();

    let swarm = FakeSwarm::with(vec![worker], vec![]);
    let mut h = harness(config(), swarm);

    h.manager.tick().await.unwrap();
    assert!(pool_gauge_present(&constraints.to_string()));

    h.swarm.state.lock().unwrap().nodes.clear();
    h.manager.tick().await.unwrap();
    assert!(!pool_gauge_present(&constraints.to_string()));
}

#[tokio::test]
async fn test_tick_reads_one_snapshot() {
    let swarm = FakeSwarm::with(vec![], vec![waiting_service("svc-1", 1.0)]);
    let mut h = harness(
        AutoscaleConfig {
            terminate_when_idle: true,
            ..config()
        },
        swarm,
    );
    h.executor.reply("spawn", 0, "n2");

    h.manager.tick().await.unwrap();
    h.manager.tick().await.unwrap();
    assert_eq!(h.manager.state().spawning_count(), 1);
    assert_eq!(h.swarm.state.lock().unwrap().snapshots, 2);
}
