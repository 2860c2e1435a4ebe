//! Container interface backed by the `docker` command line
//!
//! A snapshot is built from `docker ... inspect` output; nothing is cached
//! between snapshots.

use super::inspect::{NodeInspect, ServiceInspect, TaskInspect};
use super::{ContainerInterface, SwarmSnapshot};
use crate::constraints::{ConstraintSet, CPUS_LABEL};
use crate::error::{AutoscaleError, Result};
use crate::models::{Node, NodeAvailability, NodeStatus, Service, Task};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Settings of the `docker` command line interface
#[derive(Debug, Clone, Deserialize)]
pub struct SwarmConfig {
    #[serde(default = "default_docker_cmd")]
    pub docker_cmd: String,

    /// Daemon to talk to (`docker -H`)
    #[serde(default)]
    pub docker_host: Option<String>,

    /// Services are created with a `node.labels.image` constraint
    #[serde(default)]
    pub service_create_image_constraint: bool,

    /// Services are created with a `node.labels.cpus` constraint
    #[serde(default)]
    pub service_create_cpus_constraint: bool,

    /// Seconds a single docker call may take
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
}

fn default_docker_cmd() -> String {
    "docker".to_string()
}

fn default_command_timeout() -> u64 {
    60
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            docker_cmd: default_docker_cmd(),
            docker_host: None,
            service_create_image_constraint: false,
            service_create_cpus_constraint: false,
            command_timeout: default_command_timeout(),
        }
    }
}

impl SwarmConfig {
    /// Whether pools are only known once services exist
    pub fn per_service_constraints(&self) -> bool {
        self.service_create_image_constraint || self.service_create_cpus_constraint
    }
}

/// Swarm access through the `docker` CLI
pub struct SwarmCli {
    config: SwarmConfig,
}

impl SwarmCli {
    pub fn new(config: SwarmConfig) -> Self {
        Self { config }
    }

    async fn docker(&self, operation: &str, args: &[&str]) -> Result<String> {
        let mut command = Command::new(&self.config.docker_cmd);
        if let Some(host) = &self.config.docker_host {
            command.arg("-H").arg(host);
        }
        command.args(args).kill_on_drop(true);

        debug!(operation = %operation, args = ?args, "Running docker");

        let timeout = Duration::from_secs(self.config.command_timeout);
        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| AutoscaleError::Docker {
                operation: operation.to_string(),
                message: format!("timed out after {}s", timeout.as_secs()),
            })?
            .map_err(|e| AutoscaleError::Docker {
                operation: operation.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(AutoscaleError::Docker {
                operation: operation.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn ids(&self, operation: &str, args: &[&str]) -> Result<Vec<String>> {
        let output = self.docker(operation, args).await?;
        Ok(split_ids(&output))
    }

    async fn inspect<T: DeserializeOwned>(&self, what: &str, args: &[&str], ids: &[String]) -> Result<Vec<T>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut full: Vec<&str> = args.to_vec();
        full.extend(ids.iter().map(String::as_str));
        let output = self.docker(what, &full).await?;
        parse_inspect(what, &output)
    }
}

#[async_trait]
impl ContainerInterface for SwarmCli {
    /// Build a consistent view of nodes, services and tasks
    async fn snapshot(&self) -> Result<SwarmSnapshot> {
        let node_ids = self.ids("node ls", &["node", "ls", "--quiet"]).await?;
        let nodes: Vec<NodeInspect> = self
            .inspect("node inspect", &["node", "inspect"], &node_ids)
            .await?;

        let service_ids = self.ids("service ls", &["service", "ls", "--quiet"]).await?;
        let services: Vec<ServiceInspect> = self
            .inspect("service inspect", &["service", "inspect"], &service_ids)
            .await?;

        let tasks: Vec<TaskInspect> = if service_ids.is_empty() {
            Vec::new()
        } else {
            let mut args = vec!["service", "ps", "--quiet", "--no-trunc"];
            args.extend(service_ids.iter().map(String::as_str));
            let task_ids = self.ids("service ps", &args).await?;
            self.inspect("task inspect", &["inspect", "--type", "task"], &task_ids)
                .await?
        };

        let (nodes, services) = build_snapshot(nodes, services, tasks);
        Ok(SwarmSnapshot { nodes, services })
    }

    async fn clean_terminal_services(&self, services: &[Service]) -> Result<Vec<Service>> {
        let terminal: Vec<Service> = services.iter().filter(|s| s.terminal()).cloned().collect();

        if terminal.is_empty() {
            return Ok(terminal);
        }

        for service in &terminal {
            info!(
                service = %service.name,
                id = %service.id,
                state = service.state().unwrap_or("unknown"),
                "Removing terminal service"
            );
        }

        let mut args = vec!["service", "rm"];
        args.extend(terminal.iter().map(|s| s.id.as_str()));
        self.docker("service rm", &args).await?;

        Ok(terminal)
    }

    async fn set_node_labels(&self, node: &Node, constraints: &ConstraintSet) -> Result<()> {
        let labels: Vec<String> = constraints
            .as_labels()
            .into_iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        if labels.is_empty() {
            return Ok(());
        }

        let mut args = vec!["node", "update"];
        for label in &labels {
            args.push("--label-add");
            args.push(label);
        }
        args.push(&node.id);

        info!(node = %node.name, labels = ?labels, "Labelling node");
        self.docker("node update", &args).await.map(|_| ())
    }

    async fn drain_node(&self, node: &Node) -> Result<()> {
        info!(node = %node.name, "Draining node");
        self.docker(
            "node update",
            &["node", "update", "--availability", "drain", &node.id],
        )
        .await
        .map(|_| ())
    }
}

fn split_ids(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_inspect<T: DeserializeOwned>(what: &str, output: &str) -> Result<Vec<T>> {
    serde_json::from_str(output).map_err(|source| AutoscaleError::Parse {
        what: format!("{what} output"),
        source,
    })
}

fn parse_status(state: &str) -> NodeStatus {
    match state.to_ascii_lowercase().as_str() {
        "ready" => NodeStatus::Ready,
        "down" => NodeStatus::Down,
        "disconnected" => NodeStatus::Disconnected,
        _ => NodeStatus::Unknown,
    }
}

fn parse_availability(availability: &str) -> NodeAvailability {
    match availability.to_ascii_lowercase().as_str() {
        "active" => NodeAvailability::Active,
        "pause" => NodeAvailability::Pause,
        "drain" => NodeAvailability::Drain,
        _ => NodeAvailability::Unknown,
    }
}

/// Join inspect documents into snapshot types
///
/// Tasks whose service is unknown are logged and dropped; the swarm
/// occasionally reports such phantom tasks.
pub(crate) fn build_snapshot(
    nodes: Vec<NodeInspect>,
    services: Vec<ServiceInspect>,
    tasks: Vec<TaskInspect>,
) -> (Vec<Node>, Vec<Service>) {
    let mut built_services: Vec<Service> = Vec::with_capacity(services.len());
    for inspect in services {
        let constraints = match ConstraintSet::from_placement(inspect.placement_constraints()) {
            Ok(constraints) => constraints,
            Err(e) => {
                warn!(service = %inspect.id, error = %e, "Ignoring malformed placement constraints");
                ConstraintSet::empty()
            }
        };
        let cpus = match inspect.cpus() {
            cpus if cpus > 0.0 => cpus,
            _ => constraints
                .value_of(CPUS_LABEL)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
        };
        built_services.push(Service {
            id: inspect.id.clone(),
            name: inspect.spec.name.clone(),
            image: inspect.image().to_string(),
            cpus,
            tasks: Vec::new(),
            constraints,
        });
    }

    let service_index: HashMap<String, usize> = built_services
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.clone(), i))
        .collect();

    let mut node_tasks: HashMap<String, Vec<Task>> = HashMap::new();
    for inspect in tasks {
        let Some(&index) = service_index.get(&inspect.service_id) else {
            warn!(task = %inspect.id, service = %inspect.service_id, "Task of unknown service");
            continue;
        };
        let service = &mut built_services[index];
        let cpus = match inspect.cpus() {
            cpus if cpus > 0.0 => cpus,
            _ => service.cpus,
        };
        let task = Task {
            id: inspect.id,
            service_id: inspect.service_id,
            node_id: inspect.node_id.filter(|id| !id.is_empty()),
            desired_state: inspect.desired_state,
            state: inspect.status.state,
            cpus,
        };
        if let Some(node_id) = &task.node_id {
            node_tasks.entry(node_id.clone()).or_default().push(task.clone());
        }
        service.tasks.push(task);
    }

    let built_nodes = nodes
        .into_iter()
        .map(|inspect| {
            let cpus = inspect.cpus();
            let name = if inspect.description.hostname.is_empty() {
                inspect.id.clone()
            } else {
                inspect.description.hostname.clone()
            };
            Node {
                tasks: node_tasks.remove(&inspect.id).unwrap_or_default(),
                id: inspect.id,
                name,
                cpus,
                status: parse_status(&inspect.status.state),
                availability: parse_availability(&inspect.spec.availability),
                manager: inspect.manager_status.is_some() || inspect.spec.role == "manager",
                labels: inspect.spec.labels,
            }
        })
        .collect();

    (built_nodes, built_services)
}
