//! Access to the container orchestrator
//!
//! The autoscaler only needs a small read/command surface of the swarm:
//! listing nodes and services, removing finished services, labelling and
//! draining nodes. [`SwarmCli`] implements it on top of the `docker`
//! command line.

mod inspect;
mod swarm;

pub use inspect::{NodeInspect, ServiceInspect, TaskInspect};
pub use swarm::{SwarmCli, SwarmConfig};

use crate::constraints::ConstraintSet;
use crate::error::Result;
use crate::models::{Node, Service};
use async_trait::async_trait;
use std::collections::HashMap;

/// Nodes and services read together, once per tick
#[derive(Debug, Clone, Default)]
pub struct SwarmSnapshot {
    pub nodes: Vec<Node>,
    pub services: Vec<Service>,
}

impl SwarmSnapshot {
    /// Services not yet placed, grouped by their constraint set
    pub fn services_waiting(&self) -> HashMap<ConstraintSet, Vec<Service>> {
        group_waiting_services(self.services.clone())
    }

    /// Healthy worker nodes, grouped by the constraint set of their labels
    pub fn nodes_active(&self) -> HashMap<ConstraintSet, Vec<Node>> {
        group_active_nodes(self.nodes.clone())
    }
}

/// Read/command surface of the orchestrator used by the autoscaler
#[async_trait]
pub trait ContainerInterface: Send + Sync {
    /// All nodes and services with their tasks
    async fn snapshot(&self) -> Result<SwarmSnapshot>;

    /// Remove the terminal ones among `services`; returns the removed services
    async fn clean_terminal_services(&self, services: &[Service]) -> Result<Vec<Service>>;

    /// Add the labels a node needs to satisfy `constraints`
    async fn set_node_labels(&self, node: &Node, constraints: &ConstraintSet) -> Result<()>;

    /// Stop scheduling new tasks to a node
    async fn drain_node(&self, node: &Node) -> Result<()>;

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.snapshot().await?.nodes)
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        Ok(self.snapshot().await?.services)
    }

    async fn list_services_waiting(&self) -> Result<HashMap<ConstraintSet, Vec<Service>>> {
        Ok(self.snapshot().await?.services_waiting())
    }

    async fn list_nodes_active(&self) -> Result<HashMap<ConstraintSet, Vec<Node>>> {
        Ok(self.snapshot().await?.nodes_active())
    }
}

pub fn group_waiting_services(services: Vec<Service>) -> HashMap<ConstraintSet, Vec<Service>> {
    let mut grouped: HashMap<ConstraintSet, Vec<Service>> = HashMap::new();
    for service in services.into_iter().filter(Service::is_waiting) {
        grouped
            .entry(service.constraints.clone())
            .or_default()
            .push(service);
    }
    grouped
}

/// Manager nodes never take part in a pool
pub fn group_active_nodes(nodes: Vec<Node>) -> HashMap<ConstraintSet, Vec<Node>> {
    let mut grouped: HashMap<ConstraintSet, Vec<Node>> = HashMap::new();
    for node in nodes.into_iter().filter(|n| n.is_ok() && !n.manager) {
        grouped.entry(node.constraints()).or_default().push(node);
    }
    grouped
}
