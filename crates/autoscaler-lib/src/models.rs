//! Cluster snapshot types
//!
//! Read-only views of nodes, services and tasks, built eagerly once per
//! reconciliation pass.

use crate::constraints::ConstraintSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Task states after which a task will never run again
pub const TERMINAL_TASK_STATES: &[&str] = &["shutdown", "complete", "failed", "rejected", "orphaned"];

/// Node status as reported by the swarm
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Ready,
    Down,
    Disconnected,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Ready => write!(f, "ready"),
            NodeStatus::Down => write!(f, "down"),
            NodeStatus::Disconnected => write!(f, "disconnected"),
            NodeStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Scheduling availability of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeAvailability {
    Active,
    Pause,
    Drain,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for NodeAvailability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeAvailability::Active => write!(f, "active"),
            NodeAvailability::Pause => write!(f, "pause"),
            NodeAvailability::Drain => write!(f, "drain"),
            NodeAvailability::Unknown => write!(f, "unknown"),
        }
    }
}

/// A task of a service, possibly scheduled to a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub service_id: String,
    pub node_id: Option<String>,
    pub desired_state: String,
    pub state: String,
    pub cpus: f64,
}

impl Task {
    /// Whether the task is shut down and will not be rescheduled
    pub fn terminal(&self) -> bool {
        self.desired_state == "shutdown" && TERMINAL_TASK_STATES.contains(&self.state.as_str())
    }

    pub fn is_assigned(&self) -> bool {
        self.node_id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

/// A swarm node with the tasks currently scheduled to it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub cpus: f64,
    pub status: NodeStatus,
    pub availability: NodeAvailability,
    pub manager: bool,
    pub labels: HashMap<String, String>,
    pub tasks: Vec<Task>,
}

impl Node {
    /// Ready and accepting new tasks
    pub fn is_ok(&self) -> bool {
        self.status == NodeStatus::Ready && self.availability == NodeAvailability::Active
    }

    pub fn non_terminal_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| !t.terminal())
    }

    /// A healthy worker with nothing left to run
    pub fn destroyable(&self) -> bool {
        !self.manager && self.is_ok() && self.non_terminal_tasks().next().is_none()
    }

    /// CPU reserved by the tasks still running on this node
    pub fn non_terminal_task_cpus(&self) -> f64 {
        self.non_terminal_tasks().map(|t| t.cpus).sum()
    }

    /// Constraint set matching this node's labels
    pub fn constraints(&self) -> ConstraintSet {
        ConstraintSet::from_labels(&self.labels)
    }

    pub fn slots(&self, cpus_per_slot: f64) -> f64 {
        if cpus_per_slot > 0.0 {
            self.cpus / cpus_per_slot
        } else {
            0.0
        }
    }
}

/// A swarm service and its tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub image: String,
    pub cpus: f64,
    pub tasks: Vec<Task>,
    pub constraints: ConstraintSet,
}

impl Service {
    /// Approximate state of the service
    ///
    /// Uses the first task desired to run, whatever its current state.
    /// Otherwise the last task wins, which is imprecise for services with
    /// several replicas.
    pub fn state(&self) -> Option<&str> {
        if let Some(task) = self.tasks.iter().find(|t| t.desired_state == "running") {
            return Some(task.state.as_str());
        }
        self.tasks.last().map(|t| t.state.as_str())
    }

    /// No task is still desired to run
    pub fn terminal(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|t| t.desired_state != "running")
    }

    /// Not terminal and not yet placed on any node
    pub fn is_waiting(&self) -> bool {
        !self.terminal()
            && !self
                .tasks
                .iter()
                .any(|t| t.is_assigned() && !t.terminal())
    }

    pub fn unassigned_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| !t.is_assigned() && !t.terminal())
    }
}
