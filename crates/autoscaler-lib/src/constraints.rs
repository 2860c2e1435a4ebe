//! Constraint sets used to partition the cluster into autoscaling pools
//!
//! A constraint set groups services and nodes that can be scaled together.
//! Services contribute the `node.labels.*` entries of their placement
//! constraints; nodes contribute one `==` constraint per label.

use crate::error::AutoscaleError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

/// Prefix shared by all label-based placement constraints
pub const NODE_LABEL_PREFIX: &str = "node.labels.";

/// Label carrying the image a node was provisioned for
pub const IMAGE_LABEL: &str = "image";

/// Label carrying the CPU count a node was provisioned with
pub const CPUS_LABEL: &str = "cpus";

/// Comparison operator of a placement constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operator {
    Eq,
    Ne,
}

impl Operator {
    fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "==",
            Operator::Ne => "!=",
        }
    }
}

/// A single `(name, operator, value)` placement constraint
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Constraint {
    pub name: String,
    pub operator: Operator,
    pub value: String,
}

impl Constraint {
    pub fn new(name: impl Into<String>, operator: Operator, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operator,
            value: value.into(),
        }
    }

    /// Constraint matching a node label `key == value`
    pub fn label(key: &str, value: impl Into<String>) -> Self {
        Self::new(format!("{NODE_LABEL_PREFIX}{key}"), Operator::Eq, value)
    }

    /// The label key if this constraint targets a node label
    pub fn label_key(&self) -> Option<&str> {
        self.name.strip_prefix(NODE_LABEL_PREFIX)
    }
}

impl FromStr for Constraint {
    type Err = AutoscaleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // `!=` must be checked first, `==` would otherwise never match it
        let (name, operator, value) = if let Some((name, value)) = s.split_once("!=") {
            (name, Operator::Ne, value)
        } else if let Some((name, value)) = s.split_once("==") {
            (name, Operator::Eq, value)
        } else {
            return Err(AutoscaleError::InvalidConstraint(s.to_string()));
        };

        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            return Err(AutoscaleError::InvalidConstraint(s.to_string()));
        }

        Ok(Constraint::new(name, operator, value))
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.name, self.operator.as_str(), self.value)
    }
}

/// Immutable, order-independent set of constraints
///
/// Equality and hashing follow the sorted members, so two sets built from
/// the same constraints in a different order are the same map key.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConstraintSet {
    constraints: BTreeSet<Constraint>,
}

impl ConstraintSet {
    /// The empty constraint set (matches every node)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build the constraint set of a service from its placement constraints
    ///
    /// Only `node.labels.*` constraints take part in pool partitioning.
    pub fn from_placement<S: AsRef<str>>(placement: &[S]) -> Result<Self, AutoscaleError> {
        let mut constraints = BTreeSet::new();
        for raw in placement {
            let constraint: Constraint = raw.as_ref().parse()?;
            if constraint.label_key().is_some() {
                constraints.insert(constraint);
            }
        }
        Ok(Self { constraints })
    }

    /// Build the constraint set matching a node's labels
    pub fn from_labels(labels: &HashMap<String, String>) -> Self {
        Self {
            constraints: labels
                .iter()
                .map(|(key, value)| Constraint::label(key, value.clone()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints.iter()
    }

    /// Value of the `==` constraint on the given node label, if any
    pub fn value_of(&self, label: &str) -> Option<&str> {
        self.constraints
            .iter()
            .find(|c| c.operator == Operator::Eq && c.label_key() == Some(label))
            .map(|c| c.value.as_str())
    }

    /// Node labels that make a node satisfy this set
    ///
    /// `!=` constraints cannot be expressed as a label and are skipped.
    pub fn as_labels(&self) -> Vec<(String, String)> {
        self.constraints
            .iter()
            .filter(|c| c.operator == Operator::Eq)
            .filter_map(|c| c.label_key().map(|k| (k.to_string(), c.value.clone())))
            .collect()
    }
}

impl FromIterator<Constraint> for ConstraintSet {
    fn from_iter<I: IntoIterator<Item = Constraint>>(iter: I) -> Self {
        Self {
            constraints: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for ConstraintSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.constraints.is_empty() {
            return write!(f, "(none)");
        }
        let parts: Vec<String> = self.constraints.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

impl Serialize for ConstraintSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let raw: Vec<String> = self.constraints.iter().map(|c| c.to_string()).collect();
        raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ConstraintSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Vec::<String>::deserialize(deserializer)?;
        raw.iter()
            .map(|s| s.parse::<Constraint>())
            .collect::<Result<ConstraintSet, _>>()
            .map_err(serde::de::Error::custom)
    }
}
