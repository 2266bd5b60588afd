//! Shared types used across Trellis CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
///
/// Used uniformly by generated-API instances and by EndpointBridge status.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g. Ready, Degraded)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,

    /// Generation of the spec this condition was observed against
    #[serde(rename = "observedGeneration", default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
            observed_generation: None,
        }
    }

    /// Set the observed generation and return self for chaining
    pub fn observed_generation(mut self, generation: i64) -> Self {
        self.observed_generation = Some(generation);
        self
    }

    /// Ready condition with status True
    pub fn ready(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new("Ready", ConditionStatus::True, reason, message)
    }

    /// Ready condition with status False
    pub fn not_ready(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new("Ready", ConditionStatus::False, reason, message)
    }

    /// Degraded condition surfaced for terminal errors
    pub fn degraded(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new("Degraded", ConditionStatus::True, reason, message)
    }
}

/// Replace-or-append a condition in a condition list, keyed by type
///
/// When the new condition matches the existing one in status and reason, the
/// existing transition time is kept so the list does not churn.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        if existing.status == condition.status && existing.reason == condition.reason {
            existing.message = condition.message;
            existing.observed_generation = condition.observed_generation;
        } else {
            *existing = condition;
        }
    } else {
        conditions.push(condition);
    }
}

/// Lifecycle state of a generated-API instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum InstanceState {
    /// Reconciliation has not completed yet
    #[default]
    InProgress,
    /// All included nodes are Ready
    Active,
    /// The instance is being deleted, nodes are torn down in reverse order
    Deleting,
    /// A terminal error is blocking reconciliation
    Error,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => write!(f, "InProgress"),
            Self::Active => write!(f, "Active"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Error => write!(f, "Error"),
        }
    }
}
