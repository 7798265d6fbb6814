//! Function status conditions and the ledger operations over them
//!
//! A condition list holds at most one entry per [`ConditionType`]. Updating a
//! condition moves its type to the front; the remaining types keep their
//! relative order.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition types tracked on a Function
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ConditionType {
    /// Sources are materialized (ConfigMap written or commit resolved)
    ConfigurationReady,
    /// The image build Job finished
    BuildReady,
    /// The function Deployment is serving
    Running,
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigurationReady => write!(f, "ConfigurationReady"),
            Self::BuildReady => write!(f, "BuildReady"),
            Self::Running => write!(f, "Running"),
        }
    }
}

/// Status of a condition
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
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

/// Machine-readable reasons written by the reconciliation stages
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionReason {
    /// The Function spec failed validation
    ValidationFailed,
    /// Inline sources ConfigMap created
    ConfigMapCreated,
    /// Inline sources ConfigMap updated
    ConfigMapUpdated,
    /// Git sources resolved to a new revision
    SourceUpdated,
    /// Git sources could not be resolved
    SourceUpdateFailed,
    /// Build Job created
    JobCreated,
    /// Build Job labels patched
    JobUpdated,
    /// Stale build Jobs removed
    JobsDeleted,
    /// Build Job still in progress
    JobRunning,
    /// Build Job finished
    JobFinished,
    /// Build Job failed
    JobFailed,
    /// Function Deployment created
    DeploymentCreated,
    /// Function Deployment updated
    DeploymentUpdated,
    /// Function Deployment rolling out
    DeploymentWaiting,
    /// Function Deployment failed
    DeploymentFailed,
    /// Function Deployment ready
    DeploymentReady,
    /// Deployment lost its minimum available replicas
    MinReplicasNotAvailable,
    /// Function Service created
    ServiceCreated,
    /// Function Service updated
    ServiceUpdated,
    /// Autoscaler created
    HorizontalPodAutoscalerCreated,
    /// Autoscaler updated
    HorizontalPodAutoscalerUpdated,
}

impl std::fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Serialized form and display form are the variant name
        write!(f, "{self:?}")
    }
}

/// Kubernetes-style condition on a Function
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: ConditionType,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: ConditionReason,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: ConditionType,
        status: ConditionStatus,
        reason: ConditionReason,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_,
            status,
            reason,
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Compare status, reason and message, ignoring the timestamp
    pub fn same_state(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Place `condition` first and drop any existing entry of the same type.
///
/// Entries of other types keep their relative order. Duplicate types already
/// present in `conditions` are collapsed to their first occurrence.
pub fn update_condition(conditions: &[Condition], condition: Condition) -> Vec<Condition> {
    let mut result = Vec::with_capacity(conditions.len() + 1);
    result.push(condition);
    for existing in conditions {
        if !result.iter().any(|c| c.type_ == existing.type_) {
            result.push(existing.clone());
        }
    }
    result
}

/// Same length and, per type, same status/reason/message
pub fn equal_conditions(existing: &[Condition], expected: &[Condition]) -> bool {
    if existing.len() != expected.len() {
        return false;
    }
    expected.iter().all(|want| {
        existing
            .iter()
            .find(|c| c.type_ == want.type_)
            .is_some_and(|have| have.same_state(want))
    })
}

/// Status of the given type, `Unknown` when absent
pub fn condition_status(conditions: &[Condition], type_: ConditionType) -> ConditionStatus {
    conditions
        .iter()
        .find(|c| c.type_ == type_)
        .map(|c| c.status)
        .unwrap_or(ConditionStatus::Unknown)
}

/// Reason of the given type, `None` when absent
pub fn condition_reason(conditions: &[Condition], type_: ConditionType) -> Option<ConditionReason> {
    conditions
        .iter()
        .find(|c| c.type_ == type_)
        .map(|c| c.reason)
}
