//! Supporting types for the GateServer CRD

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// GateServer lifecycle phase
///
/// Serialized as `""` / `"Ready"` so existing clients that compare the raw
/// string keep working.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum GateServerPhase {
    /// Dependents have not been provisioned yet
    #[default]
    #[serde(rename = "")]
    Unprovisioned,
    /// All dependents were created; terminal until deletion
    Ready,
}

impl std::fmt::Display for GateServerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unprovisioned => write!(f, ""),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

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
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Created, Validated)
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
        }
    }
}

/// Permission request of a GateServer after validation
///
/// A ClusterRole rule applies either to API resources or to non-resource
/// URLs. The spec carries both sets of fields; this type only exists for
/// specs that set exactly one of them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PermissionScope {
    /// Rule over API resources
    Resource {
        /// API groups, copied verbatim
        api_groups: Vec<String>,
        /// Resource kinds, copied verbatim
        resources: Vec<String>,
        /// Specific resource names, copied verbatim
        resource_names: Vec<String>,
        /// Allowed verbs
        verbs: Vec<String>,
    },
    /// Rule over non-resource URL paths
    NonResource {
        /// URL paths, copied verbatim
        urls: Vec<String>,
        /// Allowed verbs
        verbs: Vec<String>,
    },
}
