//! GateServer Custom Resource Definition
//!
//! A GateServer describes the identity a gateway proxy runs as and the
//! permissions that identity is granted. The operator turns it into a
//! ServiceAccount, a signing-key Secret, a ClusterRole and a binding.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, GateServerPhase, PermissionScope};
use crate::CLUSTER_WIDE_NAMESPACE;

/// Specification for a GateServer
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ocgate.rh-fieldwork.com",
    version = "v1beta1",
    kind = "GateServer",
    plural = "gateservers",
    shortname = "gs",
    status = "GateServerStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Scope","type":"string","jsonPath":".spec.serviceAccountNamespace"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct GateServerSpec {
    /// Namespace the granted permissions apply to; `*` means cluster-wide
    #[serde(rename = "serviceAccountNamespace", default)]
    pub service_account_namespace: String,

    /// API groups the gateway identity may access
    #[serde(rename = "serviceAccountAPIGroups", default)]
    pub service_account_api_groups: Vec<String>,

    /// Resource kinds the gateway identity may access
    #[serde(rename = "serviceAccountResources", default)]
    pub service_account_resources: Vec<String>,

    /// Specific resource names the gateway identity may access
    #[serde(rename = "serviceAccountResourceNames", default)]
    pub service_account_resource_names: Vec<String>,

    /// Non-resource URL paths the gateway identity may access
    #[serde(rename = "serviceAccountNonResourceURLs", default)]
    pub service_account_non_resource_urls: Vec<String>,

    /// Verbs allowed on the granted resources or URLs
    #[serde(rename = "serviceAccountVerbs", default)]
    pub service_account_verbs: Vec<String>,

    /// Also register an OAuth client for the gateway
    #[serde(rename = "generateOAuthClient", default)]
    pub generate_oauth_client: bool,

    /// Public hostname of the gateway, used for the OAuth redirect URI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
}

impl GateServerSpec {
    /// Returns true when the permissions are granted cluster-wide
    pub fn is_cluster_wide(&self) -> bool {
        self.service_account_namespace == CLUSTER_WIDE_NAMESPACE
    }

    /// Returns true if API groups are named
    ///
    /// A resource rule needs its API groups; resources or resource names
    /// without them do not form a resource scope.
    pub fn has_resource_scope(&self) -> bool {
        !self.service_account_api_groups.is_empty()
    }

    /// Returns true if the non-resource URL field is set
    pub fn has_non_resource_scope(&self) -> bool {
        !self.service_account_non_resource_urls.is_empty()
    }

    /// Convert the permission fields into a [`PermissionScope`]
    ///
    /// Fails when both or neither of the resource and non-resource fields
    /// are set.
    pub fn permission_scope(&self) -> Result<PermissionScope, crate::Error> {
        match (self.has_resource_scope(), self.has_non_resource_scope()) {
            (true, true) => Err(crate::Error::validation(
                "auth roles can either apply to API resources or non-resource URL paths, but not both",
            )),
            (false, false) => Err(crate::Error::validation(
                "auth roles can either apply to API resources or non-resource URL paths, but can't be empty",
            )),
            (true, false) => Ok(PermissionScope::Resource {
                api_groups: self.service_account_api_groups.clone(),
                resources: self.service_account_resources.clone(),
                resource_names: self.service_account_resource_names.clone(),
                verbs: self.service_account_verbs.clone(),
            }),
            (false, true) => Ok(PermissionScope::NonResource {
                urls: self.service_account_non_resource_urls.clone(),
                verbs: self.service_account_verbs.clone(),
            }),
        }
    }

    /// Validate the specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.permission_scope().map(|_| ())
    }
}

/// Status for a GateServer
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GateServerStatus {
    /// Current phase of the lifecycle
    #[serde(default)]
    pub phase: GateServerPhase,

    /// Conditions in the order they were recorded
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation of the spec the last recorded condition refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl GateServerStatus {
    /// Append a condition
    ///
    /// Conditions are an append-only history: existing entries of the same
    /// type are kept.
    pub fn push_condition(&mut self, condition: Condition) {
        self.conditions.push(condition);
    }

    /// The most recently recorded condition
    pub fn last_condition(&self) -> Option<&Condition> {
        self.conditions.last()
    }
}
