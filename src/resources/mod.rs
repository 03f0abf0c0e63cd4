//! Dependent objects derived from a GateServer
//!
//! Every function here is a pure mapping from a GateServer (plus any key
//! material handed in by the caller) to the object definition that should
//! exist in the cluster. Names are derived from the GateServer so applying
//! the same definitions again is idempotent.
//!
//! - ServiceAccount `<name>`: identity the gateway runs as
//! - Secret [`JWT_SECRET_NAME`](crate::JWT_SECRET_NAME): token signing keypair
//! - ClusterRole `<name>`: one rule copied from the permission fields
//! - RoleBinding or ClusterRoleBinding `<name>`: grants the role to the identity
//! - OAuthClient `<name>`: optional, when `generateOAuthClient` is set

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{ObjectReference, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, RoleBinding, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use kube::api::{ApiResource, DynamicObject};
use kube::{Resource, ResourceExt};
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::crd::{GateServer, PermissionScope};
use crate::pki::Keypair;
use crate::{Error, APP_LABEL, JWT_SECRET_NAME};

/// Secret key holding the public key
pub const PUBLIC_KEY_FIELD: &str = "cert.pem";

/// Secret key holding the private key
pub const PRIVATE_KEY_FIELD: &str = "key.pem";

/// API group of RBAC role references
const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Length of generated OAuth client secrets
const OAUTH_CLIENT_SECRET_LEN: usize = 32;

// =============================================================================
// Artifact Types
// =============================================================================

/// Kind of a dependent object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// core/v1 ServiceAccount
    ServiceAccount,
    /// core/v1 Secret
    Secret,
    /// rbac/v1 ClusterRole
    ClusterRole,
    /// rbac/v1 RoleBinding
    RoleBinding,
    /// rbac/v1 ClusterRoleBinding
    ClusterRoleBinding,
    /// oauth.openshift.io/v1 OAuthClient
    OAuthClient,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServiceAccount => write!(f, "ServiceAccount"),
            Self::Secret => write!(f, "Secret"),
            Self::ClusterRole => write!(f, "ClusterRole"),
            Self::RoleBinding => write!(f, "RoleBinding"),
            Self::ClusterRoleBinding => write!(f, "ClusterRoleBinding"),
            Self::OAuthClient => write!(f, "OAuthClient"),
        }
    }
}

/// Name and optional namespace of an object
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    /// Object name
    pub name: String,
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
}

impl ObjectRef {
    /// Reference to a cluster-scoped object
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }

    /// Reference to a namespaced object
    pub fn namespaced(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Desired definition of one dependent object
#[derive(Clone)]
pub enum Artifact {
    /// Gateway identity
    ServiceAccount(ServiceAccount),
    /// Signing keypair
    Secret(Secret),
    /// Permission definition
    ClusterRole(ClusterRole),
    /// Namespaced permission grant
    RoleBinding(RoleBinding),
    /// Cluster-wide permission grant
    ClusterRoleBinding(ClusterRoleBinding),
    /// External auth client
    OAuthClient(DynamicObject),
}

impl Artifact {
    /// Kind of the wrapped object
    pub fn kind(&self) -> ArtifactKind {
        match self {
            Self::ServiceAccount(_) => ArtifactKind::ServiceAccount,
            Self::Secret(_) => ArtifactKind::Secret,
            Self::ClusterRole(_) => ArtifactKind::ClusterRole,
            Self::RoleBinding(_) => ArtifactKind::RoleBinding,
            Self::ClusterRoleBinding(_) => ArtifactKind::ClusterRoleBinding,
            Self::OAuthClient(_) => ArtifactKind::OAuthClient,
        }
    }

    fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::ServiceAccount(o) => &o.metadata,
            Self::Secret(o) => &o.metadata,
            Self::ClusterRole(o) => &o.metadata,
            Self::RoleBinding(o) => &o.metadata,
            Self::ClusterRoleBinding(o) => &o.metadata,
            Self::OAuthClient(o) => &o.metadata,
        }
    }

    /// Name and namespace of the wrapped object
    pub fn object_ref(&self) -> ObjectRef {
        let meta = self.metadata();
        ObjectRef {
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone(),
        }
    }

    /// Serialize the wrapped object, including apiVersion and kind
    pub fn to_json(&self) -> Result<serde_json::Value, Error> {
        let value = match self {
            Self::ServiceAccount(o) => serde_json::to_value(o),
            Self::Secret(o) => serde_json::to_value(o),
            Self::ClusterRole(o) => serde_json::to_value(o),
            Self::RoleBinding(o) => serde_json::to_value(o),
            Self::ClusterRoleBinding(o) => serde_json::to_value(o),
            Self::OAuthClient(o) => serde_json::to_value(o),
        };
        value.map_err(|e| Error::synthesis(format!("failed to serialize {}: {}", self.kind(), e)))
    }
}

// Secrets must never end up in logs, so only identify the object.
impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), self.object_ref())
    }
}

/// Binding that grants the ClusterRole to the gateway identity
#[derive(Clone, Debug, PartialEq)]
pub enum PermissionBinding {
    /// Permissions limited to one namespace
    Namespaced(RoleBinding),
    /// Permissions across all namespaces
    Cluster(ClusterRoleBinding),
}

impl From<PermissionBinding> for Artifact {
    fn from(binding: PermissionBinding) -> Self {
        match binding {
            PermissionBinding::Namespaced(rb) => Artifact::RoleBinding(rb),
            PermissionBinding::Cluster(crb) => Artifact::ClusterRoleBinding(crb),
        }
    }
}

// =============================================================================
// Derivation
// =============================================================================

fn instance_name(gs: &GateServer) -> Result<String, Error> {
    gs.metadata
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::synthesis("GateServer has no name"))
}

fn instance_namespace(gs: &GateServer) -> Result<String, Error> {
    gs.namespace()
        .filter(|ns| !ns.is_empty())
        .ok_or_else(|| Error::synthesis("GateServer has no namespace"))
}

fn app_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), name.to_string())])
}

/// Owner reference for objects in the GateServer's own namespace
///
/// Owner references cannot cross namespaces, so objects elsewhere are left
/// unowned.
fn owner_references(gs: &GateServer, namespace: Option<&str>) -> Option<Vec<OwnerReference>> {
    let same_namespace = namespace.is_some() && namespace == gs.metadata.namespace.as_deref();
    if !same_namespace {
        return None;
    }
    gs.controller_owner_ref(&()).map(|owner| vec![owner])
}

fn metadata(gs: &GateServer, name: &str, namespace: Option<String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        labels: Some(app_labels(&gs.name_any())),
        owner_references: owner_references(gs, namespace.as_deref()),
        namespace,
        ..Default::default()
    }
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values.to_vec())
    }
}

/// ServiceAccount the gateway runs as
pub fn service_account(gs: &GateServer) -> Result<ServiceAccount, Error> {
    let name = instance_name(gs)?;
    let namespace = instance_namespace(gs)?;

    Ok(ServiceAccount {
        metadata: metadata(gs, &name, Some(namespace)),
        secrets: Some(vec![ObjectReference {
            name: Some(JWT_SECRET_NAME.to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    })
}

/// Secret holding the token signing keypair
pub fn credential_secret(gs: &GateServer, keypair: &Keypair) -> Result<Secret, Error> {
    instance_name(gs)?;
    let namespace = instance_namespace(gs)?;

    let data = BTreeMap::from([
        (
            PUBLIC_KEY_FIELD.to_string(),
            ByteString(keypair.public_key_pem().to_vec()),
        ),
        (
            PRIVATE_KEY_FIELD.to_string(),
            ByteString(keypair.private_key_pem().to_vec()),
        ),
    ]);

    Ok(Secret {
        metadata: metadata(gs, JWT_SECRET_NAME, Some(namespace)),
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    })
}

/// ClusterRole with a single rule copied from the permission fields
///
/// Cluster-scoped and named after the GateServer, so GateServer names must
/// be unique across namespaces.
pub fn cluster_role(gs: &GateServer) -> Result<ClusterRole, Error> {
    let name = instance_name(gs)?;
    let scope = gs.spec.permission_scope()?;

    let rule = match &scope {
        PermissionScope::Resource {
            api_groups,
            resources,
            resource_names,
            verbs,
        } => PolicyRule {
            api_groups: non_empty(api_groups),
            resources: non_empty(resources),
            resource_names: non_empty(resource_names),
            non_resource_urls: None,
            verbs: verbs.clone(),
        },
        PermissionScope::NonResource { urls, verbs } => PolicyRule {
            api_groups: None,
            resources: None,
            resource_names: None,
            non_resource_urls: non_empty(urls),
            verbs: verbs.clone(),
        },
    };

    Ok(ClusterRole {
        metadata: metadata(gs, &name, None),
        rules: Some(vec![rule]),
        ..Default::default()
    })
}

/// Binding granting the ClusterRole to the ServiceAccount
///
/// A concrete `serviceAccountNamespace` yields a RoleBinding in that
/// namespace; `*` yields a ClusterRoleBinding.
pub fn permission_binding(gs: &GateServer) -> Result<PermissionBinding, Error> {
    let name = instance_name(gs)?;
    let namespace = instance_namespace(gs)?;

    let subjects = Some(vec![Subject {
        kind: "ServiceAccount".to_string(),
        name: name.clone(),
        namespace: Some(namespace),
        api_group: None,
    }]);
    let role_ref = RoleRef {
        api_group: RBAC_API_GROUP.to_string(),
        kind: "ClusterRole".to_string(),
        name: name.clone(),
    };

    if gs.spec.is_cluster_wide() {
        return Ok(PermissionBinding::Cluster(ClusterRoleBinding {
            metadata: metadata(gs, &name, None),
            role_ref,
            subjects,
        }));
    }

    let target = gs.spec.service_account_namespace.clone();
    if target.is_empty() {
        return Err(Error::synthesis("serviceAccountNamespace is empty"));
    }

    Ok(PermissionBinding::Namespaced(RoleBinding {
        metadata: metadata(gs, &name, Some(target)),
        role_ref,
        subjects,
    }))
}

/// API resource of the OpenShift OAuthClient kind
pub fn oauth_client_api_resource() -> ApiResource {
    ApiResource {
        group: "oauth.openshift.io".to_string(),
        version: "v1".to_string(),
        api_version: "oauth.openshift.io/v1".to_string(),
        kind: "OAuthClient".to_string(),
        plural: "oauthclients".to_string(),
    }
}

/// OAuthClient letting users log in to the gateway
pub fn oauth_client(gs: &GateServer, client_secret: &str) -> Result<DynamicObject, Error> {
    let name = instance_name(gs)?;

    let redirect_uris: Vec<String> = gs
        .spec
        .route
        .iter()
        .map(|host| format!("https://{}/auth/callback", host))
        .collect();

    let mut client = DynamicObject::new(&name, &oauth_client_api_resource());
    client.metadata.labels = Some(app_labels(&name));
    client.data = serde_json::json!({
        "secret": client_secret,
        "redirectURIs": redirect_uris,
        "grantMethod": "auto",
    });
    Ok(client)
}

/// Generate a random OAuth client secret
pub fn generate_client_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(OAUTH_CLIENT_SECRET_LEN)
        .map(char::from)
        .collect()
}

/// All artifacts a GateServer needs, in apply order
///
/// `oauth_client_secret` is only used when the spec asks for an OAuth client.
pub fn desired_artifacts(
    gs: &GateServer,
    keypair: &Keypair,
    oauth_client_secret: &str,
) -> Result<Vec<Artifact>, Error> {
    let mut artifacts = vec![
        Artifact::ServiceAccount(service_account(gs)?),
        Artifact::Secret(credential_secret(gs, keypair)?),
        Artifact::ClusterRole(cluster_role(gs)?),
        permission_binding(gs)?.into(),
    ];

    if gs.spec.generate_oauth_client {
        artifacts.push(Artifact::OAuthClient(oauth_client(gs, oauth_client_secret)?));
    }

    Ok(artifacts)
}
