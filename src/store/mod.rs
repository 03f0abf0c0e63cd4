//! Store abstractions for GateServers and their dependent artifacts
//!
//! The controller only talks to the cluster through the two traits in this
//! module. The kube-backed implementations translate API failures into the
//! crate's error kinds: a 409 becomes [`Error::Conflict`], a 404 on read or
//! delete is treated as absence, anything else is [`Error::Store`].

#[cfg(test)]
pub(crate) mod memory;

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, RoleBinding};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::GateServer;
use crate::resources::{oauth_client_api_resource, Artifact, ArtifactKind, ObjectRef};
use crate::{Error, FIELD_MANAGER};

/// Access to GateServer instances
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GateServerStore: Send + Sync {
    /// Read the current instance, `None` if it does not exist
    async fn fetch(&self, name: &str, namespace: &str) -> Result<Option<GateServer>, Error>;

    /// Persist the instance's metadata (finalizers)
    ///
    /// The write is conditional on the instance's resourceVersion; a
    /// concurrent change yields [`Error::Conflict`].
    async fn update(&self, gate_server: &GateServer) -> Result<GateServer, Error>;

    /// Persist the instance's status, with the same concurrency check as
    /// [`GateServerStore::update`]
    async fn update_status(&self, gate_server: &GateServer) -> Result<GateServer, Error>;
}

/// Access to dependent artifacts
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Create the artifact or bring an existing one in line with it
    async fn create_or_update(&self, artifact: &Artifact) -> Result<(), Error>;

    /// Delete an artifact; deleting something that is already gone succeeds
    async fn delete(&self, kind: ArtifactKind, target: &ObjectRef) -> Result<(), Error>;
}

fn store_error(operation: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(e) if e.code == 409 => Error::conflict(operation),
        other => Error::store(operation, other.to_string()),
    }
}

fn identity(gs: &GateServer) -> Result<(String, String), Error> {
    let namespace = gs
        .namespace()
        .ok_or_else(|| Error::store("update GateServer", "GateServer has no namespace"))?;
    Ok((gs.name_any(), namespace))
}

// =============================================================================
// GateServer Store
// =============================================================================

/// GateServer store backed by the Kubernetes API
pub struct KubeGateServerStore {
    client: Client,
}

impl KubeGateServerStore {
    /// Create a new store wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<GateServer> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl GateServerStore for KubeGateServerStore {
    async fn fetch(&self, name: &str, namespace: &str) -> Result<Option<GateServer>, Error> {
        self.api(namespace)
            .get_opt(name)
            .await
            .map_err(|e| store_error(&format!("fetch GateServer {}/{}", namespace, name), e))
    }

    async fn update(&self, gate_server: &GateServer) -> Result<GateServer, Error> {
        let (name, namespace) = identity(gate_server)?;

        // resourceVersion in a merge patch makes the API server reject
        // writes against a stale copy with 409
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": gate_server.resource_version(),
                "finalizers": gate_server.finalizers(),
            }
        });

        self.api(&namespace)
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| store_error(&format!("update GateServer {}/{}", namespace, name), e))
    }

    async fn update_status(&self, gate_server: &GateServer) -> Result<GateServer, Error> {
        let (name, namespace) = identity(gate_server)?;

        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": gate_server.resource_version(),
            },
            "status": gate_server.status,
        });

        self.api(&namespace)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| {
                store_error(
                    &format!("update status of GateServer {}/{}", namespace, name),
                    e,
                )
            })
    }
}

// =============================================================================
// Artifact Store
// =============================================================================

/// Artifact store backed by the Kubernetes API
///
/// Writes use server-side apply with a forced field manager, so repeating
/// an apply converges on the same object.
pub struct KubeArtifactStore {
    client: Client,
}

impl KubeArtifactStore {
    /// Create a new store wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, target: &ObjectRef) -> Result<Api<K>, Error>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        let namespace = target.namespace.as_deref().ok_or_else(|| {
            Error::synthesis(format!("namespaced object {} has no namespace", target.name))
        })?;
        Ok(Api::namespaced(self.client.clone(), namespace))
    }

    fn cluster<K>(&self) -> Api<K>
    where
        K: Resource,
        <K as Resource>::DynamicType: Default,
    {
        Api::all(self.client.clone())
    }

    fn oauth_clients(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &oauth_client_api_resource())
    }
}

async fn apply<K>(api: Api<K>, name: &str, object: &K, operation: &str) -> Result<(), Error>
where
    K: Clone + DeserializeOwned + Debug + Serialize,
{
    api.patch(
        name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(object),
    )
    .await
    .map_err(|e| store_error(operation, e))?;
    Ok(())
}

async fn delete_ignoring_missing<K>(api: Api<K>, name: &str, operation: &str) -> Result<(), Error>
where
    K: Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => {
            debug!(operation, "object already absent");
            Ok(())
        }
        Err(e) => Err(store_error(operation, e)),
    }
}

#[async_trait]
impl ArtifactStore for KubeArtifactStore {
    async fn create_or_update(&self, artifact: &Artifact) -> Result<(), Error> {
        let target = artifact.object_ref();
        let operation = format!("apply {} {}", artifact.kind(), target);
        let name = target.name.as_str();

        match artifact {
            Artifact::ServiceAccount(o) => {
                apply(self.namespaced::<ServiceAccount>(&target)?, name, o, &operation).await
            }
            Artifact::Secret(o) => {
                apply(self.namespaced::<Secret>(&target)?, name, o, &operation).await
            }
            Artifact::ClusterRole(o) => {
                apply(self.cluster::<ClusterRole>(), name, o, &operation).await
            }
            Artifact::RoleBinding(o) => {
                apply(self.namespaced::<RoleBinding>(&target)?, name, o, &operation).await
            }
            Artifact::ClusterRoleBinding(o) => {
                apply(self.cluster::<ClusterRoleBinding>(), name, o, &operation).await
            }
            Artifact::OAuthClient(o) => apply(self.oauth_clients(), name, o, &operation).await,
        }
    }

    async fn delete(&self, kind: ArtifactKind, target: &ObjectRef) -> Result<(), Error> {
        let operation = format!("delete {} {}", kind, target);
        let name = target.name.as_str();

        match kind {
            ArtifactKind::ServiceAccount => {
                let api = self.namespaced::<ServiceAccount>(target)?;
                delete_ignoring_missing(api, name, &operation).await
            }
            ArtifactKind::Secret => {
                let api = self.namespaced::<Secret>(target)?;
                delete_ignoring_missing(api, name, &operation).await
            }
            ArtifactKind::ClusterRole => {
                delete_ignoring_missing(self.cluster::<ClusterRole>(), name, &operation).await
            }
            ArtifactKind::RoleBinding => {
                let api = self.namespaced::<RoleBinding>(target)?;
                delete_ignoring_missing(api, name, &operation).await
            }
            ArtifactKind::ClusterRoleBinding => {
                let api = self.cluster::<ClusterRoleBinding>();
                delete_ignoring_missing(api, name, &operation).await
            }
            ArtifactKind::OAuthClient => {
                delete_ignoring_missing(self.oauth_clients(), name, &operation).await
            }
        }
    }
}
