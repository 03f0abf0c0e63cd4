//! Test helpers for integration tests
//!
//! Provides utilities for managing kind clusters and Kubernetes resources.

use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, Config, CustomResourceExt};
use tokio::sync::OnceCell;
use tokio::time::sleep;

use gate_operator::crd::{GateServer, GateServerSpec};

/// Name of the kind cluster used for integration tests
pub const TEST_CLUSTER_NAME: &str = "gate-operator-integration-test";

/// Global lock to ensure cluster is created only once
static CLUSTER_INIT: OnceLock<Result<(), String>> = OnceLock::new();

/// Track if CRD has been installed (async-safe)
static CRD_INSTALLED: OnceCell<Result<(), String>> = OnceCell::const_new();

/// Check if a kind cluster with the given name exists
pub fn kind_cluster_exists(name: &str) -> bool {
    let output = Command::new("kind")
        .args(["get", "clusters"])
        .output()
        .expect("failed to run kind");

    let clusters = String::from_utf8_lossy(&output.stdout);
    clusters.lines().any(|line| line.trim() == name)
}

/// Create a kind cluster for testing
pub fn create_kind_cluster(name: &str) -> Result<(), String> {
    if kind_cluster_exists(name) {
        println!("Kind cluster '{name}' already exists, reusing it");
        return Ok(());
    }

    println!("Creating kind cluster '{name}'...");
    let output = Command::new("kind")
        .args(["create", "cluster", "--name", name, "--wait", "60s"])
        .output()
        .map_err(|e| format!("failed to run kind: {e}"))?;

    if !output.status.success() {
        return Err(format!(
            "failed to create kind cluster: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    println!("Kind cluster '{name}' created successfully");
    Ok(())
}

/// Install the GateServer CRD into the cluster, replacing any previous version
pub async fn install_crd(client: &Client) -> Result<(), kube::Error> {
    let crd = GateServer::crd();
    let crd_name = crd.metadata.name.clone().unwrap_or_default();
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());

    match crds.get(&crd_name).await {
        Ok(_) => {
            println!("CRD already installed, deleting and reinstalling...");
            crds.delete(&crd_name, &DeleteParams::default()).await?;
            sleep(Duration::from_secs(2)).await;
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {}
        Err(e) => return Err(e),
    }

    println!("Installing GateServer CRD...");
    crds.create(&PostParams::default(), &crd).await?;

    // Wait for CRD to be established
    sleep(Duration::from_secs(2)).await;

    println!("CRD installed successfully");
    Ok(())
}

/// Create a Kubernetes client connected to the test cluster
pub async fn create_test_client() -> Result<Client, String> {
    let context_name = format!("kind-{TEST_CLUSTER_NAME}");

    let config = Config::from_kubeconfig(&kube::config::KubeConfigOptions {
        context: Some(context_name),
        ..Default::default()
    })
    .await
    .map_err(|e| format!("failed to load kubeconfig: {e}"))?;

    Client::try_from(config).map_err(|e| format!("failed to create client: {e}"))
}

/// Ensure the test cluster is ready (thread-safe, cluster created once)
///
/// Returns a fresh Client for each call - clients should not be shared across test threads.
pub async fn ensure_test_cluster() -> Result<Client, String> {
    let cluster_result = CLUSTER_INIT.get_or_init(|| create_kind_cluster(TEST_CLUSTER_NAME));
    cluster_result.clone()?;

    let client = create_test_client().await?;

    let crd_result = CRD_INSTALLED
        .get_or_init(|| async {
            let client = create_test_client().await?;
            install_crd(&client)
                .await
                .map_err(|e| format!("failed to install CRD: {e}"))
        })
        .await;
    crd_result.clone()?;

    Ok(client)
}

/// Create a namespace if it does not exist yet
pub async fn ensure_namespace(client: &Client, name: &str) -> Result<(), kube::Error> {
    let api: Api<Namespace> = Api::all(client.clone());
    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    match api.create(&PostParams::default(), &namespace).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
        Err(e) => Err(e),
    }
}

/// A GateServer granting the given verbs on deployments in `target`
pub fn deployment_reader(name: &str, namespace: &str, target: &str) -> GateServer {
    let mut gs = GateServer::new(
        name,
        GateServerSpec {
            service_account_namespace: target.to_string(),
            service_account_api_groups: vec!["apps".to_string()],
            service_account_resources: vec!["deployments".to_string()],
            service_account_verbs: vec!["get".to_string(), "list".to_string()],
            ..Default::default()
        },
    );
    gs.metadata.namespace = Some(namespace.to_string());
    gs
}

/// Delete a GateServer and ignore the outcome
pub async fn cleanup_gate_server(client: &Client, name: &str, namespace: &str) {
    let api: Api<GateServer> = Api::namespaced(client.clone(), namespace);
    let _ = api.delete(name, &DeleteParams::default()).await;
}

/// Poll until `check` returns true or the timeout expires
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        sleep(Duration::from_millis(500)).await;
    }
    false
}
