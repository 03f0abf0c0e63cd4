//! GateServer controller implementation
//!
//! Provisioning runs once per GateServer: validate the permission request,
//! apply every dependent artifact, add the finalizer, then mark the instance
//! Ready. Ready is terminal until deletion; spec edits after that point are
//! not acted on. Deletion removes the cluster-scoped artifacts that owner
//! references cannot clean up and then releases the finalizer.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{Condition, ConditionStatus, GateServer, GateServerPhase};
use crate::pki::{Keypair, KeypairGenerator, PkiError, RsaKeypairGenerator};
use crate::resources::{self, ArtifactKind, ObjectRef};
use crate::store::{ArtifactStore, GateServerStore, KubeArtifactStore, KubeGateServerStore};
use crate::{Error, GATESERVER_FINALIZER};

/// Minimum delay before provisioning of a failed generation is retried
pub const PROVISION_RETRY_SECS: u64 = 30;

/// Requeue delay after a write conflict
const CONFLICT_REQUEUE_SECS: u64 = 5;

/// Requeue delay after any other escalated error
const ERROR_REQUEUE_SECS: u64 = 30;

const CONDITION_VALIDATED: &str = "Validated";
const CONDITION_CREATED: &str = "Created";
const CONDITION_FINALIZED: &str = "Finalized";

const REASON_FAILED_CREATE: &str = "FailedCreateServer";
const REASON_FAILED_FINALIZE: &str = "FailedFinalizeServer";
const REASON_ALL_CREATED: &str = "AllResourcesCreated";
const MESSAGE_ALL_CREATED: &str = "All resources created";

/// Lifecycle state of a GateServer as observed at the start of a reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateServerState {
    /// Dependents not provisioned yet
    Unprovisioned,
    /// Provisioned; nothing to do until deletion
    Ready,
    /// Deletion requested; teardown may be owed
    Terminating,
    /// Gone from the store
    Deleted,
}

impl GateServerState {
    /// Classify a freshly fetched instance
    ///
    /// Deletion intent wins over phase.
    pub fn observe(gate_server: Option<&GateServer>) -> Self {
        let Some(gs) = gate_server else {
            return Self::Deleted;
        };
        if gs.metadata.deletion_timestamp.is_some() {
            return Self::Terminating;
        }
        let phase = gs.status.as_ref().map(|s| s.phase).unwrap_or_default();
        match phase {
            GateServerPhase::Ready => Self::Ready,
            GateServerPhase::Unprovisioned => Self::Unprovisioned,
        }
    }
}

/// What teardown does when some deletions fail
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TeardownPolicy {
    /// Log failures and release the finalizer anyway
    #[default]
    BestEffort,
    /// Keep the finalizer and retry until every deletion succeeds
    Strict,
}

/// Controller context shared by all reconciliations
pub struct Context {
    /// GateServer reads and writes
    pub gate_servers: Arc<dyn GateServerStore>,
    /// Dependent artifact writes
    pub artifacts: Arc<dyn ArtifactStore>,
    /// Signing keypair source
    pub keys: Arc<dyn KeypairGenerator>,
    /// Behavior when teardown deletions fail
    pub teardown_policy: TeardownPolicy,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a new controller context with the given Kubernetes client
    pub fn new(client: Client) -> Self {
        Self::builder(client).build()
    }

    /// Create a context for testing with custom stores
    ///
    /// For production code, use [`Context::builder`].
    #[cfg(test)]
    pub fn for_testing(
        gate_servers: Arc<dyn GateServerStore>,
        artifacts: Arc<dyn ArtifactStore>,
        keys: Arc<dyn KeypairGenerator>,
    ) -> Self {
        Self {
            gate_servers,
            artifacts,
            keys,
            teardown_policy: TeardownPolicy::default(),
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .teardown_policy(TeardownPolicy::Strict)
///     .build();
/// ```
pub struct ContextBuilder {
    client: Client,
    teardown_policy: TeardownPolicy,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            teardown_policy: TeardownPolicy::default(),
        }
    }

    /// Set the teardown policy
    pub fn teardown_policy(mut self, policy: TeardownPolicy) -> Self {
        self.teardown_policy = policy;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            gate_servers: Arc::new(KubeGateServerStore::new(self.client.clone())),
            artifacts: Arc::new(KubeArtifactStore::new(self.client)),
            keys: Arc::new(RsaKeypairGenerator::new()),
            teardown_policy: self.teardown_policy,
        }
    }
}

/// Reconcile a GateServer
///
/// The object handed in by the watcher is only used for its name and
/// namespace; decisions are made on a fresh read.
///
/// # Returns
///
/// An `Action` telling the runtime whether to wait for the next change or
/// requeue, or an error for store failures that must be retried.
#[instrument(skip(gate_server, ctx), fields(gate_server = %gate_server.name_any(), namespace = ?gate_server.namespace()))]
pub async fn reconcile(gate_server: Arc<GateServer>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = gate_server.name_any();
    let Some(namespace) = gate_server.namespace() else {
        warn!("GateServer without namespace, ignoring");
        return Ok(Action::await_change());
    };

    let current = ctx.gate_servers.fetch(&name, &namespace).await?;
    let state = GateServerState::observe(current.as_ref());
    debug!(?state, "observed GateServer state");

    match (state, current) {
        (GateServerState::Terminating, Some(gs)) => finalize(gs, &ctx).await,
        (GateServerState::Unprovisioned, Some(gs)) => provision(gs, &ctx).await,
        (GateServerState::Ready, _) => Ok(Action::await_change()),
        (GateServerState::Deleted, _) | (_, None) => {
            debug!("GateServer no longer exists");
            Ok(Action::await_change())
        }
    }
}

/// Error policy for the controller
///
/// Conflicts retry quickly from a fresh read; everything else backs off.
pub fn error_policy(gate_server: Arc<GateServer>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        gate_server = %gate_server.name_any(),
        "reconciliation failed"
    );

    if error.is_conflict() {
        Action::requeue(Duration::from_secs(CONFLICT_REQUEUE_SECS))
    } else {
        Action::requeue(Duration::from_secs(ERROR_REQUEUE_SECS))
    }
}

// =============================================================================
// Provisioning
// =============================================================================

async fn provision(gs: GateServer, ctx: &Context) -> Result<Action, Error> {
    if let Some(action) = pending_failure(&gs) {
        return Ok(action);
    }

    if let Err(e) = gs.spec.validate() {
        warn!(error = %e, "GateServer validation failed");
        record_failure(&gs, ctx, CONDITION_VALIDATED, REASON_FAILED_CREATE, &e.to_string()).await?;
        return Ok(Action::await_change());
    }

    if let Err(e) = provision_artifacts(&gs, ctx).await {
        if e.is_conflict() {
            return Err(e);
        }
        warn!(error = %e, "failed to create GateServer dependents");
        record_failure(&gs, ctx, CONDITION_CREATED, REASON_FAILED_CREATE, &e.to_string()).await?;
        return Ok(Action::requeue(Duration::from_secs(PROVISION_RETRY_SECS)));
    }

    // The finalizer must be persisted before Ready is observable
    let gs = ensure_finalizer(gs, ctx).await?;

    let generation = gs.metadata.generation;
    let mut updated = gs;
    let status = updated.status.get_or_insert_with(Default::default);
    status.phase = GateServerPhase::Ready;
    status.observed_generation = generation;
    status.push_condition(Condition::new(
        CONDITION_CREATED,
        ConditionStatus::True,
        REASON_ALL_CREATED,
        MESSAGE_ALL_CREATED,
    ));
    ctx.gate_servers.update_status(&updated).await?;

    info!("GateServer ready");
    Ok(Action::await_change())
}

/// Short-circuit for generations whose last attempt already failed
///
/// Recording a failure writes status, which triggers another reconcile of
/// the same generation. An invalid spec waits for an edit; a failed
/// provisioning attempt waits out the retry interval.
fn pending_failure(gs: &GateServer) -> Option<Action> {
    let status = gs.status.as_ref()?;
    let generation = gs.metadata.generation?;
    if status.observed_generation != Some(generation) {
        return None;
    }

    let last = status.last_condition()?;
    if last.status != ConditionStatus::False {
        return None;
    }

    match last.type_.as_str() {
        CONDITION_VALIDATED => {
            debug!(generation, "generation already rejected, waiting for a spec change");
            Some(Action::await_change())
        }
        CONDITION_CREATED => {
            let retry_after = Duration::from_secs(PROVISION_RETRY_SECS);
            let elapsed = (Utc::now() - last.last_transition_time)
                .to_std()
                .unwrap_or_default();
            if elapsed >= retry_after {
                return None;
            }
            debug!(generation, "provisioning failed recently, delaying retry");
            Some(Action::requeue(retry_after - elapsed))
        }
        _ => None,
    }
}

/// Generate fresh credentials and apply every dependent
///
/// Each attempt generates a new keypair and OAuth client secret. A retry
/// after a partial failure therefore rotates the credentials of dependents
/// that an earlier attempt already applied; the Secret and OAuthClient always
/// end up carrying the values of the last attempt.
async fn provision_artifacts(gs: &GateServer, ctx: &Context) -> Result<(), Error> {
    let keypair = generate_keypair(ctx.keys.clone()).await?;
    let client_secret = if gs.spec.generate_oauth_client {
        resources::generate_client_secret()
    } else {
        String::new()
    };

    let artifacts = resources::desired_artifacts(gs, &keypair, &client_secret)?;
    for artifact in &artifacts {
        debug!(?artifact, "applying dependent");
        ctx.artifacts.create_or_update(artifact).await?;
    }

    info!(count = artifacts.len(), "applied GateServer dependents");
    Ok(())
}

/// RSA generation blocks for seconds, so it runs off the async workers
async fn generate_keypair(keys: Arc<dyn KeypairGenerator>) -> Result<Keypair, Error> {
    let keypair = tokio::task::spawn_blocking(move || keys.generate())
        .await
        .map_err(|e| {
            PkiError::KeyGenerationFailed(format!("key generation task failed: {}", e))
        })??;
    Ok(keypair)
}

fn has_finalizer(gs: &GateServer) -> bool {
    gs.finalizers().iter().any(|f| f == GATESERVER_FINALIZER)
}

async fn ensure_finalizer(gs: GateServer, ctx: &Context) -> Result<GateServer, Error> {
    if has_finalizer(&gs) {
        return Ok(gs);
    }

    let mut updated = gs;
    updated.finalizers_mut().push(GATESERVER_FINALIZER.to_string());
    let updated = ctx.gate_servers.update(&updated).await?;
    debug!("added finalizer");
    Ok(updated)
}

/// Append a failure condition unless this generation already carries it
///
/// A repeated failure of the same kind leaves status untouched, so retries
/// neither grow the condition list nor re-trigger reconciliation.
async fn record_failure(
    gs: &GateServer,
    ctx: &Context,
    type_: &str,
    reason: &str,
    message: &str,
) -> Result<(), Error> {
    if failure_recorded(gs, type_, reason) {
        debug!(condition = type_, reason, "failure already recorded for this generation");
        return Ok(());
    }

    let mut updated = gs.clone();
    let status = updated.status.get_or_insert_with(Default::default);
    status.observed_generation = gs.metadata.generation;
    status.push_condition(Condition::new(
        type_,
        ConditionStatus::False,
        reason,
        message,
    ));
    ctx.gate_servers.update_status(&updated).await?;
    Ok(())
}

// =============================================================================
// Teardown
// =============================================================================

/// Cluster-scoped artifacts deleted when a GateServer goes away
///
/// Namespaced dependents are left to owner-reference garbage collection.
pub fn teardown_targets(gs: &GateServer) -> Vec<(ArtifactKind, ObjectRef)> {
    let name = gs.name_any();
    let mut targets = vec![(ArtifactKind::ClusterRole, ObjectRef::cluster(&name))];
    if gs.spec.is_cluster_wide() {
        targets.push((ArtifactKind::ClusterRoleBinding, ObjectRef::cluster(&name)));
    }
    if gs.spec.generate_oauth_client {
        targets.push((ArtifactKind::OAuthClient, ObjectRef::cluster(&name)));
    }
    targets
}

async fn finalize(gs: GateServer, ctx: &Context) -> Result<Action, Error> {
    if !has_finalizer(&gs) {
        debug!("no finalizer, nothing to tear down");
        return Ok(Action::await_change());
    }

    info!("tearing down GateServer dependents");
    let mut failures = Vec::new();
    for (kind, target) in teardown_targets(&gs) {
        if let Err(e) = ctx.artifacts.delete(kind, &target).await {
            failures.push(e);
        }
    }

    if !failures.is_empty() {
        let message = failures
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");

        match ctx.teardown_policy {
            TeardownPolicy::BestEffort => {
                warn!(failures = %message, "teardown incomplete, releasing finalizer anyway");
            }
            TeardownPolicy::Strict => {
                warn!(failures = %message, "teardown incomplete, keeping finalizer");
                record_failure(&gs, ctx, CONDITION_FINALIZED, REASON_FAILED_FINALIZE, &message)
                    .await?;
                return Err(Error::finalization(message));
            }
        }
    }

    let mut updated = gs;
    updated.finalizers_mut().retain(|f| f != GATESERVER_FINALIZER);
    ctx.gate_servers.update(&updated).await?;

    info!("GateServer finalized");
    Ok(Action::await_change())
}

fn failure_recorded(gs: &GateServer, type_: &str, reason: &str) -> bool {
    let Some(status) = gs.status.as_ref() else {
        return false;
    };
    if status.observed_generation != gs.metadata.generation {
        return false;
    }
    status
        .last_condition()
        .map(|c| c.type_ == type_ && c.status == ConditionStatus::False && c.reason == reason)
        .unwrap_or(false)
}
