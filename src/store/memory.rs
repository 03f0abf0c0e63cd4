//! In-memory store used by scenario tests
//!
//! Emulates the API server behaviors the controller depends on:
//! resourceVersion checks, removal of a terminating object once its last
//! finalizer is gone, and idempotent apply/delete of artifacts. Failures can
//! be injected per artifact kind.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;

use super::{ArtifactStore, GateServerStore};
use crate::crd::{GateServer, GateServerSpec};
use crate::resources::{Artifact, ArtifactKind, ObjectRef};
use crate::Error;

type Key = (String, String);

#[derive(Default)]
struct State {
    gate_servers: HashMap<Key, GateServer>,
    artifacts: HashMap<(ArtifactKind, ObjectRef), serde_json::Value>,
    failing_applies: HashSet<ArtifactKind>,
    failing_deletes: HashSet<ArtifactKind>,
    conflicts_remaining: usize,
    next_version: u64,
    applies: usize,
    deletes: Vec<(ArtifactKind, ObjectRef)>,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn check_write(&mut self, gs: &GateServer, operation: &str) -> Result<Key, Error> {
        let key = (gs.name_any(), gs.namespace().unwrap_or_default());
        if self.conflicts_remaining > 0 {
            self.conflicts_remaining -= 1;
            return Err(Error::conflict(operation));
        }
        let stored = self
            .gate_servers
            .get(&key)
            .ok_or_else(|| Error::store(operation, "not found"))?;
        if stored.resource_version() != gs.resource_version() {
            return Err(Error::conflict(operation));
        }
        Ok(key)
    }
}

/// In-memory implementation of both store traits
#[derive(Default)]
pub(crate) struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert a GateServer as the API server would on create
    pub(crate) fn insert(&self, mut gs: GateServer) -> GateServer {
        let mut state = self.state.lock().unwrap();
        gs.metadata.resource_version = Some(state.bump());
        gs.metadata.generation.get_or_insert(1);
        if gs.metadata.uid.is_none() {
            gs.metadata.uid = Some(format!("uid-{}", gs.name_any()));
        }
        let key = (gs.name_any(), gs.namespace().unwrap_or_default());
        state.gate_servers.insert(key, gs.clone());
        gs
    }

    pub(crate) fn get(&self, name: &str, namespace: &str) -> Option<GateServer> {
        let state = self.state.lock().unwrap();
        state
            .gate_servers
            .get(&(name.to_string(), namespace.to_string()))
            .cloned()
    }

    /// Change the spec, bumping the generation
    pub(crate) fn edit_spec(&self, name: &str, namespace: &str, spec: GateServerSpec) {
        let mut state = self.state.lock().unwrap();
        let version = state.bump();
        if let Some(gs) = state
            .gate_servers
            .get_mut(&(name.to_string(), namespace.to_string()))
        {
            gs.spec = spec;
            gs.metadata.generation = Some(gs.metadata.generation.unwrap_or(1) + 1);
            gs.metadata.resource_version = Some(version);
        }
    }

    /// Request deletion; objects without finalizers disappear immediately
    pub(crate) fn request_deletion(&self, name: &str, namespace: &str) {
        let mut state = self.state.lock().unwrap();
        let key = (name.to_string(), namespace.to_string());
        let version = state.bump();
        let Some(gs) = state.gate_servers.get_mut(&key) else {
            return;
        };
        if gs.finalizers().is_empty() {
            state.gate_servers.remove(&key);
            return;
        }
        gs.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        gs.metadata.resource_version = Some(version);
    }

    pub(crate) fn artifact(
        &self,
        kind: ArtifactKind,
        target: &ObjectRef,
    ) -> Option<serde_json::Value> {
        let state = self.state.lock().unwrap();
        state.artifacts.get(&(kind, target.clone())).cloned()
    }

    pub(crate) fn artifact_count(&self) -> usize {
        self.state.lock().unwrap().artifacts.len()
    }

    pub(crate) fn apply_count(&self) -> usize {
        self.state.lock().unwrap().applies
    }

    pub(crate) fn deleted(&self) -> Vec<(ArtifactKind, ObjectRef)> {
        self.state.lock().unwrap().deletes.clone()
    }

    pub(crate) fn fail_applies_of(&self, kind: ArtifactKind) {
        self.state.lock().unwrap().failing_applies.insert(kind);
    }

    pub(crate) fn fail_deletes_of(&self, kind: ArtifactKind) {
        self.state.lock().unwrap().failing_deletes.insert(kind);
    }

    pub(crate) fn heal(&self) {
        let mut state = self.state.lock().unwrap();
        state.failing_applies.clear();
        state.failing_deletes.clear();
    }

    /// Make the next `count` GateServer writes fail with a conflict
    pub(crate) fn conflict_next_writes(&self, count: usize) {
        self.state.lock().unwrap().conflicts_remaining = count;
    }
}

#[async_trait]
impl GateServerStore for InMemoryStore {
    async fn fetch(&self, name: &str, namespace: &str) -> Result<Option<GateServer>, Error> {
        Ok(self.get(name, namespace))
    }

    async fn update(&self, gate_server: &GateServer) -> Result<GateServer, Error> {
        let mut state = self.state.lock().unwrap();
        let key = state.check_write(gate_server, "update GateServer")?;
        let version = state.bump();

        let stored = state
            .gate_servers
            .get_mut(&key)
            .ok_or_else(|| Error::store("update GateServer", "not found"))?;
        stored.metadata.finalizers = gate_server.metadata.finalizers.clone();
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();

        if updated.metadata.deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            state.gate_servers.remove(&key);
        }
        Ok(updated)
    }

    async fn update_status(&self, gate_server: &GateServer) -> Result<GateServer, Error> {
        let mut state = self.state.lock().unwrap();
        let key = state.check_write(gate_server, "update status of GateServer")?;
        let version = state.bump();

        let stored = state
            .gate_servers
            .get_mut(&key)
            .ok_or_else(|| Error::store("update status of GateServer", "not found"))?;
        stored.status = gate_server.status.clone();
        stored.metadata.resource_version = Some(version);
        Ok(stored.clone())
    }
}

#[async_trait]
impl ArtifactStore for InMemoryStore {
    async fn create_or_update(&self, artifact: &Artifact) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let kind = artifact.kind();
        if state.failing_applies.contains(&kind) {
            return Err(Error::store(format!("apply {}", kind), "injected failure"));
        }
        let value = artifact.to_json()?;
        state.artifacts.insert((kind, artifact.object_ref()), value);
        state.applies += 1;
        Ok(())
    }

    async fn delete(&self, kind: ArtifactKind, target: &ObjectRef) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.failing_deletes.contains(&kind) {
            return Err(Error::store(format!("delete {} {}", kind, target), "injected failure"));
        }
        state.artifacts.remove(&(kind, target.clone()));
        state.deletes.push((kind, target.clone()));
        Ok(())
    }
}
