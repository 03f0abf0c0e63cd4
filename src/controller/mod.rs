//! Controller implementation for the GateServer CRD
//!
//! Reconciliation follows the Kubernetes controller pattern: re-read the
//! instance, decide from its observed state what is owed, act, and report
//! the outcome in status.

mod gate_server;

pub use gate_server::{
    error_policy, reconcile, teardown_targets, Context, ContextBuilder, GateServerState,
    TeardownPolicy, PROVISION_RETRY_SECS,
};
