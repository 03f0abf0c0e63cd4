//! gate-operator - provisions identity, signing keys and RBAC for gateway servers
//!
//! A `GateServer` declares which permissions a gateway proxy should hold.
//! The operator derives the objects the proxy needs to run with those
//! permissions, creates them once, and cleans up the cluster-scoped ones
//! when the GateServer is deleted.
//!
//! # Modules
//!
//! - [`crd`] - GateServer Custom Resource Definition
//! - [`controller`] - Reconciliation state machine and teardown
//! - [`resources`] - Pure derivation of dependent objects from a GateServer
//! - [`pki`] - Signing keypair generation
//! - [`store`] - Kubernetes store traits and their kube-backed implementations
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod error;
pub mod pki;
pub mod resources;
pub mod store;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Well-known Names
// =============================================================================

/// Finalizer marking that teardown is owed before a GateServer can be removed
pub const GATESERVER_FINALIZER: &str = "ocgate.rh-fieldwork.com/finalizer";

/// Name of the Secret holding the gateway's JWT signing keypair
///
/// One per namespace: GateServers in the same namespace share it.
pub const JWT_SECRET_NAME: &str = "kube-gateway-jwt-secret";

/// `serviceAccountNamespace` value that grants permissions cluster-wide
pub const CLUSTER_WIDE_NAMESPACE: &str = "*";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "gate-operator";

/// Label key set on every dependent object
pub const APP_LABEL: &str = "app";
