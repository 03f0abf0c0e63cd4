//! Custom Resource Definitions for the gate operator
//!
//! This module contains the GateServer CRD and its supporting types.

mod gate_server;
mod types;

pub use gate_server::{GateServer, GateServerSpec, GateServerStatus};
pub use types::{Condition, ConditionStatus, GateServerPhase, PermissionScope};
