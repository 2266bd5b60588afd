//! Custom Resource Definitions for Trellis
//!
//! Two static CRDs anchor the system: [`GraphDefinition`] declares a resource
//! graph and the schema of the API it generates, and [`EndpointBridge`] is a
//! phase-driven workflow resource for external endpoint wiring. Instance CRDs
//! are generated at runtime from GraphDefinition schemas and served through
//! the dynamic API.

mod bridge;
mod definition;
mod types;

pub use bridge::{
    BackendRef, BridgePhase, CertificateSpec, EndpointBridge, EndpointBridgeSpec,
    EndpointBridgeStatus, DELETION_POLICY_ANNOTATION, DELETION_POLICY_RETAIN,
};
pub use definition::{
    DefinitionState, ExternalRef, GraphDefinition, GraphDefinitionSpec, GraphDefinitionStatus,
    ResourceNode, SchemaSpec, ValidationRule,
};
pub use types::{set_condition, Condition, ConditionStatus, InstanceState};
