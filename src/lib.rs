//! Trellis - CRD-driven resource-graph orchestrator for Kubernetes
//!
//! Trellis turns a declarative graph of Kubernetes resources into a generated
//! custom API. A platform team authors a GraphDefinition once; each instance
//! of the generated kind is reconciled into its composed objects in
//! dependency order, with values flowing between them through `${...}`
//! expressions.
//!
//! # Architecture
//!
//! - A definition controller compiles each GraphDefinition: schema, expression
//!   parse, dependency discovery, cycle check. Valid definitions get a
//!   generated CRD and a dedicated instance controller.
//! - Instance controllers walk the dependency graph in creation order,
//!   rendering and applying composed objects and gating on readiness.
//! - The EndpointBridge controller covers the imperative gap a pure graph
//!   cannot: a phased workflow ending in a direct call to an external DNS
//!   provider.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (GraphDefinition, EndpointBridge)
//! - [`expr`] - `${...}` expression parsing and evaluation
//! - [`schema`] - Simple-schema compilation and instance validation
//! - [`graph`] - Dependency graph construction and topological ordering
//! - [`definition`] - GraphDefinition controller and graph registry
//! - [`instance`] - Per-definition instance reconciler
//! - [`bridge`] - Multi-phase EndpointBridge reconciler
//! - [`runtime`] - Dynamic-API object access
//! - [`retry`] - Exponential backoff for calls that leave the process
//! - [`error`] - Error types and requeue classification

#![deny(missing_docs)]

pub mod bridge;
pub mod crd;
pub mod definition;
pub mod error;
pub mod expr;
pub mod graph;
pub mod instance;
pub mod retry;
pub mod runtime;
pub mod schema;

pub use error::{Error, ErrorClass};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group owning the GraphDefinition and EndpointBridge kinds, and the
/// group every generated API is registered under
pub const API_GROUP: &str = "trellis.dev";

/// API version of the built-in and generated kinds
pub const API_VERSION: &str = "v1alpha1";
