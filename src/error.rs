//! Error types for the Trellis operator

use std::time::Duration;

use thiserror::Error;

/// Main error type for Trellis operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for a GraphDefinition or EndpointBridge spec
    #[error("validation error: {0}")]
    Validation(String),

    /// Expression parse or evaluation error
    #[error("expression error: {0}")]
    Expression(#[from] crate::expr::ExprError),

    /// Dependency graph error (cycle, unknown reference, self-reference)
    #[error("graph error: {0}")]
    Graph(String),

    /// Schema compilation error
    #[error("schema error: {0}")]
    Schema(String),

    /// A dependency is not yet satisfied (node pending, binding missing)
    #[error("dependency not ready: {0}")]
    DependencyNotReady(String),

    /// Remote system error (DNS, certificate authority, IAM)
    #[error("remote error: {0}")]
    Remote(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a graph error with the given message
    pub fn graph(msg: impl Into<String>) -> Self {
        Self::Graph(msg.into())
    }

    /// Create a schema error with the given message
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a dependency-not-ready error with the given message
    pub fn dependency_not_ready(msg: impl Into<String>) -> Self {
        Self::DependencyNotReady(msg.into())
    }

    /// Create a remote error with the given message
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Classify this error for requeue cadence selection
    pub fn class(&self) -> ErrorClass {
        match self {
            // K8s API and remote calls may recover on their own
            Error::Kube(_) | Error::Remote(_) => ErrorClass::Transient,
            // Missing pieces that another reconciliation may supply
            Error::DependencyNotReady(_) => ErrorClass::Recoverable,
            // User must change the spec; poll slowly and surface loudly
            Error::Validation(_)
            | Error::Expression(_)
            | Error::Graph(_)
            | Error::Schema(_)
            | Error::Serialization(_) => ErrorClass::Terminal,
        }
    }

    /// Requeue delay for this error's class
    pub fn requeue_after(&self) -> Duration {
        self.class().requeue_after()
    }
}

/// Error classification driving retry cadence
///
/// Every node and bridge phase retries independently at the cadence of the
/// error it hit; no error class aborts the whole instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Throttling, timeouts, "not yet ready" - short retry
    Transient,
    /// Missing reference or unmet dependency - medium retry
    Recoverable,
    /// Invalid configuration or permanent denial - long retry with a
    /// Degraded condition surfaced to the user
    Terminal,
}

impl ErrorClass {
    /// Bounded requeue delay for this class
    pub fn requeue_after(&self) -> Duration {
        match self {
            ErrorClass::Transient => Duration::from_secs(15),
            ErrorClass::Recoverable => Duration::from_secs(30),
            ErrorClass::Terminal => Duration::from_secs(300),
        }
    }
}
