//! Error types for the provider operator
//!
//! The taxonomy mirrors how a failure is handled by the control loop: terminal
//! errors wait for a spec change, everything else is retried with backoff.

use std::time::Duration;

use thiserror::Error;

/// Main error type for provider reconciliation
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Manifest repository unreachable, timed out or returned unreadable data
    #[error("transient fetch error for {provider}: {message}")]
    TransientFetch {
        /// Provider whose manifests were being fetched
        provider: String,
        /// Description of what failed
        message: String,
    },

    /// Unknown provider name or version in the manifest repository
    #[error("provider {provider} version {version} not found: {message}")]
    NotFound {
        /// Provider that was requested
        provider: String,
        /// Version that was requested
        version: String,
        /// Description of what is missing
        message: String,
    },

    /// Optimistic-concurrency conflict writing a component
    #[error("conflict applying {component}: {message}")]
    ApplyConflict {
        /// Component identity (apiVersion/kind/namespace/name)
        component: String,
        /// Description from the target environment
        message: String,
    },

    /// Malformed component definition or rejected object
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// Component identity, when the error is attributable to one
        component: Option<String>,
    },

    /// Owned components still present during teardown
    #[error("deletion blocked for {provider}: {remaining} owned component(s) remain")]
    DeletionBlocked {
        /// Provider being deleted
        provider: String,
        /// Number of owned components still present
        remaining: usize,
    },

    /// Target environment call failed for a reason other than a conflict
    #[error("target error for {component}: {message}")]
    Target {
        /// Component identity or listing scope
        component: String,
        /// Description of what failed
        message: String,
    },

    /// Kubernetes API error from the provider store
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A bounded call did not complete in time
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Bound that elapsed
        timeout: Duration,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Shutdown signal observed mid-reconciliation
    #[error("reconciliation cancelled")]
    Cancelled,
}

impl Error {
    /// Create a transient fetch error
    pub fn transient_fetch(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::TransientFetch {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error for a provider version
    pub fn not_found(
        provider: impl Into<String>,
        version: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            provider: provider.into(),
            version: version.into(),
            message: msg.into(),
        }
    }

    /// Create an apply conflict error for a component
    pub fn apply_conflict(component: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ApplyConflict {
            component: component.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            component: None,
        }
    }

    /// Create a validation error attributed to a component
    pub fn validation_for(component: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            component: Some(component.into()),
        }
    }

    /// Create a deletion blocked error
    pub fn deletion_blocked(provider: impl Into<String>, remaining: usize) -> Self {
        Self::DeletionBlocked {
            provider: provider.into(),
            remaining,
        }
    }

    /// Create a target environment error
    pub fn target(component: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Target {
            component: component.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Terminal errors are not requeued; only a spec change clears them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Validation { .. })
    }

    /// Whether this is an optimistic-concurrency conflict worth an immediate retry
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ApplyConflict { .. })
    }

    /// Condition reason surfaced on the provider's `Ready` condition
    pub fn reason(&self) -> &'static str {
        match self {
            Self::TransientFetch { .. } => "FetchFailed",
            Self::NotFound { .. } => "VersionNotFound",
            Self::ApplyConflict { .. } => "ApplyConflict",
            Self::Validation { .. } => "InvalidComponent",
            Self::DeletionBlocked { .. } => "DeletionBlocked",
            Self::Target { .. } | Self::Kube(_) => "TargetError",
            Self::Timeout { .. } => "Timeout",
            Self::Serialization(_) => "SerializationError",
            Self::Cancelled => "Cancelled",
        }
    }
}
