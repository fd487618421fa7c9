//! capi-operator - lifecycle operator for Cluster API providers
//!
//! Installs, upgrades and removes the four Cluster API provider kinds (core,
//! infrastructure, bootstrap and control-plane) from declarative resources.
//! A single reconciliation engine, generic over [`provider::ProviderResource`],
//! is instantiated once per kind.
//!
//! # Architecture
//!
//! - A provider resource names a desired version of a provider release
//! - The engine fetches that release from a manifest repository, renders it and
//!   converges the target environment to it with field-owned merge patches
//! - Every installed component is labelled with its owning provider; pruning and
//!   teardown operate purely on that ownership
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (CoreProvider, InfrastructureProvider, ...)
//! - [`provider`] - Provider kinds, identities and the generic resource trait
//! - [`manifest`] - Manifest repository client, release bundles and rendering
//! - [`applier`] - Component applier and target environment clients
//! - [`store`] - Provider resource stores (Kubernetes and in-memory)
//! - [`status`] - Status and condition tracking
//! - [`controller`] - State machine, reconciler, change feeds, manager and registrar
//! - [`config`] - Operator configuration
//! - [`retry`] - Retry and backoff helpers
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod applier;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod manifest;
pub mod provider;
pub mod retry;
pub mod status;
pub mod store;

pub use config::OperatorConfig;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every write the operator makes
pub const FIELD_MANAGER: &str = "capi-operator";

/// Finalizer holding a provider until its components are gone
pub const FINALIZER: &str = "operator.cluster.x-k8s.io/provider";
