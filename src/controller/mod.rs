//! Provider controllers
//!
//! One generic reconciliation engine drives all four provider kinds. Each kind
//! gets its own kube-runtime controller and concurrency limit, registered with
//! a shared [`Manager`] that holds the readiness gates and the shutdown signal.

mod manager;
mod reconciler;
mod registrar;
mod state_machine;
mod watch;

pub use manager::{Manager, ReadinessGates};
pub use reconciler::{ControllerHandle, GenericProviderReconciler};
pub use registrar::{register_providers, KubeSource, ProviderSource, Registrations};
pub use state_machine::{plan, versions_match, Plan};
pub use watch::{kube_feed, memory_feed, ChangeFilter, ProviderFeed};

pub use kube::runtime::controller::Action;

use std::sync::Arc;

use crate::applier::{ComponentApplier, TargetClient};
use crate::manifest::ManifestRepository;
use crate::OperatorConfig;

/// Per-controller options given at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerOptions {
    /// Reconciliations allowed in flight at once for this kind
    pub max_concurrent_reconciles: usize,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: 1,
        }
    }
}

/// Shared state for every reconciliation
///
/// Holds the manifest repository, the component applier and the operator
/// configuration. One context is shared by all four kinds.
pub struct Context {
    /// Source of provider releases
    pub repository: Arc<dyn ManifestRepository>,
    /// Applier bound to the target environment
    pub applier: ComponentApplier,
    /// Operator configuration
    pub config: OperatorConfig,
}

impl Context {
    /// Build a context; the applier is configured from `config`
    pub fn new(
        repository: Arc<dyn ManifestRepository>,
        target: Arc<dyn TargetClient>,
        config: OperatorConfig,
    ) -> Self {
        let applier = ComponentApplier::new(target, config.conflict_attempts, config.call_timeout);
        Self {
            repository,
            applier,
            config,
        }
    }

    /// Options derived from the configuration
    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            max_concurrent_reconciles: self.config.max_concurrent_reconciles.max(1),
        }
    }
}
