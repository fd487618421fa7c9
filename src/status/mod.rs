//! Status and condition tracking
//!
//! Every status change the engine makes goes through [`StatusTracker::record`],
//! which merges an [`Outcome`] into the provider's current status and writes it
//! only when something actually changed.

use std::sync::Arc;

use tracing::debug;

use crate::crd::{
    Condition, ConditionStatus, ProviderPhase, ProviderStatus, CONDITION_INSTALLED,
    CONDITION_READY,
};
use crate::provider::ProviderResource;
use crate::store::ProviderStore;
use crate::{Error, Result};

/// A status transition to record
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// Phase to enter
    pub phase: ProviderPhase,
    /// Conditions to merge, by type
    pub conditions: Vec<Condition>,
    /// New installed version, `None` leaves it unchanged
    pub installed_version: Option<String>,
    /// New observed generation, only set on success
    pub observed_generation: Option<i64>,
}

impl Outcome {
    /// Work in progress: phase changes and Ready goes False with the given reason
    pub fn progress(phase: ProviderPhase, reason: &str, message: impl Into<String>) -> Self {
        Self {
            phase,
            conditions: vec![Condition::new(
                CONDITION_READY,
                ConditionStatus::False,
                reason,
                message,
            )],
            installed_version: None,
            observed_generation: None,
        }
    }

    /// Fully converged at `version` for spec `generation`
    pub fn ready(version: impl Into<String>, generation: i64) -> Self {
        let version = version.into();
        Self {
            phase: ProviderPhase::Ready,
            conditions: vec![
                Condition::new(
                    CONDITION_INSTALLED,
                    ConditionStatus::True,
                    "Installed",
                    format!("version {} installed", version),
                ),
                Condition::new(
                    CONDITION_READY,
                    ConditionStatus::True,
                    "Ready",
                    "provider components are converged",
                ),
            ],
            installed_version: Some(version),
            observed_generation: Some(generation),
        }
    }

    /// Reconciliation failed; installed version and observed generation stay put
    pub fn failed(error: &Error) -> Self {
        Self {
            phase: ProviderPhase::Failed,
            conditions: vec![Condition::new(
                CONDITION_READY,
                ConditionStatus::False,
                error.reason(),
                error.to_string(),
            )],
            installed_version: None,
            observed_generation: None,
        }
    }

    /// Teardown still waiting on owned components
    pub fn deletion_blocked(error: &Error) -> Self {
        Self {
            phase: ProviderPhase::Deleting,
            ..Self::failed(error)
        }
    }

    /// Every owned component is gone
    pub fn deleted() -> Self {
        Self {
            phase: ProviderPhase::Deleted,
            conditions: vec![
                Condition::new(
                    CONDITION_INSTALLED,
                    ConditionStatus::False,
                    "Deleted",
                    "provider components removed",
                ),
                Condition::new(
                    CONDITION_READY,
                    ConditionStatus::False,
                    "Deleted",
                    "provider components removed",
                ),
            ],
            installed_version: None,
            observed_generation: None,
        }
    }

    /// Merge this outcome into `current`
    pub fn apply_to(self, current: Option<&ProviderStatus>) -> ProviderStatus {
        let mut status = current.cloned().unwrap_or_default();
        status.phase = self.phase;
        for condition in self.conditions {
            status.set_condition(condition);
        }
        if let Some(version) = self.installed_version {
            status.installed_version = Some(version);
        }
        if let Some(generation) = self.observed_generation {
            status.observed_generation = Some(generation);
        }
        status
    }
}

/// Writes outcomes to a provider's status
pub struct StatusTracker<P: ProviderResource> {
    store: Arc<dyn ProviderStore<P>>,
}

impl<P: ProviderResource> Clone for StatusTracker<P> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<P: ProviderResource> StatusTracker<P> {
    /// Create a tracker writing through `store`
    pub fn new(store: Arc<dyn ProviderStore<P>>) -> Self {
        Self { store }
    }

    /// Record `outcome` on `provider`, updating the local copy as well.
    ///
    /// Returns whether a write was issued.
    pub async fn record(&self, provider: &mut P, outcome: Outcome) -> Result<bool> {
        let next = outcome.apply_to(provider.provider_status());
        if provider.provider_status() == Some(&next) {
            return Ok(false);
        }

        debug!(
            provider = %provider.key(),
            kind = %P::KIND,
            phase = %next.phase,
            "Recording provider status"
        );
        self.store.patch_status(&provider.key(), &next).await?;
        *provider.provider_status_mut() = Some(next);
        Ok(true)
    }
}
