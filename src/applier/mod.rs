//! Component applier
//!
//! Converges the target environment to a [`ManifestBundle`] with the fewest
//! mutating calls: absent components are created, present ones whose declared
//! fields drifted are updated with their declared state, and converged ones
//! are left alone. Fields the server or other writers add are not drift. Pruning removes owned components that are
//! no longer part of the desired set.
//!
//! Ownership is recorded on every component as labels naming the provider
//! (see [`ComponentOwner::labels`]); the target listing by owner is the only
//! garbage-collection mechanism.

mod kube;
mod memory;

pub use self::kube::KubeTarget;
pub use memory::{InMemoryTarget, Mutation, MutationKind};

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::manifest::{kind_priority, Component, ComponentId, ManifestBundle};
use crate::provider::{ComponentOwner, ProviderKind};
use crate::retry::{retry_with_backoff_if, with_timeout, RetryConfig};
use crate::{Error, Result};

/// A component as it currently exists in the target environment
#[derive(Debug, Clone, PartialEq)]
pub struct LiveComponent {
    /// Identity of the object
    pub id: ComponentId,
    /// Full live object
    pub object: Value,
    /// Owning provider, if the object carries ownership
    pub owner: Option<ComponentOwner>,
    /// Optimistic-concurrency token
    pub resource_version: Option<String>,
    /// Whether deletion has been requested but not completed
    pub deleting: bool,
}

/// Client for the environment components are installed into
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TargetClient: Send + Sync {
    /// Read a component, `None` when absent
    async fn get(&self, id: &ComponentId) -> Result<Option<LiveComponent>>;

    /// Create a component owned by `owner`; fails with a conflict if it exists
    async fn create(&self, id: &ComponentId, object: &Value, owner: &ComponentOwner) -> Result<()>;

    /// Bring an existing component to `object`, its full declared state.
    ///
    /// Only the declared fields are written; guarded by `resource_version`
    /// when given.
    async fn update<'a>(&self, id: &ComponentId, object: &Value, resource_version: Option<&'a str>)
        -> Result<()>;

    /// Request deletion of a component; absent components are not an error
    async fn delete(&self, id: &ComponentId) -> Result<()>;

    /// Every component owned by `owner`, including ones being deleted
    async fn list_owned(&self, owner: &ComponentOwner) -> Result<Vec<LiveComponent>>;

    /// Every component owned by any provider of `kind`
    async fn list_managed(&self, kind: ProviderKind) -> Result<Vec<LiveComponent>>;
}

/// Outcome counts of an apply pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Components created
    pub created: usize,
    /// Components patched
    pub updated: usize,
    /// Components already converged
    pub unchanged: usize,
}

impl ApplyReport {
    /// Number of components that needed a mutating call
    pub fn applied(&self) -> usize {
        self.created + self.updated
    }

    /// Number of components examined
    pub fn total(&self) -> usize {
        self.created + self.updated + self.unchanged
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Applies bundles and prunes leftovers through a [`TargetClient`]
#[derive(Clone)]
pub struct ComponentApplier {
    target: Arc<dyn TargetClient>,
    conflict_retry: RetryConfig,
    call_timeout: Duration,
}

impl ComponentApplier {
    /// Create an applier retrying conflicts up to `conflict_attempts` times per operation
    pub fn new(target: Arc<dyn TargetClient>, conflict_attempts: u32, call_timeout: Duration) -> Self {
        Self {
            target,
            conflict_retry: RetryConfig::immediate(conflict_attempts.max(1)),
            call_timeout,
        }
    }

    /// Converge the target to every component of `bundle`, in bundle order.
    ///
    /// Stops at the first failing component; the error names it.
    pub async fn apply(
        &self,
        bundle: &ManifestBundle,
        owner: &ComponentOwner,
        cancel: &CancellationToken,
    ) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();

        for component in &bundle.components {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.apply_component(component, owner).await? {
                ApplyOutcome::Created => report.created += 1,
                ApplyOutcome::Updated => report.updated += 1,
                ApplyOutcome::Unchanged => report.unchanged += 1,
            }
        }

        if report.applied() > 0 {
            info!(
                owner = %owner,
                version = %bundle.version,
                created = report.created,
                updated = report.updated,
                unchanged = report.unchanged,
                "Applied provider components"
            );
        }
        Ok(report)
    }

    async fn apply_component(
        &self,
        component: &Component,
        owner: &ComponentOwner,
    ) -> Result<ApplyOutcome> {
        let desired = owned_object(component, owner);
        retry_with_backoff_if(
            &self.conflict_retry,
            "apply_component",
            || self.apply_once(&component.id, &desired, owner),
            Error::is_conflict,
        )
        .await
    }

    async fn apply_once(
        &self,
        id: &ComponentId,
        desired: &Value,
        owner: &ComponentOwner,
    ) -> Result<ApplyOutcome> {
        let live = with_timeout(self.call_timeout, "get component", self.target.get(id)).await?;

        let Some(live) = live else {
            with_timeout(
                self.call_timeout,
                "create component",
                self.target.create(id, desired, owner),
            )
            .await?;
            debug!(component = %id, "Created component");
            return Ok(ApplyOutcome::Created);
        };

        if let Some(current) = live.owner.as_ref().filter(|o| *o != owner) {
            return Err(Error::validation_for(
                id.to_string(),
                format!("component is owned by {}", current),
            ));
        }

        if merge_patch(&live.object, desired).is_none() {
            return Ok(ApplyOutcome::Unchanged);
        }

        with_timeout(
            self.call_timeout,
            "update component",
            self.target
                .update(id, desired, live.resource_version.as_deref()),
        )
        .await?;
        debug!(component = %id, "Updated component");
        Ok(ApplyOutcome::Updated)
    }

    /// Delete every component owned by `owner` whose identity is not in `keep`.
    ///
    /// Deletions run in reverse apply order. Returns how many deletions were issued.
    pub async fn prune(&self, owner: &ComponentOwner, keep: &HashSet<ComponentId>) -> Result<usize> {
        let mut obsolete: Vec<_> = self
            .list_owned(owner)
            .await?
            .into_iter()
            .filter(|c| !keep.contains(&c.id) && !c.deleting)
            .map(|c| c.id)
            .collect();
        obsolete.sort_by_key(|id| std::cmp::Reverse(kind_priority(&id.kind)));

        for id in &obsolete {
            retry_with_backoff_if(
                &self.conflict_retry,
                "delete_component",
                || with_timeout(self.call_timeout, "delete component", self.target.delete(id)),
                Error::is_conflict,
            )
            .await?;
            debug!(component = %id, "Deleted component");
        }

        if !obsolete.is_empty() {
            info!(owner = %owner, deleted = obsolete.len(), "Pruned provider components");
        }
        Ok(obsolete.len())
    }

    /// Components currently owned by `owner`
    pub async fn list_owned(&self, owner: &ComponentOwner) -> Result<Vec<LiveComponent>> {
        with_timeout(
            self.call_timeout,
            "list owned components",
            self.target.list_owned(owner),
        )
        .await
    }

    /// Components owned by any provider of `kind`
    pub async fn list_managed(&self, kind: ProviderKind) -> Result<Vec<LiveComponent>> {
        with_timeout(
            self.call_timeout,
            "list managed components",
            self.target.list_managed(kind),
        )
        .await
    }
}

/// The component's declared object with ownership labels added
pub fn owned_object(component: &Component, owner: &ComponentOwner) -> Value {
    let mut object = component.object.clone();
    if let Some(map) = object.as_object_mut() {
        let metadata = map
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(metadata) = metadata.as_object_mut() {
            let labels = metadata
                .entry("labels")
                .or_insert_with(|| Value::Object(Map::new()));
            if !labels.is_object() {
                *labels = Value::Object(Map::new());
            }
            if let Some(labels) = labels.as_object_mut() {
                for (k, v) in owner.labels() {
                    labels.insert(k, Value::String(v));
                }
            }
        }
    }
    object
}

/// Labels of a JSON object
pub fn labels_of(object: &Value) -> BTreeMap<String, String> {
    object
        .pointer("/metadata/labels")
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// JSON merge patch that brings `live` to `desired` for declared fields only.
///
/// Fields present in `live` but absent from `desired` are left untouched.
/// Objects are merged recursively. An array matches when it has the declared
/// length and every declared element is covered by the live element at the
/// same position, so server-defaulted fields inside elements (a port's
/// `protocol`, a container's `imagePullPolicy`) are not drift. A drifted array
/// is replaced whole. Returns `None` when `live` already matches every
/// declared field.
pub fn merge_patch(live: &Value, desired: &Value) -> Option<Value> {
    match (live, desired) {
        (Value::Object(live), Value::Object(desired)) => {
            let mut patch = Map::new();
            for (key, want) in desired {
                match live.get(key) {
                    None if want.is_null() => {}
                    None => {
                        patch.insert(key.clone(), want.clone());
                    }
                    Some(have) => {
                        if let Some(sub) = merge_patch(have, want) {
                            patch.insert(key.clone(), sub);
                        }
                    }
                }
            }
            (!patch.is_empty()).then_some(Value::Object(patch))
        }
        _ if covers(live, desired) => None,
        _ => Some(desired.clone()),
    }
}

/// Whether `live` holds every field declared in `desired`
fn covers(live: &Value, desired: &Value) -> bool {
    match (live, desired) {
        (Value::Object(live), Value::Object(desired)) => {
            desired.iter().all(|(key, want)| match live.get(key) {
                Some(have) => covers(have, want),
                None => want.is_null(),
            })
        }
        (Value::Array(live), Value::Array(desired)) => {
            live.len() == desired.len()
                && live
                    .iter()
                    .zip(desired)
                    .all(|(have, want)| covers(have, want))
        }
        _ => live == desired,
    }
}
