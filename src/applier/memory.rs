//! In-memory target environment
//!
//! An arena of components keyed by identity, each with an explicit owner
//! field. Every mutating call is recorded so callers can assert on exactly
//! what was written and in which order. Conflicts, slow deletions and outages
//! can be injected per component.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use super::{labels_of, LiveComponent, TargetClient};
use crate::manifest::ComponentId;
use crate::provider::{ComponentOwner, ProviderKind};
use crate::{Error, Result};

/// Kind of mutating call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    /// Object created
    Create,
    /// Object updated
    Update,
    /// Deletion requested
    Delete,
}

/// One recorded mutating call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    /// What was done
    pub kind: MutationKind,
    /// To which component
    pub id: ComponentId,
}

#[derive(Debug, Clone)]
struct StoredComponent {
    object: Value,
    owner: Option<ComponentOwner>,
    resource_version: u64,
    /// Remaining listings before a pending deletion completes
    deleting: Option<u32>,
}

#[derive(Default)]
struct TargetState {
    objects: BTreeMap<ComponentId, StoredComponent>,
    next_version: u64,
    mutations: Vec<Mutation>,
    conflicts: HashMap<ComponentId, u32>,
    deletion_delays: HashMap<ComponentId, u32>,
    unavailable: bool,
}

impl TargetState {
    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    fn check_available(&self, id: &ComponentId) -> Result<()> {
        if self.unavailable {
            return Err(Error::target(id.to_string(), "target unavailable"));
        }
        Ok(())
    }

    fn take_conflict(&mut self, id: &ComponentId) -> Result<()> {
        if let Some(remaining) = self.conflicts.get_mut(id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::apply_conflict(id.to_string(), "injected conflict"));
            }
        }
        Ok(())
    }

    /// Advance pending deletions by one observation
    fn tick_deletions(&mut self) {
        self.objects.retain(|_, stored| match stored.deleting.as_mut() {
            Some(0) => false,
            Some(remaining) => {
                *remaining -= 1;
                true
            }
            None => true,
        });
    }

    fn live(id: &ComponentId, stored: &StoredComponent) -> LiveComponent {
        LiveComponent {
            id: id.clone(),
            object: stored.object.clone(),
            owner: stored.owner.clone(),
            resource_version: Some(stored.resource_version.to_string()),
            deleting: stored.deleting.is_some(),
        }
    }
}

/// Target environment held entirely in memory
#[derive(Default)]
pub struct InMemoryTarget {
    state: Mutex<TargetState>,
}

impl InMemoryTarget {
    /// Empty target
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TargetState> {
        // a panic while holding the lock leaves the arena consistent
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of mutating calls served so far
    pub fn mutation_count(&self) -> usize {
        self.lock().mutations.len()
    }

    /// Every mutating call, in order
    pub fn mutations(&self) -> Vec<Mutation> {
        self.lock().mutations.clone()
    }

    /// Current object for a component, if present
    pub fn object(&self, id: &ComponentId) -> Option<Value> {
        self.lock().objects.get(id).map(|s| s.object.clone())
    }

    /// Whether a component exists (including one being deleted)
    pub fn contains(&self, id: &ComponentId) -> bool {
        self.lock().objects.contains_key(id)
    }

    /// Identities of components owned by `owner`, sorted
    pub fn owned_by(&self, owner: &ComponentOwner) -> Vec<ComponentId> {
        self.lock()
            .objects
            .iter()
            .filter(|(_, s)| s.owner.as_ref() == Some(owner))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Total number of components present
    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    /// Whether the target holds no components
    pub fn is_empty(&self) -> bool {
        self.lock().objects.is_empty()
    }

    /// Fail the next `count` writes to `id` with a conflict
    pub fn inject_conflicts(&self, id: &ComponentId, count: u32) {
        self.lock().conflicts.insert(id.clone(), count);
    }

    /// Keep `id` visible (as deleting) for `listings` owner listings after deletion
    pub fn delay_deletion(&self, id: &ComponentId, listings: u32) {
        self.lock().deletion_delays.insert(id.clone(), listings);
    }

    /// Merge `patch` into a component out of band, as the API server's
    /// defaulting or another writer would. Not recorded as a mutation.
    pub fn edit_externally(&self, id: &ComponentId, patch: &Value) -> bool {
        let mut state = self.lock();
        let next = state.bump();
        match state.objects.get_mut(id) {
            Some(stored) => {
                json_patch::merge(&mut stored.object, patch);
                stored.resource_version = next;
                true
            }
            None => false,
        }
    }

    /// Remove a component out of band, as an external actor would
    pub fn remove_externally(&self, id: &ComponentId) -> bool {
        self.lock().objects.remove(id).is_some()
    }

    /// Make every call fail with a target error while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }
}

#[async_trait]
impl TargetClient for InMemoryTarget {
    async fn get(&self, id: &ComponentId) -> Result<Option<LiveComponent>> {
        let state = self.lock();
        state.check_available(id)?;
        Ok(state
            .objects
            .get(id)
            .map(|stored| TargetState::live(id, stored)))
    }

    async fn create(&self, id: &ComponentId, object: &Value, owner: &ComponentOwner) -> Result<()> {
        let mut state = self.lock();
        state.check_available(id)?;
        state.take_conflict(id)?;
        if state.objects.contains_key(id) {
            return Err(Error::apply_conflict(id.to_string(), "already exists"));
        }

        let resource_version = state.bump();
        state.objects.insert(
            id.clone(),
            StoredComponent {
                object: object.clone(),
                owner: Some(owner.clone()),
                resource_version,
                deleting: None,
            },
        );
        state.mutations.push(Mutation {
            kind: MutationKind::Create,
            id: id.clone(),
        });
        Ok(())
    }

    async fn update<'a>(
        &self,
        id: &ComponentId,
        object: &Value,
        resource_version: Option<&'a str>,
    ) -> Result<()> {
        let mut state = self.lock();
        state.check_available(id)?;
        state.take_conflict(id)?;
        let next = state.next_version + 1;

        let stored = state
            .objects
            .get_mut(id)
            .ok_or_else(|| Error::target(id.to_string(), "not found"))?;
        if let Some(expected) = resource_version {
            if expected != stored.resource_version.to_string() {
                return Err(Error::apply_conflict(
                    id.to_string(),
                    format!(
                        "resourceVersion {} is stale, current is {}",
                        expected, stored.resource_version
                    ),
                ));
            }
        }

        json_patch::merge(&mut stored.object, object);
        if let Some(owner) = ComponentOwner::from_labels(&labels_of(&stored.object)) {
            stored.owner = Some(owner);
        }
        stored.resource_version = next;
        state.next_version = next;
        state.mutations.push(Mutation {
            kind: MutationKind::Update,
            id: id.clone(),
        });
        Ok(())
    }

    async fn delete(&self, id: &ComponentId) -> Result<()> {
        let mut state = self.lock();
        state.check_available(id)?;
        state.take_conflict(id)?;
        if !state.objects.contains_key(id) {
            return Ok(());
        }

        match state.deletion_delays.remove(id) {
            Some(listings) => {
                if let Some(stored) = state.objects.get_mut(id) {
                    stored.deleting = Some(listings);
                }
            }
            None => {
                state.objects.remove(id);
            }
        }
        state.mutations.push(Mutation {
            kind: MutationKind::Delete,
            id: id.clone(),
        });
        Ok(())
    }

    async fn list_owned(&self, owner: &ComponentOwner) -> Result<Vec<LiveComponent>> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(Error::target(owner.to_string(), "target unavailable"));
        }
        state.tick_deletions();
        Ok(state
            .objects
            .iter()
            .filter(|(_, s)| s.owner.as_ref() == Some(owner))
            .map(|(id, s)| TargetState::live(id, s))
            .collect())
    }

    async fn list_managed(&self, kind: ProviderKind) -> Result<Vec<LiveComponent>> {
        let state = self.lock();
        if state.unavailable {
            return Err(Error::target(kind.to_string(), "target unavailable"));
        }
        Ok(state
            .objects
            .iter()
            .filter(|(_, s)| s.owner.as_ref().is_some_and(|o| o.kind == kind))
            .map(|(id, s)| TargetState::live(id, s))
            .collect())
    }
}
