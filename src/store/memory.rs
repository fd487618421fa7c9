//! In-memory provider store
//!
//! Mirrors the API server semantics the engine relies on: creation sets
//! generation 1, spec updates bump it, status writes never do, and deleting a
//! resource that carries finalizers only stamps a deletion timestamp.
//!
//! Subscribers receive the key of every provider whose spec or deletion state
//! changed, or that disappeared, which is exactly what the watch feed forwards
//! for real clusters.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use tokio::sync::mpsc;

use super::ProviderStore;
use crate::crd::{ProviderSpec, ProviderStatus};
use crate::provider::{ObjectKey, ProviderResource};
use crate::{Error, Result};

struct StoreState<P> {
    providers: BTreeMap<ObjectKey, P>,
    next_uid: u64,
    subscribers: Vec<mpsc::UnboundedSender<ObjectKey>>,
    status_writes: usize,
}

impl<P> Default for StoreState<P> {
    fn default() -> Self {
        Self {
            providers: BTreeMap::new(),
            next_uid: 0,
            subscribers: Vec::new(),
            status_writes: 0,
        }
    }
}

impl<P> StoreState<P> {
    fn notify(&mut self, key: &ObjectKey) {
        self.subscribers.retain(|tx| tx.send(key.clone()).is_ok());
    }
}

/// Provider store held in process
pub struct InMemoryProviderStore<P> {
    state: Mutex<StoreState<P>>,
}

impl<P> Default for InMemoryProviderStore<P> {
    fn default() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
        }
    }
}

impl<P: ProviderResource> InMemoryProviderStore<P> {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState<P>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Receive the key of every provider whose spec or deletion state changes
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ObjectKey> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }

    /// Create a provider with generation 1
    pub fn create(&self, namespace: &str, name: &str, spec: ProviderSpec) -> Result<P> {
        let key = ObjectKey::new(namespace, name);
        let mut state = self.lock();
        if state.providers.contains_key(&key) {
            return Err(Error::validation(format!("{} {} already exists", P::KIND, key)));
        }

        state.next_uid += 1;
        let mut provider: P = crate::provider::new_provider(namespace, name, spec);
        let meta = provider.meta_mut();
        meta.generation = Some(1);
        meta.uid = Some(format!("{}-{}", P::KIND.label_value(), state.next_uid));
        meta.creation_timestamp = Some(Time(Utc::now()));

        state.providers.insert(key.clone(), provider.clone());
        state.notify(&key);
        Ok(provider)
    }

    /// Replace a provider's spec and bump its generation
    pub fn update_spec(&self, key: &ObjectKey, spec: ProviderSpec) -> Result<()> {
        let mut state = self.lock();
        let existing = state
            .providers
            .get(key)
            .ok_or_else(|| Error::validation(format!("{} {} does not exist", P::KIND, key)))?;

        let mut updated = P::from_parts(existing.meta().clone(), spec);
        *updated.provider_status_mut() = existing.provider_status().cloned();
        let generation = updated.generation() + 1;
        updated.meta_mut().generation = Some(generation);

        state.providers.insert(key.clone(), updated);
        state.notify(key);
        Ok(())
    }

    /// Request deletion. With finalizers present only the timestamp is set.
    pub fn delete(&self, key: &ObjectKey) -> Result<()> {
        let mut state = self.lock();
        let Some(provider) = state.providers.get_mut(key) else {
            return Ok(());
        };

        if provider.finalizers().is_empty() {
            state.providers.remove(key);
        } else if provider.meta().deletion_timestamp.is_none() {
            provider.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
        } else {
            return Ok(());
        }
        state.notify(key);
        Ok(())
    }

    /// Current copy of a provider
    pub fn snapshot(&self, key: &ObjectKey) -> Option<P> {
        self.lock().providers.get(key).cloned()
    }

    /// Current copy of every provider, ordered by key
    pub fn snapshot_all(&self) -> Vec<P> {
        self.lock().providers.values().cloned().collect()
    }

    /// Number of status writes served so far
    pub fn status_writes(&self) -> usize {
        self.lock().status_writes
    }
}

#[async_trait]
impl<P: ProviderResource> ProviderStore<P> for InMemoryProviderStore<P> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<P>> {
        Ok(self.snapshot(key))
    }

    async fn list(&self) -> Result<Vec<P>> {
        Ok(self.snapshot_all())
    }

    async fn patch_status(&self, key: &ObjectKey, status: &ProviderStatus) -> Result<()> {
        let mut state = self.lock();
        let provider = state
            .providers
            .get_mut(key)
            .ok_or_else(|| Error::validation(format!("{} {} does not exist", P::KIND, key)))?;
        *provider.provider_status_mut() = Some(status.clone());
        state.status_writes += 1;
        Ok(())
    }

    async fn add_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<()> {
        let mut state = self.lock();
        if let Some(provider) = state.providers.get_mut(key) {
            let finalizers = provider.finalizers_mut();
            if !finalizers.iter().any(|f| f == finalizer) {
                finalizers.push(finalizer.to_string());
            }
        }
        Ok(())
    }

    async fn remove_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<()> {
        let mut state = self.lock();
        let Some(provider) = state.providers.get_mut(key) else {
            return Ok(());
        };
        provider.finalizers_mut().retain(|f| f != finalizer);

        if provider.finalizers().is_empty() && provider.is_deleting() {
            state.providers.remove(key);
            state.notify(key);
        }
        Ok(())
    }
}

/// One in-memory store per provider type, created on first use
#[derive(Default)]
pub struct InMemoryStores {
    stores: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl InMemoryStores {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// The store for providers of type `P`
    pub fn typed<P: ProviderResource>(&self) -> Arc<InMemoryProviderStore<P>> {
        let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(store) = stores
            .get(&TypeId::of::<P>())
            .and_then(|s| s.clone().downcast::<InMemoryProviderStore<P>>().ok())
        {
            return store;
        }

        let store = Arc::new(InMemoryProviderStore::<P>::new());
        stores.insert(
            TypeId::of::<P>(),
            store.clone() as Arc<dyn Any + Send + Sync>,
        );
        store
    }
}
