//! Provider resource stores
//!
//! The engine reads providers and writes their status through [`ProviderStore`].
//! [`KubeProviderStore`] talks to the API server; [`InMemoryProviderStore`]
//! keeps resources in process and mimics generation and finalizer semantics.

mod kube;
mod memory;

pub use self::kube::KubeProviderStore;
pub use memory::{InMemoryProviderStore, InMemoryStores};

use async_trait::async_trait;

use crate::crd::ProviderStatus;
use crate::provider::{ObjectKey, ProviderResource};
use crate::Result;

/// Read/write access to provider resources of one kind
#[async_trait]
pub trait ProviderStore<P: ProviderResource>: Send + Sync {
    /// Fetch a provider, `None` when it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<P>>;

    /// Every provider of this kind across namespaces
    async fn list(&self) -> Result<Vec<P>>;

    /// Replace the status subresource
    async fn patch_status(&self, key: &ObjectKey, status: &ProviderStatus) -> Result<()>;

    /// Add a finalizer if it is not already present
    async fn add_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<()>;

    /// Remove a finalizer; a deleting provider with no finalizers left is released
    async fn remove_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<()>;
}
