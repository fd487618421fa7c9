//! Kubernetes-backed provider store

use std::marker::PhantomData;

use async_trait::async_trait;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;

use super::ProviderStore;
use crate::crd::ProviderStatus;
use crate::provider::{ObjectKey, ProviderResource};
use crate::{Result, FIELD_MANAGER};

/// Provider store backed by the API server
pub struct KubeProviderStore<P> {
    client: Client,
    _kind: PhantomData<fn() -> P>,
}

impl<P: ProviderResource> KubeProviderStore<P> {
    /// Create a store for providers of type `P`
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }

    fn api(&self, namespace: &str) -> Api<P> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Write the full finalizer list, guarded by resourceVersion
    async fn set_finalizers(&self, key: &ObjectKey, provider: &P, finalizers: Vec<String>) -> Result<()> {
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": provider.resource_version(),
            }
        });
        self.api(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<P: ProviderResource> ProviderStore<P> for KubeProviderStore<P> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<P>> {
        Ok(self.api(&key.namespace).get_opt(&key.name).await?)
    }

    async fn list(&self) -> Result<Vec<P>> {
        let api: Api<P> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn patch_status(&self, key: &ObjectKey, status: &ProviderStatus) -> Result<()> {
        let patch = json!({ "status": status });
        self.api(&key.namespace)
            .patch_status(
                &key.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<()> {
        let Some(provider) = self.get(key).await? else {
            return Ok(());
        };
        if provider.finalizers().iter().any(|f| f == finalizer) {
            return Ok(());
        }
        let mut finalizers = provider.finalizers().to_vec();
        finalizers.push(finalizer.to_string());
        self.set_finalizers(key, &provider, finalizers).await
    }

    async fn remove_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<()> {
        let Some(provider) = self.get(key).await? else {
            return Ok(());
        };
        if !provider.finalizers().iter().any(|f| f == finalizer) {
            return Ok(());
        }
        let finalizers = provider
            .finalizers()
            .iter()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect();
        match self.set_finalizers(key, &provider, finalizers).await {
            // released between the read and the write
            Err(crate::Error::Kube(kube::Error::Api(ae))) if ae.code == 404 => Ok(()),
            other => other,
        }
    }
}
