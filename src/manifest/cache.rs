//! Version-keyed cache in front of a manifest repository

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{ManifestBundle, ManifestRepository, ManifestRequest};
use crate::provider::ProviderKind;
use crate::Result;

type CacheKey = (ProviderKind, String, String, Option<String>);

/// Caches resolved releases by (kind, name, version, location).
///
/// Released versions are immutable, so a hit never goes stale. Requests for
/// `latest` always reach the inner repository, and failures are never cached.
pub struct CachedRepository<R> {
    inner: R,
    bundles: DashMap<CacheKey, Arc<ManifestBundle>>,
}

impl<R: ManifestRepository> CachedRepository<R> {
    /// Wrap a repository
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            bundles: DashMap::new(),
        }
    }

    /// Number of cached releases
    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    /// Whether nothing has been cached yet
    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    fn key(request: &ManifestRequest) -> CacheKey {
        (
            request.kind,
            request.name.clone(),
            request.version.clone(),
            request.fetch_config.as_ref().and_then(|f| f.url.clone()),
        )
    }
}

#[async_trait]
impl<R: ManifestRepository> ManifestRepository for CachedRepository<R> {
    async fn resolve(&self, request: &ManifestRequest) -> Result<Arc<ManifestBundle>> {
        if request.is_latest() {
            return self.inner.resolve(request).await;
        }

        let key = Self::key(request);
        if let Some(bundle) = self.bundles.get(&key) {
            debug!(provider = %request.provider_label(), version = %request.version, "Release cache hit");
            return Ok(bundle.clone());
        }

        let bundle = self.inner.resolve(request).await?;
        self.bundles.insert(key, bundle.clone());
        Ok(bundle)
    }
}
