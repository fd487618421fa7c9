//! In-memory manifest repository
//!
//! Releases are published programmatically. Used for dry runs and to drive
//! the engine in tests without a filesystem. Fetches of a provider can be
//! held open to observe the engine while a reconciliation is in flight.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;

use super::{highest_version, ManifestBundle, ManifestRepository, ManifestRequest};
use crate::provider::ProviderKind;
use crate::{Error, Result};

/// Repository backed by a map of published releases
pub struct InMemoryRepository {
    releases: DashMap<(ProviderKind, String), Vec<Arc<ManifestBundle>>>,
    unavailable: AtomicBool,
    fetches: AtomicUsize,
    held: watch::Sender<HashSet<String>>,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self {
            releases: DashMap::new(),
            unavailable: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
            held: watch::Sender::new(HashSet::new()),
        }
    }
}

impl InMemoryRepository {
    /// Empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a release, replacing any release with the same version
    pub fn publish(&self, bundle: ManifestBundle) {
        let mut releases = self
            .releases
            .entry((bundle.kind, bundle.provider.clone()))
            .or_default();
        releases.retain(|b| b.version != bundle.version);
        releases.push(Arc::new(bundle));
    }

    /// Simulate an outage: every resolve fails transiently while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Block resolves for provider `name` until [`InMemoryRepository::release`]
    pub fn hold(&self, name: &str) {
        self.held.send_modify(|held| {
            held.insert(name.to_string());
        });
    }

    /// Let resolves for provider `name` complete again
    pub fn release(&self, name: &str) {
        self.held.send_modify(|held| {
            held.remove(name);
        });
    }

    /// Number of resolve calls served, including failures
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManifestRepository for InMemoryRepository {
    async fn resolve(&self, request: &ManifestRequest) -> Result<Arc<ManifestBundle>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let mut held = self.held.subscribe();
        let _ = held
            .wait_for(|names| !names.contains(&request.name))
            .await;

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::transient_fetch(
                request.provider_label(),
                "repository unavailable",
            ));
        }

        let releases = self
            .releases
            .get(&(request.kind, request.name.clone()))
            .ok_or_else(|| {
                Error::not_found(request.provider_label(), &request.version, "unknown provider")
            })?;

        let found = if request.is_latest() {
            highest_version(releases.iter().map(|b| b.version.as_str()))
                .and_then(|v| releases.iter().find(|b| b.version == v))
        } else {
            let wanted = request.version.strip_prefix('v').unwrap_or(&request.version);
            releases
                .iter()
                .find(|b| b.version == request.version)
                .or_else(|| {
                    releases
                        .iter()
                        .find(|b| b.version.strip_prefix('v').unwrap_or(&b.version) == wanted)
                })
        };
        found.cloned().ok_or_else(|| {
            Error::not_found(request.provider_label(), &request.version, "unknown version")
        })
    }
}
