//! Kind registration
//!
//! Registers the generic reconciler once per provider kind. A
//! [`ProviderSource`] supplies the store each kind reads from and the feed
//! of changes that drives its controller.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::Client;
use tracing::info;

use super::manager::Manager;
use super::reconciler::{ControllerHandle, GenericProviderReconciler};
use super::watch::{kube_feed, memory_feed, ProviderFeed};
use super::{Context, ControllerOptions};
use crate::crd::{BootstrapProvider, ControlPlaneProvider, CoreProvider, InfrastructureProvider};
use crate::provider::{ProviderKind, ProviderResource};
use crate::store::{InMemoryStores, KubeProviderStore, ProviderStore};

/// Where providers of each kind live and how changes to them are observed
pub trait ProviderSource {
    /// Store for providers of type `P`
    fn store<P: ProviderResource>(&self) -> Arc<dyn ProviderStore<P>>;

    /// Observed providers of type `P` and the changes to them
    fn feed<P: ProviderResource>(&self) -> ProviderFeed<P>;
}

/// Providers stored as custom resources in a Kubernetes cluster
#[derive(Clone)]
pub struct KubeSource {
    client: Client,
}

impl KubeSource {
    /// Read providers through `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl ProviderSource for KubeSource {
    fn store<P: ProviderResource>(&self) -> Arc<dyn ProviderStore<P>> {
        Arc::new(KubeProviderStore::<P>::new(self.client.clone()))
    }

    fn feed<P: ProviderResource>(&self) -> ProviderFeed<P> {
        kube_feed(self.client.clone())
    }
}

impl ProviderSource for InMemoryStores {
    fn store<P: ProviderResource>(&self) -> Arc<dyn ProviderStore<P>> {
        self.typed::<P>()
    }

    fn feed<P: ProviderResource>(&self) -> ProviderFeed<P> {
        memory_feed(self.typed::<P>())
    }
}

/// Handles of the registered controllers, one per kind
#[derive(Clone, Default)]
pub struct Registrations {
    handles: BTreeMap<ProviderKind, ControllerHandle>,
}

impl Registrations {
    /// Handle for `kind`, if it was registered
    pub fn get(&self, kind: ProviderKind) -> Option<&ControllerHandle> {
        self.handles.get(&kind)
    }

    /// Registered kinds
    pub fn kinds(&self) -> impl Iterator<Item = ProviderKind> + '_ {
        self.handles.keys().copied()
    }

    /// Number of registered kinds
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether nothing was registered
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

fn register<P: ProviderResource, S: ProviderSource>(
    registrations: &mut Registrations,
    manager: &Manager,
    ctx: &Arc<Context>,
    source: &S,
    options: ControllerOptions,
) {
    let reconciler = GenericProviderReconciler::<P>::new(ctx.clone(), source.store::<P>());
    let handle = reconciler.setup_with_manager(manager, options, source.feed::<P>());
    info!(kind = %P::KIND, "Registered provider controller");
    registrations.handles.insert(P::KIND, handle);
}

/// Register a controller for each of the four provider kinds.
///
/// Controllers start reconciling once the manager's readiness gates open.
/// Kinds share nothing but the context: each has its own controller and
/// concurrency limit.
pub fn register_providers<S: ProviderSource>(
    manager: &Manager,
    ctx: Arc<Context>,
    source: &S,
    options: ControllerOptions,
) -> Registrations {
    let mut registrations = Registrations::default();
    register::<CoreProvider, _>(&mut registrations, manager, &ctx, source, options);
    register::<InfrastructureProvider, _>(&mut registrations, manager, &ctx, source, options);
    register::<BootstrapProvider, _>(&mut registrations, manager, &ctx, source, options);
    register::<ControlPlaneProvider, _>(&mut registrations, manager, &ctx, source, options);
    registrations
}
