//! Shared fixtures for the engine integration tests

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use capi_operator::applier::InMemoryTarget;
use capi_operator::controller::{
    register_providers, Context, ControllerHandle, ControllerOptions, Manager, Registrations,
};
use capi_operator::crd::{ProviderPhase, ProviderSpec, ProviderStatus, CONDITION_READY};
use capi_operator::manifest::{Component, ComponentId, InMemoryRepository, ManifestBundle};
use capi_operator::provider::{ObjectKey, ProviderKind, ProviderResource};
use capi_operator::store::{InMemoryProviderStore, InMemoryStores};
use capi_operator::OperatorConfig;

/// Namespace every test provider and component lives in
pub const NAMESPACE: &str = "capi-system";

/// Upper bound on any wait in these tests
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Fast backoff, no periodic resync
pub fn test_config() -> OperatorConfig {
    OperatorConfig {
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(80),
        fetch_timeout: Duration::from_secs(2),
        call_timeout: Duration::from_secs(2),
        resync_period: None,
        ..Default::default()
    }
}

/// [`test_config`] with periodic re-verification every `period`
pub fn with_resync(period: Duration) -> OperatorConfig {
    OperatorConfig {
        resync_period: Some(period),
        ..test_config()
    }
}

/// A ConfigMap manifest in the test namespace
pub fn config_map(name: &str, data: Value) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name, "namespace": NAMESPACE},
        "data": data
    })
}

/// The test namespace as a manifest
pub fn namespace() -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {"name": NAMESPACE}
    })
}

/// Identity of a ConfigMap created by [`config_map`]
pub fn config_map_id(name: &str) -> ComponentId {
    ComponentId::new("v1", "ConfigMap", Some(NAMESPACE), name)
}

/// Identity of the namespace created by [`namespace`]
pub fn namespace_id() -> ComponentId {
    ComponentId::new("v1", "Namespace", None, NAMESPACE)
}

/// Build a release from raw manifests
pub fn release(kind: ProviderKind, provider: &str, version: &str, docs: Vec<Value>) -> ManifestBundle {
    let components = docs
        .into_iter()
        .map(|doc| Component::from_value(doc).expect("valid component"))
        .collect();
    ManifestBundle::new(kind, provider, version, components).expect("valid release")
}

/// Phase recorded on a provider, if any
pub fn phase<P: ProviderResource>(provider: &P) -> Option<ProviderPhase> {
    provider.provider_status().map(|s| s.phase)
}

/// Reason on a provider's Ready condition
pub fn ready_reason<P: ProviderResource>(provider: &P) -> Option<String> {
    provider
        .provider_status()
        .and_then(|s| s.get_condition(CONDITION_READY))
        .map(|c| c.reason.clone())
}

/// Status of a provider, failing the test when none was written
pub fn status<P: ProviderResource>(provider: &P) -> &ProviderStatus {
    provider.provider_status().expect("status written")
}

/// Poll `check` until it holds, failing the test after [`WAIT_TIMEOUT`]
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A running engine with in-memory collaborators
pub struct Harness {
    pub repository: Arc<InMemoryRepository>,
    pub target: Arc<InMemoryTarget>,
    pub stores: InMemoryStores,
    pub manager: Manager,
    pub registrations: Registrations,
}

impl Harness {
    /// Register all four kinds; the readiness gates stay closed
    pub fn new(config: OperatorConfig) -> Self {
        let repository = Arc::new(InMemoryRepository::new());
        let target = Arc::new(InMemoryTarget::new());
        let stores = InMemoryStores::new();
        let manager = Manager::new(CancellationToken::new());

        let options = ControllerOptions {
            max_concurrent_reconciles: config.max_concurrent_reconciles,
        };
        let ctx = Arc::new(Context::new(repository.clone(), target.clone(), config));
        let registrations = register_providers(&manager, ctx, &stores, options);

        Self {
            repository,
            target,
            stores,
            manager,
            registrations,
        }
    }

    /// Register all four kinds and open the gates
    pub fn started(config: OperatorConfig) -> Self {
        let harness = Self::new(config);
        harness.open_gates();
        harness
    }

    /// Elect this instance and mark webhooks ready
    pub fn open_gates(&self) {
        self.manager.gates().set_elected();
        self.manager.gates().set_webhooks_ready();
    }

    /// Store for providers of type `P`
    pub fn store<P: ProviderResource>(&self) -> Arc<InMemoryProviderStore<P>> {
        self.stores.typed::<P>()
    }

    /// Controller registered for `kind`
    pub fn controller(&self, kind: ProviderKind) -> &ControllerHandle {
        self.registrations.get(kind).expect("kind registered")
    }

    /// Publish a release to the repository
    pub fn publish(&self, bundle: ManifestBundle) {
        self.repository.publish(bundle);
    }

    /// Create a provider of type `P` in the test namespace
    pub fn create<P: ProviderResource>(&self, name: &str, spec: ProviderSpec) -> ObjectKey {
        self.store::<P>()
            .create(NAMESPACE, name, spec)
            .expect("create provider")
            .key()
    }

    /// Wait until `check` holds for the provider at `key`
    pub async fn wait_for<P: ProviderResource>(
        &self,
        key: &ObjectKey,
        what: &str,
        check: impl Fn(&P) -> bool,
    ) -> P {
        let store = self.store::<P>();
        eventually(what, || store.snapshot(key).is_some_and(|p| check(&p))).await;
        store.snapshot(key).expect("provider present")
    }

    /// Wait until the provider is Ready at `version`
    pub async fn wait_installed<P: ProviderResource>(&self, key: &ObjectKey, version: &str) -> P {
        self.wait_for(key, &format!("{} ready at {}", key, version), |p: &P| {
            phase(p) == Some(ProviderPhase::Ready) && p.installed_version() == Some(version)
        })
        .await
    }

    /// Wait until the provider is gone from its store
    pub async fn wait_gone<P: ProviderResource>(&self, key: &ObjectKey) {
        let store = self.store::<P>();
        eventually(&format!("{} released", key), || store.snapshot(key).is_none()).await;
    }

    /// Stop every controller
    pub async fn shutdown(self) {
        self.manager.shutdown().await;
    }
}
