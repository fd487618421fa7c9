//! Stories about a single provider from creation to deletion

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use capi_operator::applier::InMemoryTarget;
use capi_operator::controller::{Context, GenericProviderReconciler};
use capi_operator::crd::{CoreProvider, InfrastructureProvider, ProviderPhase, ProviderSpec};
use capi_operator::manifest::InMemoryRepository;
use capi_operator::provider::{ProviderKind, ProviderResource, OWNER_KIND_LABEL, OWNER_NAME_LABEL};
use capi_operator::store::InMemoryProviderStore;
use capi_operator::{Error, FINALIZER};

use super::helpers::*;

fn core_release(version: &str) -> capi_operator::manifest::ManifestBundle {
    release(
        ProviderKind::Core,
        "cluster-api",
        version,
        vec![
            config_map("capi-manager-config", json!({"version": version})),
            namespace(),
            config_map("capi-feature-gates", json!({"MachinePool": "false"})),
        ],
    )
}

// =============================================================================
// Install and steady state
// =============================================================================

/// Story: an operator declares the core provider at 1.0.0 and the engine
/// installs the release, stamps ownership and reports Ready.
#[tokio::test]
async fn story_new_provider_is_installed_and_ready() {
    let harness = Harness::started(test_config());
    harness.publish(core_release("1.0.0"));

    let key = harness.create::<CoreProvider>("cluster-api", ProviderSpec::for_version("1.0.0"));
    let provider = harness.wait_installed::<CoreProvider>(&key, "1.0.0").await;

    let status = status(&provider);
    assert_eq!(status.observed_generation, Some(1));
    assert!(status.is_ready());
    assert!(provider.finalizers().iter().any(|f| f == FINALIZER));

    for id in [
        namespace_id(),
        config_map_id("capi-manager-config"),
        config_map_id("capi-feature-gates"),
    ] {
        let object = harness.target.object(&id).expect("component installed");
        assert_eq!(object["metadata"]["labels"][OWNER_KIND_LABEL], "core");
        assert_eq!(object["metadata"]["labels"][OWNER_NAME_LABEL], "cluster-api");
    }
    assert_eq!(
        harness.target.owned_by(&provider.owner()).len(),
        3,
        "exactly the release's components are owned"
    );

    harness.shutdown().await;
}

/// Story: once converged, periodic re-verification changes nothing.
#[tokio::test]
async fn story_converged_provider_causes_no_mutations() {
    let harness = Harness::started(with_resync(Duration::from_millis(20)));
    harness.publish(core_release("1.0.0"));

    let key = harness.create::<CoreProvider>("cluster-api", ProviderSpec::for_version("1.0.0"));
    harness.wait_installed::<CoreProvider>(&key, "1.0.0").await;

    let mutations = harness.target.mutation_count();
    let status_writes = harness.store::<CoreProvider>().status_writes();
    let fetches = harness.repository.fetch_count();

    // several resync periods
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(
        harness.repository.fetch_count() > fetches,
        "the provider was re-verified"
    );
    assert_eq!(harness.target.mutation_count(), mutations);
    assert_eq!(harness.store::<CoreProvider>().status_writes(), status_writes);

    harness.shutdown().await;
}

/// Story: someone deletes an installed component by hand; the next
/// verification pass puts it back.
#[tokio::test]
async fn story_drifted_component_is_restored() {
    let harness = Harness::started(with_resync(Duration::from_millis(20)));
    harness.publish(core_release("1.0.0"));

    let key = harness.create::<CoreProvider>("cluster-api", ProviderSpec::for_version("1.0.0"));
    harness.wait_installed::<CoreProvider>(&key, "1.0.0").await;

    let id = config_map_id("capi-feature-gates");
    assert!(harness.target.remove_externally(&id));
    eventually("component restored", || harness.target.contains(&id)).await;

    let object = harness.target.object(&id).expect("restored");
    assert_eq!(object["data"]["MachinePool"], "false");

    harness.shutdown().await;
}

/// Story: the operator changes a variable without changing the version; the
/// release is re-rendered and re-applied in place.
#[tokio::test]
async fn story_variable_change_reconfigures_same_version() {
    let harness = Harness::started(test_config());
    harness.publish(release(
        ProviderKind::Infrastructure,
        "docker",
        "1.0.0",
        vec![config_map(
            "capd-settings",
            json!({"logLevel": "${LOG_LEVEL:=info}"}),
        )],
    ));

    let key = harness.create::<InfrastructureProvider>("docker", ProviderSpec::for_version("1.0.0"));
    harness.wait_installed::<InfrastructureProvider>(&key, "1.0.0").await;
    let id = config_map_id("capd-settings");
    assert_eq!(harness.target.object(&id).expect("installed")["data"]["logLevel"], "info");

    let spec = ProviderSpec {
        variables: BTreeMap::from([("LOG_LEVEL".to_string(), "debug".to_string())]),
        ..ProviderSpec::for_version("1.0.0")
    };
    harness
        .store::<InfrastructureProvider>()
        .update_spec(&key, spec)
        .expect("update");

    let provider = harness
        .wait_for::<InfrastructureProvider>(&key, "generation 2 observed", |p| {
            p.observed_generation() == Some(2)
        })
        .await;
    assert_eq!(provider.installed_version(), Some("1.0.0"));
    assert_eq!(harness.target.object(&id).expect("installed")["data"]["logLevel"], "debug");

    harness.shutdown().await;
}

// =============================================================================
// Readiness gates
// =============================================================================

/// Story: the operator is not yet leader; nothing is touched until both the
/// election and webhook gates open, then pending work proceeds.
#[tokio::test]
async fn story_nothing_happens_before_gates_open() {
    let harness = Harness::new(test_config());
    harness.publish(core_release("1.0.0"));
    let key = harness.create::<CoreProvider>("cluster-api", ProviderSpec::for_version("1.0.0"));

    harness.manager.gates().set_elected();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(harness.target.is_empty());
    assert_eq!(harness.repository.fetch_count(), 0);
    let provider = harness.store::<CoreProvider>().snapshot(&key).expect("provider");
    assert!(provider.provider_status().is_none());

    harness.manager.gates().set_webhooks_ready();
    harness.wait_installed::<CoreProvider>(&key, "1.0.0").await;

    harness.shutdown().await;
}

// =============================================================================
// Deletion
// =============================================================================

/// Story: a provider is deleted and the engine removes everything it owns
/// before releasing the resource.
#[tokio::test]
async fn story_deleted_provider_is_released_after_its_components() {
    let harness = Harness::started(test_config());
    harness.publish(core_release("1.0.0"));

    let key = harness.create::<CoreProvider>("cluster-api", ProviderSpec::for_version("1.0.0"));
    let provider = harness.wait_installed::<CoreProvider>(&key, "1.0.0").await;
    let owner = provider.owner();

    // slow to terminate
    harness
        .target
        .delay_deletion(&config_map_id("capi-manager-config"), 3);

    harness.store::<CoreProvider>().delete(&key).expect("delete");
    harness.wait_gone::<CoreProvider>(&key).await;

    assert!(harness.target.owned_by(&owner).is_empty());
    assert!(harness.target.is_empty());

    harness.shutdown().await;
}

/// Story: step by step, the finalizer is held while owned components remain
/// and released only once none are left.
#[tokio::test]
async fn story_deletion_is_blocked_while_components_remain() {
    let repository = Arc::new(InMemoryRepository::new());
    repository.publish(core_release("1.0.0"));
    let target = Arc::new(InMemoryTarget::new());
    let store = Arc::new(InMemoryProviderStore::<CoreProvider>::new());
    let ctx = Arc::new(Context::new(repository, target.clone(), test_config()));
    let reconciler = GenericProviderReconciler::new(ctx, store.clone());
    let cancel = CancellationToken::new();

    let key = store
        .create(NAMESPACE, "cluster-api", ProviderSpec::for_version("1.0.0"))
        .expect("create")
        .key();
    reconciler.reconcile(&key, &cancel).await.expect("install");
    let owner = store.snapshot(&key).expect("provider").owner();

    let slow = config_map_id("capi-manager-config");
    target.delay_deletion(&slow, 2);
    store.delete(&key).expect("delete");

    let err = reconciler
        .reconcile(&key, &cancel)
        .await
        .expect_err("component still terminating");
    assert!(matches!(err, Error::DeletionBlocked { remaining: 1, .. }));
    assert!(!err.is_terminal());

    let provider = store.snapshot(&key).expect("provider held by finalizer");
    assert_eq!(phase(&provider), Some(ProviderPhase::Deleting));
    assert_eq!(ready_reason(&provider).as_deref(), Some("DeletionBlocked"));
    assert!(target.contains(&slow));

    let mut attempts = 0;
    while store.snapshot(&key).is_some() {
        attempts += 1;
        assert!(attempts <= 5, "deletion never completed");
        let _ = reconciler.reconcile(&key, &cancel).await;
    }
    assert!(target.owned_by(&owner).is_empty());
}
