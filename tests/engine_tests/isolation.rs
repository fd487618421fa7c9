//! Stories about many providers sharing one engine

use std::time::Duration;

use serde_json::json;

use capi_operator::crd::{
    BootstrapProvider, ControlPlaneProvider, CoreProvider, InfrastructureProvider, ProviderPhase,
    ProviderSpec,
};
use capi_operator::provider::{ProviderKind, ProviderResource};
use capi_operator::OperatorConfig;

use super::helpers::*;

fn publish_all(harness: &Harness) {
    harness.publish(release(
        ProviderKind::Core,
        "cluster-api",
        "1.0.0",
        vec![namespace(), config_map("capi-manager-config", json!({}))],
    ));
    harness.publish(release(
        ProviderKind::Infrastructure,
        "docker",
        "1.0.0",
        vec![config_map("capd-manager-config", json!({}))],
    ));
    harness.publish(release(
        ProviderKind::Infrastructure,
        "broken",
        "1.0.0",
        vec![config_map("broken-manager-config", json!({}))],
    ));
    harness.publish(release(
        ProviderKind::Bootstrap,
        "kubeadm",
        "1.0.0",
        vec![config_map("cabpk-manager-config", json!({}))],
    ));
    harness.publish(release(
        ProviderKind::ControlPlane,
        "kubeadm",
        "1.0.0",
        vec![config_map("kcp-manager-config", json!({}))],
    ));
}

/// Story: a full management stack (core, infrastructure, bootstrap and
/// control plane) is installed by the same engine, each kind owning only
/// its own components even where names coincide.
#[tokio::test]
async fn story_all_four_kinds_install_side_by_side() {
    let harness = Harness::started(test_config());
    publish_all(&harness);

    let core = harness.create::<CoreProvider>("cluster-api", ProviderSpec::for_version("1.0.0"));
    let infra = harness.create::<InfrastructureProvider>("docker", ProviderSpec::for_version("1.0.0"));
    let bootstrap = harness.create::<BootstrapProvider>("kubeadm", ProviderSpec::for_version("1.0.0"));
    let control_plane =
        harness.create::<ControlPlaneProvider>("kubeadm", ProviderSpec::for_version("1.0.0"));

    let core = harness.wait_installed::<CoreProvider>(&core, "1.0.0").await;
    let infra = harness.wait_installed::<InfrastructureProvider>(&infra, "1.0.0").await;
    let bootstrap = harness.wait_installed::<BootstrapProvider>(&bootstrap, "1.0.0").await;
    let control_plane = harness
        .wait_installed::<ControlPlaneProvider>(&control_plane, "1.0.0")
        .await;

    assert_eq!(harness.target.owned_by(&core.owner()).len(), 2);
    assert_eq!(
        harness.target.owned_by(&infra.owner()),
        vec![config_map_id("capd-manager-config")]
    );
    assert_eq!(
        harness.target.owned_by(&bootstrap.owner()),
        vec![config_map_id("cabpk-manager-config")]
    );
    assert_eq!(
        harness.target.owned_by(&control_plane.owner()),
        vec![config_map_id("kcp-manager-config")]
    );
    assert_ne!(bootstrap.owner(), control_plane.owner());

    harness.shutdown().await;
}

/// Story: one infrastructure provider keeps failing with a retryable error.
/// Providers of other kinds, and other providers of the same kind, still
/// converge.
#[tokio::test]
async fn story_failing_provider_does_not_block_others() {
    let harness = Harness::started(test_config());
    publish_all(&harness);
    harness
        .target
        .inject_conflicts(&config_map_id("broken-manager-config"), u32::MAX);

    let broken = harness.create::<InfrastructureProvider>("broken", ProviderSpec::for_version("1.0.0"));
    let broken_state = harness
        .wait_for::<InfrastructureProvider>(&broken, "broken provider failed", |p| {
            phase(p) == Some(ProviderPhase::Failed)
        })
        .await;
    assert_eq!(ready_reason(&broken_state).as_deref(), Some("ApplyConflict"));

    let docker = harness.create::<InfrastructureProvider>("docker", ProviderSpec::for_version("1.0.0"));
    let core = harness.create::<CoreProvider>("cluster-api", ProviderSpec::for_version("1.0.0"));
    let bootstrap = harness.create::<BootstrapProvider>("kubeadm", ProviderSpec::for_version("1.0.0"));

    harness.wait_installed::<InfrastructureProvider>(&docker, "1.0.0").await;
    harness.wait_installed::<CoreProvider>(&core, "1.0.0").await;
    harness.wait_installed::<BootstrapProvider>(&bootstrap, "1.0.0").await;

    let broken_state = harness
        .store::<InfrastructureProvider>()
        .snapshot(&broken)
        .expect("broken provider");
    assert!(broken_state.installed_version().is_none());

    harness.shutdown().await;
}

/// Story: with several workers per kind, a burst of providers of one kind is
/// reconciled concurrently and every one of them converges.
#[tokio::test]
async fn story_burst_of_providers_converges_with_parallel_workers() {
    let harness = Harness::started(OperatorConfig {
        max_concurrent_reconciles: 4,
        ..test_config()
    });

    let names: Vec<String> = (0..8).map(|i| format!("infra-{}", i)).collect();
    for name in &names {
        harness.publish(release(
            ProviderKind::Infrastructure,
            name,
            "1.0.0",
            vec![config_map(&format!("{}-config", name), json!({}))],
        ));
    }
    let keys: Vec<_> = names
        .iter()
        .map(|name| harness.create::<InfrastructureProvider>(name, ProviderSpec::for_version("1.0.0")))
        .collect();

    for key in &keys {
        harness.wait_installed::<InfrastructureProvider>(key, "1.0.0").await;
    }
    assert_eq!(harness.target.len(), names.len());

    harness.shutdown().await;
}

/// Story: repeated spec updates while a provider is being reconciled collapse
/// into a final state that matches the last update.
#[tokio::test]
async fn story_rapid_updates_converge_on_the_last_one() {
    let harness = Harness::started(test_config());
    for version in ["1.0.0", "1.1.0", "1.2.0", "1.3.0"] {
        harness.publish(release(
            ProviderKind::Core,
            "cluster-api",
            version,
            vec![config_map("capi-manager-config", json!({"version": version}))],
        ));
    }

    let key = harness.create::<CoreProvider>("cluster-api", ProviderSpec::for_version("1.0.0"));
    let store = harness.store::<CoreProvider>();
    for version in ["1.1.0", "1.2.0", "1.3.0"] {
        store
            .update_spec(&key, ProviderSpec::for_version(version))
            .expect("update");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let provider = harness.wait_installed::<CoreProvider>(&key, "1.3.0").await;
    assert_eq!(provider.observed_generation(), Some(4));
    assert_eq!(
        harness
            .target
            .object(&config_map_id("capi-manager-config"))
            .expect("installed")["data"]["version"],
        "1.3.0"
    );

    harness.shutdown().await;
}

/// Story: with one reconciliation per kind, a slow infrastructure provider
/// holds up the next infrastructure provider but not the core provider.
#[tokio::test]
async fn story_kinds_reconcile_one_at_a_time_but_independently() {
    let harness = Harness::started(test_config());
    publish_all(&harness);
    harness.publish(release(
        ProviderKind::Infrastructure,
        "aws",
        "1.0.0",
        vec![config_map("capa-manager-config", json!({}))],
    ));

    harness.repository.hold("docker");
    let docker = harness.create::<InfrastructureProvider>("docker", ProviderSpec::for_version("1.0.0"));
    harness
        .wait_for::<InfrastructureProvider>(&docker, "docker fetching", |p| {
            phase(p) == Some(ProviderPhase::Fetching)
        })
        .await;

    let aws = harness.create::<InfrastructureProvider>("aws", ProviderSpec::for_version("1.0.0"));
    let core = harness.create::<CoreProvider>("cluster-api", ProviderSpec::for_version("1.0.0"));
    harness.wait_installed::<CoreProvider>(&core, "1.0.0").await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let waiting = harness
        .store::<InfrastructureProvider>()
        .snapshot(&aws)
        .expect("aws provider");
    assert_eq!(phase(&waiting), None, "aws must wait for docker");
    let infra = harness.controller(ProviderKind::Infrastructure);
    assert_eq!(infra.in_flight(), 1);
    assert_eq!(infra.max_in_flight(), 1);

    harness.repository.release("docker");
    harness.wait_installed::<InfrastructureProvider>(&docker, "1.0.0").await;
    harness.wait_installed::<InfrastructureProvider>(&aws, "1.0.0").await;
    assert_eq!(infra.max_in_flight(), 1);

    harness.shutdown().await;
}

/// Story: outside notifications arriving while a provider waits for its next
/// periodic verification replace the pending run instead of adding to it.
#[tokio::test]
async fn story_repeated_notifications_do_not_multiply_resyncs() {
    let period = Duration::from_millis(200);
    let harness = Harness::started(with_resync(period));
    publish_all(&harness);

    let key = harness.create::<CoreProvider>("cluster-api", ProviderSpec::for_version("1.0.0"));
    harness.wait_installed::<CoreProvider>(&key, "1.0.0").await;

    let core = harness.controller(ProviderKind::Core);
    for _ in 0..8 {
        core.notify(key.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let baseline = harness.repository.fetch_count();
    tokio::time::sleep(period * 5).await;
    let verifications = harness.repository.fetch_count() - baseline;
    assert!(
        (1..=8).contains(&verifications),
        "{} verifications in five periods",
        verifications
    );

    harness.shutdown().await;
}
