//! Stories about how failures surface on a provider

use std::time::Duration;

use serde_json::json;

use capi_operator::crd::{CoreProvider, InfrastructureProvider, ProviderPhase, ProviderSpec};
use capi_operator::provider::{ProviderKind, ProviderResource};

use super::helpers::*;

fn docker_release(version: &str) -> capi_operator::manifest::ManifestBundle {
    release(
        ProviderKind::Infrastructure,
        "docker",
        version,
        vec![config_map("capd-manager-config", json!({"version": version}))],
    )
}

/// Story: an operator asks for a release that does not exist. The provider
/// reports VersionNotFound, keeps its installed version, and the engine waits
/// for a spec change instead of hammering the repository.
#[tokio::test]
async fn story_unknown_version_fails_without_retry_storm() {
    let harness = Harness::started(test_config());
    harness.publish(docker_release("1.0.0"));

    let key = harness.create::<InfrastructureProvider>("docker", ProviderSpec::for_version("1.0.0"));
    harness.wait_installed::<InfrastructureProvider>(&key, "1.0.0").await;

    harness
        .store::<InfrastructureProvider>()
        .update_spec(&key, ProviderSpec::for_version("9.9.9"))
        .expect("update");
    let provider = harness
        .wait_for::<InfrastructureProvider>(&key, "failed", |p| {
            phase(p) == Some(ProviderPhase::Failed)
        })
        .await;

    assert_eq!(ready_reason(&provider).as_deref(), Some("VersionNotFound"));
    assert_eq!(provider.installed_version(), Some("1.0.0"));
    assert_eq!(provider.observed_generation(), Some(1));
    assert!(harness.target.contains(&config_map_id("capd-manager-config")));

    let fetches = harness.repository.fetch_count();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(harness.repository.fetch_count(), fetches, "no retries");

    // correcting the spec clears the failure
    harness
        .store::<InfrastructureProvider>()
        .update_spec(&key, ProviderSpec::for_version("1.0.0"))
        .expect("update");
    let provider = harness
        .wait_for::<InfrastructureProvider>(&key, "recovered", |p| {
            phase(p) == Some(ProviderPhase::Ready) && p.observed_generation() == Some(3)
        })
        .await;
    assert_eq!(ready_reason(&provider).as_deref(), Some("Ready"));

    harness.shutdown().await;
}

/// Story: the repository is down. Fetches are retried with backoff capped at
/// the configured ceiling, and the provider installs once it comes back.
#[tokio::test]
async fn story_repository_outage_is_retried_with_capped_backoff() {
    let harness = Harness::started(test_config());
    harness.publish(docker_release("1.0.0"));
    harness.repository.set_unavailable(true);

    let key = harness.create::<InfrastructureProvider>("docker", ProviderSpec::for_version("1.0.0"));
    let provider = harness
        .wait_for::<InfrastructureProvider>(&key, "fetch failure", |p| {
            phase(p) == Some(ProviderPhase::Failed)
        })
        .await;
    assert_eq!(ready_reason(&provider).as_deref(), Some("FetchFailed"));
    assert!(provider.installed_version().is_none());

    let before = harness.repository.fetch_count();
    tokio::time::sleep(Duration::from_millis(400)).await;
    let retries = harness.repository.fetch_count() - before;
    // ceiling is 80ms, so at least a handful but nowhere near a tight loop
    assert!(retries >= 2, "still retrying, got {}", retries);
    assert!(retries <= 50, "backoff is capped, got {}", retries);

    harness.repository.set_unavailable(false);
    harness.wait_installed::<InfrastructureProvider>(&key, "1.0.0").await;

    harness.shutdown().await;
}

/// Story: a manifest patch without a target is rejected as invalid and is not
/// retried until the spec changes.
#[tokio::test]
async fn story_invalid_manifest_patch_is_terminal() {
    let harness = Harness::started(test_config());
    harness.publish(docker_release("1.0.0"));

    let spec = ProviderSpec {
        manifest_patches: vec![json!({"data": {"extra": "value"}})],
        ..ProviderSpec::for_version("1.0.0")
    };
    let key = harness.create::<InfrastructureProvider>("docker", spec);
    let provider = harness
        .wait_for::<InfrastructureProvider>(&key, "invalid", |p| {
            phase(p) == Some(ProviderPhase::Failed)
        })
        .await;
    assert_eq!(ready_reason(&provider).as_deref(), Some("InvalidComponent"));
    assert!(harness.target.is_empty());

    let fetches = harness.repository.fetch_count();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.repository.fetch_count(), fetches);

    harness.shutdown().await;
}

/// Story: another writer keeps touching a component while it is applied;
/// bounded conflict retries absorb it.
#[tokio::test]
async fn story_write_conflicts_are_retried() {
    let harness = Harness::started(test_config());
    harness.publish(release(
        ProviderKind::Core,
        "cluster-api",
        "1.0.0",
        vec![config_map("capi-manager-config", json!({}))],
    ));
    harness
        .target
        .inject_conflicts(&config_map_id("capi-manager-config"), 3);

    let key = harness.create::<CoreProvider>("cluster-api", ProviderSpec::for_version("1.0.0"));
    harness.wait_installed::<CoreProvider>(&key, "1.0.0").await;
    assert!(harness.target.contains(&config_map_id("capi-manager-config")));

    harness.shutdown().await;
}
