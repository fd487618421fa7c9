//! Stories about version transitions

use serde_json::json;

use capi_operator::applier::MutationKind;
use capi_operator::crd::{CoreProvider, InfrastructureProvider, ProviderPhase, ProviderSpec, CONDITION_READY};
use capi_operator::manifest::ManifestBundle;
use capi_operator::provider::{ProviderKind, ProviderResource};

use super::helpers::*;

fn core_release(version: &str, only: &str) -> ManifestBundle {
    release(
        ProviderKind::Core,
        "cluster-api",
        version,
        vec![
            namespace(),
            config_map("capi-manager-config", json!({"version": version})),
            config_map(only, json!({})),
        ],
    )
}

/// Story: the core provider moves from 1.0.0 to 2.0.0. The new release is
/// fully applied before anything obsolete is removed, so shared components
/// never disappear.
#[tokio::test]
async fn story_upgrade_applies_new_release_before_pruning() {
    let harness = Harness::started(test_config());
    harness.publish(core_release("1.0.0", "legacy-webhook-config"));
    harness.publish(core_release("2.0.0", "clusterclass-config"));

    let key = harness.create::<CoreProvider>("cluster-api", ProviderSpec::for_version("1.0.0"));
    harness.wait_installed::<CoreProvider>(&key, "1.0.0").await;
    let baseline = harness.target.mutation_count();

    harness
        .store::<CoreProvider>()
        .update_spec(&key, ProviderSpec::for_version("2.0.0"))
        .expect("update");
    let provider = harness.wait_installed::<CoreProvider>(&key, "2.0.0").await;
    assert_eq!(provider.observed_generation(), Some(2));

    let shared = config_map_id("capi-manager-config");
    assert_eq!(
        harness.target.object(&shared).expect("shared component")["data"]["version"],
        "2.0.0"
    );
    assert!(harness.target.contains(&config_map_id("clusterclass-config")));
    assert!(!harness.target.contains(&config_map_id("legacy-webhook-config")));
    assert!(harness.target.contains(&namespace_id()));

    let upgrade = &harness.target.mutations()[baseline..];
    let first_delete = upgrade
        .iter()
        .position(|m| m.kind == MutationKind::Delete)
        .expect("obsolete component pruned");
    assert!(
        upgrade[first_delete..]
            .iter()
            .all(|m| m.kind == MutationKind::Delete),
        "no write after the first deletion: {:?}",
        upgrade
    );
    let deleted: Vec<_> = upgrade[first_delete..].iter().map(|m| &m.id).collect();
    assert_eq!(deleted, vec![&config_map_id("legacy-webhook-config")]);

    harness.shutdown().await;
}

/// Story: an upgrade fails halfway because one new component cannot be
/// written. The provider keeps reporting the old version, names the failing
/// component, and nothing the old release installed is pruned.
#[tokio::test]
async fn story_failed_upgrade_keeps_the_installed_release() {
    let harness = Harness::started(test_config());
    harness.publish(core_release("1.0.0", "legacy-webhook-config"));
    harness.publish(core_release("2.0.0", "clusterclass-config"));

    let key = harness.create::<CoreProvider>("cluster-api", ProviderSpec::for_version("1.0.0"));
    harness.wait_installed::<CoreProvider>(&key, "1.0.0").await;
    harness
        .target
        .inject_conflicts(&config_map_id("clusterclass-config"), u32::MAX);

    harness
        .store::<CoreProvider>()
        .update_spec(&key, ProviderSpec::for_version("2.0.0"))
        .expect("update");
    let provider = harness
        .wait_for::<CoreProvider>(&key, "upgrade failed", |p| {
            phase(p) == Some(ProviderPhase::Failed)
        })
        .await;

    assert_eq!(provider.installed_version(), Some("1.0.0"));
    assert_eq!(ready_reason(&provider).as_deref(), Some("ApplyConflict"));
    let ready = status(&provider)
        .get_condition(CONDITION_READY)
        .expect("ready condition");
    assert!(ready.message.contains("clusterclass-config"), "{}", ready.message);

    assert!(harness.target.contains(&config_map_id("legacy-webhook-config")));
    assert!(!harness.target.contains(&config_map_id("clusterclass-config")));
    assert!(!harness
        .target
        .mutations()
        .iter()
        .any(|m| m.kind == MutationKind::Delete));

    harness.shutdown().await;
}

/// Story: a provider asks for `latest`; the highest published release is
/// installed and recorded as the concrete version.
#[tokio::test]
async fn story_latest_installs_highest_release() {
    let harness = Harness::started(test_config());
    for version in ["v0.9.0", "v1.10.0", "v1.2.0"] {
        harness.publish(release(
            ProviderKind::Infrastructure,
            "docker",
            version,
            vec![config_map("capd-release", json!({"version": version}))],
        ));
    }

    let key = harness.create::<InfrastructureProvider>("docker", ProviderSpec::for_version("latest"));
    let provider = harness
        .wait_installed::<InfrastructureProvider>(&key, "v1.10.0")
        .await;
    assert_eq!(provider.provider_spec().version, "latest");
    assert_eq!(
        harness
            .target
            .object(&config_map_id("capd-release"))
            .expect("installed")["data"]["version"],
        "v1.10.0"
    );

    harness.shutdown().await;
}

/// Story: a version given with a `v` prefix matches the release published
/// without one, and no upgrade is attempted afterwards.
#[tokio::test]
async fn story_version_prefix_does_not_trigger_upgrade() {
    let harness = Harness::started(with_resync(std::time::Duration::from_millis(20)));
    harness.publish(core_release("1.0.0", "extra"));

    let key = harness.create::<CoreProvider>("cluster-api", ProviderSpec::for_version("1.0.0"));
    harness.wait_installed::<CoreProvider>(&key, "1.0.0").await;
    let writes = harness.store::<CoreProvider>().status_writes();

    harness
        .store::<CoreProvider>()
        .update_spec(&key, ProviderSpec::for_version("v1.0.0"))
        .expect("update");
    let provider = harness
        .wait_for::<CoreProvider>(&key, "generation 2 observed", |p| {
            p.observed_generation() == Some(2)
        })
        .await;

    assert_eq!(provider.installed_version(), Some("v1.0.0"));
    assert!(harness.store::<CoreProvider>().status_writes() > writes);
    assert!(harness.target.contains(&config_map_id("extra")));

    harness.shutdown().await;
}
