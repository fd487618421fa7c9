//! capi-operator - lifecycle operator for Cluster API providers

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use capi_operator::applier::KubeTarget;
use capi_operator::controller::{register_providers, Context, KubeSource, Manager};
use capi_operator::crd::{BootstrapProvider, ControlPlaneProvider, CoreProvider, InfrastructureProvider};
use capi_operator::manifest::{CachedRepository, LocalRepository};
use capi_operator::retry::{retry_with_backoff, RetryConfig};
use capi_operator::{OperatorConfig, FIELD_MANAGER};

/// capi-operator - installs, upgrades and removes Cluster API providers
#[derive(Parser, Debug)]
#[command(name = "capi-operator", version, about, long_about = None)]
struct Cli {
    /// Print the provider CRDs as YAML and exit
    #[arg(long)]
    crd: bool,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the provider controllers (default mode)
    Controller(ControllerArgs),
}

/// Engine tunables
#[derive(Args, Debug, Clone)]
struct ControllerArgs {
    /// Root of the local manifest repository
    #[arg(long, env = "PROVIDERS_DIR", default_value = "/providers")]
    providers_dir: PathBuf,

    /// Reconciliations allowed in flight per provider kind
    #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value = "1")]
    max_concurrent_reconciles: usize,

    /// First requeue delay after a retryable failure, in seconds
    #[arg(long, env = "BACKOFF_BASE_SECS", default_value = "1")]
    backoff_base_secs: u64,

    /// Ceiling on any requeue delay, in seconds
    #[arg(long, env = "BACKOFF_MAX_SECS", default_value = "300")]
    backoff_max_secs: u64,

    /// Attempts per component write when it conflicts
    #[arg(long, env = "CONFLICT_ATTEMPTS", default_value = "5")]
    conflict_attempts: u32,

    /// Bound on a manifest fetch, in seconds
    #[arg(long, env = "FETCH_TIMEOUT_SECS", default_value = "30")]
    fetch_timeout_secs: u64,

    /// Bound on a single target call, in seconds
    #[arg(long, env = "CALL_TIMEOUT_SECS", default_value = "30")]
    call_timeout_secs: u64,

    /// Re-verify ready providers this often, in seconds (0 disables)
    #[arg(long, env = "RESYNC_PERIOD_SECS", default_value = "600")]
    resync_period_secs: u64,
}

impl Default for ControllerArgs {
    fn default() -> Self {
        let defaults = OperatorConfig::default();
        Self {
            providers_dir: defaults.providers_dir,
            max_concurrent_reconciles: defaults.max_concurrent_reconciles,
            backoff_base_secs: defaults.backoff_base.as_secs(),
            backoff_max_secs: defaults.backoff_max.as_secs(),
            conflict_attempts: defaults.conflict_attempts,
            fetch_timeout_secs: defaults.fetch_timeout.as_secs(),
            call_timeout_secs: defaults.call_timeout.as_secs(),
            resync_period_secs: defaults.resync_period.map_or(0, |d| d.as_secs()),
        }
    }
}

impl From<ControllerArgs> for OperatorConfig {
    fn from(args: ControllerArgs) -> Self {
        Self {
            providers_dir: args.providers_dir,
            max_concurrent_reconciles: args.max_concurrent_reconciles,
            backoff_base: Duration::from_secs(args.backoff_base_secs),
            backoff_max: Duration::from_secs(args.backoff_max_secs),
            conflict_attempts: args.conflict_attempts,
            fetch_timeout: Duration::from_secs(args.fetch_timeout_secs),
            call_timeout: Duration::from_secs(args.call_timeout_secs),
            resync_period: (args.resync_period_secs > 0)
                .then(|| Duration::from_secs(args.resync_period_secs)),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    if cli.crd {
        for crd in provider_crds() {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args.into()).await,
        None => run_controller(ControllerArgs::default().into()).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,capi_operator=debug,kube=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn provider_crds() -> [CustomResourceDefinition; 4] {
    [
        CoreProvider::crd(),
        InfrastructureProvider::crd(),
        BootstrapProvider::crd(),
        ControlPlaneProvider::crd(),
    ]
}

/// Install the provider CRDs with server-side apply so they always match
/// this operator's version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in provider_crds() {
        let name = crd
            .metadata
            .name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generated CRD has no name"))?;
        tracing::info!(crd = %name, "Installing CRD");
        retry_with_backoff(&RetryConfig::with_max_attempts(10), "install_crd", || async {
            crds.patch(&name, &params, &Patch::Apply(&crd)).await
        })
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;
    }

    tracing::info!("Provider CRDs installed/updated");
    Ok(())
}

/// Run the provider controllers until Ctrl-C
async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    tracing::info!(?config, "Starting capi-operator controller");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    ensure_crds_installed(&client).await?;

    let repository = Arc::new(CachedRepository::new(LocalRepository::new(
        config.providers_dir.clone(),
    )));
    let target = Arc::new(KubeTarget::new(client.clone()));
    let ctx = Arc::new(Context::new(repository, target, config));

    let manager = Manager::new(CancellationToken::new());
    let options = ctx.controller_options();
    let registrations = register_providers(&manager, ctx, &KubeSource::new(client), options);
    tracing::info!(kinds = registrations.len(), "Provider controllers registered");

    // single replica, no admission webhooks of our own
    manager.gates().set_elected();
    manager.gates().set_webhooks_ready();

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to listen for shutdown signal: {}", e))?;
    tracing::info!("Shutdown signal received");
    manager.shutdown().await;
    Ok(())
}
