//! Generic provider reconciler
//!
//! One implementation for all four provider kinds. Each reconciliation reads
//! the provider fresh from the store, derives a [`Plan`] and carries it out:
//! fetch and render the release, apply it, prune what the release no longer
//! contains, and record the outcome. Failures are recorded on the provider
//! and turned into a requeue decision by [`GenericProviderReconciler::error_policy`].
//!
//! Scheduling is kube-runtime's [`Controller`]: one pending run per provider,
//! the earliest requested time wins, and the same provider is never
//! reconciled twice at once.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::{future, stream, StreamExt};
use kube::runtime::controller::Config;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, Controller};
use kube::ResourceExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::manager::Manager;
use super::state_machine::{plan, Plan};
use super::watch::ProviderFeed;
use super::{Action, Context, ControllerOptions};
use crate::crd::ProviderPhase;
use crate::manifest::{render, ManifestBundle, ManifestRequest};
use crate::provider::{ComponentOwner, ObjectKey, ProviderKind, ProviderResource};
use crate::retry::{retry_with_backoff, with_timeout, Backoff, RetryConfig};
use crate::status::{Outcome, StatusTracker};
use crate::store::ProviderStore;
use crate::{Error, Result, FINALIZER};

/// Reconciliations running for one kind, and the most ever seen at once
#[derive(Debug, Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(self.clone())
    }
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handle for feeding notifications into a registered controller
#[derive(Clone)]
pub struct ControllerHandle {
    kind: ProviderKind,
    notify: mpsc::UnboundedSender<ObjectKey>,
    in_flight: Arc<InFlight>,
}

impl ControllerHandle {
    /// Kind this controller reconciles
    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    /// Ask for `key` to be reconciled. Providers the controller has not
    /// observed yet are ignored.
    pub fn notify(&self, key: ObjectKey) {
        let _ = self.notify.send(key);
    }

    /// Reconciliations currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.current.load(Ordering::SeqCst)
    }

    /// Most reconciliations ever running at once
    pub fn max_in_flight(&self) -> usize {
        self.in_flight.peak.load(Ordering::SeqCst)
    }
}

/// What the controller's reconcile and error policy functions share
struct Runner<P: ProviderResource> {
    reconciler: GenericProviderReconciler<P>,
    in_flight: Arc<InFlight>,
    cancel: CancellationToken,
}

/// Reconciliation engine for providers of type `P`
pub struct GenericProviderReconciler<P: ProviderResource> {
    ctx: Arc<Context>,
    store: Arc<dyn ProviderStore<P>>,
    tracker: StatusTracker<P>,
    backoff: Backoff,
    failures: DashMap<ObjectKey, u32>,
}

impl<P: ProviderResource> GenericProviderReconciler<P> {
    /// Create a reconciler reading providers from `store`
    pub fn new(ctx: Arc<Context>, store: Arc<dyn ProviderStore<P>>) -> Self {
        let backoff = Backoff::new(ctx.config.backoff_base, ctx.config.backoff_max);
        Self {
            tracker: StatusTracker::new(store.clone()),
            ctx,
            store,
            backoff,
            failures: DashMap::new(),
        }
    }

    /// Reconcile one provider identity
    #[instrument(skip(self, key, cancel), fields(kind = %P::KIND, provider = %key))]
    pub async fn reconcile(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<Action> {
        let Some(mut provider) = self.store.get(key).await? else {
            debug!("Provider no longer exists");
            return Ok(Action::await_change());
        };

        match self.reconcile_provider(&mut provider, cancel).await {
            Ok(action) => Ok(action),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                self.record_failure(&mut provider, &e).await;
                Err(e)
            }
        }
    }

    async fn reconcile_provider(&self, provider: &mut P, cancel: &CancellationToken) -> Result<Action> {
        let generation = provider.generation();
        let plan = plan(provider);
        debug!(?plan, generation, "Planned reconciliation");

        if plan == Plan::Delete {
            return self.finalize(provider).await;
        }

        if !has_finalizer(provider) {
            self.store.add_finalizer(&provider.key(), FINALIZER).await?;
            provider.finalizers_mut().push(FINALIZER.to_string());
        }

        match plan {
            Plan::Verify { version } => self.verify(provider, &version, generation, cancel).await,
            plan => self.install(provider, &plan, generation, cancel).await,
        }
    }

    /// Install, upgrade or reconfigure: fetch, apply everything, then prune
    async fn install(
        &self,
        provider: &mut P,
        plan: &Plan,
        generation: i64,
        cancel: &CancellationToken,
    ) -> Result<Action> {
        let version = plan.target_version().unwrap_or_default();
        let owner = provider.owner();

        self.tracker
            .record(
                provider,
                Outcome::progress(
                    ProviderPhase::Fetching,
                    "Fetching",
                    format!("fetching release {}", version),
                ),
            )
            .await?;
        let bundle = self.fetch(provider, version).await?;

        let phase = plan.progress_phase().unwrap_or(ProviderPhase::Installing);
        self.tracker
            .record(
                provider,
                Outcome::progress(
                    phase,
                    &phase.to_string(),
                    format!("applying release {}", bundle.version),
                ),
            )
            .await?;

        let report = self.ctx.applier.apply(&bundle, &owner, cancel).await?;
        // prune only once the whole release is in place
        let pruned = self.ctx.applier.prune(&owner, &bundle.ids()).await?;

        let installed = if provider.provider_spec().wants_latest() {
            bundle.version.clone()
        } else {
            provider.provider_spec().version.clone()
        };
        self.tracker
            .record(provider, Outcome::ready(installed.as_str(), generation))
            .await?;

        match plan {
            Plan::Upgrade { from, .. } => info!(
                from = %from,
                to = %installed,
                applied = report.applied(),
                pruned,
                "Provider upgraded"
            ),
            _ => info!(
                version = %installed,
                applied = report.applied(),
                pruned,
                "Provider installed"
            ),
        }
        Ok(self.ready_action())
    }

    /// Up to date: re-apply the installed release to repair drift
    async fn verify(
        &self,
        provider: &mut P,
        version: &str,
        generation: i64,
        cancel: &CancellationToken,
    ) -> Result<Action> {
        let owner = provider.owner();
        let bundle = self.fetch(provider, version).await?;

        let report = self.ctx.applier.apply(&bundle, &owner, cancel).await?;
        let pruned = self.ctx.applier.prune(&owner, &bundle.ids()).await?;
        if report.applied() > 0 || pruned > 0 {
            info!(
                applied = report.applied(),
                pruned,
                "Repaired drift in provider components"
            );
        }

        let installed = provider
            .installed_version()
            .unwrap_or(version)
            .to_string();
        self.tracker
            .record(provider, Outcome::ready(installed, generation))
            .await?;
        Ok(self.ready_action())
    }

    /// Deletion: remove every owned component, release the provider only at zero
    async fn finalize(&self, provider: &mut P) -> Result<Action> {
        if !has_finalizer(provider) {
            debug!("No finalizer present, nothing to clean up");
            return Ok(Action::await_change());
        }

        let key = provider.key();
        let owner = provider.owner();
        self.tracker
            .record(
                provider,
                Outcome::progress(
                    ProviderPhase::Deleting,
                    "Deleting",
                    "removing provider components",
                ),
            )
            .await?;

        let deleted = self.ctx.applier.prune(&owner, &HashSet::new()).await?;
        let remaining = self.ctx.applier.list_owned(&owner).await?.len();
        if remaining > 0 {
            debug!(deleted, remaining, "Waiting for owned components to go away");
            return Err(Error::deletion_blocked(owner.to_string(), remaining));
        }

        self.tracker.record(provider, Outcome::deleted()).await?;
        self.store.remove_finalizer(&key, FINALIZER).await?;
        info!(deleted, "Provider components removed, finalizer released");
        Ok(Action::await_change())
    }

    /// Resolve and render the release `version` for this provider
    async fn fetch(&self, provider: &P, version: &str) -> Result<ManifestBundle> {
        let request = ManifestRequest {
            version: version.to_string(),
            ..ManifestRequest::for_provider(provider)
        };
        let bundle = with_timeout(
            self.ctx.config.fetch_timeout,
            "fetch provider release",
            self.ctx.repository.resolve(&request),
        )
        .await?;
        render(&bundle, provider.provider_spec())
    }

    async fn record_failure(&self, provider: &mut P, error: &Error) {
        let outcome = if provider.is_deleting() {
            Outcome::deletion_blocked(error)
        } else {
            Outcome::failed(error)
        };
        if let Err(e) = self.tracker.record(provider, outcome).await {
            warn!(error = %e, "Failed to record provider failure");
        }
    }

    fn ready_action(&self) -> Action {
        self.ctx
            .config
            .resync_period
            .map_or_else(Action::await_change, Action::requeue)
    }

    /// Requeue decision for a failed reconciliation.
    ///
    /// Terminal errors wait for a spec change; everything else backs off
    /// exponentially per identity up to the configured ceiling.
    pub fn error_policy(&self, key: &ObjectKey, error: &Error) -> Action {
        if matches!(error, Error::Cancelled) {
            return Action::await_change();
        }
        if error.is_terminal() {
            warn!(
                kind = %P::KIND,
                provider = %key,
                error = %error,
                "Reconciliation failed permanently, waiting for a spec change"
            );
            return Action::await_change();
        }

        let failures = {
            let mut entry = self.failures.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        let delay = self.backoff.delay(failures - 1);
        error!(
            kind = %P::KIND,
            provider = %key,
            error = %error,
            failures,
            retry_in = ?delay,
            "Reconciliation failed"
        );
        Action::requeue(delay)
    }

    /// Forget the failure streak of `key`
    pub fn reset_backoff(&self, key: &ObjectKey) {
        self.failures.remove(key);
    }

    /// Consecutive failures recorded for `key`
    pub fn failure_count(&self, key: &ObjectKey) -> u32 {
        self.failures.get(key).map(|f| *f).unwrap_or(0)
    }

    /// Enumerate every provider of this kind and remove orphaned components.
    ///
    /// Returns the keys of every provider found. Orphans are managed
    /// components whose owning provider no longer exists.
    pub async fn resync(&self) -> Result<Vec<ObjectKey>> {
        let providers = retry_with_backoff(
            &RetryConfig::with_max_attempts(5),
            "list_providers",
            || self.store.list(),
        )
        .await?;

        let live: HashSet<ComponentOwner> = providers.iter().map(|p| p.owner()).collect();
        match self.sweep_orphans(&live).await {
            Ok(0) => {}
            Ok(n) => info!(kind = %P::KIND, deleted = n, "Removed orphaned components"),
            Err(e) => warn!(kind = %P::KIND, error = %e, "Orphan sweep failed"),
        }

        Ok(providers.iter().map(|p| p.key()).collect())
    }

    async fn sweep_orphans(&self, live: &HashSet<ComponentOwner>) -> Result<usize> {
        let mut orphans: HashMap<ComponentOwner, usize> = HashMap::new();
        for component in self.ctx.applier.list_managed(P::KIND).await? {
            if let Some(owner) = component.owner.filter(|o| !live.contains(o)) {
                *orphans.entry(owner).or_default() += 1;
            }
        }

        let mut deleted = 0;
        for owner in orphans.keys() {
            debug!(owner = %owner, "Owner no longer exists, pruning its components");
            deleted += self.ctx.applier.prune(owner, &HashSet::new()).await?;
        }
        Ok(deleted)
    }

    /// Register this reconciler with `manager` and start its controller once
    /// the readiness gates open. Changes arriving through `feed` before that
    /// are buffered.
    pub fn setup_with_manager(
        self,
        manager: &Manager,
        options: ControllerOptions,
        feed: ProviderFeed<P>,
    ) -> ControllerHandle {
        let (notify, notified) = mpsc::unbounded_channel::<ObjectKey>();
        let in_flight = Arc::new(InFlight::default());
        let handle = ControllerHandle {
            kind: P::KIND,
            notify,
            in_flight: in_flight.clone(),
        };

        let gates = manager.gates().clone();
        let cancel = manager.shutdown_token();
        let concurrency = u16::try_from(options.max_concurrent_reconciles.max(1)).unwrap_or(u16::MAX);
        let runner = Arc::new(Runner {
            reconciler: self,
            in_flight,
            cancel: cancel.clone(),
        });

        manager.spawn(async move {
            if !gates.wait_open(&cancel).await {
                return;
            }
            info!(kind = %P::KIND, concurrency, "Starting provider controller");

            match runner.reconciler.resync().await {
                Ok(keys) => debug!(kind = %P::KIND, providers = keys.len(), "Initial resync"),
                Err(e) => warn!(kind = %P::KIND, error = %e, "Initial resync failed"),
            }

            let ProviderFeed { reader, triggers } = feed;
            let lookup = reader.clone();
            let notified = stream::unfold(notified, |mut rx| async move {
                rx.recv().await.map(|key| (key, rx))
            })
            .filter_map(move |key| {
                let provider = lookup
                    .get(&ObjectRef::new(&key.name).within(&key.namespace))
                    .map(|p| Ok::<P, watcher::Error>(P::clone(&p)));
                future::ready(provider)
            });

            let controller = Controller::for_stream(stream::select(triggers, notified), reader)
                .with_config(Config::default().concurrency(concurrency))
                .run(reconcile_object::<P>, error_policy_object::<P>, runner)
                .for_each(log_reconcile_result(P::KIND.resource_kind()));

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = controller => {}
            }
            debug!(kind = %P::KIND, "Provider controller stopped");
        });

        handle
    }
}

async fn reconcile_object<P: ProviderResource>(provider: Arc<P>, runner: Arc<Runner<P>>) -> Result<Action> {
    let key = provider.key();
    let _running = runner.in_flight.enter();

    let result = tokio::select! {
        biased;
        _ = runner.cancel.cancelled() => Err(Error::Cancelled),
        result = runner.reconciler.reconcile(&key, &runner.cancel) => result,
    };
    if result.is_ok() {
        runner.reconciler.reset_backoff(&key);
    }
    result
}

fn error_policy_object<P: ProviderResource>(provider: Arc<P>, error: &Error, runner: Arc<Runner<P>>) -> Action {
    runner.reconciler.error_policy(&provider.key(), error)
}

fn log_reconcile_result<T: Debug, E: Debug>(
    kind: &'static str,
) -> impl Fn(std::result::Result<T, E>) -> future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => debug!(?action, "{} reconciliation completed", kind),
            Err(e) => warn!(error = ?e, "{} reconciliation error", kind),
        }
        future::ready(())
    }
}

fn has_finalizer<P: ProviderResource>(provider: &P) -> bool {
    provider.finalizers().iter().any(|f| f == FINALIZER)
}
