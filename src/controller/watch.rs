//! Change notification feeds
//!
//! A feed pairs a reflector [`Store`] with the stream of provider objects that
//! should trigger a reconciliation. Only changes the engine acts on are
//! forwarded: a new identity, a new spec generation or a deletion request.
//! Status writes made by the engine itself never re-trigger it.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::{future, StreamExt};
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use tracing::{debug, warn};

use crate::crd::ProviderSpec;
use crate::provider::{new_provider, ObjectKey, ProviderResource};
use crate::store::InMemoryProviderStore;

/// Server-side timeout for watch requests
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Remembers the last generation and deletion state seen per identity
#[derive(Debug, Default)]
pub struct ChangeFilter {
    seen: HashMap<ObjectKey, (i64, bool)>,
}

impl ChangeFilter {
    /// Empty filter; the first sighting of every identity counts as a change
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sighting and report whether it warrants a reconciliation
    pub fn changed(&mut self, key: &ObjectKey, generation: i64, deleting: bool) -> bool {
        let state = (generation, deleting);
        match self.seen.insert(key.clone(), state) {
            Some(previous) => previous != state,
            None => true,
        }
    }

    /// Forget an identity that no longer exists
    pub fn forget(&mut self, key: &ObjectKey) {
        self.seen.remove(key);
    }
}

/// Objects of one provider kind and the changes that trigger reconciliation
pub struct ProviderFeed<P: ProviderResource> {
    /// Latest known copy of every provider
    pub reader: Store<P>,
    /// Providers to reconcile, in the order they changed
    pub triggers: BoxStream<'static, Result<P, watcher::Error>>,
}

/// Watch providers of type `P` in every namespace.
///
/// Watch errors are retried with the watcher's default backoff and surface
/// in the controller's output.
pub fn kube_feed<P: ProviderResource>(client: Client) -> ProviderFeed<P> {
    let (reader, writer) = reflector::store();
    let api: Api<P> = Api::all(client);
    let mut filter = ChangeFilter::new();

    let triggers = reflector::reflector(
        writer,
        watcher::watcher(api, watcher::Config::default().timeout(WATCH_TIMEOUT_SECS)),
    )
    .default_backoff()
    .filter_map(move |event| {
        let trigger = match event {
            Ok(Event::Apply(provider)) | Ok(Event::InitApply(provider)) => {
                let key = provider.key();
                let changed = filter.changed(&key, provider.generation(), provider.is_deleting());
                if changed {
                    debug!(kind = %P::KIND, provider = %key, "Provider changed");
                }
                changed.then_some(Ok(provider))
            }
            Ok(Event::Delete(provider)) => {
                filter.forget(&provider.key());
                None
            }
            Ok(Event::Init) | Ok(Event::InitDone) => None,
            Err(e) => {
                warn!(kind = %P::KIND, error = %e, "Provider watch error");
                Some(Err(e))
            }
        };
        future::ready(trigger)
    })
    .boxed();

    ProviderFeed { reader, triggers }
}

/// Feed from an in-memory store: every provider present now, then every
/// provider whose spec or deletion state changes.
pub fn memory_feed<P: ProviderResource>(store: Arc<InMemoryProviderStore<P>>) -> ProviderFeed<P> {
    let (reader, mut writer) = reflector::store();
    let rx = store.subscribe();

    let existing = store.snapshot_all();
    writer.apply_watcher_event(&Event::Init);
    for provider in &existing {
        writer.apply_watcher_event(&Event::InitApply(provider.clone()));
    }
    writer.apply_watcher_event(&Event::InitDone);

    let updates = stream::unfold(
        (rx, writer, store),
        |(mut rx, mut writer, store)| async move {
            loop {
                let key = rx.recv().await?;
                match store.snapshot(&key) {
                    Some(provider) => {
                        writer.apply_watcher_event(&Event::Apply(provider.clone()));
                        return Some((Ok::<P, watcher::Error>(provider), (rx, writer, store)));
                    }
                    None => {
                        let gone = new_provider::<P>(&key.namespace, &key.name, ProviderSpec::default());
                        writer.apply_watcher_event(&Event::Delete(gone));
                    }
                }
            }
        },
    );

    ProviderFeed {
        reader,
        triggers: stream::iter(existing.into_iter().map(Ok))
            .chain(updates)
            .boxed(),
    }
}
