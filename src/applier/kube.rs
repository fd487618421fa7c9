//! Kubernetes-backed target environment
//!
//! Components are untyped, so every call goes through `Api<DynamicObject>`
//! resolved via API discovery. Discovery is cached and refreshed when a kind
//! is missing, which happens right after a bundle installs its own CRDs.
//!
//! Updates are server-side applies of the declared object under
//! [`FIELD_MANAGER`], so fields other managers own are never overwritten.
//! Owner listings walk every listable type; a type that fails to list is
//! skipped unless this operator has written components of it.

use async_trait::async_trait;
use dashmap::DashSet;
use kube::api::{
    Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams,
    PostParams, PropagationPolicy,
};
use kube::discovery::{verbs, ApiCapabilities, ApiResource, Discovery, Scope};
use kube::Client;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{labels_of, LiveComponent, TargetClient};
use crate::manifest::ComponentId;
use crate::provider::{ComponentOwner, ProviderKind, OWNER_KIND_LABEL};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result, FIELD_MANAGER};

/// Target client talking to a Kubernetes API server
pub struct KubeTarget {
    client: Client,
    discovery: RwLock<Option<Discovery>>,
    /// `apiVersion/kind` of every type components were written as
    written: DashSet<String>,
}

impl KubeTarget {
    /// Create a target for `client`; discovery runs lazily
    pub fn new(client: Client) -> Self {
        Self {
            client,
            discovery: RwLock::new(None),
            written: DashSet::new(),
        }
    }

    fn record_written(&self, ar: &ApiResource) {
        self.written.insert(type_key(ar));
    }

    async fn run_discovery(&self) -> Result<Discovery> {
        retry_with_backoff(&RetryConfig::with_max_attempts(3), "api_discovery", || {
            Discovery::new(self.client.clone()).run()
        })
        .await
        .map_err(|e| Error::target("discovery", format!("API discovery failed: {}", e)))
    }

    /// Resolve a component's API resource, refreshing discovery on a miss
    async fn resolve(&self, id: &ComponentId) -> Result<(ApiResource, ApiCapabilities)> {
        let (group, version) = parse_api_version(&id.api_version);
        let gvk = GroupVersionKind::gvk(group, version, &id.kind);

        if let Some(found) = self
            .discovery
            .read()
            .await
            .as_ref()
            .and_then(|d| d.resolve_gvk(&gvk))
        {
            return Ok(found);
        }

        debug!(api_version = %id.api_version, kind = %id.kind, "Kind not in discovery cache, refreshing");
        let discovery = self.run_discovery().await?;
        let found = discovery.resolve_gvk(&gvk);
        *self.discovery.write().await = Some(discovery);

        // retryable: the CRD may not be established yet
        found.ok_or_else(|| {
            Error::target(
                id.to_string(),
                format!("{}/{} is not served by the API server", id.api_version, id.kind),
            )
        })
    }

    async fn api_for(&self, id: &ComponentId) -> Result<(Api<DynamicObject>, ApiResource, bool)> {
        let (ar, caps) = self.resolve(id).await?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        let api = match (&id.namespace, namespaced) {
            (Some(ns), true) => Api::namespaced_with(self.client.clone(), ns, &ar),
            (None, true) => {
                return Err(Error::validation_for(
                    id.to_string(),
                    format!("{} is namespaced but the component has no namespace", id.kind),
                ))
            }
            (_, false) => Api::all_with(self.client.clone(), &ar),
        };
        Ok((api, ar, namespaced))
    }

    /// Every listable resource the server knows, from the discovery cache
    async fn listable_resources(&self) -> Result<Vec<ApiResource>> {
        let mut cached = self.discovery.write().await;
        if cached.is_none() {
            *cached = Some(self.run_discovery().await?);
        }
        Ok(cached
            .iter()
            .flat_map(|d| d.groups())
            .flat_map(|g| g.recommended_resources())
            .filter(|(_, caps)| caps.supports_operation(verbs::LIST))
            .map(|(ar, _)| ar)
            .collect())
    }

    async fn list_selected(&self, selector: &str, scope: &str) -> Result<Vec<LiveComponent>> {
        let params = ListParams::default().labels(selector);
        let mut found = Vec::new();

        for ar in self.listable_resources().await? {
            let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
            let listed = api.list(&params).await.map(|list| list.items);
            let written = self.written.contains(&type_key(&ar));
            found.extend(listed_components(&ar, listed, written, scope)?);
        }
        Ok(found)
    }
}

fn type_key(ar: &ApiResource) -> String {
    format!("{}/{}", ar.api_version, ar.kind)
}

/// Components from one type's listing.
///
/// A failed listing of a type this operator never wrote cannot hide owned
/// components and is skipped; an unavailable aggregated API must not block
/// every provider.
fn listed_components(
    ar: &ApiResource,
    listed: std::result::Result<Vec<DynamicObject>, kube::Error>,
    written: bool,
    scope: &str,
) -> Result<Vec<LiveComponent>> {
    match listed {
        Ok(objects) => objects
            .into_iter()
            .map(|object| live_component(ar, object))
            .collect(),
        // some aggregated APIs refuse cluster-wide listing
        Err(kube::Error::Api(ae)) if matches!(ae.code, 403 | 404 | 405) => Ok(Vec::new()),
        Err(e) if !written => {
            warn!(
                api_version = %ar.api_version,
                kind = %ar.kind,
                error = %e,
                "Skipping resource type that could not be listed"
            );
            Ok(Vec::new())
        }
        Err(e) => Err(map_kube_error(scope, e)),
    }
}

#[async_trait]
impl TargetClient for KubeTarget {
    async fn get(&self, id: &ComponentId) -> Result<Option<LiveComponent>> {
        let (api, ar, _) = self.api_for(id).await?;
        match api.get_opt(&id.name).await {
            Ok(Some(object)) => live_component(&ar, object).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(map_kube_error(&id.to_string(), e)),
        }
    }

    async fn create(&self, id: &ComponentId, object: &Value, owner: &ComponentOwner) -> Result<()> {
        let (api, ar, namespaced) = self.api_for(id).await?;
        let mut object = object.clone();

        // ownerReferences only work for namespaced objects next to the owner
        if let Some(uid) = owner.uid.as_deref() {
            if namespaced && id.namespace.as_deref() == Some(owner.key.namespace.as_str()) {
                if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
                    metadata.insert(
                        "ownerReferences".to_string(),
                        serde_json::json!([{
                            "apiVersion": format!("{}/{}", crate::crd::GROUP, crate::crd::VERSION),
                            "kind": owner.kind.resource_kind(),
                            "name": owner.key.name,
                            "uid": uid,
                            "blockOwnerDeletion": false
                        }]),
                    );
                }
            }
        }

        let object: DynamicObject = serde_json::from_value(object)
            .map_err(|e| Error::serialization(format!("{}: {}", id, e)))?;
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.create(&params, &object)
            .await
            .map_err(|e| map_kube_error(&id.to_string(), e))?;
        self.record_written(&ar);
        Ok(())
    }

    async fn update<'a>(
        &self,
        id: &ComponentId,
        object: &Value,
        resource_version: Option<&'a str>,
    ) -> Result<()> {
        let (api, ar, _) = self.api_for(id).await?;
        let mut patch = object.clone();
        if let (Some(rv), Some(map)) = (resource_version, patch.as_object_mut()) {
            let metadata = map
                .entry("metadata")
                .or_insert_with(|| Value::Object(Default::default()));
            if let Some(metadata) = metadata.as_object_mut() {
                metadata.insert("resourceVersion".to_string(), Value::String(rv.to_string()));
            }
        }

        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&id.name, &params, &Patch::Apply(&patch))
            .await
            .map_err(|e| map_kube_error(&id.to_string(), e))?;
        self.record_written(&ar);
        Ok(())
    }

    async fn delete(&self, id: &ComponentId) -> Result<()> {
        let (api, _, _) = self.api_for(id).await?;
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match api.delete(&id.name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(map_kube_error(&id.to_string(), e)),
        }
    }

    async fn list_owned(&self, owner: &ComponentOwner) -> Result<Vec<LiveComponent>> {
        let owned = self.list_selected(&owner.selector(), &owner.to_string()).await?;
        // selector matches on labels only; keep the comparison explicit
        Ok(owned
            .into_iter()
            .filter(|c| c.owner.as_ref() == Some(owner))
            .collect())
    }

    async fn list_managed(&self, kind: ProviderKind) -> Result<Vec<LiveComponent>> {
        let selector = format!("{}={}", OWNER_KIND_LABEL, kind.label_value());
        self.list_selected(&selector, &kind.to_string()).await
    }
}

/// Split `group/version` (or bare `v1`) into its parts
fn parse_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

fn live_component(ar: &ApiResource, object: DynamicObject) -> Result<LiveComponent> {
    let name = object.metadata.name.clone().unwrap_or_default();
    let id = ComponentId::new(
        ar.api_version.clone(),
        ar.kind.clone(),
        object.metadata.namespace.as_deref(),
        name,
    );
    let resource_version = object.metadata.resource_version.clone();
    let deleting = object.metadata.deletion_timestamp.is_some();
    let value = serde_json::to_value(&object).map_err(|e| Error::serialization(e.to_string()))?;
    let owner = ComponentOwner::from_labels(&labels_of(&value));

    Ok(LiveComponent {
        id,
        object: value,
        owner,
        resource_version,
        deleting,
    })
}

/// Classify an API error for a component
fn map_kube_error(component: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => Error::apply_conflict(component, ae.message),
        kube::Error::Api(ae) if ae.code == 400 || ae.code == 422 => {
            Error::validation_for(component, ae.message)
        }
        other => {
            warn!(component = %component, error = %other, "Target API call failed");
            Error::target(component, other.to_string())
        }
    }
}
