//! Manifest repository client
//!
//! Resolves (kind, name, version) to an immutable [`ManifestBundle`]: the
//! ordered list of components making up one provider release.
//!
//! - [`LocalRepository`] reads clusterctl-style release directories from disk.
//! - [`CachedRepository`] memoizes released versions in front of any repository.
//! - [`InMemoryRepository`] serves bundles published programmatically.
//!
//! Per-provider customisation (variables, patches) is applied afterwards by
//! [`render`], so cached bundles stay shared and immutable.

mod cache;
mod local;
mod memory;
mod render;
mod yaml;

pub use cache::CachedRepository;
pub use local::LocalRepository;
pub use memory::InMemoryRepository;
pub use render::{render, substitute_vars};
pub use yaml::parse_yaml_multi;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;

use crate::crd::{FetchConfig, LATEST_VERSION};
use crate::provider::{ProviderKind, ProviderResource};
use crate::{Error, Result};

/// Identity of a component in the target environment
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId {
    /// apiVersion (e.g. `apps/v1`)
    pub api_version: String,
    /// kind (e.g. `Deployment`)
    pub kind: String,
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// metadata.name
    pub name: String,
}

impl ComponentId {
    /// Create an id
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    /// Extract the identity of a JSON object
    pub fn from_object(object: &Value) -> Result<Self> {
        let field = |path: &[&str]| str_at(object, path);

        let kind = field(&["kind"]).ok_or_else(|| Error::validation("component has no kind"))?;
        let api_version = field(&["apiVersion"])
            .ok_or_else(|| Error::validation(format!("{} has no apiVersion", kind)))?;
        let name = field(&["metadata", "name"]).ok_or_else(|| {
            Error::validation(format!("{} {} has no metadata.name", api_version, kind))
        })?;

        Ok(Self::new(
            api_version,
            kind,
            field(&["metadata", "namespace"]),
            name,
        ))
    }

    /// API group of the resource type ("" for the core group)
    pub fn group(&self) -> &str {
        self.api_version
            .rsplit_once('/')
            .map(|(group, _)| group)
            .unwrap_or("")
    }
}

fn str_at<'a>(object: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut cur = object;
    for p in path {
        cur = cur.get(p)?;
    }
    cur.as_str().filter(|s| !s.is_empty())
}

impl std::fmt::Display for ComponentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}/{}", self.api_version, self.kind, ns, self.name),
            None => write!(f, "{}/{}/{}", self.api_version, self.kind, self.name),
        }
    }
}

/// One declarative object destined for the target environment
#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    /// Identity of the object
    pub id: ComponentId,
    /// Desired fields, the full object as declared in the manifest
    pub object: Value,
}

impl Component {
    /// Validate a parsed document and wrap it as a component
    pub fn from_value(object: Value) -> Result<Self> {
        if !object.is_object() {
            return Err(Error::validation(format!(
                "manifest document is not a mapping: {}",
                object
            )));
        }
        let id = ComponentId::from_object(&object)?;
        Ok(Self { id, object })
    }
}

/// Apply order for component kinds: prerequisites first.
///
/// Namespaces and CRDs must exist before the objects that live in or use them.
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" => 2,
        "ClusterRole" | "Role" => 3,
        "ClusterRoleBinding" | "RoleBinding" => 4,
        "ConfigMap" | "Secret" => 5,
        "Issuer" | "ClusterIssuer" | "Certificate" => 6,
        "Service" => 7,
        "Deployment" | "DaemonSet" | "StatefulSet" => 8,
        "MutatingWebhookConfiguration" | "ValidatingWebhookConfiguration" => 9,
        _ => 10,
    }
}

/// Immutable, ordered set of components for one provider release
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestBundle {
    /// Provider kind the release belongs to
    pub kind: ProviderKind,
    /// Provider name in the repository
    pub provider: String,
    /// Concrete release version (never `latest`)
    pub version: String,
    /// Components in apply order
    pub components: Vec<Component>,
}

impl ManifestBundle {
    /// Build a bundle, ordering components by kind priority.
    ///
    /// Declaration order is kept within a priority class. Duplicate identities
    /// are rejected.
    pub fn new(
        kind: ProviderKind,
        provider: impl Into<String>,
        version: impl Into<String>,
        mut components: Vec<Component>,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        for c in &components {
            if !seen.insert(&c.id) {
                return Err(Error::validation_for(
                    c.id.to_string(),
                    "component declared more than once",
                ));
            }
        }
        components.sort_by_key(|c| kind_priority(&c.id.kind));

        Ok(Self {
            kind,
            provider: provider.into(),
            version: version.into(),
            components,
        })
    }

    /// Parse a multi-document YAML release into a bundle
    pub fn from_yaml(
        kind: ProviderKind,
        provider: impl Into<String>,
        version: impl Into<String>,
        yaml: &str,
    ) -> Result<Self> {
        let components = parse_yaml_multi(yaml)?
            .into_iter()
            .filter(|doc| !doc.is_null())
            .map(Component::from_value)
            .collect::<Result<Vec<_>>>()?;
        Self::new(kind, provider, version, components)
    }

    /// Identities of every component, the keep-set for pruning
    pub fn ids(&self) -> HashSet<ComponentId> {
        self.components.iter().map(|c| c.id.clone()).collect()
    }
}

/// What to resolve: a provider release and where to find it
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestRequest {
    /// Provider kind
    pub kind: ProviderKind,
    /// Provider name in the repository
    pub name: String,
    /// Desired version, possibly `latest`
    pub version: String,
    /// Location override from the provider spec
    pub fetch_config: Option<FetchConfig>,
}

impl ManifestRequest {
    /// Request the release a provider currently asks for
    pub fn for_provider<P: ProviderResource>(provider: &P) -> Self {
        let spec = provider.provider_spec();
        Self {
            kind: P::KIND,
            name: provider.repository_name(),
            version: spec.version.clone(),
            fetch_config: spec.fetch_config.clone(),
        }
    }

    /// Whether the request asks for the moving `latest` release
    pub fn is_latest(&self) -> bool {
        self.version == LATEST_VERSION
    }

    /// Human-readable provider label for errors and logs
    pub fn provider_label(&self) -> String {
        format!("{} {}", self.kind, self.name)
    }
}

/// Source of versioned manifest bundles
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestRepository: Send + Sync {
    /// Resolve a release to its bundle.
    ///
    /// Fails with [`Error::NotFound`] for an unknown name or version and with
    /// [`Error::TransientFetch`] when the repository could not be read.
    async fn resolve(&self, request: &ManifestRequest) -> Result<Arc<ManifestBundle>>;
}

/// Pick the highest semantic version from a set of release names.
///
/// A leading `v` is ignored for comparison; names that are not semver are skipped.
pub fn highest_version<'a>(versions: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    versions
        .into_iter()
        .filter_map(|v| {
            semver::Version::parse(v.strip_prefix('v').unwrap_or(v))
                .ok()
                .map(|parsed| (parsed, v))
        })
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, v)| v)
}
