//! Provider kind abstraction
//!
//! The reconciliation engine is written once, generic over [`ProviderResource`].
//! Each of the four CRDs implements it, which is all the engine needs to read
//! the spec, write the status and stamp ownership on components.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};

use k8s_openapi::NamespaceResourceScope;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::crd::{
    BootstrapProvider, ControlPlaneProvider, CoreProvider, InfrastructureProvider, ProviderSpec,
    ProviderStatus,
};

/// Label carrying the owning provider's kind
pub const OWNER_KIND_LABEL: &str = "operator.cluster.x-k8s.io/provider-kind";
/// Label carrying the owning provider's namespace
pub const OWNER_NAMESPACE_LABEL: &str = "operator.cluster.x-k8s.io/provider-namespace";
/// Label carrying the owning provider's name
pub const OWNER_NAME_LABEL: &str = "operator.cluster.x-k8s.io/provider-name";

/// The four provider kinds Cluster API knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProviderKind {
    /// cluster-api core controllers
    Core,
    /// Infrastructure providers (docker, aws, ...)
    Infrastructure,
    /// Bootstrap providers (kubeadm, rke2, ...)
    Bootstrap,
    /// Control plane providers (kubeadm, rke2, ...)
    ControlPlane,
}

impl ProviderKind {
    /// Every kind, in registration order
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::Core,
        ProviderKind::Infrastructure,
        ProviderKind::Bootstrap,
        ProviderKind::ControlPlane,
    ];

    /// Kubernetes kind of the CRD
    pub fn resource_kind(&self) -> &'static str {
        match self {
            ProviderKind::Core => "CoreProvider",
            ProviderKind::Infrastructure => "InfrastructureProvider",
            ProviderKind::Bootstrap => "BootstrapProvider",
            ProviderKind::ControlPlane => "ControlPlaneProvider",
        }
    }

    /// Short form used in labels and repository paths
    pub fn label_value(&self) -> &'static str {
        match self {
            ProviderKind::Core => "core",
            ProviderKind::Infrastructure => "infrastructure",
            ProviderKind::Bootstrap => "bootstrap",
            ProviderKind::ControlPlane => "control-plane",
        }
    }

    /// Parse the label form back into a kind
    pub fn from_label(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.label_value() == value)
    }

    /// Component file name inside a release directory
    pub fn components_file(&self) -> String {
        format!("{}-components.yaml", self.label_value())
    }

    /// Repository directory for a provider of this kind
    ///
    /// Core providers live under their own name, all others are prefixed
    /// with the kind (e.g. `infrastructure-docker`).
    pub fn repository_dir(&self, name: &str) -> String {
        match self {
            ProviderKind::Core => name.to_string(),
            _ => format!("{}-{}", self.label_value(), name),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.resource_kind())
    }
}

/// Namespace/name identity of a provider resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace of the resource
    pub namespace: String,
    /// Name of the resource
    pub name: String,
}

impl ObjectKey {
    /// Create a key
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Owner of a component: the provider that caused its creation.
///
/// Identity is (kind, namespace, name). The uid is carried along for
/// ownerReferences but ignored by equality, so an owner read back from
/// labels compares equal to the live provider.
#[derive(Debug, Clone)]
pub struct ComponentOwner {
    /// Kind of the owning provider
    pub kind: ProviderKind,
    /// Namespace/name of the owning provider
    pub key: ObjectKey,
    /// Server-assigned uid, when known
    pub uid: Option<String>,
}

impl ComponentOwner {
    /// Create an owner without a uid
    pub fn new(kind: ProviderKind, key: ObjectKey) -> Self {
        Self {
            kind,
            key,
            uid: None,
        }
    }

    /// Ownership labels stamped onto every component
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (OWNER_KIND_LABEL.to_string(), self.kind.label_value().to_string()),
            (OWNER_NAMESPACE_LABEL.to_string(), self.key.namespace.clone()),
            (OWNER_NAME_LABEL.to_string(), self.key.name.clone()),
        ])
    }

    /// Label selector matching this owner's components
    pub fn selector(&self) -> String {
        self.labels()
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Recover the owner from a component's labels
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Option<Self> {
        let kind = ProviderKind::from_label(labels.get(OWNER_KIND_LABEL)?)?;
        let namespace = labels.get(OWNER_NAMESPACE_LABEL)?;
        let name = labels.get(OWNER_NAME_LABEL)?;
        Some(Self::new(kind, ObjectKey::new(namespace, name)))
    }
}

impl PartialEq for ComponentOwner {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.key == other.key
    }
}

impl Eq for ComponentOwner {}

impl Hash for ComponentOwner {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.key.hash(state);
    }
}

impl std::fmt::Display for ComponentOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.key)
    }
}

/// Capability interface the engine needs from a provider resource
pub trait ProviderResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Which of the four kinds this type is
    const KIND: ProviderKind;

    /// Shared provider spec
    fn provider_spec(&self) -> &ProviderSpec;

    /// Current status, if any was written
    fn provider_status(&self) -> Option<&ProviderStatus>;

    /// Mutable access to the status
    fn provider_status_mut(&mut self) -> &mut Option<ProviderStatus>;

    /// Build a resource from metadata and spec with no status
    fn from_parts(metadata: ObjectMeta, spec: ProviderSpec) -> Self;

    /// Namespace/name of this resource
    fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Owner stamped on components this provider installs
    fn owner(&self) -> ComponentOwner {
        ComponentOwner {
            kind: Self::KIND,
            key: self.key(),
            uid: self.uid(),
        }
    }

    /// Spec generation (0 when the store does not track one)
    fn generation(&self) -> i64 {
        self.meta().generation.unwrap_or(0)
    }

    /// Whether a deletion timestamp is set
    fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    /// Installed version recorded in status
    fn installed_version(&self) -> Option<&str> {
        self.provider_status()
            .and_then(|s| s.installed_version.as_deref())
    }

    /// Observed generation recorded in status
    fn observed_generation(&self) -> Option<i64> {
        self.provider_status().and_then(|s| s.observed_generation)
    }

    /// Name used to look the provider up in the manifest repository
    fn repository_name(&self) -> String {
        self.provider_spec()
            .fetch_config
            .as_ref()
            .and_then(|f| f.provider_name.clone())
            .unwrap_or_else(|| self.name_any())
    }
}

macro_rules! impl_provider_resource {
    ($ty:ty, $kind:expr) => {
        impl ProviderResource for $ty {
            const KIND: ProviderKind = $kind;

            fn provider_spec(&self) -> &ProviderSpec {
                &self.spec.provider
            }

            fn provider_status(&self) -> Option<&ProviderStatus> {
                self.status.as_ref()
            }

            fn provider_status_mut(&mut self) -> &mut Option<ProviderStatus> {
                &mut self.status
            }

            fn from_parts(metadata: ObjectMeta, spec: ProviderSpec) -> Self {
                Self {
                    metadata,
                    spec: spec.into(),
                    status: None,
                }
            }
        }
    };
}

impl_provider_resource!(CoreProvider, ProviderKind::Core);
impl_provider_resource!(InfrastructureProvider, ProviderKind::Infrastructure);
impl_provider_resource!(BootstrapProvider, ProviderKind::Bootstrap);
impl_provider_resource!(ControlPlaneProvider, ProviderKind::ControlPlane);

/// Build a provider with the given namespace, name and spec
pub fn new_provider<P: ProviderResource>(namespace: &str, name: &str, spec: ProviderSpec) -> P {
    P::from_parts(
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec,
    )
}
