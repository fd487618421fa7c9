//! The four provider Custom Resource Definitions
//!
//! CoreProvider, InfrastructureProvider, BootstrapProvider and
//! ControlPlaneProvider are identical apart from their kind. Each spec
//! flattens the shared [`ProviderSpec`] so the wire format is the same for all.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ProviderSpec, ProviderStatus};

/// API group of the provider CRDs
pub const GROUP: &str = "operator.cluster.x-k8s.io";

/// API version of the provider CRDs
pub const VERSION: &str = "v1alpha1";

macro_rules! provider_crd {
    ($(#[$doc:meta])* $spec:ident, $kind:literal, $plural:literal, $short:literal) => {
        $(#[$doc])*
        #[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
        #[kube(
            group = "operator.cluster.x-k8s.io",
            version = "v1alpha1",
            kind = $kind,
            plural = $plural,
            shortname = $short,
            status = "ProviderStatus",
            namespaced,
            printcolumn = r#"{"name":"Desired","type":"string","jsonPath":".spec.version"}"#,
            printcolumn = r#"{"name":"Installed","type":"string","jsonPath":".status.installedVersion"}"#,
            printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
            printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
        )]
        pub struct $spec {
            /// Shared provider configuration
            #[serde(flatten)]
            pub provider: ProviderSpec,
        }

        impl From<ProviderSpec> for $spec {
            fn from(provider: ProviderSpec) -> Self {
                Self { provider }
            }
        }
    };
}

provider_crd!(
    /// Specification for a CoreProvider (cluster-api itself)
    CoreProviderSpec,
    "CoreProvider",
    "coreproviders",
    "cp"
);

provider_crd!(
    /// Specification for an InfrastructureProvider (docker, aws, proxmox, ...)
    InfrastructureProviderSpec,
    "InfrastructureProvider",
    "infrastructureproviders",
    "ip"
);

provider_crd!(
    /// Specification for a BootstrapProvider (kubeadm, rke2, ...)
    BootstrapProviderSpec,
    "BootstrapProvider",
    "bootstrapproviders",
    "bp"
);

provider_crd!(
    /// Specification for a ControlPlaneProvider (kubeadm, rke2, ...)
    ControlPlaneProviderSpec,
    "ControlPlaneProvider",
    "controlplaneproviders",
    "cpp"
);
