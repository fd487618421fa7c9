//! Custom Resource Definitions for the provider operator
//!
//! One CRD per provider kind, all sharing [`ProviderSpec`] and [`ProviderStatus`].

mod providers;
mod types;

pub use providers::{
    BootstrapProvider, BootstrapProviderSpec, ControlPlaneProvider, ControlPlaneProviderSpec,
    CoreProvider, CoreProviderSpec, InfrastructureProvider, InfrastructureProviderSpec, GROUP,
    VERSION,
};
pub use types::{
    Condition, ConditionStatus, FetchConfig, ProviderPhase, ProviderSpec, ProviderStatus,
    CONDITION_INSTALLED, CONDITION_READY, LATEST_VERSION,
};
