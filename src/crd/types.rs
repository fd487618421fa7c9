//! Shared types for the provider CRDs
//!
//! All four provider kinds carry the same spec and status shape; only the kind
//! tag differs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::schema::{ArrayValidation, InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Sentinel version that resolves to the newest release in the repository
pub const LATEST_VERSION: &str = "latest";

/// Condition type summarising whether the provider is installed and converged
pub const CONDITION_READY: &str = "Ready";

/// Condition type recording the outcome of the last install or upgrade
pub const CONDITION_INSTALLED: &str = "ProviderInstalled";

/// Desired state shared by every provider kind
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    /// Desired release, a semantic version or `latest`
    pub version: String,

    /// Where to obtain the provider's manifests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_config: Option<FetchConfig>,

    /// Values substituted for `${VAR}` references in the manifests
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,

    /// JSON merge patches applied to matching components after fetch
    ///
    /// A patch matches a component when its `apiVersion`, `kind` and
    /// `metadata.name` (and `metadata.namespace`, if set) equal the component's.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "preserve_unknown_list")]
    pub manifest_patches: Vec<serde_json::Value>,
}

impl ProviderSpec {
    /// Create a spec for the given version with no overrides
    pub fn for_version(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..Default::default()
        }
    }

    /// Whether the desired version is the `latest` sentinel
    pub fn wants_latest(&self) -> bool {
        self.version == LATEST_VERSION
    }
}

fn preserve_unknown_list(_: &mut schemars::gen::SchemaGenerator) -> Schema {
    let mut item = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    item.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    SchemaObject {
        instance_type: Some(InstanceType::Array.into()),
        array: Some(Box::new(ArrayValidation {
            items: Some(Schema::Object(item).into()),
            ..Default::default()
        })),
        ..Default::default()
    }
    .into()
}

/// Location descriptor for a provider's manifests
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FetchConfig {
    /// Repository root (a path or `file://` URL); defaults to the operator's providers directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Name of the provider in the repository; defaults to the resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_name: Option<String>,
}

/// Lifecycle phase of a provider
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ProviderPhase {
    /// Not yet reconciled
    #[default]
    Pending,
    /// Resolving the manifest bundle
    Fetching,
    /// First install of the bundle in progress
    Installing,
    /// Version change in progress
    Upgrading,
    /// Installed version matches desired and components are converged
    Ready,
    /// Owned components are being removed
    Deleting,
    /// Owned components are gone and the resource was released
    Deleted,
    /// Last reconciliation failed
    Failed,
}

impl std::fmt::Display for ProviderPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Fetching => write!(f, "Fetching"),
            Self::Installing => write!(f, "Installing"),
            Self::Upgrading => write!(f, "Upgrading"),
            Self::Ready => write!(f, "Ready"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Deleted => write!(f, "Deleted"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready, ProviderInstalled)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Observed state shared by every provider kind
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: ProviderPhase,

    /// Conditions, one per type, in first-set order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Release currently applied to the target environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_version: Option<String>,

    /// Spec generation the status last fully converged to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ProviderStatus {
    /// Set the phase and return self for chaining
    pub fn phase(mut self, phase: ProviderPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Set a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        self.set_condition(condition);
        self
    }

    /// Merge a condition into the set.
    ///
    /// A condition of the same type is replaced in place. Its transition time
    /// is kept when the status value did not change.
    pub fn set_condition(&mut self, mut condition: Condition) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                *existing = condition;
            }
            None => self.conditions.push(condition),
        }
    }

    /// Look up a condition by type
    pub fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Whether the Ready condition is True
    pub fn is_ready(&self) -> bool {
        self.get_condition(CONDITION_READY)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }
}
