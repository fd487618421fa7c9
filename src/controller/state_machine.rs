//! Provider state machine
//!
//! Decides what a reconciliation must do from the provider's spec and status
//! alone. The notification that triggered the run carries no information.

use crate::crd::ProviderPhase;
use crate::provider::ProviderResource;

/// The work one reconciliation performs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Remove every owned component, then release the provider
    Delete,
    /// Nothing installed yet
    Install {
        /// Version to install
        version: String,
    },
    /// A different version is installed
    Upgrade {
        /// Installed version
        from: String,
        /// Desired version
        to: String,
    },
    /// Same version, but the spec changed (variables, patches, fetch config)
    Reconfigure {
        /// Installed version
        version: String,
    },
    /// Up to date; re-verify the installed components
    Verify {
        /// Installed version
        version: String,
    },
}

impl Plan {
    /// Phase recorded while the bundle is applied, `None` for silent verification
    pub fn progress_phase(&self) -> Option<ProviderPhase> {
        match self {
            Plan::Delete => Some(ProviderPhase::Deleting),
            Plan::Install { .. } => Some(ProviderPhase::Installing),
            Plan::Upgrade { .. } | Plan::Reconfigure { .. } => Some(ProviderPhase::Upgrading),
            Plan::Verify { .. } => None,
        }
    }

    /// Version whose bundle this plan applies
    pub fn target_version(&self) -> Option<&str> {
        match self {
            Plan::Delete => None,
            Plan::Install { version } | Plan::Reconfigure { version } | Plan::Verify { version } => {
                Some(version.as_str())
            }
            Plan::Upgrade { to, .. } => Some(to.as_str()),
        }
    }
}

/// Whether two version strings name the same release (a leading `v` is ignored)
pub fn versions_match(a: &str, b: &str) -> bool {
    a.strip_prefix('v').unwrap_or(a) == b.strip_prefix('v').unwrap_or(b)
}

/// Derive the plan for a provider.
///
/// Providers on `latest` are only re-resolved when their generation changed;
/// otherwise the release they installed is verified.
pub fn plan<P: ProviderResource>(provider: &P) -> Plan {
    if provider.is_deleting() {
        return Plan::Delete;
    }

    let spec = provider.provider_spec();
    let desired = spec.version.as_str();
    let converged_generation = provider.observed_generation() == Some(provider.generation());

    let Some(installed) = provider.installed_version() else {
        return Plan::Install {
            version: desired.to_string(),
        };
    };

    if spec.wants_latest() {
        return if converged_generation {
            Plan::Verify {
                version: installed.to_string(),
            }
        } else {
            Plan::Upgrade {
                from: installed.to_string(),
                to: desired.to_string(),
            }
        };
    }

    if !versions_match(desired, installed) {
        Plan::Upgrade {
            from: installed.to_string(),
            to: desired.to_string(),
        }
    } else if !converged_generation {
        Plan::Reconfigure {
            version: desired.to_string(),
        }
    } else {
        Plan::Verify {
            version: desired.to_string(),
        }
    }
}
