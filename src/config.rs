//! Operator configuration
//!
//! The binary builds this from flags and environment variables; tests build
//! it directly. Engine code reads it through the shared controller context.

use std::path::PathBuf;
use std::time::Duration;

use crate::Error;

/// Tunables for the reconciliation engine
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Root of the local manifest repository
    pub providers_dir: PathBuf,
    /// Reconciliations allowed in flight per provider kind
    pub max_concurrent_reconciles: usize,
    /// First requeue delay after a retryable failure
    pub backoff_base: Duration,
    /// Ceiling on any requeue delay
    pub backoff_max: Duration,
    /// Attempts per component operation when writes conflict
    pub conflict_attempts: u32,
    /// Bound on a single manifest repository fetch
    pub fetch_timeout: Duration,
    /// Bound on a single target environment call
    pub call_timeout: Duration,
    /// Re-verify ready providers this often, `None` to only react to changes
    pub resync_period: Option<Duration>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            providers_dir: PathBuf::from("/providers"),
            max_concurrent_reconciles: 1,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300), // 5 minutes
            conflict_attempts: 5,
            fetch_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
            resync_period: Some(Duration::from_secs(600)),
        }
    }
}

impl OperatorConfig {
    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_concurrent_reconciles == 0 {
            return Err(Error::validation("max_concurrent_reconciles must be at least 1"));
        }
        if self.conflict_attempts == 0 {
            return Err(Error::validation("conflict_attempts must be at least 1"));
        }
        if self.backoff_base > self.backoff_max {
            return Err(Error::validation(format!(
                "backoff base {:?} exceeds ceiling {:?}",
                self.backoff_base, self.backoff_max
            )));
        }
        if self.fetch_timeout.is_zero() || self.call_timeout.is_zero() {
            return Err(Error::validation("timeouts must be non-zero"));
        }
        Ok(())
    }
}
