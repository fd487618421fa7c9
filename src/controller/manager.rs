//! Controller manager
//!
//! Owns the readiness gates every controller waits on, the shutdown token and
//! the tasks controllers spawn.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Pre-conditions that must hold before any reconciliation starts
pub struct ReadinessGates {
    elected: watch::Sender<bool>,
    webhooks_ready: watch::Sender<bool>,
}

impl Default for ReadinessGates {
    fn default() -> Self {
        Self {
            elected: watch::Sender::new(false),
            webhooks_ready: watch::Sender::new(false),
        }
    }
}

impl ReadinessGates {
    /// Both gates closed
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark this instance as the elected leader
    pub fn set_elected(&self) {
        info!("Leader election won");
        self.elected.send_replace(true);
    }

    /// Mark admission webhooks as serving
    pub fn set_webhooks_ready(&self) {
        info!("Webhooks ready");
        self.webhooks_ready.send_replace(true);
    }

    /// Whether both gates are open
    pub fn is_open(&self) -> bool {
        *self.elected.borrow() && *self.webhooks_ready.borrow()
    }

    /// Wait until both gates are open. Returns false if `cancel` fires first.
    pub async fn wait_open(&self, cancel: &CancellationToken) -> bool {
        let mut elected = self.elected.subscribe();
        let mut webhooks_ready = self.webhooks_ready.subscribe();

        tokio::select! {
            _ = cancel.cancelled() => false,
            open = async {
                elected.wait_for(|v| *v).await.is_ok()
                    && webhooks_ready.wait_for(|v| *v).await.is_ok()
            } => open,
        }
    }
}

/// Runs registered controllers until shutdown
pub struct Manager {
    gates: Arc<ReadinessGates>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Manager {
    /// Create a manager stopped by `shutdown`
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            gates: Arc::new(ReadinessGates::new()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The readiness gates
    pub fn gates(&self) -> &Arc<ReadinessGates> {
        &self.gates
    }

    /// Token cancelled on shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn a task that lives until shutdown
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Cancel everything and wait for spawned tasks to finish
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        debug!(tasks = tasks.len(), "Waiting for controller tasks");
        for task in tasks {
            let _ = task.await;
        }
        info!("Controllers stopped");
    }
}
