//! Process-wide shutdown and failure escalation.
//!
//! Long-running tasks subscribe to the shutdown broadcast. A task that
//! errors or panics is reported through `fail`, which trips the
//! "services failed" state and requests shutdown. Anything blocked on
//! `failed()` wakes up instead of hanging.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct Services {
    shutdown: broadcast::Sender<()>,
    stopped: Arc<watch::Sender<bool>>,
    failed: Arc<watch::Sender<Option<String>>>,
}

impl Default for Services {
    fn default() -> Self {
        Self::new()
    }
}

impl Services {
    pub fn new() -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let (stopped, _) = watch::channel(false);
        let (failed, _) = watch::channel(None);
        Self {
            shutdown,
            stopped: Arc::new(stopped),
            failed: Arc::new(failed),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub fn shutdown(&self) {
        if !self.stopped.send_replace(true) {
            tracing::info!("shutdown requested");
        }
        let _ = self.shutdown.send(());
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Resolves once shutdown has been requested, even if that happened earlier.
    pub async fn stopped(&self) {
        let mut rx = self.stopped.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Mark services failed. The first reason wins.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let first = self.failed.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.clone());
            true
        });
        if first {
            tracing::error!(reason = %reason, "services failed");
        }
        self.shutdown();
    }

    pub fn failure(&self) -> Option<String> {
        self.failed.borrow().clone()
    }

    /// Resolves with the failure reason once services have failed.
    pub async fn failed(&self) -> String {
        let mut rx = self.failed.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => String::from("services dropped"),
        };
        reason
    }

    /// Watch a task; an error or panic escalates to `fail`.
    pub fn supervise(&self, name: &'static str, handle: JoinHandle<anyhow::Result<()>>) {
        let services = self.clone();
        tokio::spawn(async move {
            match handle.await {
                Ok(Ok(())) => tracing::debug!(task = name, "task exited"),
                Ok(Err(e)) => services.fail(format!("{name} failed: {e:#}")),
                Err(e) if e.is_panic() => services.fail(format!("{name} panicked")),
                Err(_) => tracing::debug!(task = name, "task cancelled"),
            }
        });
    }
}
