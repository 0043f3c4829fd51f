//! Spawns registered services and coordinates their shutdown.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::services::{Service, ServiceResult, run_service};

pub struct ServiceManager {
    running: HashMap<String, JoinHandle<ServiceResult>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ServiceManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            running: HashMap::new(),
            shutdown_tx,
        }
    }

    /// Spawn a service under this manager's shutdown signal.
    pub fn spawn(&mut self, name: &str, service: Box<dyn Service>) {
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(run_service(service, shutdown_rx));
        self.running.insert(name.to_string(), handle);
        debug!(service = name, "service spawned");
    }

    /// Wait until any service completes, returning its name and result.
    /// Services are expected to run forever, so a completion here means the
    /// application should begin shutting down.
    pub async fn wait_any(&mut self) -> (String, ServiceResult) {
        if self.running.is_empty() {
            return (
                "none".to_string(),
                ServiceResult::Error(anyhow::anyhow!("no services running")),
            );
        }

        loop {
            let finished = self
                .running
                .iter()
                .find(|(_, handle)| handle.is_finished())
                .map(|(name, _)| name.clone());

            if let Some(name) = finished {
                let handle = self.running.remove(&name).unwrap();
                let result = match handle.await {
                    Ok(result) => result,
                    Err(join_error) => {
                        error!(service = name, error = %join_error, "service task panicked");
                        ServiceResult::Error(anyhow::anyhow!("task panic: {join_error}"))
                    }
                };
                return (name, result);
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Signal shutdown to every running service and wait up to `timeout`.
    ///
    /// Returns the elapsed time on success, or the names of services that
    /// did not finish in time.
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<Duration, Vec<String>> {
        let names: Vec<String> = self.running.keys().cloned().collect();
        info!(services = ?names, timeout = ?timeout, "shutting down services");

        let _ = self.shutdown_tx.send(());

        let started = std::time::Instant::now();
        let mut pending = Vec::new();
        for (name, handle) in self.running.drain() {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(_)) => debug!(service = name, "service stopped"),
                Ok(Err(join_error)) => {
                    warn!(service = name, error = %join_error, "service shutdown failed");
                    pending.push(name);
                }
                Err(_) => {
                    warn!(service = name, "service shutdown timed out");
                    pending.push(name);
                }
            }
        }

        let elapsed = started.elapsed();
        if pending.is_empty() {
            info!(elapsed = ?elapsed, "all services stopped");
            Ok(elapsed)
        } else {
            warn!(pending = ?pending, elapsed = ?elapsed, "shutdown left services pending");
            Err(pending)
        }
    }
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}
