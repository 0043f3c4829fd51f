pub mod manager;

use crate::error::Result;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Debug)]
pub enum ServiceResult {
    GracefulShutdown,
    NormalCompletion,
    Error(anyhow::Error),
}

/// Common lifecycle for every long-running component of the application.
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    /// Name used in logs and shutdown accounting.
    fn name(&self) -> &'static str;

    /// The service's main work loop; returning at all is unexpected.
    async fn run(&mut self) -> Result<()>;

    /// Gracefully wind the service down.
    async fn shutdown(&mut self) -> Result<()>;
}

/// Drive a service until it completes on its own or the shutdown signal
/// arrives.
pub async fn run_service(
    mut service: Box<dyn Service>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> ServiceResult {
    let name = service.name();
    info!(service = name, "service started");

    let work = async {
        match service.run().await {
            Ok(()) => {
                warn!(service = name, "service completed unexpectedly");
                ServiceResult::NormalCompletion
            }
            Err(error) => {
                error!(service = name, error = %error, "service failed");
                ServiceResult::Error(error)
            }
        }
    };

    tokio::select! {
        result = work => result,
        _ = shutdown_rx.recv() => {
            info!(service = name, "shutting down");
            let started = std::time::Instant::now();
            match service.shutdown().await {
                Ok(()) => {
                    info!(service = name, elapsed = ?started.elapsed(), "shutdown complete");
                    ServiceResult::GracefulShutdown
                }
                Err(error) => {
                    error!(service = name, elapsed = ?started.elapsed(), error = %error, "shutdown failed");
                    ServiceResult::Error(error)
                }
            }
        }
    }
}
