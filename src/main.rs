use clap::Parser;
use figment::{Figment, providers::Env};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cronhook::config::Config;
use cronhook::scheduler::SchedulerService;
use cronhook::services::ServiceResult;
use cronhook::services::manager::ServiceManager;
use cronhook::store::postgres::PostgresStore;

/// cronhook - CRON-driven HTTP callback scheduler
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log formatter to use
    #[arg(long, value_enum, default_value_t = LogFormatter::Auto)]
    formatter: LogFormatter,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum LogFormatter {
    /// Human-readable output (default in debug builds)
    Pretty,
    /// JSON lines (default in release builds)
    Json,
    /// Pick based on build mode
    Auto,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config: Config = Figment::new()
        .merge(Env::raw())
        .extract()
        .expect("Failed to load config");

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,cronhook={}", config.log_level)));

    let use_pretty = match args.formatter {
        LogFormatter::Pretty => true,
        LogFormatter::Json => false,
        LogFormatter::Auto => cfg!(debug_assertions),
    };
    if use_pretty {
        tracing_subscriber::fmt()
            .with_target(true)
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_target(true)
            .json()
            .with_env_filter(filter)
            .init();
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = env!("GIT_COMMIT_SHORT"),
        environment = if cfg!(debug_assertions) {
            "development"
        } else {
            "production"
        },
        "starting cronhook"
    );

    let db_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .expect("Failed to create database pool");

    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .expect("Failed to run migrations");

    info!(
        max_workers = config.max_workers,
        request_timeout = ?config.request_timeout,
        max_retries = config.max_retries,
        refresh_interval = ?config.refresh_interval,
        shutdown_timeout = ?config.shutdown_timeout,
        "configuration loaded"
    );

    let store = Arc::new(PostgresStore::new(db_pool));
    let scheduler = SchedulerService::new(store, config.scheduler());

    let shutdown_timeout = config.shutdown_timeout;
    let mut manager = ServiceManager::new();
    manager.spawn("scheduler", Box::new(scheduler));

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        info!("received ctrl+c, gracefully shutting down");
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm_stream =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM signal handler");
        sigterm_stream.recv().await;
        info!("received SIGTERM, gracefully shutting down");
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    let mut exit_code = 0;

    tokio::select! {
        (service_name, result) = manager.wait_any() => {
            match result {
                ServiceResult::GracefulShutdown => {
                    info!(service = service_name, "service completed gracefully");
                }
                ServiceResult::NormalCompletion => {
                    warn!(service = service_name, "service completed unexpectedly");
                    exit_code = 1;
                }
                ServiceResult::Error(error) => {
                    error!(service = service_name, error = %error, "service failed");
                    exit_code = 1;
                }
            }
            if shutdown_remaining(&mut manager, shutdown_timeout).await {
                exit_code = if exit_code == 0 { 2 } else { exit_code };
            }
        }
        _ = ctrl_c => {
            if shutdown_remaining(&mut manager, shutdown_timeout).await {
                exit_code = 2;
            }
        }
        _ = sigterm => {
            if shutdown_remaining(&mut manager, shutdown_timeout).await {
                exit_code = 2;
            }
        }
    }

    info!(exit_code, "shutdown complete");
    std::process::exit(exit_code);
}

/// Shut down whatever is still running; returns `true` if anything failed
/// to stop within the timeout.
async fn shutdown_remaining(manager: &mut ServiceManager, timeout: std::time::Duration) -> bool {
    match manager.shutdown(timeout).await {
        Ok(elapsed) => {
            info!(elapsed = ?elapsed, "graceful shutdown complete");
            false
        }
        Err(pending) => {
            warn!(pending = ?pending, "graceful shutdown timed out");
            true
        }
    }
}
