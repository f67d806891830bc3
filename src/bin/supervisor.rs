//! duorec supervisor process.
//!
//! Scheduler, capture driver and merge engine in one process; exactly one
//! instance per host owns the camera devices.

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use duorec::cli::{self, Args};
use duorec::config::Config;
use duorec::supervisor::SupervisorEngine;

fn main() -> ExitCode {
    let args = Args::parse();

    let _log_guard = match duorec::logging::init_logging("duorec-supervisor") {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            return cli::exit_runtime_error();
        }
    };

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Configuration error: {e}");
            return cli::exit_config_error();
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create runtime: {e}");
            return cli::exit_runtime_error();
        }
    };

    let once = args.once;
    let result = runtime.block_on(async move {
        let mut engine = SupervisorEngine::new(config);

        if once {
            return engine.run_once().await;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        });

        engine.run(shutdown_rx).await
    });

    match result {
        Ok(()) => cli::EXIT_OK,
        Err(e) => {
            error!("Unrecoverable runtime error: {e:#}");
            cli::exit_runtime_error()
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
