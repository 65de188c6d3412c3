use anyhow::Context;
use std::time::Duration;
use tokio::net::TcpListener;

use rpmforge::config::loader::{config_path_from_env, load_config};
use rpmforge::{init_global_logger, server, Orchestrator, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // =========================================================================
    // CONFIGURATION
    // =========================================================================
    let config_path = config_path_from_env();
    let config = load_config(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    // =========================================================================
    // LOGGING - before anything that logs
    // =========================================================================
    let collector = init_global_logger(config.paths.log_dir.clone(), config.logging.level_filter())
        .map_err(anyhow::Error::msg)?;
    eprintln!("[Main] Logging to {}", collector.log_path().display());
    log::info!(
        "[Main] rpmforge {} starting (runtime: {:?}, max concurrent builds: {})",
        VERSION,
        config.sandbox.runtime,
        config.limits.max_concurrent_builds
    );

    // =========================================================================
    // ORCHESTRATOR AND ARTIFACT RETENTION
    // =========================================================================
    let bind = config.server.bind.clone();
    let reap_every = Duration::from_secs(config.artifacts.reap_interval_secs);
    let orchestrator = Orchestrator::from_config(config).context("preparing work directories")?;
    orchestrator.startup_sweep();
    let reaper = orchestrator.store().spawn_reaper(reap_every);

    // =========================================================================
    // SERVE UNTIL SIGNALLED
    // =========================================================================
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {}", bind))?;
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let mut serving = tokio::spawn(server::serve(listener, orchestrator.clone(), async move {
        let _ = stop_rx.await;
    }));

    let mut exit: anyhow::Result<()> = Ok(());
    tokio::select! {
        _ = shutdown_signal() => {
            log::info!("[Main] Shutdown requested");
            orchestrator.shutdown().await;
            let _ = stop_tx.send(());
            match serving.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("[Main] Server error during shutdown: {}", e),
                Err(e) => log::error!("[Main] Server task failed: {}", e),
            }
        }
        result = &mut serving => {
            log::error!("[Main] Server stopped unexpectedly");
            orchestrator.shutdown().await;
            exit = match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::Error::new(e).context("server failed")),
                Err(e) => Err(anyhow::Error::new(e).context("server task failed")),
            };
        }
    }

    // =========================================================================
    // SHUTDOWN
    // =========================================================================
    reaper.abort();
    log::info!("[Main] Shutdown complete");
    if let Err(e) = collector.wait_for_empty().await {
        eprintln!("[Main] WARNING: Failed to flush log collector: {}", e);
    }
    exit
}

/// Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log::warn!("[Main] Cannot listen for SIGTERM: {}", e);
                futures::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
}
