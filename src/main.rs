use clap::Parser;
use lazyproxy::cli::Cli;
use lazyproxy::config::Config;
use lazyproxy::process::{Supervisor, SupervisorSettings};
use lazyproxy::proxy::ProxyServer;
use lazyproxy::{PKG_NAME, VERSION};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_directive = if cli.verbose { "lazyproxy=debug" } else { "lazyproxy=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_directive.parse().expect("valid log directive")),
        )
        .init();

    let config = Config::resolve(&cli).map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (supervisor, mut supervisor_task) =
        Supervisor::spawn(config.backend.clone(), SupervisorSettings::from(&config));

    let proxy = ProxyServer::bind(
        &config.backend.listen,
        config.backend.forward.clone(),
        supervisor.clone(),
        config.dial,
        shutdown_rx,
    )
    .await
    .map_err(|e| {
        error!(error = %e, "Failed to start listener");
        e
    })?;

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Wait for a shutdown signal, or for the supervisor to give up
    let outcome = tokio::select! {
        signal = wait_for_signal() => {
            info!(signal, "Shutting down...");
            Ok(())
        }
        result = &mut supervisor_task => {
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::Error::new(e)),
                Err(e) => Err(anyhow::anyhow!("Process supervisor panicked: {}", e)),
            }
        }
    };

    let _ = shutdown_tx.send(true);

    if outcome.is_ok() {
        info!("Stopping backend...");
        supervisor.shutdown().await;
    }

    if tokio::time::timeout(Duration::from_secs(5), proxy_handle).await.is_err() {
        warn!("Proxy server did not stop in time");
    }

    match outcome {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Exiting after fatal backend error");
            Err(e)
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "Ctrl+C"
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting lazy proxy");
    info!(
        listen = %config.backend.listen,
        forward = %config.backend.forward,
        "Proxy configuration"
    );
    info!(
        idle_timeout_ms = config.idle_timeout.as_millis(),
        idle_check_interval_ms = config.idle_check_interval.as_millis(),
        stop_grace_period_ms = config.stop_grace_period.as_millis(),
        on_backend_exit = ?config.exit_policy,
        "Idle settings"
    );
    info!(
        retry_interval_ms = config.dial.retry_interval.as_millis(),
        max_attempts = ?config.dial.max_attempts,
        max_wait_ms = ?config.dial.max_wait.map(|d| d.as_millis()),
        "Backend dial policy"
    );
    info!(
        command = %config.backend.program,
        args = ?config.backend.args,
        working_dir = ?config.backend.working_dir,
        "Backend command"
    );
}
