#![deny(unused)]
//! mcp-sandboxd - sandbox lifecycle daemon for MCP tool servers.
//!
//! Reads newline-delimited JSON control requests on stdin and answers on
//! stdout. Logs go to stderr. On EOF, SIGINT or SIGTERM every sandbox is
//! destroyed before the process exits.

mod control;
mod tracing_layer;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use control::ControlHandler;
use mcp_sandbox::SandboxRegistry;
use mcp_sandbox_core::ManagerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Config decides the log format, so load it before tracing and report
    // a load failure once tracing is up.
    let config = ManagerConfig::load();
    let json_logs = config.as_ref().map(|c| c.logging.json).unwrap_or(false);
    tracing_layer::configure_tracing(json_logs)?;

    let config = config.context("invalid sandbox configuration")?;
    tracing::info!("Starting mcp-sandboxd v{}", env!("CARGO_PKG_VERSION"));

    let metrics = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")?;

    // =========================================================================
    // Connect to the container runtime
    // =========================================================================
    let registry = match SandboxRegistry::init(config).await {
        Ok(registry) => registry,
        Err(e) => {
            tracing::error!(error = %e, "Container runtime unavailable, exiting");
            return Err(e.into());
        }
    };

    let handler = ControlHandler::new(registry.clone()).with_metrics(metrics);

    // =========================================================================
    // Control loop
    // =========================================================================
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                tracing::warn!("stdout closed, dropping responses");
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();
    let stop_signal = shutdown_signal();
    tokio::pin!(stop_signal);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    let handler = handler.clone();
                    let tx = tx.clone();
                    in_flight.spawn(async move {
                        let response = handler.handle_line(&line).await;
                        let _ = tx.send(response.to_line()).await;
                    });
                }
                Ok(None) => {
                    tracing::info!("stdin closed");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read control input");
                    break;
                }
            },
            _ = &mut stop_signal => break,
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Control request task failed");
                }
            }
        }
    }

    // =========================================================================
    // Drain
    // =========================================================================
    registry.shutdown().await;
    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Control request task failed");
        }
    }
    drop(tx);
    let _ = writer.await;

    tracing::info!("mcp-sandboxd stopped");
    Ok(())
}

/// Resolves on SIGINT (Ctrl-C) or SIGTERM.
///
/// The SIGTERM handler is installed when this is called, not when the
/// returned future is first polled.
fn shutdown_signal() -> impl std::future::Future<Output = ()> {
    #[cfg(unix)]
    let sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| tracing::warn!(error = %e, "Failed to listen for SIGTERM"))
        .ok();

    async move {
        let interrupt = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async move {
            match sigterm {
                Some(mut sigterm) => {
                    sigterm.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = interrupt => tracing::info!("Interrupted"),
            _ = terminate => tracing::info!("Terminated"),
        }
    }
}
