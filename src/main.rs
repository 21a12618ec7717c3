//! newsdesk: binary entrypoint.
//! Loads config, wires the core, starts background jobs and serves the
//! HTTP API until ctrl-c / SIGTERM, then waits for in-flight computes and
//! flushes the quota ledger.

use anyhow::Context;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use newsdesk::{api, config::AppConfig, metrics::Metrics, scheduler, Core};

/// Compact logs; `RUST_LOG` overrides the default filter.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("newsdesk=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl-c handler failed");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::load_default().context("loading newsdesk config")?;
    let bind_addr = cfg.http.bind_addr.clone();
    let grace = Duration::from_secs(cfg.http.shutdown_grace_secs);

    let core = Core::from_config(cfg)?;
    let metrics = Metrics::init(&core.cfg).context("installing metrics recorder")?;
    let app = api::router(core.clone(), &metrics);

    let (stop_tx, stop_rx) = watch::channel(false);
    let jobs = scheduler::spawn_all(core.clone(), stop_rx);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "newsdesk listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    let _ = stop_tx.send(true);
    for job in jobs {
        if tokio::time::timeout(grace, job).await.is_err() {
            tracing::warn!("background job did not stop within grace period");
        }
    }

    core.shutdown().await;
    Ok(())
}
