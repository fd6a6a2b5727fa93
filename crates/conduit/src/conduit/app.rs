use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::conduit::{
    config::{self, CredentialSource},
    logging, net,
    server::{self, AppState},
    session::SessionFactory,
    telemetry,
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }
    if cfg.credential_source == CredentialSource::Placeholder {
        tracing::warn!(
            credential = %cfg.credential,
            "config: no credential configured, using the public development placeholder; anyone can use this tunnel"
        );
    }
    if cfg.share.enabled {
        tracing::warn!("config: share page enabled, GET / reveals the credential");
    }

    tracing::info!(
        config = %resolved.path.display(),
        listen_addr = %cfg.listen_addr,
        ws_path = %cfg.ws_path,
        dial_timeout_ms = cfg.dial_timeout.as_millis() as u64,
        handshake_timeout_ms = cfg.handshake_timeout.as_millis() as u64,
        buffer_size = cfg.buffer_size,
        metrics = cfg.metrics,
        "conduit: starting"
    );

    let prom = if cfg.metrics {
        Some(Arc::new(telemetry::init_prometheus()?))
    } else {
        None
    };

    let state = AppState {
        factory: SessionFactory::new(
            cfg.credential,
            Arc::new(net::TcpDialer),
            cfg.session_options(),
        ),
        credential: cfg.credential,
        ws_path: cfg.ws_path.clone(),
        share: cfg.share.clone(),
        prom,
    };

    let bind = net::normalize_bind_addr(&cfg.listen_addr);
    let listener = tokio::net::TcpListener::bind(bind.as_ref())
        .await
        .with_context(|| format!("server: bind {bind}"))?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut tasks = JoinSet::new();
    tasks.spawn(server::serve_with_shutdown(listener, state, shutdown_rx));

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected server exit.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    let drain = async { while tasks.join_next().await.is_some() {} };

    // Hard cap so `docker stop` doesn't stall indefinitely.
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("shutdown: drain timed out");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
