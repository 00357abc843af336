pub mod config;
pub mod coordinator;
pub mod error;
pub mod http;
pub mod persistence;
pub mod prometheus;
pub mod supervisor;
pub mod tokens;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::coordinator::Coordinator;
use crate::http::AppState;
use crate::persistence::Database;
use crate::prometheus::Prometheus;
use crate::supervisor::{DynProxyEngine, OutlineEngine, default_binary_paths};

/// How long the HTTP front end may drain in-flight requests on shutdown.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

/// One outbound client for every peer and collector call, with the single
/// configured timeout.
pub fn build_client(cfg: &config::AppConfig) -> Result<reqwest::Client> {
    let mut builder =
        reqwest::Client::builder().timeout(Duration::from_secs(cfg.http_client.timeout_secs));

    if cfg.http_client.tls_insecure_skip_verify {
        warn!("TLS certificate verification is disabled for outbound calls");
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder.build().map_err(Into::into)
}

/// Boot the whole node: durable state, coordinator bootstrap, the engine
/// supervisor, the periodic workers, and the management API.
pub async fn run() -> Result<()> {
    let cfg = config::load()?;

    let client = build_client(&cfg)?;
    let db = Arc::new(Database::open(&cfg.database.dir)?);
    info!(dir = %cfg.database.dir, "database loaded");

    let engine: DynProxyEngine = Arc::new(OutlineEngine::new(
        &cfg.engine.config_path,
        default_binary_paths(),
    ));
    let prometheus = Arc::new(Prometheus::new(
        client.clone(),
        &cfg.prometheus.config_path,
        cfg.prometheus.host.clone(),
        cfg.prometheus.port,
    ));

    let (coordinator, mut fatal_rx) = Coordinator::new(
        cfg.clone(),
        client,
        db.clone(),
        engine.clone(),
        prometheus.clone(),
    );
    coordinator.bootstrap().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The engine runs for the life of the process; a launch failure or a
    // dirty exit is fatal to the whole application.
    {
        let engine = engine.clone();
        let metrics_port = coordinator.metrics_port();
        let fatal = coordinator.fatal_sender();
        tokio::spawn(async move {
            match engine.start(metrics_port).await {
                Ok(()) => warn!("shadowsocks engine exited"),
                Err(err) => {
                    let _ = fatal.send(err.into()).await;
                }
            }
        });
    }

    {
        let prometheus = prometheus.clone();
        tokio::spawn(async move {
            prometheus.reload().await;
        });
    }

    let workers = coordinator.spawn_workers(shutdown_rx.clone());

    let state = AppState {
        db,
        coordinator: coordinator.clone(),
        http_port: cfg.server.port,
    };
    let app = http::build_router(state);

    let api_addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid listen address: {err}"))?;
    let listener = TcpListener::bind(api_addr).await?;
    info!(%api_addr, "management api listening");

    let mut api_shutdown = shutdown_rx.clone();
    let mut api_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = api_shutdown.changed().await;
            })
            .await
    });

    let outcome: Result<()> = tokio::select! {
        res = &mut api_task => {
            match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(anyhow::anyhow!("management api server failed: {err}")),
                Err(err) => Err(anyhow::anyhow!("management api task failed: {err}")),
            }
        }
        Some(err) = fatal_rx.recv() => Err(err),
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(true);
            match tokio::time::timeout(DRAIN_DEADLINE, &mut api_task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => warn!(%err, "management api server failed during drain"),
                Ok(Err(err)) => warn!(%err, "management api task failed during drain"),
                Err(_) => {
                    warn!("drain deadline exceeded; aborting the http front end");
                    api_task.abort();
                }
            }
            Ok(())
        }
    };

    let _ = shutdown_tx.send(true);
    engine.stop().await;
    for worker in workers {
        worker.abort();
    }
    info!("shutdown complete");

    outcome
}

/// Waits for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                None
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }
}
