use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use anyhow::Context;
use arc_swap::{ArcSwap, ArcSwapOption};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{error, info};

use common::api::{LOCAL_SERVER_ID, Server, ServerStatus};

use crate::config::AppConfig;
use crate::persistence::Database;
use crate::persistence::settings::{
    PLACEHOLDER_API_TOKEN, PLACEHOLDER_EXTERNAL_HTTP, PLACEHOLDER_SHADOWSOCKS_PORT,
};
use crate::prometheus::Prometheus;
use crate::supervisor::DynProxyEngine;
use crate::tokens;

pub mod engine;
pub mod fleet;
pub mod metrics;
pub mod workers;

pub use metrics::FleetMetrics;

/// The reconciliation core: owns the in-memory fleet state, drives the
/// periodic pull/push schedule, and enforces quota policy.
///
/// Shared across HTTP handlers and background tasks behind an `Arc`; every
/// durable mutation goes through the [`Database`], every metrics-map
/// replacement is a single atomic swap.
pub struct Coordinator {
    cfg: AppConfig,
    http: reqwest::Client,
    db: Arc<Database>,
    engine: DynProxyEngine,
    prometheus: Arc<Prometheus>,
    metrics_port: AtomicU16,
    synced_at: ArcSwapOption<DateTime<Utc>>,
    fleet_metrics: ArcSwap<FleetMetrics>,
    fatal: mpsc::Sender<anyhow::Error>,
}

impl Coordinator {
    /// Build the coordinator plus the receiver for fatal background errors;
    /// the caller aborts the process when that channel yields.
    pub fn new(
        cfg: AppConfig,
        http: reqwest::Client,
        db: Arc<Database>,
        engine: DynProxyEngine,
        prometheus: Arc<Prometheus>,
    ) -> (Arc<Self>, mpsc::Receiver<anyhow::Error>) {
        let (fatal, fatal_rx) = mpsc::channel(1);
        let coordinator = Arc::new(Self {
            cfg,
            http,
            db,
            engine,
            prometheus,
            metrics_port: AtomicU16::new(0),
            synced_at: ArcSwapOption::empty(),
            fleet_metrics: ArcSwap::from_pointee(FleetMetrics::default()),
            fatal,
        });
        (coordinator, fatal_rx)
    }

    /// Startup sequence: settings bootstrap, metrics-port allocation, and
    /// the initial local/fleet sync. Any failure here is fatal.
    pub async fn bootstrap(self: &Arc<Self>) -> anyhow::Result<()> {
        self.init_settings().await?;

        let port =
            free_port().context("cannot find a free port for the engine metrics exporter")?;
        self.metrics_port.store(port, Ordering::SeqCst);

        self.sync_local_keys(false).await?;
        self.sync_server_targets(false).await?;
        Ok(())
    }

    /// Replace any still-placeholder settings with real values: a generated
    /// api token, a discovered free engine port, and an external URL derived
    /// from the HTTP listener.
    async fn init_settings(&self) -> anyhow::Result<()> {
        let mut settings = self.db.settings().await;

        if settings.api_token == PLACEHOLDER_API_TOKEN {
            settings.api_token = tokens::generate_token(tokens::API_TOKEN_LEN);
            info!("generated a fresh api token");
        }
        if settings.shadowsocks_port == PLACEHOLDER_SHADOWSOCKS_PORT {
            settings.shadowsocks_port =
                free_port().context("cannot find a free port for the shadowsocks engine")?;
            info!(port = settings.shadowsocks_port, "assigned a shadowsocks port");
        }
        if settings.external_http == PLACEHOLDER_EXTERNAL_HTTP {
            settings.external_http = format!("http://127.0.0.1:{}", self.cfg.server.port);
        }

        self.db
            .update_settings(settings)
            .await
            .context("cannot save bootstrapped settings")?;
        Ok(())
    }

    /// Port the engine's metrics exporter binds; assigned during bootstrap.
    pub fn metrics_port(&self) -> u16 {
        self.metrics_port.load(Ordering::SeqCst)
    }

    /// Timestamp of the last successful local key sync.
    pub fn synced_at(&self) -> Option<DateTime<Utc>> {
        self.synced_at.load_full().map(|ts| *ts)
    }

    pub(crate) fn stamp_synced_at(&self) {
        self.synced_at.store(Some(Arc::new(Utc::now())));
    }

    /// The node itself as a synthetic server record, built on demand from
    /// local settings rather than stored.
    pub async fn current_server(&self) -> Server {
        let settings = self.db.settings().await;
        Server {
            id: LOCAL_SERVER_ID.into(),
            http_host: "127.0.0.1".into(),
            http_port: self.cfg.server.port,
            api_token: settings.api_token,
            shadowsocks_enabled: settings.shadowsocks_enabled,
            shadowsocks_host: settings.shadowsocks_host,
            shadowsocks_port: settings.shadowsocks_port,
            status: ServerStatus::Active,
            synced_at: self.synced_at(),
        }
    }

    /// Explicit fleet resync after an admin mutation: always reconfigures
    /// the local engine and reloads the collector.
    pub async fn sync(self: &Arc<Self>) {
        if let Err(err) = self.sync_local_keys(true).await {
            self.report_fatal(err);
            return;
        }
        if let Err(err) = self.sync_server_targets(true).await {
            self.report_fatal(err);
        }
    }

    /// Surface a background fatality to the main run loop. The channel holds
    /// one error; later reports are logged only.
    fn report_fatal(&self, err: anyhow::Error) {
        error!(?err, "fatal coordinator failure");
        let _ = self.fatal.try_send(err);
    }

    pub(crate) fn fatal_sender(&self) -> mpsc::Sender<anyhow::Error> {
        self.fatal.clone()
    }
}

/// Ask the OS for an unused local TCP port.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}
