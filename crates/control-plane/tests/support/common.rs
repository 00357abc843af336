#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use common::api::{Cipher, Key, Server};
use control_plane::config::{
    AppConfig, DatabaseConfig, EngineConfig, HttpClientConfig, PrometheusConfig, ServerConfig,
    WorkersConfig,
};
use control_plane::coordinator::Coordinator;
use control_plane::http::{AppState, build_router};
use control_plane::persistence::settings::PLACEHOLDER_API_TOKEN;
use control_plane::persistence::{Database, NewKey, NewServer};
use control_plane::prometheus::Prometheus;
use control_plane::supervisor::{EngineError, EngineKey, ProxyEngine};

/// The placeholder token doubles as a fixed test credential as long as the
/// coordinator bootstrap has not replaced it.
pub const TEST_API_TOKEN: &str = PLACEHOLDER_API_TOKEN;

/// In-process engine double: records config rewrites and reload signals.
#[derive(Default)]
pub struct FakeEngine {
    pub updates: Mutex<Vec<Vec<EngineKey>>>,
    pub reconfigures: AtomicU32,
}

impl FakeEngine {
    pub fn update_count(&self) -> usize {
        self.updates.lock().expect("lock").len()
    }

    pub fn last_update(&self) -> Option<Vec<EngineKey>> {
        self.updates.lock().expect("lock").last().cloned()
    }

    pub fn reconfigure_count(&self) -> u32 {
        self.reconfigures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxyEngine for FakeEngine {
    async fn start(&self, _metrics_port: u16) -> Result<(), EngineError> {
        Ok(())
    }

    async fn update_config(&self, keys: &[EngineKey]) -> Result<(), EngineError> {
        self.updates.lock().expect("lock").push(keys.to_vec());
        Ok(())
    }

    async fn reconfigure(&self) -> Result<(), EngineError> {
        self.reconfigures.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {}
}

pub struct TestNode {
    pub coordinator: Arc<Coordinator>,
    pub db: Arc<Database>,
    pub engine: Arc<FakeEngine>,
    pub fatal_rx: mpsc::Receiver<anyhow::Error>,
    pub cfg: AppConfig,
    pub storage: TempDir,
}

pub fn test_config(storage: &TempDir, prometheus_host: &str, prometheus_port: u16) -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".into(),
            port: 8080,
        },
        http_client: HttpClientConfig {
            timeout_secs: 2,
            tls_insecure_skip_verify: false,
        },
        prometheus: PrometheusConfig {
            host: prometheus_host.into(),
            port: prometheus_port,
            config_path: storage.path().join("prometheus.yml").display().to_string(),
        },
        engine: EngineConfig {
            config_path: storage.path().join("keys.yml").display().to_string(),
        },
        database: DatabaseConfig {
            dir: storage.path().join("database").display().to_string(),
        },
        workers: WorkersConfig {
            pull_interval_secs: 10,
            sync_interval_secs: 60,
        },
    }
}

/// A coordinator wired to a temp database, a fake engine, and whatever
/// prometheus endpoint the test points it at.
pub fn setup_node(prometheus_host: &str, prometheus_port: u16) -> TestNode {
    let storage = TempDir::new().expect("tempdir");
    let cfg = test_config(&storage, prometheus_host, prometheus_port);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .expect("client");
    let db = Arc::new(Database::open(cfg.database.dir.clone()).expect("open db"));
    let engine = Arc::new(FakeEngine::default());
    let prometheus = Arc::new(Prometheus::new(
        client.clone(),
        cfg.prometheus.config_path.clone(),
        cfg.prometheus.host.clone(),
        cfg.prometheus.port,
    ));

    let (coordinator, fatal_rx) = Coordinator::new(
        cfg.clone(),
        client,
        db.clone(),
        engine.clone(),
        prometheus,
    );

    TestNode {
        coordinator,
        db,
        engine,
        fatal_rx,
        cfg,
        storage,
    }
}

pub fn setup_app(node: &TestNode) -> axum::Router {
    build_router(AppState {
        db: node.db.clone(),
        coordinator: node.coordinator.clone(),
        http_port: node.cfg.server.port,
    })
}

pub async fn store_key(node: &TestNode, secret: &str, name: &str, quota: u64) -> Key {
    node.db
        .store_key(NewKey {
            cipher: Cipher::Aes128Gcm,
            secret: secret.into(),
            name: name.into(),
            quota,
            enabled: true,
        })
        .await
        .expect("store key")
}

pub async fn register_peer(node: &TestNode, host: &str, port: u16, token: &str) -> Server {
    node.db
        .store_server(NewServer {
            http_host: host.into(),
            http_port: port,
            api_token: token.into(),
        })
        .await
        .expect("store server")
}

/// A full peer settings body as served by `GET /v1/settings`.
pub fn peer_settings_body(enabled: bool, host: &str, port: u16) -> serde_json::Value {
    serde_json::json!({
        "admin_password": "password",
        "api_token": "peer-api-token-123456",
        "shadowsocks_enabled": enabled,
        "shadowsocks_host": host,
        "shadowsocks_port": port,
        "external_https": "",
        "external_http": format!("http://{host}"),
        "traffic_ratio": 1.0,
        "http_port": 8080
    })
}

/// Poll until `check` passes or the deadline expires.
pub async fn wait_for(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
