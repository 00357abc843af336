use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub http_client: HttpClientConfig,
    pub prometheus: PrometheusConfig,
    pub engine: EngineConfig,
    pub database: DatabaseConfig,
    pub workers: WorkersConfig,
}

/// Management API listener.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Outbound client used for every peer and prometheus call.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpClientConfig {
    pub timeout_secs: u64,
    /// Peers commonly run on bare IPs with self-signed certificates.
    pub tls_insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrometheusConfig {
    pub host: String,
    pub port: u16,
    pub config_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub config_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub dir: String,
}

/// Periodic reconciliation cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    /// Fast tick: pull-based fleet health check.
    pub pull_interval_secs: u64,
    /// Slow tick: pull + metrics aggregation + key push.
    pub sync_interval_secs: u64,
}

// (ENV_NAME, config_key)
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("SHADOWFLEET_SERVER_HOST", "server.host"),
    ("SHADOWFLEET_SERVER_PORT", "server.port"),
    (
        "SHADOWFLEET_HTTP_CLIENT_TIMEOUT_SECS",
        "http_client.timeout_secs",
    ),
    (
        "SHADOWFLEET_HTTP_CLIENT_TLS_INSECURE_SKIP_VERIFY",
        "http_client.tls_insecure_skip_verify",
    ),
    ("SHADOWFLEET_PROMETHEUS_HOST", "prometheus.host"),
    ("SHADOWFLEET_PROMETHEUS_PORT", "prometheus.port"),
    (
        "SHADOWFLEET_PROMETHEUS_CONFIG_PATH",
        "prometheus.config_path",
    ),
    ("SHADOWFLEET_ENGINE_CONFIG_PATH", "engine.config_path"),
    ("SHADOWFLEET_DATABASE_DIR", "database.dir"),
    (
        "SHADOWFLEET_WORKERS_PULL_INTERVAL_SECS",
        "workers.pull_interval_secs",
    ),
    (
        "SHADOWFLEET_WORKERS_SYNC_INTERVAL_SECS",
        "workers.sync_interval_secs",
    ),
];

pub fn load() -> anyhow::Result<AppConfig> {
    let mut builder = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("http_client.timeout_secs", 10)?
        .set_default("http_client.tls_insecure_skip_verify", true)?
        .set_default("prometheus.host", "127.0.0.1")?
        .set_default("prometheus.port", 9090)?
        .set_default(
            "prometheus.config_path",
            "storage/prometheus/prometheus.yml",
        )?
        .set_default("engine.config_path", "storage/shadowsocks/keys.yml")?
        .set_default("database.dir", "storage/database")?
        .set_default("workers.pull_interval_secs", 10)?
        .set_default("workers.sync_interval_secs", 60)?;

    for (env_key, cfg_key) in ENV_OVERRIDES {
        if let Ok(value) = env::var(env_key) {
            builder = builder.set_override(*cfg_key, value)?;
        }
    }

    let app: AppConfig = builder.build()?.try_deserialize()?;
    validate(&app)?;
    Ok(app)
}

fn validate(cfg: &AppConfig) -> anyhow::Result<()> {
    if cfg.server.port == 0 {
        anyhow::bail!("server.port must be > 0");
    }
    if cfg.http_client.timeout_secs == 0 {
        anyhow::bail!("http_client.timeout_secs must be > 0");
    }
    if cfg.prometheus.port == 0 {
        anyhow::bail!("prometheus.port must be > 0");
    }
    if cfg.workers.pull_interval_secs == 0 || cfg.workers.sync_interval_secs == 0 {
        anyhow::bail!("worker intervals must be > 0");
    }
    Ok(())
}
