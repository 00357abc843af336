use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::persistence::write_atomic;

/// The one aggregation the coordinator runs: bytes per access key,
/// transfer direction, protocol, and server over a rolling 30-day window.
pub const USAGE_QUERY: &str =
    r#"sum(increase(shadowsocks_data_bytes{dir=~"c<p|c>p"}[30d])) by (access_key,proto,dir,service)"#;

/// Transfer direction as labeled by the engine's exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `c<p`: proxy-to-client bytes.
    Download,
    /// `c>p`: client-to-proxy bytes.
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
}

/// One parsed row of the aggregation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRow {
    pub key_id: String,
    pub server_id: String,
    pub dir: Direction,
    pub proto: Proto,
    pub bytes: u64,
}

/// Client for the prometheus collector: scrape-target config, reload
/// control, and the usage aggregation query.
pub struct Prometheus {
    http: reqwest::Client,
    config_path: PathBuf,
    host: String,
    port: u16,
}

#[derive(Serialize)]
struct ScrapeDocument {
    global: GlobalSection,
    scrape_configs: Vec<ScrapeJob>,
}

#[derive(Serialize)]
struct GlobalSection {
    scrape_interval: String,
    external_labels: ExternalLabels,
}

#[derive(Serialize)]
struct ExternalLabels {
    monitor: String,
}

#[derive(Serialize)]
struct ScrapeJob {
    job_name: String,
    static_configs: Vec<StaticTarget>,
}

#[derive(Serialize)]
struct StaticTarget {
    targets: Vec<String>,
    labels: TargetLabels,
}

#[derive(Serialize)]
struct TargetLabels {
    service: String,
}

#[derive(Deserialize)]
struct QueryResponse {
    data: QueryData,
}

#[derive(Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<QueryResult>,
}

#[derive(Deserialize)]
struct QueryResult {
    metric: QueryMetric,
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Deserialize)]
struct QueryMetric {
    #[serde(default)]
    access_key: String,
    #[serde(default)]
    dir: String,
    #[serde(default)]
    proto: String,
    #[serde(default)]
    service: String,
}

impl Prometheus {
    pub fn new(
        http: reqwest::Client,
        config_path: impl Into<PathBuf>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            http,
            config_path: config_path.into(),
            host: host.into(),
            port,
        }
    }

    /// Rewrite the scrape-target section: one static config per fleet node,
    /// labeled with its server id.
    pub fn update_targets(&self, servers: &BTreeMap<String, String>) -> anyhow::Result<()> {
        let document = ScrapeDocument {
            global: GlobalSection {
                scrape_interval: "5s".into(),
                external_labels: ExternalLabels {
                    monitor: "shadowfleet".into(),
                },
            },
            scrape_configs: vec![ScrapeJob {
                job_name: "shadowsocks".into(),
                static_configs: servers
                    .iter()
                    .map(|(id, address)| StaticTarget {
                        targets: vec![address.clone()],
                        labels: TargetLabels {
                            service: id.clone(),
                        },
                    })
                    .collect(),
            }],
        };

        let rendered = serde_yaml::to_string(&document)?;
        write_atomic(&self.config_path, rendered.as_bytes())
            .with_context(|| format!("cannot write {}", self.config_path.display()))?;
        debug!(targets = servers.len(), path = %self.config_path.display(), "prometheus targets rewritten");
        Ok(())
    }

    /// Ask the collector to reload its configuration. Best effort: failures
    /// are logged, never propagated.
    pub async fn reload(&self) {
        let url = format!("http://{}:{}/-/reload", self.host, self.port);
        match self.http.post(&url).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("prometheus reloaded");
            }
            Ok(response) => {
                warn!(%url, status = %response.status(), "prometheus reload failed");
            }
            Err(err) => {
                warn!(%url, ?err, "cannot request prometheus reload");
            }
        }
    }

    /// Run the usage aggregation. Malformed rows are skipped and logged
    /// individually; partial success is acceptable.
    pub async fn query(&self) -> anyhow::Result<Vec<UsageRow>> {
        let url = format!("http://{}:{}/api/v1/query", self.host, self.port);
        let response = self
            .http
            .get(&url)
            .query(&[("query", USAGE_QUERY)])
            .send()
            .await
            .with_context(|| format!("prometheus query request to {url}"))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("prometheus query failed: {status}");
        }

        let body: QueryResponse = response
            .json()
            .await
            .context("decode prometheus query response")?;

        let mut rows = Vec::with_capacity(body.data.result.len());
        for result in body.data.result {
            let dir = match result.metric.dir.as_str() {
                "c<p" => Direction::Download,
                "c>p" => Direction::Upload,
                other => {
                    warn!(dir = other, "skipping metric row with unknown direction");
                    continue;
                }
            };
            let proto = match result.metric.proto.as_str() {
                "tcp" => Proto::Tcp,
                "udp" => Proto::Udp,
                other => {
                    warn!(proto = other, "skipping metric row with unknown protocol");
                    continue;
                }
            };
            // Instant-vector values arrive as `[timestamp, "decimal"]`.
            let Some(bytes) = result
                .value
                .get(1)
                .and_then(|v| v.as_str())
                .and_then(|v| v.parse::<f64>().ok())
            else {
                warn!(value = %result.value, "skipping metric row with unparsable value");
                continue;
            };

            rows.push(UsageRow {
                key_id: result.metric.access_key,
                server_id: result.metric.service,
                dir,
                proto,
                bytes: bytes as u64,
            });
        }

        Ok(rows)
    }
}
