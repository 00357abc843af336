use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use metrics::counter;
use reqwest::StatusCode;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use common::api::{LOCAL_SERVER_ID, Key, PeerOutcome, PeerSettings, Server, ServerStatus};

use super::Coordinator;

impl Coordinator {
    /// Rewrite the collector's scrape targets over all peers plus the node
    /// itself, then fan out a key push to every peer in the background.
    pub async fn sync_server_targets(self: &Arc<Self>, reconfigure: bool) -> anyhow::Result<()> {
        let mut targets = BTreeMap::new();
        targets.insert(
            LOCAL_SERVER_ID.to_string(),
            format!("127.0.0.1:{}", self.cfg.server.port),
        );
        for server in self.db.servers().await {
            targets.insert(
                server.id.clone(),
                format!("{}:{}", server.http_host, server.http_port),
            );
        }

        self.prometheus
            .update_targets(&targets)
            .context("cannot update prometheus scrape targets")?;
        if reconfigure {
            self.prometheus.reload().await;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.push_all().await;
        });
        Ok(())
    }

    /// Pull every peer's settings concurrently; one tick of the fleet
    /// health check. Awaitable so tests can drive a full cycle.
    pub async fn pull_all(self: &Arc<Self>) {
        let mut jobs: Vec<JoinHandle<()>> = Vec::new();
        for server in self.db.servers().await {
            let this = Arc::clone(self);
            jobs.push(tokio::spawn(async move { this.pull_server(server).await }));
        }
        for job in jobs {
            let _ = job.await;
        }
    }

    /// Push the full key set to every peer concurrently.
    pub async fn push_all(self: &Arc<Self>) {
        let mut jobs: Vec<JoinHandle<()>> = Vec::new();
        for server in self.db.servers().await {
            let this = Arc::clone(self);
            jobs.push(tokio::spawn(async move { this.push_server(server).await }));
        }
        for job in jobs {
            let _ = job.await;
        }
    }

    async fn pull_server(&self, mut server: Server) {
        let url = format!("http://{}:{}/v1/settings", server.http_host, server.http_port);
        debug!(server = %server.id, %url, "pulling peer settings");

        let response = match self
            .http
            .get(&url)
            .bearer_auth(&server.api_token)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(server = %server.id, %url, ?err, "cannot pull peer");
                counter!("shadowfleet_pull_failures_total").increment(1);
                self.apply_outcome(server, PeerOutcome::Unreachable).await;
                return;
            }
        };

        match response.status() {
            StatusCode::UNAUTHORIZED => {
                warn!(server = %server.id, "peer rejected our api token");
                self.apply_outcome(server, PeerOutcome::Denied).await;
            }
            StatusCode::OK => match response.json::<PeerSettings>().await {
                Ok(peer) => {
                    server.status = ServerStatus::from_outcome(PeerOutcome::Synced);
                    server.shadowsocks_enabled = peer.shadowsocks_enabled;
                    server.shadowsocks_host = peer.shadowsocks_host;
                    server.shadowsocks_port = peer.shadowsocks_port;
                    self.persist_server(server).await;
                }
                Err(err) => {
                    warn!(server = %server.id, ?err, "cannot parse pulled peer settings");
                    counter!("shadowfleet_pull_failures_total").increment(1);
                    self.apply_outcome(server, PeerOutcome::Unreachable).await;
                }
            },
            status => {
                warn!(server = %server.id, %status, "unexpected pull status");
                counter!("shadowfleet_pull_failures_total").increment(1);
                self.apply_outcome(server, PeerOutcome::Unreachable).await;
            }
        }
    }

    async fn push_server(&self, mut server: Server) {
        let url = format!(
            "http://{}:{}/v1/keys/refill",
            server.http_host, server.http_port
        );
        let keys: Vec<Key> = self.db.keys().await;
        debug!(server = %server.id, %url, keys = keys.len(), "pushing keys to peer");

        let response = match self
            .http
            .post(&url)
            .bearer_auth(&server.api_token)
            .json(&keys)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(server = %server.id, %url, ?err, "cannot push keys to peer");
                counter!("shadowfleet_push_failures_total").increment(1);
                self.apply_outcome(server, PeerOutcome::Unreachable).await;
                return;
            }
        };

        match response.status() {
            StatusCode::UNAUTHORIZED => {
                warn!(server = %server.id, "peer rejected our api token");
                self.apply_outcome(server, PeerOutcome::Denied).await;
            }
            StatusCode::NO_CONTENT => {
                server.status = ServerStatus::from_outcome(PeerOutcome::Synced);
                server.synced_at = Some(Utc::now());
                self.persist_server(server).await;
            }
            status => {
                warn!(server = %server.id, %status, "unexpected push status");
                counter!("shadowfleet_push_failures_total").increment(1);
                self.apply_outcome(server, PeerOutcome::Unreachable).await;
            }
        }
    }

    async fn apply_outcome(&self, mut server: Server, outcome: PeerOutcome) {
        server.status = ServerStatus::from_outcome(outcome);
        self.persist_server(server).await;
    }

    async fn persist_server(&self, server: Server) {
        match self.db.update_server(server.clone()).await {
            Ok(Some(_)) => {}
            Ok(None) => debug!(server = %server.id, "peer deleted before its state was applied"),
            Err(err) => error!(server = %server.id, ?err, "cannot persist peer state"),
        }
    }
}
