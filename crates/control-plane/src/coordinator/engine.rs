use anyhow::Context;
use metrics::counter;
use tracing::debug;

use crate::supervisor::EngineKey;

use super::Coordinator;

impl Coordinator {
    /// Project all enabled keys into the engine's key file. With
    /// `reconfigure` the running engine is hot-reloaded as well; explicit
    /// resyncs pass `true`, which also bypasses the staleness guard.
    pub async fn sync_local_keys(&self, reconfigure: bool) -> anyhow::Result<()> {
        if !reconfigure && self.local_sync_is_fresh().await {
            debug!("key table unchanged since last local sync; skipping");
            return Ok(());
        }

        let settings = self.db.settings().await;
        let keys: Vec<EngineKey> = self
            .db
            .keys()
            .await
            .into_iter()
            .filter(|k| k.enabled)
            .map(|k| EngineKey {
                id: k.id,
                port: settings.shadowsocks_port,
                cipher: k.cipher,
                secret: k.secret,
            })
            .collect();

        debug!(keys = keys.len(), "syncing keys with the local engine");
        self.engine
            .update_config(&keys)
            .await
            .context("cannot sync keys with the local engine")?;

        if reconfigure {
            self.engine
                .reconfigure()
                .await
                .context("cannot reload the local engine")?;
        }

        self.stamp_synced_at();
        counter!("shadowfleet_local_syncs_total").increment(1);
        Ok(())
    }

    async fn local_sync_is_fresh(&self) -> bool {
        let Some(synced_at) = self.synced_at() else {
            return false;
        };
        match self.db.keys_updated_at().await {
            Some(updated_at) => synced_at > updated_at,
            None => true,
        }
    }
}
