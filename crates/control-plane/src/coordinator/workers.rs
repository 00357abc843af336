use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use super::Coordinator;

impl Coordinator {
    /// Launch the two periodic workers: a fast pull-based health check and
    /// the slower full reconciliation (pull + metrics + push). Both job
    /// sets also run once immediately.
    ///
    /// Ticks spawn their jobs without waiting for a previous tick to
    /// finish; overlapping in-flight requests against a slow peer are an
    /// accepted trade-off for liveness.
    pub fn spawn_workers(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        self.spawn_pull_jobs();
        self.spawn_sync_jobs();

        let pull_worker = {
            let this = Arc::clone(self);
            let shutdown = shutdown.clone();
            let period = Duration::from_secs(this.cfg.workers.pull_interval_secs);
            tokio::spawn(async move {
                ticker(this, shutdown, period, Coordinator::spawn_pull_jobs).await;
                debug!("pull worker stopped");
            })
        };

        let sync_worker = {
            let this = Arc::clone(self);
            let period = Duration::from_secs(this.cfg.workers.sync_interval_secs);
            tokio::spawn(async move {
                ticker(this, shutdown, period, Coordinator::spawn_sync_jobs).await;
                debug!("sync worker stopped");
            })
        };

        vec![pull_worker, sync_worker]
    }

    fn spawn_pull_jobs(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.pull_all().await;
        });
    }

    fn spawn_sync_jobs(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.pull_all().await;
        });
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.collect_metrics().await;
        });
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.push_all().await;
        });
    }
}

async fn ticker(
    coordinator: Arc<Coordinator>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
    jobs: fn(&Arc<Coordinator>),
) {
    let mut interval = tokio::time::interval(period);
    // The first tick fires immediately and the jobs already ran once.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => jobs(&coordinator),
        }
    }
}
