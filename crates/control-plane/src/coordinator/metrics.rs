use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use tracing::{debug, error, info};

use common::api::TrafficTotals;

use crate::prometheus::{Direction, Proto, UsageRow};

use super::Coordinator;

/// Per-server and per-key usage, rebuilt wholesale every metrics cycle.
#[derive(Debug, Default)]
pub struct FleetMetrics {
    pub servers: HashMap<String, TrafficTotals>,
    pub keys: HashMap<String, TrafficTotals>,
}

impl FleetMetrics {
    /// Fold aggregation rows into fresh maps.
    pub fn from_rows(rows: &[UsageRow]) -> Self {
        let mut metrics = FleetMetrics::default();
        for row in rows {
            record(metrics.servers.entry(row.server_id.clone()).or_default(), row);
            record(metrics.keys.entry(row.key_id.clone()).or_default(), row);
        }
        metrics
    }
}

fn record(totals: &mut TrafficTotals, row: &UsageRow) {
    match (row.dir, row.proto) {
        (Direction::Download, Proto::Tcp) => totals.down_tcp += row.bytes,
        (Direction::Download, Proto::Udp) => totals.down_udp += row.bytes,
        (Direction::Upload, Proto::Tcp) => totals.up_tcp += row.bytes,
        (Direction::Upload, Proto::Udp) => totals.up_udp += row.bytes,
    }
    totals.total += row.bytes;
}

impl Coordinator {
    /// The current usage maps. Readers see either the previous or the next
    /// cycle's maps, never a half-built one: replacement is one swap.
    pub fn metrics(&self) -> Arc<FleetMetrics> {
        self.fleet_metrics.load_full()
    }

    /// Run the usage aggregation, swap the maps in, and enforce quotas.
    /// Query failures degrade to keeping the previous maps.
    pub async fn collect_metrics(self: &Arc<Self>) {
        debug!("aggregating fleet usage");
        let rows = match self.prometheus.query().await {
            Ok(rows) => rows,
            Err(err) => {
                error!(?err, "prometheus query failed");
                counter!("shadowfleet_metrics_failures_total").increment(1);
                return;
            }
        };

        self.fleet_metrics
            .store(Arc::new(FleetMetrics::from_rows(&rows)));

        self.enforce_quotas().await;
    }

    /// Disable every enabled, quota-bearing key whose aggregated usage
    /// exceeds its quota; persist each flip and trigger a full fleet sync
    /// when anything changed.
    async fn enforce_quotas(self: &Arc<Self>) {
        let metrics = self.metrics();
        let mut disabled_any = false;

        for mut key in self.db.keys().await {
            if !key.enabled || key.quota == 0 {
                continue;
            }
            let Some(usage) = metrics.keys.get(&key.id) else {
                continue;
            };
            if usage.total / 1_000_000 > key.quota {
                info!(
                    key = %key.id,
                    used_mb = usage.total / 1_000_000,
                    quota_mb = key.quota,
                    "quota exceeded; disabling key"
                );
                key.enabled = false;
                match self.db.update_key(key).await {
                    Ok(Some(_)) => {
                        disabled_any = true;
                        counter!("shadowfleet_quota_disables_total").increment(1);
                    }
                    Ok(None) => {}
                    Err(err) => error!(?err, "cannot disable key over quota"),
                }
            }
        }

        if disabled_any {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.sync().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(key: &str, server: &str, dir: Direction, proto: Proto, bytes: u64) -> UsageRow {
        UsageRow {
            key_id: key.into(),
            server_id: server.into(),
            dir,
            proto,
            bytes,
        }
    }

    #[test]
    fn rows_fold_into_both_maps() {
        let rows = vec![
            row("k-1", "s-0", Direction::Download, Proto::Tcp, 100),
            row("k-1", "s-1", Direction::Upload, Proto::Tcp, 40),
            row("k-2", "s-0", Direction::Download, Proto::Udp, 7),
            row("k-1", "s-0", Direction::Upload, Proto::Udp, 3),
        ];
        let metrics = FleetMetrics::from_rows(&rows);

        let k1 = metrics.keys.get("k-1").expect("k-1");
        assert_eq!(k1.down_tcp, 100);
        assert_eq!(k1.up_tcp, 40);
        assert_eq!(k1.up_udp, 3);
        assert_eq!(k1.total, 143);

        let s0 = metrics.servers.get("s-0").expect("s-0");
        assert_eq!(s0.down_tcp, 100);
        assert_eq!(s0.down_udp, 7);
        assert_eq!(s0.up_udp, 3);
        assert_eq!(s0.total, 110);

        assert_eq!(metrics.servers.get("s-1").expect("s-1").total, 40);
    }

    #[test]
    fn empty_rows_produce_empty_maps() {
        let metrics = FleetMetrics::from_rows(&[]);
        assert!(metrics.servers.is_empty());
        assert!(metrics.keys.is_empty());
    }
}
