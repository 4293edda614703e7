use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::info;
use tokio::sync::mpsc;

use crate::cluster::Cluster;
use crate::humanfmt::HumanFmt;

/// Producers drop records instead of blocking when this many are queued.
pub(crate) const RECORD_CHANNEL_CAPACITY: usize = 1024;

const DISABLED_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// One served download request, as reported by the access middleware.
#[derive(Clone, Debug)]
pub(crate) struct AccessMetric {
    /// Wall-clock seconds spent serving the request.
    pub(crate) used: f64,
    pub(crate) bytes: f64,
    /// Trimmed user-agent product token.
    pub(crate) ua: String,
    /// Partial requests do not count towards the per-UA histogram.
    pub(crate) is_range: bool,
}

/// Counters persisted across aggregation windows, reported to the authority
/// and rendered on the dashboard.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    pub(crate) accesses: RwLock<HashMap<String, i64>>,
}

/// Long-lived accounting task. Starts counting once the cluster is first
/// enabled, folds a summary into the shared stats every minute, and clears
/// itself on every disable. A node left disabled for a full hour is not
/// coming back in this process, so the task then terminates.
pub(crate) async fn run_aggregator(cluster: Arc<Cluster>, mut records: mpsc::Receiver<AccessMetric>) {
    let mut enabled = cluster.subscribe_enabled();
    let mut enabled_recheck = enabled.clone();
    if enabled.wait_for(|en| *en).await.is_err() {
        return;
    }

    let mut flush_ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + Duration::from_secs(60),
        Duration::from_secs(60),
    );
    flush_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut total: i64 = 0;
    let mut total_used: f64 = 0.0;
    let mut total_bytes: f64 = 0.0;
    let mut uas: HashMap<String, i64> = HashMap::with_capacity(10);

    loop {
        tokio::select! {
            _ = flush_ticker.tick() => {
                let mut accesses = cluster
                    .stats
                    .accesses
                    .write()
                    .expect("other users should not panic");

                info!(
                    "Served {total} requests, total response body = {}, total used time = {total_used:.2}s",
                    HumanFmt::Bytes(total_bytes)
                );
                for (ua, count) in uas.drain() {
                    let key = if ua.is_empty() {
                        String::from("[Unknown]")
                    } else {
                        ua
                    };
                    *accesses.entry(key).or_default() += count;
                }

                total = 0;
                total_used = 0.0;
                total_bytes = 0.0;
            }
            record = records.recv() => {
                let Some(record) = record else { return };
                total += 1;
                total_used += record.used;
                total_bytes += record.bytes;
                if !record.is_range {
                    *uas.entry(record.ua).or_default() += 1;
                }
            }
            disabled_ok = async { enabled.wait_for(|en| !*en).await.is_ok() } => {
                if !disabled_ok {
                    return;
                }

                total = 0;
                total_used = 0.0;
                total_bytes = 0.0;
                uas.clear();

                let reenabled_ok = match tokio::time::timeout(
                    DISABLED_SHUTDOWN_TIMEOUT,
                    async { enabled_recheck.wait_for(|en| *en).await.is_ok() },
                ).await {
                    Ok(ok) => ok, // re-enabled, resume with zeroed state
                    Err(_) => false,
                };
                if !reenabled_ok {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Cluster;
    use crate::config::Config;

    fn test_cluster() -> (Arc<Cluster>, mpsc::Receiver<AccessMetric>) {
        let config: &'static Config = Box::leak(Box::new(Config::default()));
        let slots = Arc::new(crate::bufslots::BufSlots::new(crate::nonzero!(1)));
        Cluster::new(config, Vec::new(), Vec::new(), slots, None)
    }

    async fn settle<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flush_folds_ua_histogram() {
        let (cluster, records) = test_cluster();
        let task = tokio::spawn(run_aggregator(Arc::clone(&cluster), records));

        cluster.enable();
        let tx = cluster.record_sender();
        tx.send(AccessMetric {
            used: 0.2,
            bytes: 5.0,
            ua: "curl".to_string(),
            is_range: false,
        })
        .await
        .unwrap();
        tx.send(AccessMetric {
            used: 0.1,
            bytes: 7.0,
            ua: String::new(),
            is_range: false,
        })
        .await
        .unwrap();
        /* range requests count bytes but not the UA */
        tx.send(AccessMetric {
            used: 0.1,
            bytes: 3.0,
            ua: "curl".to_string(),
            is_range: true,
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_secs(65)).await;
        settle(|| !cluster.stats.accesses.read().unwrap().is_empty()).await;

        {
            let accesses = cluster.stats.accesses.read().unwrap();
            assert_eq!(accesses.get("curl"), Some(&1));
            assert_eq!(accesses.get("[Unknown]"), Some(&1));
        }

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn disable_clears_and_reenable_resumes() {
        let (cluster, records) = test_cluster();
        let task = tokio::spawn(run_aggregator(Arc::clone(&cluster), records));

        cluster.enable();
        let tx = cluster.record_sender();
        tx.send(AccessMetric {
            used: 0.2,
            bytes: 5.0,
            ua: "stale".to_string(),
            is_range: false,
        })
        .await
        .unwrap();
        settle(|| tx.capacity() == RECORD_CHANNEL_CAPACITY).await;

        cluster.disable();
        tokio::task::yield_now().await;
        cluster.enable();
        tx.send(AccessMetric {
            used: 0.2,
            bytes: 5.0,
            ua: "fresh".to_string(),
            is_range: false,
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_secs(65)).await;
        settle(|| !cluster.stats.accesses.read().unwrap().is_empty()).await;

        {
            let accesses = cluster.stats.accesses.read().unwrap();
            assert_eq!(accesses.get("stale"), None);
            assert_eq!(accesses.get("fresh"), Some(&1));
        }

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn terminates_after_an_hour_disabled() {
        let (cluster, records) = test_cluster();
        let task = tokio::spawn(run_aggregator(Arc::clone(&cluster), records));

        cluster.enable();
        tokio::task::yield_now().await;
        cluster.disable();

        tokio::time::sleep(DISABLED_SHUTDOWN_TIMEOUT + Duration::from_secs(1)).await;
        settle(|| task.is_finished()).await;
        assert!(task.is_finished());
    }
}
