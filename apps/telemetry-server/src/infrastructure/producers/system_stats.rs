//! Host statistics for the `OTHERS` target.
//!
//! Serves `proc/uptime`, `proc/loadavg`, and `proc/meminfo`, each sampled
//! from the procfs file of the same name and encoded as JSON-IETF.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{Producer, ProducerError, SessionQueue};
use crate::domain::streaming::{DeliveryItem, Value, now_nanos};
use crate::domain::subscription::{ParsedSubscription, path_to_string};
use crate::infrastructure::metrics;
use crate::proto::{Path, TypedValue, typed_value};

/// Where and how often statistics are sampled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemStatsConfig {
    /// Root of the procfs tree.
    pub proc_root: PathBuf,
    /// STREAM sample interval when the subscription names none.
    pub default_interval: Duration,
}

impl Default for SystemStatsConfig {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            default_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stat {
    Uptime,
    LoadAvg,
    MemInfo,
}

impl Stat {
    fn from_path(path: &str) -> Option<Self> {
        match path.trim_matches('/') {
            "proc/uptime" => Some(Self::Uptime),
            "proc/loadavg" => Some(Self::LoadAvg),
            "proc/meminfo" => Some(Self::MemInfo),
            _ => None,
        }
    }

    const fn file(self) -> &'static str {
        match self {
            Self::Uptime => "uptime",
            Self::LoadAvg => "loadavg",
            Self::MemInfo => "meminfo",
        }
    }

    fn parse(self, raw: &str) -> Result<serde_json::Value, String> {
        let json = match self {
            Self::Uptime => serde_json::to_value(parse_uptime(raw)?),
            Self::LoadAvg => serde_json::to_value(parse_loadavg(raw)?),
            Self::MemInfo => serde_json::to_value(parse_meminfo(raw)),
        };
        json.map_err(|e| e.to_string())
    }
}

#[derive(Debug, PartialEq, Serialize)]
struct Uptime {
    total_seconds: f64,
    idle_seconds: f64,
}

#[derive(Debug, PartialEq, Serialize)]
struct LoadAvg {
    load_1: f64,
    load_5: f64,
    load_15: f64,
    running: u64,
    total: u64,
}

fn parse_uptime(raw: &str) -> Result<Uptime, String> {
    let mut fields = raw.split_whitespace().map(str::parse::<f64>);
    match (fields.next(), fields.next()) {
        (Some(Ok(total_seconds)), Some(Ok(idle_seconds))) => Ok(Uptime {
            total_seconds,
            idle_seconds,
        }),
        _ => Err(format!("malformed uptime: {raw:?}")),
    }
}

fn parse_loadavg(raw: &str) -> Result<LoadAvg, String> {
    let malformed = || format!("malformed loadavg: {raw:?}");
    let fields: Vec<&str> = raw.split_whitespace().collect();
    let [one, five, fifteen, tasks, ..] = fields.as_slice() else {
        return Err(malformed());
    };
    let (running, total) = tasks.split_once('/').ok_or_else(malformed)?;

    Ok(LoadAvg {
        load_1: one.parse().map_err(|_| malformed())?,
        load_5: five.parse().map_err(|_| malformed())?,
        load_15: fifteen.parse().map_err(|_| malformed())?,
        running: running.parse().map_err(|_| malformed())?,
        total: total.parse().map_err(|_| malformed())?,
    })
}

/// `Key: value kB` lines to a map of numeric values; unparsable lines are skipped.
fn parse_meminfo(raw: &str) -> BTreeMap<String, u64> {
    raw.lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let value = rest.split_whitespace().next()?.parse().ok()?;
            Some((key.trim().to_string(), value))
        })
        .collect()
}

/// Producer of host statistics for one session.
pub struct SystemStatsProducer {
    proc_root: PathBuf,
    prefix: Path,
    stats: Vec<(Path, Stat)>,
    interval: Duration,
    sent: AtomicU64,
    failed: AtomicU64,
}

impl SystemStatsProducer {
    /// Create a producer for the paths of `subscription`.
    ///
    /// # Errors
    ///
    /// Returns `ProducerError::InvalidPath` for a path this producer does not serve.
    pub fn new(
        config: SystemStatsConfig,
        subscription: &ParsedSubscription,
    ) -> Result<Self, ProducerError> {
        let stats = subscription
            .paths
            .iter()
            .map(|path| {
                let name = path_to_string(path);
                Stat::from_path(&name)
                    .map(|stat| (path.clone(), stat))
                    .ok_or(ProducerError::InvalidPath(name))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let interval = subscription
            .list
            .subscription
            .iter()
            .map(|s| s.sample_interval)
            .filter(|&ns| ns > 0)
            .min()
            .map_or(config.default_interval, Duration::from_nanos);

        Ok(Self {
            proc_root: config.proc_root,
            prefix: subscription.prefix.clone(),
            stats,
            interval,
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    /// STREAM sample interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    async fn sample(&self) -> Vec<DeliveryItem> {
        let mut items = Vec::with_capacity(self.stats.len());
        for (path, stat) in &self.stats {
            let file = self.proc_root.join(stat.file());
            let parsed = match tokio::fs::read_to_string(&file).await {
                Ok(raw) => stat.parse(&raw),
                Err(e) => Err(format!("failed to read {}: {e}", file.display())),
            };
            let value = match parsed {
                Ok(json) => Value::update(
                    Some(self.prefix.clone()),
                    path.clone(),
                    TypedValue {
                        value: Some(typed_value::Value::JsonIetfVal(json.to_string().into_bytes())),
                    },
                ),
                Err(message) => Value::fatal(message),
            };
            items.push(value.into());
        }
        items
    }

    async fn batch(&self, queue: &SessionQueue) -> bool {
        let mut items = self.sample().await;
        items.push(Value::sync().into());
        queue.put(items).await.is_ok()
    }
}

#[async_trait]
impl Producer for SystemStatsProducer {
    async fn stream_run(
        &self,
        queue: Arc<SessionQueue>,
        stop: CancellationToken,
        _subscription: &ParsedSubscription,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut synced = false;

        loop {
            tokio::select! {
                () = stop.cancelled() => return,
                _ = ticker.tick() => {
                    let mut items = self.sample().await;
                    if !synced {
                        items.push(Value::sync().into());
                        synced = true;
                    }
                    if queue.put(items).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn poll_run(
        &self,
        queue: Arc<SessionQueue>,
        mut polls: mpsc::Receiver<()>,
        _subscription: &ParsedSubscription,
    ) {
        while polls.recv().await.is_some() {
            if !self.batch(&queue).await {
                return;
            }
        }
    }

    async fn once_run(
        &self,
        queue: Arc<SessionQueue>,
        mut once: mpsc::Receiver<()>,
        _subscription: &ParsedSubscription,
    ) {
        if once.recv().await.is_some() {
            self.batch(&queue).await;
        }
    }

    fn sent_one(&self, value: &Value) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        let latency = now_nanos().saturating_sub(value.timestamp);
        metrics::record_send_latency(Duration::from_nanos(u64::try_from(latency).unwrap_or(0)));
    }

    fn failed_send(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn close(&self) {
        tracing::debug!(
            sent = self.sent.load(Ordering::Relaxed),
            failed = self.failed.load(Ordering::Relaxed),
            "System stats producer closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::domain::queue::DeliveryQueue;
    use crate::proto::{SubscribeRequest, Subscription, SubscriptionList, subscribe_request};

    const MEMINFO: &str = "MemTotal:       16318756 kB\nMemFree:         1234567 kB\nHugePages_Total:       0\n";

    fn proc_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("uptime"), "350735.47 234388.90\n").unwrap();
        fs::write(dir.path().join("loadavg"), "0.25 0.50 0.75 2/612 48213\n").unwrap();
        fs::write(dir.path().join("meminfo"), MEMINFO).unwrap();
        dir
    }

    fn subscription(paths: &[&str], sample_interval: u64) -> ParsedSubscription {
        let request = SubscribeRequest {
            request: Some(subscribe_request::Request::Subscribe(SubscriptionList {
                prefix: Some(Path {
                    target: "OTHERS".to_string(),
                    ..Default::default()
                }),
                subscription: paths
                    .iter()
                    .map(|p| Subscription {
                        path: Some(Path {
                            element: p.split('/').map(ToString::to_string).collect(),
                            ..Default::default()
                        }),
                        sample_interval,
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            })),
        };
        ParsedSubscription::from_request(&request).unwrap()
    }

    fn producer(dir: &tempfile::TempDir, paths: &[&str]) -> SystemStatsProducer {
        let config = SystemStatsConfig {
            proc_root: dir.path().to_path_buf(),
            default_interval: Duration::from_millis(10),
        };
        SystemStatsProducer::new(config, &subscription(paths, 0)).unwrap()
    }

    fn json(item: &DeliveryItem) -> serde_json::Value {
        let DeliveryItem::Value(value) = item else {
            panic!("expected a value");
        };
        let Some(TypedValue {
            value: Some(typed_value::Value::JsonIetfVal(bytes)),
        }) = &value.val
        else {
            panic!("expected JSON-IETF, got {value:?}");
        };
        serde_json::from_slice(bytes).unwrap()
    }

    #[test]
    fn parses_proc_files() {
        assert_eq!(
            parse_uptime("350735.47 234388.90\n").unwrap(),
            Uptime {
                total_seconds: 350_735.47,
                idle_seconds: 234_388.90
            }
        );
        assert_eq!(
            parse_loadavg("0.25 0.50 0.75 2/612 48213").unwrap(),
            LoadAvg {
                load_1: 0.25,
                load_5: 0.5,
                load_15: 0.75,
                running: 2,
                total: 612
            }
        );
        let mem = parse_meminfo(MEMINFO);
        assert_eq!(mem.get("MemTotal"), Some(&16_318_756));
        assert_eq!(mem.get("HugePages_Total"), Some(&0));
        assert!(parse_uptime("garbage").is_err());
        assert!(parse_loadavg("0.1 0.2").is_err());
    }

    #[test]
    fn sample_interval_from_subscription() {
        let dir = proc_root();
        let config = SystemStatsConfig {
            proc_root: dir.path().to_path_buf(),
            default_interval: Duration::from_secs(1),
        };
        let p = SystemStatsProducer::new(config.clone(), &subscription(&["proc/uptime"], 0)).unwrap();
        assert_eq!(p.interval(), Duration::from_secs(1));

        let p = SystemStatsProducer::new(config, &subscription(&["proc/uptime"], 250_000_000)).unwrap();
        assert_eq!(p.interval(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn poll_batch_ends_with_sync() {
        let dir = proc_root();
        let p = producer(&dir, &["proc/uptime", "proc/loadavg", "proc/meminfo"]);
        let queue = Arc::new(DeliveryQueue::new(16));
        let (tx, rx) = mpsc::channel(1);
        tx.send(()).await.unwrap();
        drop(tx);

        p.poll_run(Arc::clone(&queue), rx, &subscription(&["proc/uptime"], 0)).await;

        let items = queue.get(16).await.unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(json(&items[0])["total_seconds"], 350_735.47);
        assert_eq!(json(&items[1])["running"], 2);
        assert_eq!(json(&items[2])["MemFree"], 1_234_567);
        assert!(matches!(&items[3], DeliveryItem::Value(v) if v.sync_response));
    }

    #[tokio::test]
    async fn missing_file_is_fatal() {
        let dir = proc_root();
        fs::remove_file(dir.path().join("loadavg")).unwrap();
        let p = producer(&dir, &["proc/loadavg"]);
        let queue = Arc::new(DeliveryQueue::new(4));
        let (tx, rx) = mpsc::channel(1);
        tx.send(()).await.unwrap();

        p.once_run(Arc::clone(&queue), rx, &subscription(&["proc/uptime"], 0)).await;

        let items = queue.get(4).await.unwrap();
        assert!(matches!(&items[0], DeliveryItem::Value(v) if v.fatal.is_some()));
    }

    #[tokio::test]
    async fn stream_syncs_once_and_stops_on_cancel() {
        let dir = proc_root();
        let p = Arc::new(producer(&dir, &["proc/uptime"]));
        let queue = Arc::new(DeliveryQueue::new(64));
        let stop = CancellationToken::new();

        let task = {
            let (p, queue, stop) = (Arc::clone(&p), Arc::clone(&queue), stop.clone());
            tokio::spawn(async move { p.stream_run(queue, stop, &subscription(&["proc/uptime"], 0)).await })
        };
        tokio::time::sleep(Duration::from_millis(60)).await;
        stop.cancel();
        task.await.unwrap();

        let items = queue.get(64).await.unwrap();
        let syncs = items
            .iter()
            .filter(|i| matches!(i, DeliveryItem::Value(v) if v.sync_response))
            .count();
        assert_eq!(syncs, 1);
        assert!(items.len() >= 3);
    }
}
