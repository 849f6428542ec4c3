//! Perf telemetry client: bounded, non-blocking stat submission, aggregated by
//! (id, key, time span) and delivered in batches to a [`PerfReporter`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::StackConfig;
use crate::logging::{LogBridge, LogSink};
use crate::stack::{NetworkStack, StackBootstrap, StartError};
use crate::{log_debug, log_info, log_warn};

/// Default time-span slot width.
pub const DEFAULT_SPAN_MINUTES: u32 = 60;
const MAX_SPAN_MINUTES: u32 = 24 * 60;
/// Log a drop on the first occurrence and then every this many.
const DROP_LOG_EVERY: u64 = 100;
const STOP_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum PerfError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("rejected by collector: {0}")]
    Rejected(String),
}

/// Delivers aggregated batches to a collection backend. May block; it runs on
/// a worker thread.
pub trait PerfReporter: Send + Sync {
    fn report(&self, batch: &PerfBatch) -> Result<(), PerfError>;
}

/// One submitted statistic. Error code 0 means success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerfStat {
    pub id: String,
    pub key: String,
    pub byte_count: u64,
    pub error_code: u32,
    pub name: String,
    pub value: u64,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerfOptions {
    /// Bound on stats waiting for the aggregator. Further submissions are dropped.
    pub queue_capacity: usize,
    pub flush_interval: Duration,
    /// Flush early once this many groups accumulate.
    pub max_batch: usize,
    /// Slot width in minutes, 1..=1440. Anything else means 60.
    pub span_minutes: u32,
}

impl Default for PerfOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            flush_interval: Duration::from_secs(60),
            max_batch: 256,
            span_minutes: DEFAULT_SPAN_MINUTES,
        }
    }
}

impl PerfOptions {
    pub fn span_minutes(&self) -> u32 {
        if (1..=MAX_SPAN_MINUTES).contains(&self.span_minutes) {
            self.span_minutes
        } else {
            DEFAULT_SPAN_MINUTES
        }
    }
}

/// UTC date plus the start of the slot a stat falls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeSpan {
    pub date: NaiveDate,
    pub start: NaiveTime,
}

impl TimeSpan {
    pub fn of(at: DateTime<Utc>, span_minutes: u32) -> Self {
        let span = span_minutes.max(1);
        let minute_of_day = at.hour() * 60 + at.minute();
        let slot = minute_of_day / span * span;
        Self {
            date: at.date_naive(),
            start: NaiveTime::from_hms_opt(slot / 60, slot % 60, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueStats {
    pub count: u64,
    pub total: u64,
    pub avg: u64,
    pub min: u64,
    pub max: u64,
}

impl ValueStats {
    fn record(&mut self, v: u64) {
        if self.count == 0 {
            self.min = v;
            self.max = v;
        } else {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
        self.count += 1;
        self.total = self.total.saturating_add(v);
        self.avg = self.total / self.count;
    }
}

/// Aggregate of every stat sharing (id, key, span).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerfSummary {
    pub id: String,
    pub key: String,
    pub span: TimeSpan,
    pub success: u64,
    pub failed: u64,
    pub errors: BTreeMap<u32, u64>,
    pub bytes: ValueStats,
    pub values: BTreeMap<String, ValueStats>,
}

impl PerfSummary {
    fn new(id: String, key: String, span: TimeSpan) -> Self {
        Self {
            id,
            key,
            span,
            success: 0,
            failed: 0,
            errors: BTreeMap::new(),
            bytes: ValueStats::default(),
            values: BTreeMap::new(),
        }
    }

    pub fn total(&self) -> u64 {
        self.success + self.failed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerfBatch {
    pub batch_id: Uuid,
    pub owner_id: String,
    pub dec_id: String,
    pub client_address: String,
    pub created_at: DateTime<Utc>,
    pub summaries: Vec<PerfSummary>,
}

impl PerfBatch {
    /// Number of stats folded into this batch.
    pub fn stat_count(&self) -> u64 {
        self.summaries.iter().map(PerfSummary::total).sum()
    }
}

/// Groups stats in memory until taken.
#[derive(Debug, Default)]
pub struct PerfAggregator {
    span_minutes: u32,
    groups: BTreeMap<(String, String, TimeSpan), PerfSummary>,
}

impl PerfAggregator {
    pub fn new(span_minutes: u32) -> Self {
        Self {
            span_minutes,
            groups: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, stat: &PerfStat) {
        let span = TimeSpan::of(stat.submitted_at, self.span_minutes);
        let summary = self
            .groups
            .entry((stat.id.clone(), stat.key.clone(), span))
            .or_insert_with(|| PerfSummary::new(stat.id.clone(), stat.key.clone(), span));
        if stat.error_code == 0 {
            summary.success += 1;
        } else {
            summary.failed += 1;
        }
        *summary.errors.entry(stat.error_code).or_insert(0) += 1;
        summary.bytes.record(stat.byte_count);
        if !stat.name.is_empty() {
            summary
                .values
                .entry(stat.name.clone())
                .or_default()
                .record(stat.value);
        }
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn take(&mut self) -> Vec<PerfSummary> {
        std::mem::take(&mut self.groups).into_values().collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfCounters {
    pub submitted: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub failed_batches: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    failed_batches: AtomicU64,
}

struct Identity {
    owner_id: String,
    dec_id: String,
    client_address: String,
}

struct Running {
    tx: mpsc::Sender<PerfStat>,
    runtime: Runtime,
    flushed: std::sync::mpsc::Receiver<()>,
}

struct PerfState {
    running: Option<Running>,
    starting: bool,
    bridge: LogBridge,
}

struct PerfInner {
    bootstrap: StackBootstrap,
    reporter: Arc<dyn PerfReporter>,
    options: PerfOptions,
    counters: Arc<Counters>,
    state: Mutex<PerfState>,
}

impl Drop for PerfInner {
    fn drop(&mut self) {
        if let Some(running) = self.state.get_mut().running.take() {
            drop(running.tx);
            running.runtime.shutdown_background();
        }
    }
}

/// Telemetry client handle. Clones share the same channel.
#[derive(Clone)]
pub struct PerfClient {
    inner: Arc<PerfInner>,
}

impl PerfClient {
    pub fn new(stack: Arc<dyn NetworkStack>, reporter: Arc<dyn PerfReporter>) -> Self {
        Self::with_options(stack, reporter, PerfOptions::default())
    }

    pub fn with_options(
        stack: Arc<dyn NetworkStack>,
        reporter: Arc<dyn PerfReporter>,
        options: PerfOptions,
    ) -> Self {
        Self::from_bootstrap(StackBootstrap::new(stack), reporter, options)
    }

    pub(crate) fn from_bootstrap(
        bootstrap: StackBootstrap,
        reporter: Arc<dyn PerfReporter>,
        options: PerfOptions,
    ) -> Self {
        Self {
            inner: Arc::new(PerfInner {
                bootstrap,
                reporter,
                options,
                counters: Arc::new(Counters::default()),
                state: Mutex::new(PerfState {
                    running: None,
                    starting: false,
                    bridge: LogBridge::disabled(),
                }),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running.is_some()
    }

    /// Launch the client's stack and the aggregation worker.
    pub fn start(
        &self,
        owner_id: &str,
        dec_id: &str,
        client_address: &str,
        config: StackConfig,
        sink: Arc<dyn LogSink>,
    ) -> Result<(), StartError> {
        {
            let mut st = self.inner.state.lock();
            if st.starting || st.running.is_some() {
                return Err(StartError::AlreadyStarted);
            }
            st.starting = true;
        }
        let bridge = LogBridge::new(sink, config.level_filter());
        let result = self.launch(owner_id, dec_id, client_address, config, &bridge);
        let mut st = self.inner.state.lock();
        st.starting = false;
        match result {
            Ok(running) => {
                st.running = Some(running);
                st.bridge = bridge.clone();
                drop(st);
                log_info!(
                    bridge,
                    "perf client started: owner={}, dec={}, client={}",
                    owner_id,
                    dec_id,
                    client_address
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn launch(
        &self,
        owner_id: &str,
        dec_id: &str,
        client_address: &str,
        config: StackConfig,
        bridge: &LogBridge,
    ) -> Result<Running, StartError> {
        self.inner
            .bootstrap
            .start_with_bridge(config, bridge.clone())?;

        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("ood-perf")
            .enable_time()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                self.inner.bootstrap.stop();
                return Err(StartError::Runtime(e.to_string()));
            }
        };

        let (tx, rx) = mpsc::channel(self.inner.options.queue_capacity.max(1));
        let (flushed_tx, flushed) = std::sync::mpsc::channel();
        let worker = Aggregation {
            identity: Identity {
                owner_id: owner_id.to_owned(),
                dec_id: dec_id.to_owned(),
                client_address: client_address.to_owned(),
            },
            reporter: self.inner.reporter.clone(),
            options: self.inner.options,
            counters: self.inner.counters.clone(),
            bridge: bridge.clone(),
        };
        runtime.spawn(async move {
            worker.run(rx).await;
            let _ = flushed_tx.send(());
        });
        Ok(Running {
            tx,
            runtime,
            flushed,
        })
    }

    /// Queue one stat. Never blocks: when the queue is full or the client is not
    /// running the stat is dropped and counted.
    pub fn submit_stat(
        &self,
        id: &str,
        key: &str,
        byte_count: u64,
        error_code: u32,
        name: &str,
        value: u64,
    ) {
        let stat = PerfStat {
            id: id.to_owned(),
            key: key.to_owned(),
            byte_count,
            error_code,
            name: name.to_owned(),
            value,
            submitted_at: Utc::now(),
        };
        let counters = &self.inner.counters;
        counters.submitted.fetch_add(1, Ordering::Relaxed);
        let (result, bridge) = {
            let st = self.inner.state.lock();
            let result = match &st.running {
                Some(running) => running.tx.try_send(stat).map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => "queue full",
                    mpsc::error::TrySendError::Closed(_) => "worker stopped",
                }),
                None => Err("client not started"),
            };
            (result, st.bridge.clone())
        };
        if let Err(reason) = result {
            let dropped = counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped == 1 || dropped % DROP_LOG_EVERY == 0 {
                log_warn!(
                    bridge,
                    "perf stat dropped ({}), {} dropped so far",
                    reason,
                    dropped
                );
            }
        }
    }

    pub fn counters(&self) -> PerfCounters {
        let c = &self.inner.counters;
        PerfCounters {
            submitted: c.submitted.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            failed_batches: c.failed_batches.load(Ordering::Relaxed),
        }
    }

    /// Flush what is queued, stop the worker and the stack. Returns false if the
    /// client was not running.
    pub fn stop(&self) -> bool {
        let (running, bridge) = {
            let mut st = self.inner.state.lock();
            (st.running.take(), st.bridge.clone())
        };
        let Some(Running {
            tx,
            runtime,
            flushed,
        }) = running
        else {
            self.inner.bootstrap.stop();
            return false;
        };
        drop(tx);
        if flushed.recv_timeout(STOP_FLUSH_TIMEOUT).is_err() {
            log_warn!(bridge, "perf client stopped before the final flush completed");
        }
        runtime.shutdown_background();
        self.inner.bootstrap.stop();
        let c = self.counters();
        log_info!(
            bridge,
            "perf client stopped: submitted={}, dropped={}, delivered={}, failed_batches={}",
            c.submitted,
            c.dropped,
            c.delivered,
            c.failed_batches
        );
        true
    }
}

struct Aggregation {
    identity: Identity,
    reporter: Arc<dyn PerfReporter>,
    options: PerfOptions,
    counters: Arc<Counters>,
    bridge: LogBridge,
}

impl Aggregation {
    async fn run(self, mut rx: mpsc::Receiver<PerfStat>) {
        let mut agg = PerfAggregator::new(self.options.span_minutes());
        let mut ticker = tokio::time::interval(self.options.flush_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                stat = rx.recv() => match stat {
                    Some(stat) => {
                        agg.record(&stat);
                        if agg.len() >= self.options.max_batch.max(1) {
                            self.flush(&mut agg).await;
                        }
                    }
                    None => {
                        self.flush(&mut agg).await;
                        return;
                    }
                },
                _ = ticker.tick() => self.flush(&mut agg).await,
            }
        }
    }

    async fn flush(&self, agg: &mut PerfAggregator) {
        if agg.is_empty() {
            return;
        }
        let batch = PerfBatch {
            batch_id: Uuid::new_v4(),
            owner_id: self.identity.owner_id.clone(),
            dec_id: self.identity.dec_id.clone(),
            client_address: self.identity.client_address.clone(),
            created_at: Utc::now(),
            summaries: agg.take(),
        };
        let stats = batch.stat_count();
        let batch_id = batch.batch_id;
        let reporter = self.reporter.clone();
        let result = tokio::task::spawn_blocking(move || reporter.report(&batch))
            .await
            .unwrap_or_else(|e| Err(PerfError::Rejected(e.to_string())));
        match result {
            Ok(()) => {
                self.counters.delivered.fetch_add(stats, Ordering::Relaxed);
                log_debug!(self.bridge, "perf batch {} delivered, {} stats", batch_id, stats);
            }
            Err(e) => {
                self.counters.failed_batches.fetch_add(1, Ordering::Relaxed);
                log_warn!(self.bridge, "perf batch {} not delivered: {}", batch_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CollectReporter, CollectSink, MockStack};
    use chrono::TimeZone;
    use log::Level;
    use std::sync::mpsc as std_mpsc;
    use std::time::Instant;

    fn config() -> StackConfig {
        StackConfig::new("/tmp/ood-perf-test", "127.0.0.1:1318").with_log_level("debug")
    }

    fn stat_at(id: &str, key: &str, error_code: u32, bytes: u64, at: DateTime<Utc>) -> PerfStat {
        PerfStat {
            id: id.into(),
            key: key.into(),
            byte_count: bytes,
            error_code,
            name: "latency_ms".into(),
            value: bytes / 10,
            submitted_at: at,
        }
    }

    #[test]
    fn span_slots() {
        let at = Utc.with_ymd_and_hms(2026, 3, 9, 14, 37, 12).unwrap();
        let hour = TimeSpan::of(at, 60);
        assert_eq!(hour.date, NaiveDate::from_ymd_opt(2026, 3, 9).unwrap());
        assert_eq!(hour.start, NaiveTime::from_hms_opt(14, 0, 0).unwrap());
        assert_eq!(
            TimeSpan::of(at, 15).start,
            NaiveTime::from_hms_opt(14, 30, 0).unwrap()
        );
        assert_eq!(
            TimeSpan::of(at, 1440).start,
            NaiveTime::from_hms_opt(0, 0, 0).unwrap()
        );
    }

    #[test]
    fn out_of_range_span_falls_back() {
        let mut opts = PerfOptions::default();
        opts.span_minutes = 0;
        assert_eq!(opts.span_minutes(), 60);
        opts.span_minutes = 2000;
        assert_eq!(opts.span_minutes(), 60);
        opts.span_minutes = 5;
        assert_eq!(opts.span_minutes(), 5);
    }

    #[test]
    fn aggregator_groups_by_id_key_and_span() {
        let t1 = Utc.with_ymd_and_hms(2026, 3, 9, 14, 5, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 3, 9, 14, 50, 0).unwrap();
        let t3 = Utc.with_ymd_and_hms(2026, 3, 9, 15, 1, 0).unwrap();
        let mut agg = PerfAggregator::new(60);
        agg.record(&stat_at("put", "object", 0, 100, t1));
        agg.record(&stat_at("put", "object", 0, 300, t2));
        agg.record(&stat_at("put", "object", 7, 200, t2));
        agg.record(&stat_at("put", "object", 0, 50, t3));
        agg.record(&stat_at("get", "object", 0, 10, t1));
        assert_eq!(agg.len(), 3);

        let summaries = agg.take();
        assert!(agg.is_empty());
        let put = summaries
            .iter()
            .find(|s| s.id == "put" && s.span.start == NaiveTime::from_hms_opt(14, 0, 0).unwrap())
            .unwrap();
        assert_eq!(put.success, 2);
        assert_eq!(put.failed, 1);
        assert_eq!(put.errors.get(&0), Some(&2));
        assert_eq!(put.errors.get(&7), Some(&1));
        assert_eq!(put.bytes.total, 600);
        assert_eq!(put.bytes.avg, 200);
        assert_eq!(put.bytes.min, 100);
        assert_eq!(put.bytes.max, 300);
        let latency = &put.values["latency_ms"];
        assert_eq!(latency.count, 3);
        assert_eq!(latency.max, 30);
    }

    #[test]
    fn unnamed_stats_carry_no_value() {
        let mut agg = PerfAggregator::new(60);
        let mut stat = stat_at("ping", "", 0, 0, Utc::now());
        stat.name.clear();
        agg.record(&stat);
        let summaries = agg.take();
        assert!(summaries[0].values.is_empty());
        assert_eq!(summaries[0].total(), 1);
    }

    #[test]
    fn submit_before_start_is_dropped() {
        let client = PerfClient::new(
            Arc::new(MockStack::default()),
            Arc::new(CollectReporter::default()),
        );
        client.submit_stat("put", "object", 10, 0, "latency_ms", 3);
        let c = client.counters();
        assert_eq!(c.submitted, 1);
        assert_eq!(c.dropped, 1);
        assert!(!client.stop());
    }

    #[test]
    fn stop_flushes_aggregated_batch() {
        let reporter = Arc::new(CollectReporter::default());
        let sink = Arc::new(CollectSink::default());
        let client = PerfClient::new(Arc::new(MockStack::default()), reporter.clone());
        client
            .start("owner-1", "dec-1", "10.0.0.5:8050", config(), sink.clone())
            .unwrap();
        for i in 0..10u64 {
            client.submit_stat("put", "object", i * 10, if i < 8 { 0 } else { 3 }, "latency_ms", i);
        }
        assert!(client.stop());

        let batches = reporter.batches();
        let total: u64 = batches.iter().map(PerfBatch::stat_count).sum();
        assert_eq!(total, 10);
        let batch = &batches[0];
        assert_eq!(batch.owner_id, "owner-1");
        assert_eq!(batch.dec_id, "dec-1");
        assert_eq!(batch.client_address, "10.0.0.5:8050");
        let failed: u64 = batches
            .iter()
            .flat_map(|b| b.summaries.iter())
            .map(|s| s.failed)
            .sum();
        assert_eq!(failed, 2);

        let c = client.counters();
        assert_eq!(c.submitted, 10);
        assert_eq!(c.dropped, 0);
        assert_eq!(c.delivered, 10);
        assert!(sink.contains(Level::Info, "perf client stopped"));
        assert!(!client.is_running());
    }

    #[test]
    fn flushes_on_interval() {
        let reporter = Arc::new(CollectReporter::default());
        let options = PerfOptions {
            flush_interval: Duration::from_millis(20),
            ..PerfOptions::default()
        };
        let client =
            PerfClient::with_options(Arc::new(MockStack::default()), reporter.clone(), options);
        client
            .start("o", "d", "c", config(), Arc::new(CollectSink::default()))
            .unwrap();
        client.submit_stat("get", "chunk", 512, 0, "", 0);
        assert!(reporter.wait_for_batches(1, Duration::from_secs(5)));
        client.stop();
    }

    #[test]
    fn saturated_queue_never_blocks_submitters() {
        let reporter = Arc::new(CollectReporter::gated());
        let sink = Arc::new(CollectSink::default());
        let options = PerfOptions {
            queue_capacity: 4,
            max_batch: 1,
            ..PerfOptions::default()
        };
        let client =
            PerfClient::with_options(Arc::new(MockStack::default()), reporter.clone(), options);
        client
            .start("o", "d", "c", config(), sink.clone())
            .unwrap();

        let (tx, rx) = std_mpsc::channel();
        {
            let client = client.clone();
            std::thread::spawn(move || {
                let started = Instant::now();
                for i in 0..1000u64 {
                    client.submit_stat("put", "object", i, 0, "latency_ms", i);
                }
                let _ = tx.send(started.elapsed());
            });
        }
        let elapsed = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("submitter blocked on a saturated queue");
        assert!(elapsed < Duration::from_secs(2));

        let c = client.counters();
        assert_eq!(c.submitted, 1000);
        assert!(c.dropped >= 900, "dropped only {}", c.dropped);
        assert!(sink.count_containing(Level::Warn, "perf stat dropped") >= 2);

        reporter.open();
        assert!(client.stop());
        let c = client.counters();
        assert_eq!(c.delivered + c.dropped, 1000);
    }

    #[test]
    fn failed_delivery_is_counted() {
        let reporter = Arc::new(CollectReporter::default());
        reporter.set_failing(true);
        let sink = Arc::new(CollectSink::default());
        let client = PerfClient::new(Arc::new(MockStack::default()), reporter);
        client.start("o", "d", "c", config(), sink.clone()).unwrap();
        client.submit_stat("put", "object", 1, 0, "", 0);
        client.stop();
        let c = client.counters();
        assert_eq!(c.failed_batches, 1);
        assert_eq!(c.delivered, 0);
        assert!(sink.contains(Level::Warn, "collector unavailable"));
    }

    #[test]
    fn start_twice_then_restart_after_stop() {
        let stack = Arc::new(MockStack::default());
        let client = PerfClient::new(stack.clone(), Arc::new(CollectReporter::default()));
        client
            .start("o", "d", "c", config(), Arc::new(CollectSink::default()))
            .unwrap();
        assert!(matches!(
            client.start("o", "d", "c", config(), Arc::new(CollectSink::default())),
            Err(StartError::AlreadyStarted)
        ));
        assert!(client.stop());
        client
            .start("o", "d", "c", config(), Arc::new(CollectSink::default()))
            .unwrap();
        assert!(client.is_running());
        assert_eq!(stack.launches(), 2);
        client.stop();
    }

    #[test]
    fn invalid_config_does_not_start() {
        let stack = Arc::new(MockStack::default());
        let sink = Arc::new(CollectSink::default());
        let client = PerfClient::new(stack.clone(), Arc::new(CollectReporter::default()));
        let err = client
            .start(
                "o",
                "d",
                "c",
                StackConfig::new("/tmp/x", "not-an-address"),
                sink.clone(),
            )
            .unwrap_err();
        assert!(matches!(err, StartError::Validation(_)));
        assert!(sink.contains(Level::Error, "non_address"));
        assert!(!client.is_running());
        assert_eq!(stack.launches(), 0);
    }

    #[test]
    fn batch_serializes_as_json() {
        let mut agg = PerfAggregator::new(60);
        agg.record(&stat_at("put", "object", 0, 100, Utc::now()));
        let batch = PerfBatch {
            batch_id: Uuid::new_v4(),
            owner_id: "o".into(),
            dec_id: "d".into(),
            client_address: "c".into(),
            created_at: Utc::now(),
            summaries: agg.take(),
        };
        let json = serde_json::to_string(&batch).unwrap();
        assert!(json.contains("\"batch_id\""));
        let back: PerfBatch = serde_json::from_str(&json).unwrap();
        assert_eq!(back, batch);
    }
}
