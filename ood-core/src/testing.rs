//! Fakes for unit tests: a scripted network stack, a gated bind handshake,
//! a collecting log sink and a collecting perf reporter.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use log::Level;
use parking_lot::{Condvar, Mutex};

use crate::bind::{BindError, BindHandshake, BindInfo, BindPolicy};
use crate::config::StackConfig;
use crate::logging::{LogRecord, LogSink};
use crate::perf::{PerfBatch, PerfError, PerfReporter};
use crate::stack::{NetworkStack, RetryPolicy, StackError};

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

pub fn fast_bind() -> BindPolicy {
    BindPolicy {
        poll_interval: Duration::from_millis(5),
        max_failures: 3,
        timeout: Some(Duration::from_secs(3)),
    }
}

#[derive(Default)]
pub struct CollectSink {
    records: Mutex<Vec<LogRecord>>,
}

impl CollectSink {
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.count_containing(level, needle) > 0
    }

    pub fn count(&self, level: Level) -> usize {
        self.records.lock().iter().filter(|r| r.level == level).count()
    }

    pub fn count_containing(&self, level: Level, needle: &str) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| r.level == level && r.message.contains(needle))
            .count()
    }
}

impl LogSink for CollectSink {
    fn log(&self, record: &LogRecord) {
        self.records.lock().push(record.clone());
    }
}

struct MockStackState {
    addresses: Vec<String>,
    tagged: bool,
    generation: u64,
    failing_launches: u32,
    launch_transient: bool,
    fail_restarts: bool,
    restart_delay: Duration,
}

/// Network stack with scripted failures. `tagged()` stacks report three
/// addresses prefixed with their generation, e.g. `g2-10.0.0.1:8050`.
pub struct MockStack {
    state: Mutex<MockStackState>,
    launches: AtomicU32,
    restarts: AtomicU32,
    resets: AtomicU32,
    shutdowns: AtomicU32,
}

impl Default for MockStack {
    fn default() -> Self {
        Self::with_addresses(&["127.0.0.1:8050"])
    }
}

impl MockStack {
    pub fn with_addresses(addresses: &[&str]) -> Self {
        Self {
            state: Mutex::new(MockStackState {
                addresses: addresses.iter().map(|a| a.to_string()).collect(),
                tagged: false,
                generation: 0,
                failing_launches: 0,
                launch_transient: true,
                fail_restarts: false,
                restart_delay: Duration::ZERO,
            }),
            launches: AtomicU32::new(0),
            restarts: AtomicU32::new(0),
            resets: AtomicU32::new(0),
            shutdowns: AtomicU32::new(0),
        }
    }

    pub fn tagged() -> Self {
        let stack = Self::with_addresses(&[]);
        stack.state.lock().tagged = true;
        stack
    }

    pub fn fail_next_launches(&self, n: u32, transient: bool) {
        let mut st = self.state.lock();
        st.failing_launches = n;
        st.launch_transient = transient;
    }

    pub fn fail_restarts(&self, fail: bool) {
        self.state.lock().fail_restarts = fail;
    }

    pub fn set_restart_delay(&self, delay: Duration) {
        self.state.lock().restart_delay = delay;
    }

    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> u32 {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> u32 {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl NetworkStack for MockStack {
    fn launch(&self, _config: &StackConfig) -> Result<(), StackError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let mut st = self.state.lock();
        if st.failing_launches > 0 {
            st.failing_launches -= 1;
            return Err(if st.launch_transient {
                StackError::Transient("port busy".into())
            } else {
                StackError::Fatal("bad identity".into())
            });
        }
        Ok(())
    }

    fn restart_interface(&self) -> Result<(), StackError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.lock().restart_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let mut st = self.state.lock();
        if st.fail_restarts {
            return Err(StackError::Transient("interface down".into()));
        }
        st.generation += 1;
        Ok(())
    }

    fn reset_network(&self, _wifi_address: IpAddr) -> Result<(), StackError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.state.lock().generation += 1;
        Ok(())
    }

    fn local_addresses(&self) -> Vec<String> {
        let st = self.state.lock();
        if st.tagged {
            (1..=3)
                .map(|i| format!("g{}-10.0.0.{}:8050", st.generation, i))
                .collect()
        } else {
            st.addresses.clone()
        }
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

type BindResult = Result<Option<BindInfo>, BindError>;

/// Handshake that plays back a script, then answers with `fallback`.
/// A gated handshake blocks every attempt until `open()` is called.
pub struct MockHandshake {
    script: Mutex<VecDeque<BindResult>>,
    fallback: BindResult,
    gate: Mutex<bool>,
    gate_opened: Condvar,
    attempts: AtomicU32,
}

impl MockHandshake {
    fn with(script: Vec<BindResult>, fallback: BindResult) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            gate: Mutex::new(true),
            gate_opened: Condvar::new(),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn succeeding() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn scripted(script: Vec<BindResult>) -> Self {
        Self::with(
            script,
            Ok(Some(BindInfo::new("device-test", Some("owner-test".into())))),
        )
    }

    pub fn always_pending() -> Self {
        Self::with(Vec::new(), Ok(None))
    }

    pub fn gated(self) -> Self {
        *self.gate.lock() = false;
        self
    }

    pub fn open(&self) {
        *self.gate.lock() = true;
        self.gate_opened.notify_all();
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl BindHandshake for MockHandshake {
    fn bind(&self, _config: &StackConfig) -> BindResult {
        {
            let mut open = self.gate.lock();
            while !*open {
                self.gate_opened.wait(&mut open);
            }
        }
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Keeps every delivered batch. Can be gated like [`MockHandshake`] to stand in
/// for a stalled backend, or set to fail.
pub struct CollectReporter {
    batches: Mutex<Vec<PerfBatch>>,
    gate: Mutex<bool>,
    gate_opened: Condvar,
    failing: Mutex<bool>,
}

impl Default for CollectReporter {
    fn default() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            gate: Mutex::new(true),
            gate_opened: Condvar::new(),
            failing: Mutex::new(false),
        }
    }
}

impl CollectReporter {
    pub fn gated() -> Self {
        let reporter = Self::default();
        *reporter.gate.lock() = false;
        reporter
    }

    pub fn open(&self) {
        *self.gate.lock() = true;
        self.gate_opened.notify_all();
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn batches(&self) -> Vec<PerfBatch> {
        self.batches.lock().clone()
    }

    /// Poll until at least `n` batches arrived or `timeout` passed.
    pub fn wait_for_batches(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.batches.lock().len() >= n {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.batches.lock().len() >= n
    }
}

impl PerfReporter for CollectReporter {
    fn report(&self, batch: &PerfBatch) -> Result<(), PerfError> {
        {
            let mut open = self.gate.lock();
            while !*open {
                self.gate_opened.wait(&mut open);
            }
        }
        if *self.failing.lock() {
            return Err(PerfError::Rejected("collector unavailable".into()));
        }
        self.batches.lock().push(batch.clone());
        Ok(())
    }
}
