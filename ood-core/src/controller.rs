//! Device binding controller (OOD control): init → start → wait for bind → serve addresses.

use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tokio::runtime::Runtime;

use crate::address::AddressList;
use crate::bind::{BindError, BindHandshake, BindInfo, BindPolicy, BindState};
use crate::config::StackConfig;
use crate::logging::{LogBridge, LogSink};
use crate::stack::{
    NetworkStack, ResetError, RestartError, RetryPolicy, StackBootstrap, StackState, StartError,
};
use crate::{log_debug, log_error, log_info, log_warn};

/// Pending bind attempts are also reported at info level on the first and every Nth attempt.
pub(crate) const PENDING_INFO_EVERY: u64 = 30;

type BindListener = Arc<dyn Fn(&BindInfo) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("already started, bind state is {0}")]
    AlreadyStarted(BindState),
    #[error("failed to create worker runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

struct ControlState {
    bind: BindState,
    /// Set between accepting `start` and entering WaitingForBind.
    starting: bool,
    /// Bumped on every re-init and shutdown; workers of an older epoch are ignored.
    epoch: u64,
    config: Option<StackConfig>,
    bridge: LogBridge,
    info: Option<BindInfo>,
    listeners: Vec<BindListener>,
}

struct ControllerInner {
    bootstrap: Arc<StackBootstrap>,
    /// False when the bootstrap is shared; shutdown then leaves the stack running.
    owns_stack: bool,
    handshake: Arc<dyn BindHandshake>,
    policy: BindPolicy,
    state: Mutex<ControlState>,
    bind_changed: Condvar,
    runtime: Mutex<Option<Runtime>>,
}

/// Handle to one device binding lifecycle. Clones share the same state.
///
/// The host normally keeps a single handle for the life of the process; tests
/// build one per case.
#[derive(Clone)]
pub struct OodController {
    inner: Arc<ControllerInner>,
}

impl OodController {
    pub fn new(stack: Arc<dyn NetworkStack>, handshake: Arc<dyn BindHandshake>) -> Self {
        Self::with_policies(stack, handshake, BindPolicy::default(), RetryPolicy::default())
    }

    pub fn with_policies(
        stack: Arc<dyn NetworkStack>,
        handshake: Arc<dyn BindHandshake>,
        policy: BindPolicy,
        retry: RetryPolicy,
    ) -> Self {
        let bootstrap = Arc::new(StackBootstrap::new(stack).with_retry_policy(retry));
        Self::build(bootstrap, true, handshake, policy)
    }

    /// Controller over a bootstrap other callers also drive. `start` launches the
    /// stack only if it is not already up; `shutdown` leaves it running.
    pub fn with_bootstrap(
        bootstrap: Arc<StackBootstrap>,
        handshake: Arc<dyn BindHandshake>,
        policy: BindPolicy,
    ) -> Self {
        Self::build(bootstrap, false, handshake, policy)
    }

    fn build(
        bootstrap: Arc<StackBootstrap>,
        owns_stack: bool,
        handshake: Arc<dyn BindHandshake>,
        policy: BindPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                bootstrap,
                owns_stack,
                handshake,
                policy,
                state: Mutex::new(ControlState {
                    bind: BindState::Uninitialized,
                    starting: false,
                    epoch: 0,
                    config: None,
                    bridge: LogBridge::disabled(),
                    info: None,
                    listeners: Vec::new(),
                }),
                bind_changed: Condvar::new(),
                runtime: Mutex::new(None),
            }),
        }
    }

    /// Uninitialized (or Failed) → Initializing. Stores config and sink; no network I/O.
    pub fn init(&self, config: StackConfig, sink: Arc<dyn LogSink>) -> Result<(), InitError> {
        {
            let mut runtime = self.inner.runtime.lock();
            if runtime.is_none() {
                *runtime = Some(
                    tokio::runtime::Builder::new_multi_thread()
                        .worker_threads(1)
                        .thread_name("ood-control")
                        .enable_time()
                        .build()?,
                );
            }
        }

        let bridge = LogBridge::new(sink, config.level_filter());
        let storage = config.storage_path.display().to_string();
        let was_failed = {
            let mut st = self.inner.state.lock();
            if st.starting {
                return Err(InitError::AlreadyStarted(st.bind));
            }
            match st.bind {
                BindState::Uninitialized | BindState::Initializing | BindState::Failed => {}
                BindState::WaitingForBind | BindState::Bound => {
                    return Err(InitError::AlreadyStarted(st.bind))
                }
            }
            let was_failed = st.bind == BindState::Failed;
            st.epoch += 1;
            st.bind = BindState::Initializing;
            st.config = Some(config);
            st.bridge = bridge.clone();
            st.info = None;
            was_failed
        };
        if was_failed
            && (self.inner.owns_stack || self.inner.bootstrap.state() == StackState::Failed)
        {
            self.inner.bootstrap.stop();
        }
        log_info!(bridge, "ood control initialized, storage={}", storage);
        Ok(())
    }

    /// Initializing → WaitingForBind. Returns after validation; the stack launch
    /// and the bind handshake run on the worker.
    pub fn start(&self) -> Result<(), StartError> {
        let (config, bridge, epoch) = {
            let mut st = self.inner.state.lock();
            match st.bind {
                BindState::Uninitialized => return Err(StartError::NotInitialized),
                BindState::Initializing if !st.starting => {}
                BindState::Initializing | BindState::WaitingForBind | BindState::Bound => {
                    return Err(StartError::AlreadyStarted)
                }
                BindState::Failed => return Err(StartError::Failed),
            }
            let Some(config) = st.config.clone() else {
                return Err(StartError::NotInitialized);
            };
            st.starting = true;
            (config, st.bridge.clone(), st.epoch)
        };

        if let Err(e) = config.validate() {
            {
                let mut st = self.inner.state.lock();
                st.starting = false;
                self.inner.bind_changed.notify_all();
            }
            log_error!(bridge, "ood control start rejected, invalid config: {}", e);
            return Err(StartError::Validation(e));
        }

        {
            let mut st = self.inner.state.lock();
            st.starting = false;
            st.bind = BindState::WaitingForBind;
        }
        log_info!(bridge, "ood control starting, waiting for bind");

        let worker = run_bind(Arc::downgrade(&self.inner), config, bridge, epoch);
        let spawned = match self.inner.runtime.lock().as_ref() {
            Some(rt) => {
                rt.spawn(worker);
                true
            }
            None => false,
        };
        if !spawned {
            self.inner
                .settle(epoch, Err(BindError::Worker("runtime is shut down".into())));
            return Err(StartError::Runtime("runtime is shut down".into()));
        }
        Ok(())
    }

    /// Block until the state leaves WaitingForBind. Returns at once in any other
    /// state. Every concurrent caller is released by the same transition.
    pub fn wait_bind(&self) -> BindState {
        let mut st = self.inner.state.lock();
        while st.starting || st.bind == BindState::WaitingForBind {
            self.inner.bind_changed.wait(&mut st);
        }
        st.bind
    }

    pub fn bind_state(&self) -> BindState {
        self.inner.state.lock().bind
    }

    /// Momentary: may be stale by the time it is read.
    pub fn is_bound(&self) -> bool {
        self.bind_state() == BindState::Bound
    }

    pub fn bind_info(&self) -> Option<BindInfo> {
        self.inner.state.lock().info.clone()
    }

    /// Fresh copy of the current addresses, or `None` unless bound.
    pub fn address_list(&self) -> Option<AddressList> {
        let st = self.inner.state.lock();
        if st.bind != BindState::Bound {
            return None;
        }
        Some(self.inner.bootstrap.address_list())
    }

    /// Release a list obtained from [`address_list`](Self::address_list). `None` is a no-op.
    pub fn release_address_list(&self, list: Option<AddressList>) {
        if let Some(list) = list {
            list.release();
        }
    }

    pub fn restart_interface(&self) -> Result<(), RestartError> {
        self.inner.bootstrap.restart_interface()
    }

    pub fn reset_network(&self, wifi_address: &str) -> Result<(), ResetError> {
        self.inner.bootstrap.reset_network(wifi_address)
    }

    /// Run `listener` once the device is bound; immediately if it already is.
    pub fn on_bind(&self, listener: impl Fn(&BindInfo) + Send + Sync + 'static) {
        let listener: BindListener = Arc::new(listener);
        let info = {
            let mut st = self.inner.state.lock();
            let bound = match st.bind {
                BindState::Bound => st.info.clone(),
                _ => None,
            };
            if bound.is_none() {
                st.listeners.push(listener.clone());
            }
            bound
        };
        if let Some(info) = info {
            listener(&info);
        }
    }

    /// Stop the stack and the worker. Waiters are released with `Uninitialized`.
    pub fn shutdown(&self) {
        let bridge = {
            let mut st = self.inner.state.lock();
            st.epoch += 1;
            st.bind = BindState::Uninitialized;
            st.starting = false;
            st.config = None;
            st.info = None;
            self.inner.bind_changed.notify_all();
            st.bridge.clone()
        };
        if self.inner.owns_stack {
            self.inner.bootstrap.stop();
        }
        if let Some(rt) = self.inner.runtime.lock().take() {
            rt.shutdown_background();
        }
        log_info!(bridge, "ood control shut down");
    }
}

impl ControllerInner {
    fn is_current(&self, epoch: u64) -> bool {
        let st = self.state.lock();
        st.epoch == epoch && st.bind == BindState::WaitingForBind
    }

    /// WaitingForBind → Bound / Failed, for the given epoch only.
    fn settle(&self, epoch: u64, outcome: Result<BindInfo, BindError>) {
        if outcome.is_ok() {
            self.bootstrap.refresh_addresses();
        }
        let (bridge, listeners) = {
            let mut st = self.state.lock();
            if st.epoch != epoch || st.bind != BindState::WaitingForBind {
                return;
            }
            let listeners = match &outcome {
                Ok(info) => {
                    st.bind = BindState::Bound;
                    st.info = Some(info.clone());
                    std::mem::take(&mut st.listeners)
                }
                Err(_) => {
                    st.bind = BindState::Failed;
                    Vec::new()
                }
            };
            self.bind_changed.notify_all();
            (st.bridge.clone(), listeners)
        };
        match outcome {
            Ok(info) => {
                log_info!(
                    bridge,
                    "device bound: device={}, owner={:?}",
                    info.device_id,
                    info.owner_id
                );
                for listener in listeners {
                    listener(&info);
                }
            }
            Err(e) => log_error!(bridge, "device bind failed: {}", e),
        }
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        if let Some(rt) = self.runtime.get_mut().take() {
            rt.shutdown_background();
        }
    }
}

/// Bring the stack up unless it already is. Returns whether this call launched it,
/// or `None` when the worker should stop.
async fn launch_stack(
    inner: &Weak<ControllerInner>,
    config: &StackConfig,
    bridge: &LogBridge,
    epoch: u64,
) -> Option<bool> {
    let bootstrap = inner.upgrade()?.bootstrap.clone();
    let launch = {
        let bootstrap = bootstrap.clone();
        let config = config.clone();
        let bridge = bridge.clone();
        tokio::task::spawn_blocking(move || bootstrap.start_with_bridge(config, bridge)).await
    };
    let launched = match launch {
        Ok(Ok(())) => true,
        Ok(Err(StartError::AlreadyStarted)) => {
            log_debug!(bridge, "network stack already up, sharing it");
            false
        }
        Ok(Err(e)) => {
            if let Some(inner) = inner.upgrade() {
                inner.settle(epoch, Err(BindError::Stack(e.to_string())));
            }
            return None;
        }
        Err(e) => {
            if let Some(inner) = inner.upgrade() {
                inner.settle(epoch, Err(BindError::Worker(e.to_string())));
            }
            return None;
        }
    };
    let current = inner.upgrade().map_or(false, |inner| inner.is_current(epoch));
    if !current {
        if launched {
            log_info!(bridge, "ood control shut down during stack launch, stopping stack");
            bootstrap.stop();
        }
        return None;
    }
    Some(launched)
}

/// Launch the stack, then poll the handshake until bound, rejected, out of
/// retries or timed out.
async fn run_bind(
    inner: Weak<ControllerInner>,
    config: StackConfig,
    bridge: LogBridge,
    epoch: u64,
) {
    if launch_stack(&inner, &config, &bridge, epoch).await.is_none() {
        return;
    }
    let started = Instant::now();
    let mut attempt: u64 = 0;
    let mut failures: u32 = 0;
    loop {
        let (handshake, policy) = match inner.upgrade() {
            Some(inner) if inner.is_current(epoch) => (inner.handshake.clone(), inner.policy),
            _ => return,
        };
        attempt += 1;
        let cfg = config.clone();
        let result = tokio::task::spawn_blocking(move || handshake.bind(&cfg))
            .await
            .unwrap_or_else(|e| Err(BindError::Worker(e.to_string())));

        let delay = match result {
            Ok(Some(info)) => {
                if let Some(inner) = inner.upgrade() {
                    inner.settle(epoch, Ok(info));
                }
                return;
            }
            Ok(None) => {
                failures = 0;
                log_debug!(bridge, "bind attempt {}: device not activated yet", attempt);
                if attempt == 1 || attempt % PENDING_INFO_EVERY == 0 {
                    log_info!(
                        bridge,
                        "waiting for device activation, {} bind attempt(s) so far",
                        attempt
                    );
                }
                policy.poll_interval
            }
            Err(e) if e.is_retryable() && failures + 1 < policy.max_failures => {
                failures += 1;
                log_warn!(
                    bridge,
                    "bind attempt {} failed ({}/{}): {}",
                    attempt,
                    failures,
                    policy.max_failures,
                    e
                );
                policy.error_backoff(failures)
            }
            Err(e) => {
                log_error!(bridge, "bind attempt {} failed: {}", attempt, e);
                if let Some(inner) = inner.upgrade() {
                    inner.settle(epoch, Err(e));
                }
                return;
            }
        };

        let delay = match policy.timeout {
            Some(limit) => {
                let elapsed = started.elapsed();
                if elapsed >= limit {
                    if let Some(inner) = inner.upgrade() {
                        inner.settle(epoch, Err(BindError::Timeout(limit)));
                    }
                    return;
                }
                delay.min(limit - elapsed)
            }
            None => delay,
        };
        tokio::time::sleep(delay).await;
    }
}
