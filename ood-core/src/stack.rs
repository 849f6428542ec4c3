//! Network stack bootstrap: start / restart interface / reset network around an
//! external peer network stack.
//!
//! These calls block the calling thread for the collaborator call and its retry
//! backoff. The controller and the C boundary run them on worker threads.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use crate::address::{AddressBook, AddressList};
use crate::config::{parse_ip_addr, StackConfig, ValidationError};
use crate::logging::{LogBridge, LogSink};
use crate::{log_debug, log_error, log_info, log_warn};

/// The peer network stack itself. Implementations own transport, routing and
/// persisted identity under `config.storage_path`.
pub trait NetworkStack: Send + Sync {
    fn launch(&self, config: &StackConfig) -> Result<(), StackError>;
    /// Tear down and relaunch network interfaces, keeping identity and state.
    fn restart_interface(&self) -> Result<(), StackError>;
    /// Move to a new local attachment point and reconcile active connections.
    fn reset_network(&self, wifi_address: IpAddr) -> Result<(), StackError>;
    /// Currently resolved addresses (`ip:port`), in discovery order.
    fn local_addresses(&self) -> Vec<String>;
    fn shutdown(&self);
}

/// Error from the underlying stack. Transient errors are retried with backoff.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StackError {
    #[error("transient network error: {0}")]
    Transient(String),
    #[error("network stack error: {0}")]
    Fatal(String),
}

impl StackError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StackError::Transient(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("invalid config: {0}")]
    Validation(#[from] ValidationError),
    #[error("not initialized")]
    NotInitialized,
    #[error("already started")]
    AlreadyStarted,
    #[error("in failed state, re-initialize before starting")]
    Failed,
    #[error("stopped while starting")]
    Stopped,
    #[error("stack launch failed after {attempts} attempt(s): {source}")]
    Launch {
        attempts: u32,
        #[source]
        source: StackError,
    },
    #[error("worker runtime unavailable: {0}")]
    Runtime(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RestartError {
    #[error("stack is not running")]
    NotRunning,
    #[error("another reconfiguration is in progress, try again")]
    Busy,
    #[error("interface restart failed after {attempts} attempt(s): {source}")]
    Interface {
        attempts: u32,
        #[source]
        source: StackError,
    },
}

impl RestartError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RestartError::Busy)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResetError {
    #[error("invalid wifi address: {0}")]
    Validation(#[from] ValidationError),
    #[error("stack is not running")]
    NotRunning,
    #[error("another reconfiguration is in progress, try again")]
    Busy,
    #[error("network reset failed after {attempts} attempt(s): {source}")]
    Network {
        attempts: u32,
        #[source]
        source: StackError,
    },
}

impl ResetError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResetError::Busy)
    }
}

/// Bounded exponential backoff for transient stack errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), with up to 20% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let base = exp.min(self.max_backoff);
        let jitter_ms = base.as_millis() as u64 / 5;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }

    /// Run `op`, retrying transient errors. Fatal errors end the loop at once.
    /// On failure returns the number of attempts made and the last error.
    pub(crate) fn run<T>(
        &self,
        bridge: &LogBridge,
        what: &str,
        mut op: impl FnMut() -> Result<T, StackError>,
    ) -> Result<T, (u32, StackError)> {
        let max = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < max => {
                    let delay = self.backoff(attempt);
                    log_warn!(
                        bridge,
                        "{} attempt {}/{} failed: {}; retrying in {:?}",
                        what,
                        attempt,
                        max,
                        e,
                        delay
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => return Err((attempt, e)),
            }
        }
    }
}

/// Lifecycle of a bootstrap instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackState {
    Stopped,
    Starting,
    Running,
    /// Restart or reset in progress.
    Reconfiguring,
    Failed,
}

struct BootstrapInner {
    state: StackState,
    config: Option<StackConfig>,
    wifi_address: Option<IpAddr>,
    bridge: LogBridge,
    /// `stop` arrived while a start or reconfiguration was in flight.
    stop_requested: bool,
}

/// Brings a [`NetworkStack`] to a running state and keeps its address set current.
///
/// No lock is held while the stack or the log sink is called; concurrent
/// reconfigurations are refused with a retryable `Busy` error instead.
pub struct StackBootstrap {
    stack: Arc<dyn NetworkStack>,
    retry: RetryPolicy,
    inner: Mutex<BootstrapInner>,
    addresses: AddressBook,
}

impl StackBootstrap {
    pub fn new(stack: Arc<dyn NetworkStack>) -> Self {
        Self {
            stack,
            retry: RetryPolicy::default(),
            inner: Mutex::new(BootstrapInner {
                state: StackState::Stopped,
                config: None,
                wifi_address: None,
                bridge: LogBridge::disabled(),
                stop_requested: false,
            }),
            addresses: AddressBook::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn state(&self) -> StackState {
        self.inner.lock().state
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            StackState::Running | StackState::Reconfiguring
        )
    }

    pub fn config(&self) -> Option<StackConfig> {
        self.inner.lock().config.clone()
    }

    pub fn wifi_address(&self) -> Option<IpAddr> {
        self.inner.lock().wifi_address
    }

    pub fn bridge(&self) -> LogBridge {
        self.inner.lock().bridge.clone()
    }

    /// Snapshot of the current address generation. Empty unless running.
    pub fn address_list(&self) -> AddressList {
        self.addresses.list()
    }

    pub fn address_generation(&self) -> u64 {
        self.addresses.generation()
    }

    /// Validate `config`, wire the log sink and launch the stack.
    pub fn start(&self, config: StackConfig, sink: Arc<dyn LogSink>) -> Result<(), StartError> {
        let bridge = LogBridge::new(sink, config.level_filter());
        self.start_with_bridge(config, bridge)
    }

    pub(crate) fn start_with_bridge(
        &self,
        config: StackConfig,
        bridge: LogBridge,
    ) -> Result<(), StartError> {
        if let Err(e) = config.validate() {
            log_error!(bridge, "invalid stack config: {}", e);
            return Err(StartError::Validation(e));
        }
        {
            let mut inner = self.inner.lock();
            match inner.state {
                StackState::Stopped => {}
                StackState::Failed => return Err(StartError::Failed),
                StackState::Starting | StackState::Running | StackState::Reconfiguring => {
                    return Err(StartError::AlreadyStarted)
                }
            }
            inner.state = StackState::Starting;
            inner.stop_requested = false;
            inner.wifi_address = config.wifi_ip();
            inner.config = Some(config.clone());
            inner.bridge = bridge.clone();
        }

        log_info!(
            bridge,
            "launching network stack: storage={}, non={}, ws={:?}, bdt_port={}, wifi={:?}",
            config.storage_path.display(),
            config.non_address,
            config.websocket_address,
            config.bdt_port,
            config.wifi_address
        );

        match self
            .retry
            .run(&bridge, "stack launch", || self.stack.launch(&config))
        {
            Ok(()) => match self.finish(StackState::Running, Some(self.stack.local_addresses())) {
                Some(generation) => {
                    log_info!(
                        bridge,
                        "network stack running, address generation {}",
                        generation
                    );
                    Ok(())
                }
                None => Err(StartError::Stopped),
            },
            Err((attempts, source)) => {
                self.finish(StackState::Failed, None);
                log_error!(
                    bridge,
                    "network stack launch failed after {} attempt(s): {}",
                    attempts,
                    source
                );
                Err(StartError::Launch { attempts, source })
            }
        }
    }

    /// Relaunch interfaces. On failure the previous address generation stays current.
    pub fn restart_interface(&self) -> Result<(), RestartError> {
        let bridge = {
            let mut inner = self.inner.lock();
            match inner.state {
                StackState::Running => {}
                StackState::Starting | StackState::Reconfiguring => {
                    return Err(RestartError::Busy)
                }
                StackState::Stopped | StackState::Failed => return Err(RestartError::NotRunning),
            }
            inner.state = StackState::Reconfiguring;
            inner.bridge.clone()
        };

        log_info!(bridge, "restarting network interface");
        let result = self
            .retry
            .run(&bridge, "interface restart", || self.stack.restart_interface());
        match result {
            Ok(()) => match self.finish(StackState::Running, Some(self.stack.local_addresses())) {
                Some(generation) => {
                    log_info!(
                        bridge,
                        "network interface restarted, address generation {}",
                        generation
                    );
                    Ok(())
                }
                None => Err(RestartError::NotRunning),
            },
            Err((attempts, source)) => {
                self.finish(StackState::Running, None);
                log_error!(
                    bridge,
                    "interface restart failed after {} attempt(s): {}; keeping previous interface",
                    attempts,
                    source
                );
                Err(RestartError::Interface { attempts, source })
            }
        }
    }

    /// Move to a new Wi-Fi address. Bind state and higher-level state are untouched.
    pub fn reset_network(&self, wifi_address: &str) -> Result<(), ResetError> {
        let ip = match parse_ip_addr("wifi_address", wifi_address) {
            Ok(ip) => ip,
            Err(e) => {
                let bridge = self.bridge();
                log_error!(bridge, "reset network rejected: {}", e);
                return Err(ResetError::Validation(e));
            }
        };
        let bridge = {
            let mut inner = self.inner.lock();
            match inner.state {
                StackState::Running => {}
                StackState::Starting | StackState::Reconfiguring => return Err(ResetError::Busy),
                StackState::Stopped | StackState::Failed => return Err(ResetError::NotRunning),
            }
            inner.state = StackState::Reconfiguring;
            inner.bridge.clone()
        };

        log_info!(bridge, "resetting network to wifi address {}", ip);
        let result = self
            .retry
            .run(&bridge, "network reset", || self.stack.reset_network(ip));
        match result {
            Ok(()) => {
                self.inner.lock().wifi_address = Some(ip);
                match self.finish(StackState::Running, Some(self.stack.local_addresses())) {
                    Some(generation) => {
                        log_info!(
                            bridge,
                            "network reset to {}, address generation {}",
                            ip,
                            generation
                        );
                        Ok(())
                    }
                    None => Err(ResetError::NotRunning),
                }
            }
            Err((attempts, source)) => {
                self.finish(StackState::Running, None);
                log_error!(
                    bridge,
                    "network reset failed after {} attempt(s): {}",
                    attempts,
                    source
                );
                Err(ResetError::Network { attempts, source })
            }
        }
    }

    /// Leave Starting/Reconfiguring for `next`, publishing `addresses` if given.
    /// A stop requested meanwhile wins: the stack is shut down and `None` returned.
    fn finish(&self, next: StackState, addresses: Option<Vec<String>>) -> Option<u64> {
        let mut inner = self.inner.lock();
        if inner.stop_requested {
            inner.stop_requested = false;
            inner.state = StackState::Stopped;
            inner.config = None;
            let bridge = inner.bridge.clone();
            drop(inner);
            log_info!(bridge, "stop requested while busy, stopping network stack");
            self.halt(&bridge);
            return None;
        }
        inner.state = next;
        Some(match addresses {
            Some(addresses) => self.addresses.publish(addresses),
            None => self.addresses.generation(),
        })
    }

    fn halt(&self, bridge: &LogBridge) {
        self.stack.shutdown();
        self.addresses.clear();
        log_debug!(bridge, "network stack stopped");
    }

    /// Re-read the stack's addresses into a new generation. No-op unless running
    /// and idle; returns the generation that is current afterwards.
    pub(crate) fn refresh_addresses(&self) -> u64 {
        if self.state() != StackState::Running {
            return self.addresses.generation();
        }
        self.addresses.publish(self.stack.local_addresses())
    }

    /// Shut the stack down. Running or Failed go back to Stopped. While a start
    /// or reconfiguration is in flight the stop is deferred until it ends, and
    /// false is returned.
    pub fn stop(&self) -> bool {
        let bridge = {
            let mut inner = self.inner.lock();
            match inner.state {
                StackState::Running | StackState::Failed => {}
                StackState::Stopped => return true,
                StackState::Starting | StackState::Reconfiguring => {
                    inner.stop_requested = true;
                    return false;
                }
            }
            inner.state = StackState::Stopped;
            inner.config = None;
            inner.bridge.clone()
        };
        self.halt(&bridge);
        true
    }
}

impl Drop for StackBootstrap {
    fn drop(&mut self) {
        let state = self.inner.get_mut().state;
        if state != StackState::Stopped {
            self.stack.shutdown();
        }
    }
}
