//! C ABI for linking ood-core as a static library from Android (NDK), iOS or other C hosts.
//! Entry points return nothing; failures are reported through the host's log callback.
//! Handles are process-wide: one network stack, one controller, one perf client. The
//! controller binds against the same network stack `ood_stack_*` drives.
//!
//! Arguments are validated on the caller's thread; stack launches, restarts, resets and
//! perf client starts then run on a boundary worker so the entry points return at once.

use std::collections::{HashSet, VecDeque};
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use log::Level;
use parking_lot::Mutex;
use tokio::runtime::Runtime;

use crate::bind::{BindHandshake, BindPolicy, BindState};
use crate::config::{parse_ip_addr, parse_log_level, port_from_raw, StackConfig, ValidationError};
use crate::controller::{InitError, OodController};
use crate::local::{DescFileHandshake, JsonlReporter, LocalStack};
use crate::logging::{LogBridge, LogRecord, LogSink};
use crate::perf::{PerfClient, PerfReporter};
use crate::stack::{NetworkStack, ResetError, RestartError, StackBootstrap, StartError};
use crate::{log_debug, log_error, log_info, log_warn};

/// Host log callback. `level`: 1 error, 2 warn, 3 info, 4 debug, 5 trace.
/// `message` is valid only for the duration of the call.
pub type OodLogCallback = Option<extern "C" fn(level: c_int, message: *const c_char)>;

/// Address list handed to the host. Release with `ood_control_free_address_list`.
#[repr(C)]
pub struct AddressResult {
    pub count: usize,
    pub values: *mut *mut c_char,
}

/// Released headers kept poisoned before being freed, so a prompt second release is caught.
const QUARANTINE_LEN: usize = 64;

/// How long `ood_shutdown` waits for dispatched work to finish.
const WORKER_DRAIN: Duration = Duration::from_secs(5);

/// Factories for the collaborators behind the C handles.
#[derive(Clone, Copy)]
pub struct Backend {
    pub stack: fn() -> Arc<dyn NetworkStack>,
    pub handshake: fn() -> Arc<dyn BindHandshake>,
    pub reporter: fn(&StackConfig) -> Arc<dyn PerfReporter>,
}

fn local_stack() -> Arc<dyn NetworkStack> {
    Arc::new(LocalStack::new())
}

fn desc_handshake() -> Arc<dyn BindHandshake> {
    Arc::new(DescFileHandshake)
}

fn jsonl_reporter(config: &StackConfig) -> Arc<dyn PerfReporter> {
    Arc::new(JsonlReporter::new(&config.storage_path))
}

impl Default for Backend {
    fn default() -> Self {
        Self {
            stack: local_stack,
            handshake: desc_handshake,
            reporter: jsonl_reporter,
        }
    }
}

#[derive(Default)]
struct AddressRegistry {
    live: HashSet<usize>,
    released: VecDeque<usize>,
}

lazy_static! {
    static ref BACKEND: Mutex<Backend> = Mutex::new(Backend::default());
    static ref STACK: Mutex<Option<Arc<StackBootstrap>>> = Mutex::new(None);
    static ref CONTROLLER: Mutex<Option<OodController>> = Mutex::new(None);
    static ref PERF: Mutex<Option<PerfClient>> = Mutex::new(None);
    static ref BRIDGE: Mutex<LogBridge> = Mutex::new(LogBridge::disabled());
    static ref ADDRESSES: Mutex<AddressRegistry> = Mutex::new(AddressRegistry::default());
    static ref WORKER: Mutex<Option<Runtime>> = Mutex::new(None);
}

/// Replace the collaborators used for handles created from now on.
pub fn set_backend(backend: Backend) {
    *BACKEND.lock() = backend;
}

struct CallbackSink(extern "C" fn(c_int, *const c_char));

impl LogSink for CallbackSink {
    fn log(&self, record: &LogRecord) {
        let message = CString::new(record.message.replace('\0', " ")).unwrap_or_default();
        (self.0)(level_code(record.level), message.as_ptr());
    }
}

fn level_code(level: Level) -> c_int {
    match level {
        Level::Error => 1,
        Level::Warn => 2,
        Level::Info => 3,
        Level::Debug => 4,
        Level::Trace => 5,
    }
}

/// Wire the host callback; the most recent one also receives boundary diagnostics.
fn wire_sink(callback: OodLogCallback, log_level: &str) -> (Arc<dyn LogSink>, LogBridge) {
    let sink: Arc<dyn LogSink> = match callback {
        Some(cb) => Arc::new(CallbackSink(cb)),
        None => Arc::new(|_: &LogRecord| {}),
    };
    let level = parse_log_level(log_level).unwrap_or(log::LevelFilter::Info);
    let bridge = if callback.is_some() {
        LogBridge::new(sink.clone(), level)
    } else {
        LogBridge::disabled()
    };
    bridge.install_global();
    *BRIDGE.lock() = bridge.clone();
    (sink, bridge)
}

fn bridge() -> LogBridge {
    BRIDGE.lock().clone()
}

/// The network stack behind both `ood_stack_*` and the controller.
fn shared_stack(backend: &Backend) -> Arc<StackBootstrap> {
    STACK
        .lock()
        .get_or_insert_with(|| Arc::new(StackBootstrap::new((backend.stack)())))
        .clone()
}

/// Run `job` on the boundary worker. Falls back to the caller's thread if the
/// worker cannot be built.
fn dispatch(job: impl FnOnce() + Send + 'static) {
    let mut worker = WORKER.lock();
    if worker.is_none() {
        match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("ood-ffi")
            .build()
        {
            Ok(rt) => *worker = Some(rt),
            Err(e) => {
                drop(worker);
                log_warn!(bridge(), "boundary worker unavailable ({}), running inline", e);
                job();
                return;
            }
        }
    }
    if let Some(rt) = worker.as_ref() {
        rt.spawn_blocking(job);
    }
}

fn c_string(p: *const c_char) -> String {
    if p.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned()
}

fn c_string_opt(p: *const c_char) -> Option<String> {
    Some(c_string(p)).filter(|s| !s.trim().is_empty())
}

fn stack_config(
    storage_path: *const c_char,
    non_address: *const c_char,
    websocket_address: *const c_char,
    bdt_port: c_int,
    log_level: *const c_char,
    wifi_address: *const c_char,
) -> Result<StackConfig, ValidationError> {
    Ok(StackConfig {
        storage_path: c_string(storage_path).into(),
        non_address: c_string(non_address),
        websocket_address: c_string_opt(websocket_address),
        bdt_port: port_from_raw(i64::from(bdt_port))?,
        log_level: c_string(log_level),
        wifi_address: c_string_opt(wifi_address),
    })
}

/// Errors not already logged by the component that raised them.
fn report_start_error(bridge: &LogBridge, what: &str, e: &StartError) {
    match e {
        StartError::AlreadyStarted => log_info!(bridge, "{} already started", what),
        StartError::Stopped => log_info!(bridge, "{} stopped while starting", what),
        StartError::NotInitialized | StartError::Failed | StartError::Runtime(_) => {
            log_error!(bridge, "{}: {}", what, e)
        }
        StartError::Validation(_) | StartError::Launch { .. } => {}
    }
}

/// Start the network stack. `wifi_address` and `websocket_address` may be null.
#[no_mangle]
pub extern "C" fn ood_stack_start(
    storage_path: *const c_char,
    non_address: *const c_char,
    websocket_address: *const c_char,
    bdt_port: c_int,
    log_level: *const c_char,
    wifi_address: *const c_char,
    log_cb: OodLogCallback,
) {
    let (sink, bridge) = wire_sink(log_cb, &c_string(log_level));
    let config = match stack_config(
        storage_path,
        non_address,
        websocket_address,
        bdt_port,
        log_level,
        wifi_address,
    ) {
        Ok(c) => c,
        Err(e) => {
            log_error!(bridge, "network stack start rejected: {}", e);
            return;
        }
    };
    if let Err(e) = config.validate() {
        log_error!(bridge, "network stack start rejected: {}", e);
        return;
    }
    let backend = *BACKEND.lock();
    let boot = shared_stack(&backend);
    dispatch(move || {
        if let Err(e) = boot.start(config, sink) {
            report_start_error(&bridge, "network stack", &e);
        }
    });
}

#[no_mangle]
pub extern "C" fn ood_stack_restart_interface() {
    let Some(boot) = STACK.lock().clone() else {
        log_error!(bridge(), "restart interface: network stack not started");
        return;
    };
    dispatch(move || match boot.restart_interface() {
        Ok(()) | Err(RestartError::Interface { .. }) => {}
        Err(e @ RestartError::Busy) => log_warn!(boot.bridge(), "restart interface: {}", e),
        Err(e @ RestartError::NotRunning) => log_error!(bridge(), "restart interface: {}", e),
    });
}

#[no_mangle]
pub extern "C" fn ood_stack_reset_network(wifi_address: *const c_char) {
    let Some(boot) = STACK.lock().clone() else {
        log_error!(bridge(), "reset network: network stack not started");
        return;
    };
    let wifi_address = c_string(wifi_address);
    if let Err(e) = parse_ip_addr("wifi_address", &wifi_address) {
        log_error!(boot.bridge(), "reset network rejected: {}", e);
        return;
    }
    dispatch(move || match boot.reset_network(&wifi_address) {
        Ok(()) | Err(ResetError::Network { .. }) | Err(ResetError::Validation(_)) => {}
        Err(e @ ResetError::Busy) => log_warn!(boot.bridge(), "reset network: {}", e),
        Err(e @ ResetError::NotRunning) => log_error!(bridge(), "reset network: {}", e),
    });
}

#[allow(clippy::too_many_arguments)]
#[no_mangle]
pub extern "C" fn ood_perf_client_start(
    owner_id: *const c_char,
    dec_id: *const c_char,
    client_address: *const c_char,
    storage_path: *const c_char,
    non_address: *const c_char,
    websocket_address: *const c_char,
    bdt_port: c_int,
    log_level: *const c_char,
    wifi_address: *const c_char,
    log_cb: OodLogCallback,
) {
    let (sink, bridge) = wire_sink(log_cb, &c_string(log_level));
    let config = match stack_config(
        storage_path,
        non_address,
        websocket_address,
        bdt_port,
        log_level,
        wifi_address,
    ) {
        Ok(c) => c,
        Err(e) => {
            log_error!(bridge, "perf client start rejected: {}", e);
            return;
        }
    };
    if let Err(e) = config.validate() {
        log_error!(bridge, "perf client start rejected: {}", e);
        return;
    }
    let backend = *BACKEND.lock();
    let client = PERF
        .lock()
        .get_or_insert_with(|| PerfClient::new((backend.stack)(), (backend.reporter)(&config)))
        .clone();
    let owner_id = c_string(owner_id);
    let dec_id = c_string(dec_id);
    let client_address = c_string(client_address);
    dispatch(move || {
        if let Err(e) = client.start(&owner_id, &dec_id, &client_address, config, sink) {
            report_start_error(&bridge, "perf client", &e);
        }
    });
}

/// Queue one stat. Never blocks; dropped (and counted) when the queue is full.
#[no_mangle]
pub extern "C" fn ood_perf_submit_stat(
    id: *const c_char,
    key: *const c_char,
    byte_count: u64,
    error_code: u32,
    name: *const c_char,
    value: u64,
) {
    let Some(client) = PERF.lock().clone() else {
        log_debug!(bridge(), "perf stat dropped, perf client not started");
        return;
    };
    client.submit_stat(
        &c_string(id),
        &c_string(key),
        byte_count,
        error_code,
        &c_string(name),
        value,
    );
}

#[no_mangle]
pub extern "C" fn ood_control_init(
    storage_path: *const c_char,
    log_level: *const c_char,
    log_cb: OodLogCallback,
) {
    let level = c_string(log_level);
    let (sink, bridge) = wire_sink(log_cb, &level);
    let config = StackConfig::for_ood(c_string(storage_path), level);
    let backend = *BACKEND.lock();
    let controller = CONTROLLER
        .lock()
        .get_or_insert_with(|| {
            OodController::with_bootstrap(
                shared_stack(&backend),
                (backend.handshake)(),
                BindPolicy::default(),
            )
        })
        .clone();
    match controller.init(config, sink) {
        Ok(()) => {}
        Err(e @ InitError::AlreadyStarted(_)) => log_info!(bridge, "ood control init: {}", e),
        Err(e @ InitError::Runtime(_)) => log_error!(bridge, "ood control init: {}", e),
    }
}

#[no_mangle]
pub extern "C" fn ood_control_start() {
    let Some(controller) = CONTROLLER.lock().clone() else {
        log_error!(bridge(), "ood control start: not initialized");
        return;
    };
    if let Err(e) = controller.start() {
        report_start_error(&bridge(), "ood control", &e);
    }
}

/// Block until the bind handshake settles. Returns at once if not waiting for bind.
#[no_mangle]
pub extern "C" fn ood_control_wait_bind() {
    let Some(controller) = CONTROLLER.lock().clone() else {
        log_warn!(bridge(), "ood control wait bind: not initialized");
        return;
    };
    let state = controller.wait_bind();
    if state != BindState::Bound {
        log_debug!(bridge(), "ood control wait bind returned in state {}", state);
    }
}

/// 1 if bound, else 0.
#[no_mangle]
pub extern "C" fn ood_control_is_bind() -> u8 {
    CONTROLLER
        .lock()
        .clone()
        .map(|c| c.is_bound() as u8)
        .unwrap_or(0)
}

/// Current addresses as `ip:port` strings, or null unless bound.
/// The caller owns the result and must release it exactly once.
#[no_mangle]
pub extern "C" fn ood_control_get_address_list() -> *mut AddressResult {
    let Some(controller) = CONTROLLER.lock().clone() else {
        return ptr::null_mut();
    };
    let Some(list) = controller.address_list() else {
        return ptr::null_mut();
    };
    let values: Vec<*mut c_char> = list
        .into_iter()
        .filter_map(|addr| CString::new(addr).ok())
        .map(CString::into_raw)
        .collect();
    let count = values.len();
    let values = if count == 0 {
        ptr::null_mut()
    } else {
        Box::into_raw(values.into_boxed_slice()) as *mut *mut c_char
    };
    let result = Box::into_raw(Box::new(AddressResult { count, values }));
    ADDRESSES.lock().live.insert(result as usize);
    result
}

/// Release a list from `ood_control_get_address_list`. Null is a no-op; a repeated or
/// unknown handle is logged and ignored.
#[no_mangle]
pub extern "C" fn ood_control_free_address_list(result: *mut AddressResult) {
    if result.is_null() {
        return;
    }
    let key = result as usize;
    let evicted = {
        let mut registry = ADDRESSES.lock();
        if !registry.live.remove(&key) {
            let twice = registry.released.contains(&key);
            drop(registry);
            if twice {
                log_error!(bridge(), "address list {:p} released twice", result);
            } else {
                log_error!(bridge(), "release of unknown address list {:p}", result);
            }
            return;
        }
        unsafe {
            let header = &mut *result;
            if !header.values.is_null() {
                let values =
                    Box::from_raw(ptr::slice_from_raw_parts_mut(header.values, header.count));
                for value in values.iter() {
                    drop(CString::from_raw(*value));
                }
            }
            header.count = 0;
            header.values = ptr::null_mut();
        }
        registry.released.push_back(key);
        if registry.released.len() > QUARANTINE_LEN {
            registry.released.pop_front()
        } else {
            None
        }
    };
    if let Some(old) = evicted {
        drop(unsafe { Box::from_raw(old as *mut AddressResult) });
    }
}

/// Finish dispatched work, then stop the perf client, the controller and the network
/// stack, and drop their handles.
#[no_mangle]
pub extern "C" fn ood_shutdown() {
    let worker = WORKER.lock().take();
    if let Some(rt) = worker {
        rt.shutdown_timeout(WORKER_DRAIN);
    }
    let perf = PERF.lock().take();
    let controller = CONTROLLER.lock().take();
    let stack = STACK.lock().take();
    if let Some(perf) = perf {
        perf.stop();
    }
    if let Some(controller) = controller {
        controller.shutdown();
    }
    if let Some(stack) = stack {
        stack.stop();
    }
    log_info!(bridge(), "ood handles shut down");
}
