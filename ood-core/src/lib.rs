//! OOD device control core: network stack bootstrap, device binding, address
//! hand-off and perf telemetry. Linked as a static library by mobile hosts.

pub mod address;
pub mod bind;
pub mod config;
pub mod controller;
pub mod ffi;
pub mod local;
pub mod logging;
pub mod perf;
pub mod stack;

pub use address::AddressList;
pub use bind::{BindError, BindHandshake, BindInfo, BindPolicy, BindState};
pub use config::{StackConfig, ValidationError};
pub use controller::{InitError, OodController};
pub use local::{DescFileHandshake, JsonlReporter, LocalStack};
pub use logging::{LogBridge, LogRecord, LogSink};
pub use perf::{PerfBatch, PerfClient, PerfCounters, PerfError, PerfOptions, PerfReporter, PerfStat};
pub use stack::{
    NetworkStack, ResetError, RestartError, RetryPolicy, StackBootstrap, StackError, StackState,
    StartError,
};

#[cfg(test)]
mod testing;
