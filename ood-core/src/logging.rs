//! Logging bridge: every diagnostic goes to one host-supplied sink.
//! The sink may be called from any worker thread, concurrently.

use std::fmt;
use std::sync::Arc;

use lazy_static::lazy_static;
use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::RwLock;

lazy_static! {
    /// Where `log` facade records currently go. Replaced by every `install_global`.
    static ref FACADE_ROUTE: RwLock<LogBridge> = RwLock::new(LogBridge::disabled());
    /// Whether our logger owns the facade. The facade accepts one logger per process.
    static ref FACADE_INSTALLED: bool = log::set_logger(&FACADE).is_ok();
}

static FACADE: FacadeLogger = FacadeLogger;

/// One diagnostic. Delivered synchronously to the sink and not retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: Level,
    pub message: String,
}

/// Receives diagnostics. Implemented for any `Fn(&LogRecord) + Send + Sync`.
pub trait LogSink: Send + Sync {
    fn log(&self, record: &LogRecord);
}

impl<F> LogSink for F
where
    F: Fn(&LogRecord) + Send + Sync,
{
    fn log(&self, record: &LogRecord) {
        self(record)
    }
}

/// Sink plus level threshold. Cheap to clone; holds no lock while calling the sink.
#[derive(Clone)]
pub struct LogBridge {
    sink: Option<Arc<dyn LogSink>>,
    level: LevelFilter,
}

impl fmt::Debug for LogBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogBridge")
            .field("has_sink", &self.sink.is_some())
            .field("level", &self.level)
            .finish()
    }
}

impl Default for LogBridge {
    fn default() -> Self {
        Self::disabled()
    }
}

impl LogBridge {
    pub fn new(sink: Arc<dyn LogSink>, level: LevelFilter) -> Self {
        Self {
            sink: Some(sink),
            level,
        }
    }

    /// Bridge that drops everything. Used before a sink is wired.
    pub fn disabled() -> Self {
        Self {
            sink: None,
            level: LevelFilter::Off,
        }
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    pub fn enabled(&self, level: Level) -> bool {
        self.sink.is_some() && level <= self.level
    }

    /// Format the whole message, then hand it to the sink in one call.
    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        if let Some(sink) = &self.sink {
            let record = LogRecord {
                level,
                message: args.to_string(),
            };
            sink.log(&record);
        }
    }

    /// Route records from the `log` facade (used by collaborator crates) into this
    /// bridge, replacing the previous route. Returns false if a foreign logger
    /// already owns the facade.
    pub fn install_global(&self) -> bool {
        *FACADE_ROUTE.write() = self.clone();
        if !*FACADE_INSTALLED {
            return false;
        }
        log::set_max_level(self.level);
        true
    }
}

/// `log::Log` adapter forwarding to the current route.
struct FacadeLogger;

impl Log for FacadeLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        FACADE_ROUTE.read().enabled(metadata.level())
    }

    fn log(&self, record: &Record<'_>) {
        let bridge = FACADE_ROUTE.read().clone();
        bridge.log(
            record.level(),
            format_args!("[{}] {}", record.target(), record.args()),
        );
    }

    fn flush(&self) {}
}

#[macro_export]
macro_rules! log_error {
    ($bridge:expr, $($arg:tt)+) => {
        $bridge.log(::log::Level::Error, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($bridge:expr, $($arg:tt)+) => {
        $bridge.log(::log::Level::Warn, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! log_info {
    ($bridge:expr, $($arg:tt)+) => {
        $bridge.log(::log::Level::Info, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($bridge:expr, $($arg:tt)+) => {
        $bridge.log(::log::Level::Debug, format_args!($($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CollectSink;

    #[test]
    fn level_threshold_filters() {
        let sink = Arc::new(CollectSink::default());
        let bridge = LogBridge::new(sink.clone(), LevelFilter::Warn);
        log_error!(bridge, "boom {}", 1);
        log_warn!(bridge, "careful");
        log_info!(bridge, "hidden");
        log_debug!(bridge, "hidden too");
        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].level, Level::Error);
        assert_eq!(records[0].message, "boom 1");
        assert_eq!(records[1].level, Level::Warn);
    }

    #[test]
    fn disabled_bridge_drops_everything() {
        let bridge = LogBridge::disabled();
        assert!(!bridge.enabled(Level::Error));
        log_error!(bridge, "nobody hears this");
    }

    #[test]
    fn closure_sink() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let bridge = LogBridge::new(
            Arc::new(move |r: &LogRecord| seen_cb.lock().push(r.message.clone())),
            LevelFilter::Trace,
        );
        log_info!(bridge, "hello");
        assert_eq!(*seen.lock(), vec!["hello".to_string()]);
    }

    #[test]
    fn concurrent_messages_arrive_whole() {
        let sink = Arc::new(CollectSink::default());
        let bridge = LogBridge::new(sink.clone(), LevelFilter::Trace);
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let bridge = bridge.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        log_info!(bridge, "worker-{}-message-{}-{}", t, i, "x".repeat(64));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let records = sink.records();
        assert_eq!(records.len(), 8 * 200);
        for r in records {
            assert!(r.message.starts_with("worker-"));
            assert!(r.message.ends_with(&"x".repeat(64)));
            assert_eq!(r.message.matches("worker-").count(), 1);
        }
    }
}
