// OOD Linux: hosts the device binding controller and the perf client on the local stack.

mod config;

use std::sync::Arc;

use anyhow::Context;
use ood_core::{
    BindState, DescFileHandshake, JsonlReporter, LocalStack, LogBridge, LogRecord, LogSink,
    OodController, PerfClient, RetryPolicy,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Timestamped lines on stderr; one write per record.
struct StderrSink;

impl LogSink for StderrSink {
    fn log(&self, record: &LogRecord) {
        eprintln!(
            "{} {:<5} {}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            record.level,
            record.message
        );
    }
}

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("ood-linux {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load()?;
    let stack_config = cfg.stack_config();
    let sink: Arc<dyn LogSink> = Arc::new(StderrSink);
    // The daemon's own diagnostics go through the `log` facade into the same sink.
    LogBridge::new(sink.clone(), stack_config.level_filter()).install_global();
    log::info!(
        "ood-linux {} starting, storage={}",
        VERSION,
        stack_config.storage_path.display()
    );

    let controller = OodController::with_policies(
        Arc::new(LocalStack::new()),
        Arc::new(DescFileHandshake),
        cfg.bind_policy(),
        RetryPolicy::default(),
    );
    controller.init(stack_config.clone(), sink.clone())?;
    controller.on_bind(|info| {
        log::info!(
            "device {} bound to owner {}",
            info.device_id,
            info.owner_id.as_deref().unwrap_or("-")
        );
    });
    controller.start().context("start ood control")?;

    let perf = if cfg.perf.enabled {
        let client = PerfClient::with_options(
            Arc::new(LocalStack::new()),
            Arc::new(JsonlReporter::new(&stack_config.storage_path)),
            cfg.perf_options(),
        );
        client
            .start(
                &cfg.perf.owner_id,
                &cfg.perf.dec_id,
                &cfg.perf.client_address,
                cfg.perf_stack_config(),
                sink.clone(),
            )
            .context("start perf client")?;
        Some(client)
    } else {
        None
    };

    {
        let controller = controller.clone();
        std::thread::spawn(move || {
            let state = controller.wait_bind();
            if state != BindState::Bound {
                log::warn!("bind ended in state {}", state);
                return;
            }
            if let Some(list) = controller.address_list() {
                log::info!("serving addresses: {}", list.as_slice().join(", "));
                controller.release_address_list(Some(list));
            }
        });
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(shutdown_signal())?;
    log::info!("shutdown requested");

    if let Some(perf) = perf {
        perf.stop();
    }
    controller.shutdown();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
