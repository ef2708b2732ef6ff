use std::path::{Path, PathBuf};

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Keeps the non-blocking writers flushing until the daemon exits.
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
    pub log_file: Option<PathBuf>,
}

/// Console logging always; a daily rolling file under `log_dir` when the
/// directory is writable. `RUST_LOG` controls the filter.
pub fn init_service_logging(log_dir: &Path, service_name: &str) -> anyhow::Result<LogGuards> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let console_layer = fmt::layer()
        .with_writer(stdout_writer)
        .with_ansi(true)
        .with_target(false)
        .boxed();

    if !log_dir_writable(log_dir) {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        info!(
            "Logging to console only ({} is not writable)",
            log_dir.display()
        );
        return Ok(LogGuards {
            _guards: vec![stdout_guard],
            log_file: None,
        });
    }

    rotate_logs_on_startup(log_dir, service_name)?;

    let file_name = format!("{service_name}.log");
    let file_appender = tracing_appender::rolling::daily(log_dir, &file_name);
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .boxed();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(vec![file_layer, console_layer])
        .init();

    let log_file = log_dir.join(file_name);
    info!("Logging initialized, file output at {}", log_file.display());

    Ok(LogGuards {
        _guards: vec![file_guard, stdout_guard],
        log_file: Some(log_file),
    })
}

fn log_dir_writable(log_dir: &Path) -> bool {
    let check = log_dir.join(".write_check");
    std::fs::create_dir_all(log_dir)
        .and_then(|_| std::fs::File::create(&check))
        .and_then(|_| std::fs::remove_file(&check))
        .is_ok()
}

/// Move the previous run's log aside so each daemon start begins a fresh file.
pub fn rotate_logs_on_startup(log_dir: &Path, service_name: &str) -> anyhow::Result<()> {
    let current = log_dir.join(format!("{service_name}.log"));
    if current.exists() {
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let backup = log_dir.join(format!("{service_name}.{timestamp}.log"));
        std::fs::rename(&current, &backup)?;
    }
    Ok(())
}
