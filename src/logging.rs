use tracing::info;
use tracing_appender::non_blocking;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging for the service: console always, plus a daily-rotating
/// file sink under `log_dir` when that directory is writable.
pub fn init_service_logging(log_dir: &str, service_name: &str) -> Result<(), anyhow::Error> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let can_write_logs = std::fs::create_dir_all(log_dir)
        .and_then(|_| std::fs::File::create(format!("{log_dir}/.test_write")))
        .map(|_| std::fs::remove_file(format!("{log_dir}/.test_write")))
        .is_ok();

    if can_write_logs {
        use tracing_appender::rolling;

        let file_appender = rolling::daily(log_dir, format!("{service_name}.log"));
        let (non_blocking_file, guard_file) = non_blocking(file_appender);
        let (non_blocking_stdout, guard_stdout) = non_blocking(std::io::stdout());

        let file_layer = fmt::layer()
            .with_writer(non_blocking_file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true);

        let console_layer = fmt::layer()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .with_target(false)
            .with_thread_ids(false)
            .with_line_number(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .init();

        std::mem::forget(guard_file);
        std::mem::forget(guard_stdout);

        info!("logging initialized - writing to {log_dir}/{service_name}.log");
    } else {
        let (non_blocking_stdout, guard_stdout) = non_blocking(std::io::stdout());

        let console_layer = fmt::layer()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .with_target(false)
            .with_thread_ids(false)
            .with_line_number(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        std::mem::forget(guard_stdout);

        info!("logging initialized - console output only (could not create log directory)");
    }

    Ok(())
}
