use std::fs::OpenOptions;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// Env var naming a file that receives debug-level logs
pub const LOG_FILE_ENV: &str = "CONVSYNC_LOG_FILE";

pub fn init_tracing() {
    init_tracing_with_level(LevelFilter::INFO);
}

/// Install the global subscriber: stderr at `level`, plus a debug-level file
/// layer when `CONVSYNC_LOG_FILE` is set. Safe to call more than once.
pub fn init_tracing_with_level(level: LevelFilter) {
    let file_logging = std::env::var(LOG_FILE_ENV).ok();

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(level);

    let registry = tracing_subscriber::registry().with(stderr_layer);

    let file = file_logging.as_ref().and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!("Could not open log file {}: {}", path, e);
                None
            }
        }
    });

    if let Some(file) = file {
        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_filter(LevelFilter::DEBUG);

        if registry.with(file_layer).try_init().is_ok() {
            if let Some(path) = file_logging {
                eprintln!("File logging enabled: {}", path);
            }
        }
    } else {
        // Already installed (tests, embedding) is fine
        let _ = registry.try_init();
    }
}
