//! File-backed tracing subscriber for the payload, which has no console of its own.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::Level;

/// `<temp>/bgctl-hook-<pid>.log`
pub fn log_path() -> PathBuf {
    std::env::temp_dir().join(format!("bgctl-hook-{}.log", std::process::id()))
}

/// Install the global subscriber. Silently does nothing if the log file cannot be opened or a
/// subscriber is already set, so logging never blocks the payload from loading.
pub fn init() {
    let Ok(file) = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path())
    else {
        return;
    };

    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_ansi(false)
        .with_thread_ids(true)
        .with_max_level(Level::DEBUG)
        .with_writer(Mutex::new(file))
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
