//! Tracing setup for the server and CLI.
//!
//! Pipeline events carry structured fields: `document_id`, `pages` and `chunks` on ingest,
//! `hits` and `min_score` on retrieval, `attempt` and `max_attempts` on synthesis retries.
//! They are written twice: a compact stdout layer without targets, and a plain-text file layer
//! with targets. The file is `DOCSYNTH_LOG_FILE` when set and `logs/docsynth.log` otherwise.
//! `RUST_LOG` filters both layers and defaults to `info`.
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_LOG_FILE: &str = "logs/docsynth.log";

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber. Logging to stdout continues if the log file cannot be opened.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_target(false).compact();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer);

    match file_writer(&log_file_path(std::env::var("DOCSYNTH_LOG_FILE").ok())) {
        Some(writer) => {
            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false)
                .compact();
            registry.with(file_layer).init();
        }
        None => registry.init(),
    }
}

/// Resolve the log file, treating a blank setting as unset.
fn log_file_path(configured: Option<String>) -> PathBuf {
    configured
        .filter(|value| !value.trim().is_empty())
        .map_or_else(|| PathBuf::from(DEFAULT_LOG_FILE), PathBuf::from)
}

fn file_writer(path: &Path) -> Option<NonBlocking> {
    match open_log_file(path) {
        Ok(file) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            let _ = LOG_GUARD.set(guard);
            Some(non_blocking)
        }
        Err(err) => {
            eprintln!("Failed to open log file {}: {err}", path.display());
            None
        }
    }
}

/// Open `path` for appending, creating missing parent directories.
fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}
