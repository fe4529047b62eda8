//! Logging initialization using `tracing` and `tracing-subscriber`.

use std::path::{Path, PathBuf};

use tracing::info;
use tracing_subscriber::{fmt, fmt::writer::BoxMakeWriter, util::SubscriberInitExt, EnvFilter};

use crate::overlay::OverlayMetrics;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

#[derive(Debug, Clone)]
pub enum LogSink {
    /// Log to stderr, keeping stdout free for the embedding process.
    Console,
    /// Append-only log file.
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub sink: LogSink,
    pub debug: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Human,
            sink: LogSink::Console,
            debug: false,
        }
    }
}

/// Initialize the global tracing subscriber. Safe to call multiple times;
/// subsequent calls will no-op.
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = if config.debug {
        EnvFilter::new("trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let (writer, ansi) = match &config.sink {
        LogSink::Console => (BoxMakeWriter::new(std::io::stderr), true),
        LogSink::File(path) => {
            ensure_parent(path)?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            (BoxMakeWriter::new(std::sync::Mutex::new(file)), false)
        }
    };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(writer)
        .with_ansi(ansi);

    match config.format {
        LogFormat::Human => {
            let _ = builder.finish().try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().finish().try_init();
        }
    };

    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Emit overlay store counters as one structured event. Callers should pass
/// a periodically sampled snapshot to avoid excessive log volume.
pub fn log_overlay_metrics(snapshot: OverlayMetrics) {
    info!(
        target: "grovefs::overlay",
        dirs_loaded = snapshot.dirs_loaded,
        dirs_saved = snapshot.dirs_saved,
        files_created = snapshot.files_created,
        files_opened = snapshot.files_opened,
        files_removed = snapshot.files_removed,
        scans = snapshot.scans,
        "overlay_store_metrics"
    );
}
