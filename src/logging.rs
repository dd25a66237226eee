#![forbid(unsafe_code)]

//! Tracing setup. Console output goes to stderr because stdout is reserved for
//! the list of completed item directories.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Keeps the non-blocking file writer alive; drop it last.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Installs the global subscriber. `RUST_LOG` wins over `level`. When
/// `log_file` is set, records are also appended to it without ANSI colors.
pub fn init_logging(level: &str, log_file: Option<&Path>) -> LogGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let console_layer = fmt::layer()
        .with_target(false)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_writer(io::stderr);

    let (file_layer, file_guard) = match log_file.map(open_log_file) {
        Some(Ok(file)) => {
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer()
                .with_target(true)
                .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        Some(Err(err)) => {
            eprintln!("could not open log file, logging to stderr only: {err}");
            (None, None)
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();
    if installed.is_ok() {
        if let Some(path) = log_file.filter(|_| file_guard.is_some()) {
            info!(file = %path.display(), "file logging enabled");
        }
    }

    LogGuard {
        _file_guard: file_guard,
    }
}

fn open_log_file(path: &Path) -> io::Result<fs::File> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn log_file_and_parents_are_created() -> Result<()> {
        let temp = tempdir()?;
        let path = temp.path().join("logs/nested/ytpl.log");
        open_log_file(&path)?;
        assert!(path.is_file());
        Ok(())
    }

    #[test]
    fn init_logging_survives_unwritable_file() -> Result<()> {
        let temp = tempdir()?;
        let blocker = temp.path().join("blocker");
        fs::write(&blocker, b"file, not a directory")?;
        let guard = init_logging("debug", Some(&blocker.join("ytpl.log")));
        assert!(guard._file_guard.is_none());
        Ok(())
    }
}
