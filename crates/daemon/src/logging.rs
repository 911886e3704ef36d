//! Console and activity-log output.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber: stderr for the operator, plus an
/// append-only plain-text file when `log_file` can be opened.
///
/// `RUST_LOG` overrides the level chosen from `debug`. Calling this twice is
/// harmless; the second call is ignored.
pub fn setup_logging(debug: bool, log_file: Option<&Path>) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (file, file_error) = match log_file.map(|path| (path, open_activity_log(path))) {
        Some((_, Ok(file))) => (Some(file), None),
        Some((path, Err(e))) => (None, Some((path, e))),
        None => (None, None),
    };
    let file_layer = file.map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(Mutex::new(file))
    });

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr).with_target(debug))
        .with(file_layer)
        .try_init()
        .is_ok();
    if !installed {
        return;
    }

    if let Some((path, e)) = file_error {
        warn!(
            path = %path.display(),
            error = %e,
            "activity log unavailable, logging to console only"
        );
    }
    info!("logging initialized");
}

/// Open `path` for appending, creating it and its parent directory.
pub fn open_activity_log(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}
