pub mod config;
pub mod db;
pub mod extraction_api;
pub mod pipeline;
pub mod remote;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global `tracing` subscriber. Events go to stderr and, when
/// `log_dir` is given, are also appended to a dated file there. `RUST_LOG`
/// wins over the built-in filter. Calling it twice is harmless.
///
/// Returns the log file path, if any.
pub fn init_tracing(log_dir: Option<&Path>) -> std::io::Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter()));

    let (file_layer, log_path) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(config::log_file_name(chrono::Local::now().date_naive()));
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            let layer = fmt::layer().with_ansi(false).with_writer(Mutex::new(file));
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init();
    Ok(log_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_dir_gets_a_dated_file() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");

        let path = init_tracing(Some(&logs)).unwrap().unwrap();
        assert!(path.starts_with(&logs));
        assert!(path.exists());
        assert!(path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("pop-reconcile-"));

        assert_eq!(init_tracing(None).unwrap(), None);
    }
}
