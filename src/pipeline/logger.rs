//! Run-scoped logging.
//!
//! Every pipeline run installs its own thread-local subscriber for the
//! duration of the run. Its sink writes to stderr (or stdout) and, once
//! [`RunLog::start_log_to_file`] has been called, also to `<label>.log`.
//! The subscriber is removed when the returned guard drops, whatever way
//! the run ends.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, Registry};

use crate::error::{Error, Result};

/// Stream receiving the run log besides the optional file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    #[default]
    Stderr,
    Stdout,
}

/// Arguments of the implicit `log_config` task.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfigArgs {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub stream: Option<LogStream>,
    #[serde(default)]
    pub filename: Option<PathBuf>,
}

struct Sink {
    stream: LogStream,
    file: Option<File>,
}

/// Writer factory shared between the subscriber and the [`RunLog`].
#[derive(Clone)]
struct SinkWriter(Arc<Mutex<Sink>>);

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut sink = self.0.lock().unwrap_or_else(|e| e.into_inner());
        match sink.stream {
            LogStream::Stderr => io::stderr().write_all(buf)?,
            LogStream::Stdout => io::stdout().write_all(buf)?,
        }
        if let Some(file) = sink.file.as_mut() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut sink = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(file) = sink.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for SinkWriter {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Log state owned by one pipeline run.
pub struct RunLog {
    level: LevelFilter,
    filename: PathBuf,
    log_path: Option<PathBuf>,
    sink: Arc<Mutex<Sink>>,
    handle: reload::Handle<LevelFilter, Registry>,
}

impl std::fmt::Debug for RunLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLog")
            .field("level", &self.level)
            .field("filename", &self.filename)
            .field("log_path", &self.log_path)
            .finish()
    }
}

impl RunLog {
    /// Install a run log for `label` on the current thread.
    ///
    /// The log stays active until the guard is dropped.
    pub fn install(label: &str) -> (Self, DefaultGuard) {
        let level = LevelFilter::INFO;
        let sink = Arc::new(Mutex::new(Sink {
            stream: LogStream::Stderr,
            file: None,
        }));
        let (filter, handle) = reload::Layer::new(level);
        let subscriber = tracing_subscriber::registry().with(filter).with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(SinkWriter(sink.clone())),
        );
        let guard = tracing::subscriber::set_default(subscriber);

        let log = Self {
            level,
            filename: PathBuf::from(format!("{}.log", label)),
            log_path: None,
            sink,
            handle,
        };
        (log, guard)
    }

    /// Current level.
    pub fn level(&self) -> LevelFilter {
        self.level
    }

    /// Path of the log file, once logging to file has started.
    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Apply `log_config` task arguments.
    pub fn config(&mut self, args: LogConfigArgs) -> Result<()> {
        if let Some(level) = args.level {
            let level = LevelFilter::from_str(&level)
                .map_err(|_| Error::Config(format!("unknown log level: {}", level)))?;
            self.handle
                .reload(level)
                .map_err(|e| Error::Config(format!("cannot change log level: {}", e)))?;
            self.level = level;
        }
        if let Some(stream) = args.stream {
            self.lock_sink().stream = stream;
        }
        if let Some(filename) = args.filename {
            self.filename = filename;
            // Follow the new file name if a log file is already open
            if let Some(current) = self.log_path.take() {
                let directory = current.parent().map(Path::to_path_buf).unwrap_or_default();
                self.open_file(&directory, true)?;
            }
        }
        Ok(())
    }

    /// Start writing the log to a file in `directory`.
    ///
    /// The directory is ignored if the configured file name already carries
    /// a parent path.
    pub fn start_log_to_file(&mut self, directory: &Path) -> Result<PathBuf> {
        self.open_file(directory, false)
    }

    /// Flush and close the log file.
    pub fn terminate(self) {
        let mut sink = self.lock_sink();
        if let Some(mut file) = sink.file.take() {
            let _ = file.flush();
        }
    }

    fn open_file(&mut self, directory: &Path, append: bool) -> Result<PathBuf> {
        let has_parent = self
            .filename
            .parent()
            .map(|p| !p.as_os_str().is_empty())
            .unwrap_or(false);
        let path = if has_parent {
            self.filename.clone()
        } else {
            directory.join(&self.filename)
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(Error::NotFound(format!(
                    "log directory does not exist: {}",
                    parent.display()
                )));
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&path)?;
        self.lock_sink().file = Some(file);
        tracing::debug!("Start stream to file: {}", path.display());
        self.log_path = Some(path.clone());
        Ok(path)
    }

    fn lock_sink(&self) -> std::sync::MutexGuard<'_, Sink> {
        self.sink.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_log_to_file() {
        let dir = TempDir::new().unwrap();
        let (mut log, guard) = RunLog::install("tile_1_2");
        let path = log.start_log_to_file(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("tile_1_2.log"));

        tracing::info!("hello from the run");
        tracing::debug!("hidden at info level");
        log.terminate();
        drop(guard);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("hello from the run"));
        assert!(!content.contains("hidden at info level"));
    }

    #[test]
    fn test_level_reload() {
        let dir = TempDir::new().unwrap();
        let (mut log, guard) = RunLog::install("run");
        log.config(LogConfigArgs {
            level: Some("debug".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(log.level(), LevelFilter::DEBUG);
        let path = log.start_log_to_file(dir.path()).unwrap();
        tracing::debug!("now visible");
        log.terminate();
        drop(guard);

        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("now visible"));
    }

    #[test]
    fn test_rename_log_file_while_open() {
        let dir = TempDir::new().unwrap();
        let (mut log, _guard) = RunLog::install("first");
        log.start_log_to_file(dir.path()).unwrap();
        log.config(LogConfigArgs {
            filename: Some("second.log".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(log.log_path(), Some(dir.path().join("second.log").as_path()));
    }

    #[test]
    fn test_invalid_level() {
        let (mut log, _guard) = RunLog::install("run");
        let err = log
            .config(LogConfigArgs {
                level: Some("loud".into()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_log_directory() {
        let dir = TempDir::new().unwrap();
        let (mut log, _guard) = RunLog::install("run");
        assert!(log.start_log_to_file(&dir.path().join("nope")).is_err());
    }
}
