//! Error type shared by the grid, the pipelines and the batch executor.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Result type for laserfarm operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for laserfarm operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad grid parameters, task names, argument shapes or options.
    #[error("configuration error: {0}")]
    Config(String),

    /// Input that is well-formed but not acceptable (empty cloud, unknown filter, ...)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A required local or remote path is missing
    #[error("not found: {0}")]
    NotFound(String),

    /// A path that must not exist already does
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Requested mode or format is not supported
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Remote storage failure
    #[error("remote storage error: {0}")]
    Remote(#[from] object_store::Error),

    /// Remote client used before it was configured
    #[error("remote client error: {0}")]
    RemoteClient(String),

    /// IO error during file operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// LAS/LAZ reader or writer failure
    #[error("LAS error: {0}")]
    Las(#[from] las::Error),

    /// JSON (de)serialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization failure
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A task failed with a domain-specific reason
    #[error("{task} failed: {message}")]
    Task { task: String, message: String },

    /// Cluster setup or dispatch failure
    #[error("executor error: {0}")]
    Executor(String),

    /// Raster output failure
    #[error("raster error: {0}")]
    Raster(String),
}

/// Stable classification of an [`Error`], carried across process boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    InvalidInput,
    NotFound,
    AlreadyExists,
    NotImplemented,
    Remote,
    Io,
    Las,
    Json,
    Yaml,
    Task,
    Executor,
    Raster,
    Panic,
}

impl ErrorKind {
    /// Name used in outcome reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "ConfigError",
            ErrorKind::InvalidInput => "InvalidInputError",
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::AlreadyExists => "AlreadyExistsError",
            ErrorKind::NotImplemented => "NotImplementedError",
            ErrorKind::Remote => "RemoteError",
            ErrorKind::Io => "IoError",
            ErrorKind::Las => "LasError",
            ErrorKind::Json => "JsonError",
            ErrorKind::Yaml => "YamlError",
            ErrorKind::Task => "TaskError",
            ErrorKind::Executor => "ExecutorError",
            ErrorKind::Raster => "RasterError",
            ErrorKind::Panic => "Panic",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::NotImplemented(_) => ErrorKind::NotImplemented,
            Error::Remote(_) | Error::RemoteClient(_) => ErrorKind::Remote,
            Error::Io(_) => ErrorKind::Io,
            Error::Las(_) => ErrorKind::Las,
            Error::Json(_) => ErrorKind::Json,
            Error::Yaml(_) => ErrorKind::Yaml,
            Error::Task { .. } => ErrorKind::Task,
            Error::Executor(_) => ErrorKind::Executor,
            Error::Raster(_) => ErrorKind::Raster,
        }
    }

    /// Build a task failure.
    pub fn task(task: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Task {
            task: task.into(),
            message: message.into(),
        }
    }
}
