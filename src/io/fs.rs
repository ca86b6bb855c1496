//! Local filesystem checks and JSON argument files.

use std::path::Path;

use serde_json::Value;

use crate::error::{Error, Result};

/// Check that `path` exists (or does not, if `should_exist` is false).
pub fn check_path_exists(path: &Path, should_exist: bool) -> Result<()> {
    match (path.exists(), should_exist) {
        (true, false) => Err(Error::AlreadyExists(format!(
            "Path {} already exists!",
            path.display()
        ))),
        (false, true) => Err(Error::NotFound(format!(
            "Path {} does not exist!",
            path.display()
        ))),
        _ => Ok(()),
    }
}

/// Like [`check_path_exists`], additionally requiring a regular file.
pub fn check_file_exists(path: &Path, should_exist: bool) -> Result<()> {
    check_path_exists(path, should_exist)?;
    if should_exist && !path.is_file() {
        return Err(Error::InvalidInput(format!(
            "Path {} is not a file!",
            path.display()
        )));
    }
    Ok(())
}

/// Like [`check_path_exists`], additionally requiring a directory.
///
/// With `mkdir`, a missing directory is created (parents included) instead
/// of failing.
pub fn check_dir_exists(path: &Path, should_exist: bool, mkdir: bool) -> Result<()> {
    match check_path_exists(path, should_exist) {
        Err(Error::NotFound(_)) if mkdir => std::fs::create_dir_all(path)?,
        other => other?,
    }
    if should_exist && !path.is_dir() {
        return Err(Error::InvalidInput(format!(
            "Path {} is not a directory!",
            path.display()
        )));
    }
    Ok(())
}

/// Read task arguments from a JSON configuration file.
pub fn get_args_from_configfile(path: &Path) -> Result<Value> {
    check_path_exists(path, true)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => {
            let content = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&content)?)
        }
        other => Err(Error::NotImplemented(format!(
            "Parser for .{} file not implemented",
            other.unwrap_or("")
        ))),
    }
}

/// Remove a local file or directory tree. The record must exist.
pub fn purge_local(path: &Path) -> Result<()> {
    check_path_exists(path, true)?;
    tracing::debug!("... removing {}", path.display());
    if path.is_dir() {
        std::fs::remove_dir_all(path)?;
    } else {
        std::fs::remove_file(path)?;
    }
    Ok(())
}
