//! Filesystem layout. Everything the worker persists lives under the
//! config directory the parent process points us at.

use std::path::PathBuf;

/// Root directory handed down by the parent via `CONFIG_DIR_PATH`; the
/// working directory is the fallback for ad-hoc runs.
pub fn config_dir() -> PathBuf {
    std::env::var_os("CONFIG_DIR_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// One database per account.
pub fn database_path(account_id: &str) -> PathBuf {
    config_dir().join(format!("{}.db", account_id))
}

/// Content-addressed attachment storage.
pub fn files_root() -> PathBuf {
    config_dir().join("files")
}

pub fn logs_dir() -> PathBuf {
    config_dir().join("logs")
}
