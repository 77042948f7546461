//! Runtime config file
//!
//! The engine reads its configuration from disk at start-up, so the document
//! is committed with write-temp-then-rename; the engine never sees a partial file.

use crate::compiler::ConfigDocument;
use std::path::{Path, PathBuf};
use tracing::debug;
use veil_profile::write_atomic;

/// Config file errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    #[error("Config path is empty")]
    EmptyPath,

    #[error("Failed to write config to {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Write `document` to `path` atomically
pub fn write_config(path: &Path, document: &ConfigDocument) -> Result<(), ConfigFileError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigFileError::EmptyPath);
    }

    let text = document.to_pretty_string();
    write_atomic(path, text.as_bytes()).map_err(|source| ConfigFileError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("Wrote engine config ({} bytes) to {}", text.len(), path.display());
    Ok(())
}
