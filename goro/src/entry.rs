//! Resolving the program a process worker executes

use std::path::{Path, PathBuf};

use crate::error::GoroError;

/// Resolve the worker entry program: an explicit `filename` wins and must
/// exist; otherwise the currently running executable is used, which is what
/// lets the worker rebuild the same registry the main side has.
pub(crate) fn resolve_entry(filename: Option<&Path>) -> Result<PathBuf, GoroError> {
    match filename {
        Some(path) => {
            if path.is_file() {
                Ok(path.to_path_buf())
            } else {
                Err(GoroError::Config(format!(
                    "worker entry {} does not exist",
                    path.display()
                )))
            }
        }
        None => std::env::current_exe()
            .map_err(|e| GoroError::Config(format!("cannot resolve worker entry: {}", e))),
    }
}
