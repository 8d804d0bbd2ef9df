//! Filesystem path policy for staged sandbox files.
//!
//! Caller-supplied paths are untrusted. They must stay inside the staging
//! root, so absolute paths and any `..` segment are rejected outright rather
//! than resolved.

use crate::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// Validates a path intended for the sandbox root and returns its normalized
/// relative form (`.` segments dropped).
pub fn validate_relative_path(input_path: &str) -> Result<PathBuf> {
    if input_path.trim().is_empty() {
        return Err(Error::validation("File path must not be empty"));
    }

    if input_path.contains('\0') {
        return Err(Error::validation(format!(
            "File path contains a NUL byte: {:?}",
            input_path
        )));
    }

    // Reject Windows-style absolute paths and separators on any OS
    if input_path.contains('\\')
        || (input_path.len() >= 2
            && input_path.as_bytes()[1] == b':'
            && input_path.as_bytes()[0].is_ascii_alphabetic())
    {
        return Err(Error::validation(format!(
            "Absolute or backslash-separated paths are not allowed in sandbox: {}",
            input_path
        )));
    }

    let mut normalized = PathBuf::new();
    for component in Path::new(input_path).components() {
        match component {
            Component::Normal(c) => normalized.push(c),
            Component::ParentDir => {
                return Err(Error::validation(format!(
                    "Path traversal detected in path: {}",
                    input_path
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::validation(format!(
                    "Absolute paths are not allowed in sandbox: {}",
                    input_path
                )));
            }
            Component::CurDir => {}
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(Error::validation(format!(
            "File path does not name a file: {}",
            input_path
        )));
    }

    Ok(normalized)
}
