//! Client-side path handling.

use crate::error::{Error, Result};

/// Split a path into parent directory and leaf name.
pub(crate) fn split_parent_name(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::InvalidPath(path.to_string()));
    }
    let (parent, name) = match trimmed.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", trimmed),
    };
    let parent = if parent.is_empty() { "/" } else { parent };
    if name.is_empty() || name == "." || name == ".." {
        Err(Error::InvalidPath(path.to_string()))
    } else {
        Ok((parent, name))
    }
}

/// Split a path into walk elements.
///
/// Empty and `.` components are dropped; `..` is kept and left to the server.
pub(crate) fn path_parts(path: &str) -> Vec<&str> {
    path.split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect()
}
