//! Absolute-path splitting.
//!
//! `.` segments are dropped, `..` pops the previous component, empty
//! segments are ignored. `.` and `..` are never materialized as directory
//! entries; they exist only here.

use revfs_error::{Result, VfsError};
use revfs_types::MAX_NAME_LEN;

/// Split an absolute path into its live components.
pub fn split_path(path: &str) -> Result<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(VfsError::Invalid(format!("path is not absolute: {path}")));
    }
    let mut components = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                let _ = components.pop();
            }
            name => {
                if name.len() > MAX_NAME_LEN {
                    return Err(VfsError::NameTooLong);
                }
                components.push(name);
            }
        }
    }
    Ok(components)
}

/// Split off the final component: `(parent components, basename)`.
///
/// Fails for paths that resolve to the root itself (nothing to name).
pub fn split_parent(path: &str) -> Result<(Vec<&str>, &str)> {
    let mut components = split_path(path)?;
    let Some(name) = components.pop() else {
        return Err(VfsError::Invalid(format!(
            "path has no final component: {path}"
        )));
    };
    Ok((components, name))
}
