//! Group folder sandboxing.
//!
//! Every group carries a `folder` identifier used as a filesystem key under
//! the configured groups root. Folder names are restricted to a safe
//! character set and resolved paths must stay inside the root; anything
//! else is rejected before a container is spawned or a task row is acted on.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Maximum folder name length. Long enough for any sane group name, short
/// enough to stay a valid path component everywhere.
const MAX_FOLDER_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FolderError {
    #[error("folder name is empty")]
    Empty,
    #[error("folder name is too long ({0} > {MAX_FOLDER_LEN})")]
    TooLong(usize),
    #[error("folder name contains illegal character {0:?}")]
    IllegalChar(char),
    #[error("folder name may not start with a dot")]
    LeadingDot,
    #[error("folder resolves outside the groups root")]
    OutsideRoot,
}

/// Validate a folder identifier: letters, digits, `-`, `_`, `.`, no leading
/// dot, bounded length.
pub fn validate_folder_name(name: &str) -> Result<(), FolderError> {
    if name.is_empty() {
        return Err(FolderError::Empty);
    }
    if name.len() > MAX_FOLDER_LEN {
        return Err(FolderError::TooLong(name.len()));
    }
    if name.starts_with('.') {
        return Err(FolderError::LeadingDot);
    }
    for c in name.chars() {
        if !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.') {
            return Err(FolderError::IllegalChar(c));
        }
    }
    Ok(())
}

/// Resolve a group folder inside the groups root.
///
/// Returns the joined path after verifying the name is valid and the result
/// cannot escape `root`. The path is checked lexically (the folder may not
/// exist yet), so `..` components are rejected outright by the name check.
pub fn resolve_group_folder(root: &Path, name: &str) -> Result<PathBuf, FolderError> {
    validate_folder_name(name)?;

    let joined = root.join(name);
    // The charset excludes separators, but keep the containment check as the
    // single choke point for any future relaxation of the name rules.
    let mut normal = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => return Err(FolderError::OutsideRoot),
            other => normal.push(other),
        }
    }
    if !normal.starts_with(root) {
        return Err(FolderError::OutsideRoot);
    }
    Ok(normal)
}
