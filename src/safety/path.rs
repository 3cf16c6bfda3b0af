//! Workspace path containment.

use crate::errors::{CodedError, ErrorCode};
use std::path::{Component, Path, PathBuf};

/// Normalize a path lexically (without touching the filesystem).
/// Resolves `.` and `..` components so that `/workspace/../etc/passwd`
/// correctly normalizes to `/etc/passwd` rather than passing through
/// as if it starts with `/workspace`.
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                // Pop the last normal component (but never pop past root)
                if matches!(components.last(), Some(Component::Normal(_))) {
                    components.pop();
                }
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Canonicalize the deepest existing ancestor of `path`, then re-append the
/// remaining components. Lets containment checks resolve symlinks even for
/// paths that do not exist yet (a file about to be written).
fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(canon) => {
                let mut resolved = canon;
                for part in tail.iter().rev() {
                    resolved.push(part);
                }
                return resolved;
            }
            Err(_) => match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    tail.push(name);
                    existing = parent;
                }
                _ => return path.to_path_buf(),
            },
        }
    }
}

fn blocked(input: &str) -> CodedError {
    CodedError::new(
        ErrorCode::InvalidPath,
        "path is outside the workspace".to_string(),
    )
    .with_internal(format!("rejected path: {}", input))
}

/// Validate that `input` stays inside `root` and return the resolved absolute
/// path. Relative inputs are anchored at the root; `..` traversal, absolute
/// paths outside the root, and symlink escapes all fail with `INVALID_PATH`.
///
/// The prefix comparison is strict (byte-wise) on the resolved forms, so a
/// sibling directory sharing the root's spelling in another case cannot slip
/// through on a case-sensitive filesystem.
pub fn contain(input: &str, root: &Path) -> Result<PathBuf, CodedError> {
    if input.is_empty() {
        return Err(CodedError::new(ErrorCode::InvalidPath, "empty path"));
    }

    let candidate = Path::new(input);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    let normalized = lexical_normalize(&joined);
    // Normalization must have consumed every `..`; anything left over means
    // the traversal tried to climb above the filesystem root.
    if normalized
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(blocked(input));
    }

    let root_resolved = root
        .canonicalize()
        .unwrap_or_else(|_| lexical_normalize(root));
    let resolved = resolve_existing_prefix(&normalized);

    if resolved == root_resolved || resolved.starts_with(&root_resolved) {
        Ok(resolved)
    } else {
        Err(blocked(input))
    }
}
