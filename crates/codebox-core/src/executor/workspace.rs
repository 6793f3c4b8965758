//! Path safety and filesystem state of a sandbox workspace.
//!
//! Like git, only regular files are tracked (empty directories are invisible)
//! and each file is identified by the SHA-256 of its content.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use crate::cas::Digest;

use super::ExecutorError;

/// Absolute prefix callers may use for workspace paths.
pub const WORKSPACE_PREFIX: &str = "/workspace/";

/// Reserved top-level directory for executor state (dependencies, readiness).
pub const RESERVED_DIR: &str = ".codebox";

/// Normalise a caller path to a `/`-separated path relative to the workspace.
///
/// Accepts `a/b.txt`, `./a/b.txt` and `/workspace/a/b.txt`. Rejects anything
/// that could escape the workspace or touch the reserved directory.
pub fn normalize_path(raw: &str) -> Result<String, ExecutorError> {
    let trimmed = raw.strip_prefix(WORKSPACE_PREFIX).unwrap_or(raw);
    let invalid = |reason: &str| ExecutorError::InvalidPath {
        path: raw.to_string(),
        reason: reason.to_string(),
    };

    let mut parts = Vec::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| invalid("path is not valid UTF-8"))?;
                parts.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir => return Err(invalid("parent directory references are not allowed")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("path must be relative to the workspace"))
            }
        }
    }

    match parts.first() {
        None => Err(invalid("path is empty")),
        Some(first) if *first == RESERVED_DIR => Err(invalid("path is reserved")),
        Some(_) => Ok(parts.join("/")),
    }
}

/// Hash every regular file under `root`, keyed by workspace-relative path.
///
/// The reserved directory is skipped; symlinks are not followed.
pub fn snapshot_blocking(root: &Path) -> Result<BTreeMap<String, Digest>, ExecutorError> {
    let mut files = BTreeMap::new();
    for path in walk_files(root, root)? {
        let relative = relative_key(root, &path);
        let content = std::fs::read(&path)?;
        files.insert(relative, Digest::compute(&content));
    }
    Ok(files)
}

fn relative_key(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Simple directory walker (regular files only).
fn walk_files(root: &Path, dir: &Path) -> Result<Vec<PathBuf>, ExecutorError> {
    let mut files = Vec::new();
    if !dir.is_dir() {
        return Ok(files);
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if dir == root && entry.file_name() == RESERVED_DIR {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            files.extend(walk_files(root, &path)?);
        } else if file_type.is_file() {
            files.push(path);
        }
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_accepts_relative_and_prefixed() {
        assert_eq!(normalize_path("input.csv").unwrap(), "input.csv");
        assert_eq!(normalize_path("./data/x.bin").unwrap(), "data/x.bin");
        assert_eq!(normalize_path("/workspace/out/plot.png").unwrap(), "out/plot.png");
    }

    #[test]
    fn test_normalize_rejects_escapes() {
        assert!(normalize_path("../etc/passwd").is_err());
        assert!(normalize_path("a/../../b").is_err());
        assert!(normalize_path("/etc/passwd").is_err());
        assert!(normalize_path("").is_err());
        assert!(normalize_path(".codebox/ready").is_err());
        assert!(normalize_path("/workspace/.codebox/site-packages/x.py").is_err());
    }

    #[test]
    fn test_snapshot_skips_reserved_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("nested/empty")).unwrap();
        std::fs::create_dir_all(dir.path().join(RESERVED_DIR)).unwrap();
        std::fs::write(dir.path().join("top.txt"), b"top").unwrap();
        std::fs::write(dir.path().join("nested/inner.txt"), b"inner").unwrap();
        std::fs::write(dir.path().join(RESERVED_DIR).join("ready"), b"").unwrap();

        let snap = snapshot_blocking(dir.path()).unwrap();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap["top.txt"], Digest::compute(b"top"));
        assert_eq!(snap["nested/inner.txt"], Digest::compute(b"inner"));
    }
}
