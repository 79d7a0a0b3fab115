//! File-set, content and branch capabilities consumed by a refresh.

use crate::config::IgnoreConfig;
use crate::error::StrataError;
use ignore::WalkBuilder;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::UNIX_EPOCH;

/// Path -> last modified time in milliseconds since the Unix epoch.
pub type LastModifiedMap = HashMap<String, i64>;

/// Branch name used when a root is not inside a git checkout.
pub const NO_BRANCH: &str = "NONE";

/// What the indexer needs to know about the files of a workspace root.
///
/// Implementations return paths already filtered by ignore rules.
pub trait Workspace: Send + Sync {
    fn list_files(&self, root: &Path) -> crate::Result<LastModifiedMap>;
    fn read_file(&self, path: &str) -> crate::Result<Vec<u8>>;
    fn current_branch(&self, root: &Path) -> String;
}

/// Filesystem-backed workspace honouring .gitignore plus extra patterns.
pub struct LocalWorkspace {
    ignore_set: globset::GlobSet,
}

impl LocalWorkspace {
    pub fn new(config: &IgnoreConfig) -> crate::Result<Self> {
        let mut builder = globset::GlobSetBuilder::new();
        for pattern in &config.patterns {
            let glob_pattern = if pattern.contains('*') || pattern.contains('?') {
                pattern.clone()
            } else {
                format!("**/{}", pattern)
            };
            builder.add(
                globset::Glob::new(&glob_pattern)
                    .map_err(|e| StrataError::GlobPattern(e.to_string()))?,
            );
            builder.add(
                globset::Glob::new(&format!("**/{}/**", pattern))
                    .map_err(|e| StrataError::GlobPattern(e.to_string()))?,
            );
        }
        let ignore_set = builder
            .build()
            .map_err(|e| StrataError::GlobPattern(e.to_string()))?;
        Ok(Self { ignore_set })
    }
}

impl Workspace for LocalWorkspace {
    fn list_files(&self, root: &Path) -> crate::Result<LastModifiedMap> {
        if !root.is_dir() {
            return Err(StrataError::Workspace {
                root: root.to_path_buf(),
                message: "not a directory".to_string(),
            });
        }

        let mut builder = WalkBuilder::new(root);
        builder.hidden(false);
        builder.git_ignore(true);
        builder.git_global(true);
        builder.git_exclude(true);

        let mut files = LastModifiedMap::new();
        for entry in builder.build() {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let path = entry.path();
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let relative = path.strip_prefix(root).unwrap_or(path);
            if self.ignore_set.is_match(relative) {
                continue;
            }
            files.insert(path.to_string_lossy().to_string(), file_mtime_ms(path));
        }
        Ok(files)
    }

    fn read_file(&self, path: &str) -> crate::Result<Vec<u8>> {
        Ok(fs::read(path)?)
    }

    fn current_branch(&self, root: &Path) -> String {
        Command::new("git")
            .args(["rev-parse", "--abbrev-ref", "HEAD"])
            .current_dir(root)
            .output()
            .ok()
            .and_then(|o| {
                if o.status.success() {
                    Some(String::from_utf8_lossy(&o.stdout).trim().to_string())
                } else {
                    None
                }
            })
            .filter(|branch| !branch.is_empty())
            .unwrap_or_else(|| NO_BRANCH.to_string())
    }
}

fn file_mtime_ms(path: &Path) -> i64 {
    fs::metadata(path)
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lists_files_with_mtimes_and_skips_ignored() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        fs::write(dir.path().join("src/a.py"), "X").unwrap();
        fs::write(dir.path().join("node_modules/pkg/index.js"), "y").unwrap();

        let workspace = LocalWorkspace::new(&IgnoreConfig::default()).unwrap();
        let files = workspace.list_files(dir.path()).unwrap();

        assert_eq!(files.len(), 1);
        let (path, mtime) = files.iter().next().unwrap();
        assert!(path.ends_with("a.py"));
        assert!(*mtime > 0);
        assert_eq!(workspace.read_file(path).unwrap(), b"X");
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let dir = TempDir::new().unwrap();
        let workspace = LocalWorkspace::new(&IgnoreConfig::default()).unwrap();
        let err = workspace.list_files(&dir.path().join("gone")).unwrap_err();
        assert!(matches!(err, StrataError::Workspace { .. }));
    }

    #[test]
    fn test_branch_outside_git_is_none() {
        let dir = TempDir::new().unwrap();
        let workspace = LocalWorkspace::new(&IgnoreConfig::default()).unwrap();
        assert_eq!(workspace.current_branch(dir.path()), NO_BRANCH);
    }
}
