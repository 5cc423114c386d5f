use std::{
    ffi::OsStr,
    fmt, io,
    path::{Path, PathBuf},
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path is not absolute: {0}")]
    NotAbsolute(PathBuf),
    #[error("failed to canonicalize {path}: {source}")]
    Canonicalize {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// An absolute filesystem path.
///
/// The on-disk layout mixes absolute paths (the root directory) with
/// relative ones (symlink targets, worktree gitdir pointers), so the
/// distinction is kept in the type instead of in comments at call sites.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AbsPath(PathBuf);

impl AbsPath {
    /// Wrap a path that is already absolute. Does not touch the filesystem.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, PathError> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(PathError::NotAbsolute(path));
        }
        Ok(Self(path))
    }

    /// Canonicalize a path that must already exist, resolving symlinks.
    /// Uses dunce so Windows never sees `\\?\` verbatim paths, which the
    /// external git binary cannot handle.
    pub fn canonicalize(path: impl AsRef<Path>) -> Result<Self, PathError> {
        let path = path.as_ref();
        let canon = dunce::canonicalize(path).map_err(|source| PathError::Canonicalize {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self(canon))
    }

    /// Join a relative component onto this path. For input that may be
    /// absolute, use [`rebase`](Self::rebase) instead; `Path::join` would
    /// silently replace the base.
    pub fn join(&self, rel: impl AsRef<Path>) -> AbsPath {
        AbsPath(self.0.join(rel))
    }

    /// Interpret `path` relative to this base unless it is already absolute.
    pub fn rebase(&self, path: impl AsRef<Path>) -> AbsPath {
        let path = path.as_ref();
        if path.is_absolute() {
            AbsPath(path.to_path_buf())
        } else {
            self.join(path)
        }
    }

    /// Split into parent directory and final component.
    pub fn split(&self) -> (Option<AbsPath>, Option<&OsStr>) {
        (
            self.0.parent().map(|p| AbsPath(p.to_path_buf())),
            self.0.file_name(),
        )
    }

    pub fn parent(&self) -> Option<AbsPath> {
        self.0.parent().map(|p| AbsPath(p.to_path_buf()))
    }

    pub fn base_name(&self) -> Option<&str> {
        self.0.file_name().and_then(|n| n.to_str())
    }

    /// Relative path from `base` to `self`, e.g. for symlink targets and
    /// gitdir pointers that must survive the tree being remounted at a
    /// different absolute path.
    pub fn relative_from(&self, base: &AbsPath) -> Option<PathBuf> {
        pathdiff::diff_paths(&self.0, &base.0)
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn exists(&self) -> bool {
        self.0.exists()
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

impl AsRef<Path> for AbsPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl AsRef<OsStr> for AbsPath {
    fn as_ref(&self) -> &OsStr {
        self.0.as_os_str()
    }
}

impl fmt::Display for AbsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_relative() {
        assert!(AbsPath::new("relative/path").is_err());
        assert!(AbsPath::new("/absolute/path").is_ok());
    }

    #[test]
    fn rebase_keeps_absolute_and_joins_relative() {
        let base = AbsPath::new("/srv/repo").unwrap();
        assert_eq!(
            base.rebase("/etc/other").as_path(),
            Path::new("/etc/other")
        );
        assert_eq!(
            base.rebase("link").as_path(),
            Path::new("/srv/repo/link")
        );
    }

    #[test]
    fn split_returns_dir_and_base() {
        let p = AbsPath::new("/srv/repo/link").unwrap();
        let (dir, base) = p.split();
        assert_eq!(dir.unwrap().as_path(), Path::new("/srv/repo"));
        assert_eq!(base.unwrap(), "link");
    }

    #[test]
    fn relative_from_walks_up() {
        let wt = AbsPath::new("/srv/repo/.worktrees/abc").unwrap();
        let root = AbsPath::new("/srv/repo").unwrap();
        assert_eq!(
            root.relative_from(&wt).unwrap(),
            Path::new("../..")
        );
        assert_eq!(
            wt.relative_from(&root).unwrap(),
            Path::new(".worktrees/abc")
        );
    }

    #[test]
    fn canonicalize_resolves_symlinks() {
        let td = tempfile::TempDir::new().unwrap();
        let target = td.path().join("target");
        std::fs::create_dir(&target).unwrap();
        let link = td.path().join("alias");
        std::os::unix::fs::symlink(&target, &link).unwrap();
        let canon = AbsPath::canonicalize(&link).unwrap();
        assert_eq!(canon.as_path(), dunce::canonicalize(&target).unwrap());
    }
}
