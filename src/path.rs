// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine where chezmoi keeps its files on the current machine, and model
//! the two relative path namespaces that the reconciliation engine juggles:
//!
//! - [`SourceRelPath`]: a path inside the source directory, where every
//!   component may carry encoded attributes like `dot_` or `private_`.
//! - [`TargetRelPath`]: the matching path relative to the destination
//!   directory, with all attributes stripped away.
//!
//! The two types are deliberately distinct so the compiler catches any mix
//! up between "where the source file lives" and "where the result goes".

use std::{
    ffi::OsStr,
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Component, Path, PathBuf},
};

/// Determine absolute path to user's home directory.
///
/// Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or(NoWayHome)
}

/// Determine default absolute path to the source directory.
///
/// Uses XDG Base Directory path `$XDG_DATA_HOME/chezmoi`.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_source_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|path| path.join("chezmoi"))
        .ok_or(NoWayHome)
}

/// Determine default absolute path to the configuration directory.
///
/// Uses XDG Base Directory path `$XDG_CONFIG_HOME/chezmoi`. Both the
/// configuration file and the persistent state file live here.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn default_config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("chezmoi"))
        .ok_or(NoWayHome)
}

/// Determine default absolute path to the configuration file.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn default_config_file() -> Result<PathBuf> {
    default_config_dir().map(|path| path.join("chezmoi.toml"))
}

/// Determine default absolute path to the download cache of externals.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn default_cache_dir() -> Result<PathBuf> {
    dirs::cache_dir()
        .map(|path| path.join("chezmoi"))
        .ok_or(NoWayHome)
}

/// No way to determine user's home directory.
///
/// # See Also
///
/// - [`dirs::home_dir`](https://docs.rs/dirs/latest/dirs/fn.home_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's home directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;

/// Path relative to the destination directory.
///
/// Ordering is component-wise, so a directory always sorts before anything
/// inside of it. The empty path denotes the destination directory itself.
#[derive(Default, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetRelPath(PathBuf);

impl TargetRelPath {
    /// Construct new target relative path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// The destination directory itself.
    pub fn root() -> Self {
        Self::default()
    }

    /// Construct from an absolute destination path.
    ///
    /// Returns `None` when `path` is not inside `dest_dir`.
    pub fn from_abs(dest_dir: &Path, path: &Path) -> Option<Self> {
        path.strip_prefix(dest_dir).ok().map(Self::new)
    }

    /// Append a single component.
    pub fn join(&self, name: impl AsRef<Path>) -> Self {
        if self.0.as_os_str().is_empty() {
            return Self(name.as_ref().to_path_buf());
        }

        Self(self.0.join(name))
    }

    /// Parent path, `None` for top-level entries and the root.
    pub fn parent(&self) -> Option<Self> {
        self.0
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(|parent| Self(parent.to_path_buf()))
    }

    /// Final component.
    pub fn file_name(&self) -> Option<&OsStr> {
        self.0.file_name()
    }

    /// Check if path denotes the destination directory itself.
    pub fn is_empty(&self) -> bool {
        self.0.as_os_str().is_empty()
    }

    /// Check if `self` lives somewhere underneath `dir`.
    pub fn is_inside(&self, dir: &TargetRelPath) -> bool {
        self != dir && self.0.starts_with(&dir.0)
    }

    /// Number of components.
    pub fn depth(&self) -> usize {
        self.0
            .components()
            .filter(|component| matches!(component, Component::Normal(_)))
            .count()
    }

    /// Resolve against the destination directory.
    pub fn to_abs(&self, dest_dir: &Path) -> PathBuf {
        if self.is_empty() {
            return dest_dir.to_path_buf();
        }

        dest_dir.join(&self.0)
    }

    /// Treat target path as [`Path`] slice.
    pub fn as_path(&self) -> &Path {
        self.0.as_path()
    }
}

impl Display for TargetRelPath {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.0.to_string_lossy().as_ref())
    }
}

impl From<&str> for TargetRelPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

/// Path relative to the source directory.
///
/// Remembers whether it names a directory, because the attribute grammar for
/// directories differs from the one for files.
#[derive(Default, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceRelPath {
    path: PathBuf,
    is_dir: bool,
}

impl SourceRelPath {
    /// Construct new source path naming a directory.
    pub fn new_dir(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            is_dir: true,
        }
    }

    /// Construct new source path naming a file.
    pub fn new_file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            is_dir: false,
        }
    }

    /// Append a directory component.
    pub fn join_dir(&self, name: impl AsRef<Path>) -> Self {
        Self::new_dir(self.joined(name))
    }

    /// Append a file component.
    pub fn join_file(&self, name: impl AsRef<Path>) -> Self {
        Self::new_file(self.joined(name))
    }

    fn joined(&self, name: impl AsRef<Path>) -> PathBuf {
        if self.path.as_os_str().is_empty() {
            name.as_ref().to_path_buf()
        } else {
            self.path.join(name)
        }
    }

    /// Source directory containing this path.
    pub fn parent(&self) -> Self {
        Self::new_dir(self.path.parent().unwrap_or(Path::new("")))
    }

    /// Check if path names a directory.
    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    /// Check if path denotes the source directory itself.
    pub fn is_empty(&self) -> bool {
        self.path.as_os_str().is_empty()
    }

    /// Final component.
    pub fn file_name(&self) -> Option<&OsStr> {
        self.path.file_name()
    }

    /// Resolve against the source directory.
    pub fn to_abs(&self, source_dir: &Path) -> PathBuf {
        if self.is_empty() {
            return source_dir.to_path_buf();
        }

        source_dir.join(&self.path)
    }

    /// Treat source path as [`Path`] slice.
    pub fn as_path(&self) -> &Path {
        self.path.as_path()
    }
}

impl Display for SourceRelPath {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.path.to_string_lossy().as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn target_rel_path_sorts_parents_first() {
        let mut paths = vec![
            TargetRelPath::from("a.b"),
            TargetRelPath::from("a/b"),
            TargetRelPath::from("a"),
            TargetRelPath::from(".config/nvim"),
            TargetRelPath::from(".config"),
        ];
        paths.sort();
        assert_eq!(
            paths,
            vec![
                TargetRelPath::from(".config"),
                TargetRelPath::from(".config/nvim"),
                TargetRelPath::from("a"),
                TargetRelPath::from("a/b"),
                TargetRelPath::from("a.b"),
            ]
        );
    }

    #[test]
    fn target_rel_path_join_and_parent() {
        let root = TargetRelPath::root();
        let config = root.join(".config");
        let nvim = config.join("nvim");
        assert_eq!(config.to_string(), ".config");
        assert_eq!(nvim.parent(), Some(config.clone()));
        assert_eq!(config.parent(), None);
        assert!(nvim.is_inside(&config));
        assert!(!config.is_inside(&config));
        assert_eq!(nvim.depth(), 2);
        assert_eq!(root.to_abs(Path::new("/home/user")), PathBuf::from("/home/user"));
        assert_eq!(
            nvim.to_abs(Path::new("/home/user")),
            PathBuf::from("/home/user/.config/nvim")
        );
    }

    #[test]
    fn target_rel_path_from_abs() {
        let dest = Path::new("/home/user");
        assert_eq!(
            TargetRelPath::from_abs(dest, Path::new("/home/user/.bashrc")),
            Some(TargetRelPath::from(".bashrc"))
        );
        assert_eq!(TargetRelPath::from_abs(dest, Path::new("/etc/passwd")), None);
    }

    #[test]
    fn source_rel_path_tracks_kind() {
        let root = SourceRelPath::new_dir("");
        let dir = root.join_dir("dot_config");
        let file = dir.join_file("private_token");
        assert!(dir.is_dir());
        assert!(!file.is_dir());
        assert_eq!(file.to_string(), "dot_config/private_token");
        assert_eq!(file.parent(), dir);
        assert_eq!(dir.parent(), root);
    }
}
