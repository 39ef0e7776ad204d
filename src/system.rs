// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Filesystem and process abstraction.
//!
//! Every side effect of the reconciliation engine goes through the [`System`]
//! trait: reading and writing files, creating directories and symlinks,
//! removing paths, and running commands. Nothing above this module touches
//! [`std::fs`] directly.
//!
//! # Decorators
//!
//! [`RealSystem`] is the only leaf implementation. Every other implementation
//! wraps another [`System`] and changes one aspect of it:
//!
//! - [`ReadOnlySystem`]: mutations fail with [`Error::ReadOnly`].
//! - [`DryRunSystem`]: mutations succeed without touching anything.
//! - [`GitDiffSystem`]: mutations append a git-style patch to a writer, then
//!   get forwarded.
//! - [`ExternalDiffSystem`]: mutations are shown through an external diff
//!   program, then get forwarded.
//! - [`DebugSystem`]: every call and its result is logged.
//!
//! Each decorator implements the full trait and forwards what it leaves
//! alone explicitly. Composition order matters, because the outer layer sees
//! whatever the inner layers made of a call. Callers build chains outward
//! from [`RealSystem`], so `GitDiffSystem(DryRunSystem(RealSystem))` shows a
//! diff without applying it, while `GitDiffSystem(RealSystem)` shows a diff
//! and applies it.

mod debug;
mod dry_run;
mod external_diff;
mod git_diff;
mod read_only;
mod real;

pub use debug::DebugSystem;
pub use dry_run::DryRunSystem;
pub use external_diff::ExternalDiffSystem;
pub use git_diff::{DiffWriter, GitDiffSystem};
pub use read_only::ReadOnlySystem;
pub use real::RealSystem;

use crate::path::TargetRelPath;

use std::{
    ffi::OsString,
    fs::Metadata,
    io,
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
    time::SystemTime,
};

/// A place to read and write files, and run commands.
pub trait System: Send + Sync {
    /// Set permission bits of path.
    fn chmod(&self, path: &Path, perm: u32) -> Result<()>;

    /// Query path without following a final symlink.
    fn lstat(&self, path: &Path) -> Result<FileInfo>;

    /// Query path, following symlinks.
    fn stat(&self, path: &Path) -> Result<FileInfo>;

    /// Create a single directory.
    fn mkdir(&self, path: &Path, perm: u32) -> Result<()>;

    /// List directory entries sorted by name.
    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>>;

    /// Read file contents.
    fn read_file(&self, path: &Path) -> Result<Vec<u8>>;

    /// Read symlink target.
    fn read_link(&self, path: &Path) -> Result<PathBuf>;

    /// Remove a file, symlink, or empty directory.
    fn remove(&self, path: &Path) -> Result<()>;

    /// Remove path and everything beneath it. A missing path is not an error.
    fn remove_all(&self, path: &Path) -> Result<()>;

    /// Move path.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Run command with inherited standard streams.
    fn run_cmd(&self, cmd: &mut Command) -> Result<()>;

    /// Run command for its standard output.
    ///
    /// Only for commands without side effects, so decorators that suppress
    /// mutations let it through, and implementations may cache the result.
    fn idempotent_cmd_output(&self, cmd: &mut Command) -> Result<Vec<u8>>;

    /// Run script contents from working directory `dir`.
    fn run_script(
        &self,
        name: &TargetRelPath,
        dir: &Path,
        data: &[u8],
        options: &RunScriptOptions,
    ) -> Result<()>;

    /// Write file contents with permission bits, replacing any existing file.
    fn write_file(&self, path: &Path, data: &[u8], perm: u32) -> Result<()>;

    /// Create symlink at `path` pointing to `linkname`.
    fn write_symlink(&self, linkname: &Path, path: &Path) -> Result<()>;
}

/// Type of filesystem object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FileKind {
    File,
    Dir,
    Symlink,
    Other,
}

/// Subset of file metadata the engine cares about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub kind: FileKind,
    pub perm: u32,
    pub len: u64,
    pub modified: Option<SystemTime>,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }
}

impl From<&Metadata> for FileInfo {
    fn from(metadata: &Metadata) -> Self {
        let file_type = metadata.file_type();
        let kind = if file_type.is_symlink() {
            FileKind::Symlink
        } else if file_type.is_dir() {
            FileKind::Dir
        } else if file_type.is_file() {
            FileKind::File
        } else {
            FileKind::Other
        };

        Self {
            kind,
            perm: metadata_perm(metadata),
            len: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }
}

#[cfg(unix)]
fn metadata_perm(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn metadata_perm(metadata: &Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o666
    }
}

/// Named entry of a directory listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub info: FileInfo,
}

/// Program used to run scripts with a given file extension.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Interpreter {
    pub command: String,
    pub args: Vec<String>,
}

/// Extra knobs for [`System::run_script`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunScriptOptions {
    /// Run script through this program instead of executing it directly.
    pub interpreter: Option<Interpreter>,

    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

/// Create directory and all missing parents.
///
/// Existing directories are left alone, including ones that appear while
/// this function runs.
///
/// # Errors
///
/// - Return [`Error::Io`] if a path component exists but is not a directory,
///   or a directory cannot be created.
pub fn mkdir_all(system: &dyn System, path: &Path, perm: u32) -> Result<()> {
    match system.stat(path) {
        Ok(info) if info.is_dir() => return Ok(()),
        Ok(_) => return Err(not_a_directory(path)),
        Err(err) if err.class() == ErrorClass::NotFound => {}
        Err(err) => return Err(err),
    }

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        mkdir_all(system, parent, perm)?;
    }

    match system.mkdir(path, perm) {
        Err(err) if err.class() == ErrorClass::AlreadyExists => match system.stat(path) {
            Ok(info) if info.is_dir() => Ok(()),
            _ => Err(err),
        },
        result => result,
    }
}

fn not_a_directory(path: &Path) -> Error {
    Error::Io {
        op: "create directory",
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::AlreadyExists, "not a directory"),
    }
}

/// Coarse error classification used to pick between skip, report, and abort.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ReadOnly,
    Other,
}

/// System error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Filesystem operation failed.
    #[error("failed to {op} {:?}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Mutation attempted on a read-only system.
    #[error("cannot {op} {:?} on read-only system", path.display())]
    ReadOnly { op: &'static str, path: PathBuf },

    /// Command ran but did not succeed.
    #[error("command {command} failed: {status}{}", stderr_suffix(.stderr))]
    Command {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

impl Error {
    /// Classify error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io { source, .. } => match source.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => ErrorClass::NotFound,
                io::ErrorKind::AlreadyExists => ErrorClass::AlreadyExists,
                io::ErrorKind::PermissionDenied => ErrorClass::PermissionDenied,
                _ => ErrorClass::Other,
            },
            Self::ReadOnly { .. } => ErrorClass::ReadOnly,
            Self::Command { .. } => ErrorClass::Other,
        }
    }

    /// Check if error means the path does not exist.
    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }

    pub(crate) fn io<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> Self + 'a {
        move |source| Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

pub(crate) fn describe_cmd(cmd: &Command) -> String {
    let mut out = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        out.push(' ');
        out.push_str(&arg.to_string_lossy());
    }
    out
}

/// Friendly result alias :3
pub type Result<T, E = Error> = std::result::Result<T, E>;
