// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{
    error::{Error, Result},
    state::{EntryState, EntryStateKind},
    system::{FileKind, System},
};

use std::path::{Path, PathBuf};

/// What currently exists at a destination path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActualStateEntry {
    Absent {
        path: PathBuf,
    },
    Dir {
        path: PathBuf,
        perm: u32,
    },
    File {
        path: PathBuf,
        perm: u32,
        contents: Vec<u8>,
    },
    Symlink {
        path: PathBuf,
        linkname: String,
    },
}

impl ActualStateEntry {
    /// Inspect `path` through `system` without following a final symlink.
    ///
    /// # Errors
    ///
    /// - Return [`Error::UnsupportedFileType`] for sockets, devices, and
    ///   other special files.
    /// - Return [`Error::System`] if path cannot be inspected or read.
    pub fn new(system: &dyn System, path: &Path) -> Result<Self> {
        let info = match system.lstat(path) {
            Ok(info) => info,
            Err(err) if err.is_not_found() => {
                return Ok(Self::Absent {
                    path: path.to_path_buf(),
                });
            }
            Err(err) => return Err(err.into()),
        };

        let path = path.to_path_buf();
        match info.kind {
            FileKind::Dir => Ok(Self::Dir {
                path,
                perm: info.perm,
            }),
            FileKind::File => {
                let contents = system.read_file(&path)?;
                Ok(Self::File {
                    path,
                    perm: info.perm,
                    contents,
                })
            }
            FileKind::Symlink => {
                let linkname = system.read_link(&path)?.to_string_lossy().into_owned();
                Ok(Self::Symlink { path, linkname })
            }
            FileKind::Other => Err(Error::UnsupportedFileType { path }),
        }
    }

    /// Absolute destination path.
    pub fn path(&self) -> &Path {
        match self {
            Self::Absent { path }
            | Self::Dir { path, .. }
            | Self::File { path, .. }
            | Self::Symlink { path, .. } => path,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent { .. })
    }

    /// Entry state describing what is there right now.
    pub fn entry_state(&self) -> EntryState {
        match self {
            Self::Absent { .. } => EntryState::remove(),
            Self::Dir { perm, .. } => EntryState::new(EntryStateKind::Dir, *perm, None),
            Self::File { perm, contents, .. } => {
                EntryState::new(EntryStateKind::File, *perm, Some(contents))
            }
            Self::Symlink { linkname, .. } => {
                EntryState::new(EntryStateKind::Symlink, 0, Some(linkname.as_bytes()))
            }
        }
    }

    /// Remove whatever is there. Nothing happens for an absent entry.
    ///
    /// # Errors
    ///
    /// - Return [`Error::System`] if removal fails.
    pub fn remove(&self, system: &dyn System) -> Result<()> {
        if self.is_absent() {
            return Ok(());
        }

        system.remove_all(self.path()).map_err(Into::into)
    }
}
