// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use super::{DirEntry, Error, FileInfo, Result, RunScriptOptions, System};
use crate::path::TargetRelPath;

use std::{
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
};

/// Reads pass through, mutations fail.
pub struct ReadOnlySystem {
    inner: Arc<dyn System>,
}

impl ReadOnlySystem {
    /// Construct new read-only system over `inner`.
    pub fn new(inner: Arc<dyn System>) -> Self {
        Self { inner }
    }
}

fn refuse<T>(op: &'static str, path: &Path) -> Result<T> {
    Err(Error::ReadOnly {
        op,
        path: path.to_path_buf(),
    })
}

impl System for ReadOnlySystem {
    fn chmod(&self, path: &Path, _perm: u32) -> Result<()> {
        refuse("change mode of", path)
    }

    fn lstat(&self, path: &Path) -> Result<FileInfo> {
        self.inner.lstat(path)
    }

    fn stat(&self, path: &Path) -> Result<FileInfo> {
        self.inner.stat(path)
    }

    fn mkdir(&self, path: &Path, _perm: u32) -> Result<()> {
        refuse("create directory", path)
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        self.inner.read_dir(path)
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        self.inner.read_file(path)
    }

    fn read_link(&self, path: &Path) -> Result<PathBuf> {
        self.inner.read_link(path)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        refuse("remove", path)
    }

    fn remove_all(&self, path: &Path) -> Result<()> {
        refuse("remove", path)
    }

    fn rename(&self, from: &Path, _to: &Path) -> Result<()> {
        refuse("rename", from)
    }

    fn run_cmd(&self, cmd: &mut Command) -> Result<()> {
        refuse("run", Path::new(cmd.get_program()))
    }

    fn idempotent_cmd_output(&self, cmd: &mut Command) -> Result<Vec<u8>> {
        self.inner.idempotent_cmd_output(cmd)
    }

    fn run_script(
        &self,
        name: &TargetRelPath,
        _dir: &Path,
        _data: &[u8],
        _options: &RunScriptOptions,
    ) -> Result<()> {
        refuse("run script", name.as_path())
    }

    fn write_file(&self, path: &Path, _data: &[u8], _perm: u32) -> Result<()> {
        refuse("write", path)
    }

    fn write_symlink(&self, _linkname: &Path, path: &Path) -> Result<()> {
        refuse("create symlink", path)
    }
}
