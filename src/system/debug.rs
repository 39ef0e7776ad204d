// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use super::{describe_cmd, DirEntry, FileInfo, Result, RunScriptOptions, System};
use crate::path::TargetRelPath;

use std::{
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
};
use tracing::debug;

/// Logs every call along with its outcome.
pub struct DebugSystem {
    inner: Arc<dyn System>,
}

impl DebugSystem {
    /// Construct new debug system over `inner`.
    pub fn new(inner: Arc<dyn System>) -> Self {
        Self { inner }
    }
}

fn outcome<T>(result: &Result<T>) -> String {
    match result {
        Ok(_) => "ok".into(),
        Err(err) => err.to_string(),
    }
}

impl System for DebugSystem {
    fn chmod(&self, path: &Path, perm: u32) -> Result<()> {
        let result = self.inner.chmod(path, perm);
        debug!(path = %path.display(), perm = format_args!("{perm:o}"), outcome = outcome(&result), "chmod");
        result
    }

    fn lstat(&self, path: &Path) -> Result<FileInfo> {
        let result = self.inner.lstat(path);
        debug!(path = %path.display(), info = ?result.as_ref().ok(), outcome = outcome(&result), "lstat");
        result
    }

    fn stat(&self, path: &Path) -> Result<FileInfo> {
        let result = self.inner.stat(path);
        debug!(path = %path.display(), info = ?result.as_ref().ok(), outcome = outcome(&result), "stat");
        result
    }

    fn mkdir(&self, path: &Path, perm: u32) -> Result<()> {
        let result = self.inner.mkdir(path, perm);
        debug!(path = %path.display(), perm = format_args!("{perm:o}"), outcome = outcome(&result), "mkdir");
        result
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let result = self.inner.read_dir(path);
        let entries = result.as_ref().map(Vec::len).unwrap_or_default();
        debug!(path = %path.display(), entries, outcome = outcome(&result), "read_dir");
        result
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let result = self.inner.read_file(path);
        let len = result.as_ref().map(Vec::len).unwrap_or_default();
        debug!(path = %path.display(), len, outcome = outcome(&result), "read_file");
        result
    }

    fn read_link(&self, path: &Path) -> Result<PathBuf> {
        let result = self.inner.read_link(path);
        debug!(path = %path.display(), linkname = ?result.as_ref().ok(), outcome = outcome(&result), "read_link");
        result
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let result = self.inner.remove(path);
        debug!(path = %path.display(), outcome = outcome(&result), "remove");
        result
    }

    fn remove_all(&self, path: &Path) -> Result<()> {
        let result = self.inner.remove_all(path);
        debug!(path = %path.display(), outcome = outcome(&result), "remove_all");
        result
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let result = self.inner.rename(from, to);
        debug!(from = %from.display(), to = %to.display(), outcome = outcome(&result), "rename");
        result
    }

    fn run_cmd(&self, cmd: &mut Command) -> Result<()> {
        let command = describe_cmd(cmd);
        let result = self.inner.run_cmd(cmd);
        debug!(command, outcome = outcome(&result), "run_cmd");
        result
    }

    fn idempotent_cmd_output(&self, cmd: &mut Command) -> Result<Vec<u8>> {
        let command = describe_cmd(cmd);
        let result = self.inner.idempotent_cmd_output(cmd);
        let len = result.as_ref().map(Vec::len).unwrap_or_default();
        debug!(command, len, outcome = outcome(&result), "idempotent_cmd_output");
        result
    }

    fn run_script(
        &self,
        name: &TargetRelPath,
        dir: &Path,
        data: &[u8],
        options: &RunScriptOptions,
    ) -> Result<()> {
        let result = self.inner.run_script(name, dir, data, options);
        debug!(
            name = %name,
            dir = %dir.display(),
            len = data.len(),
            interpreter = ?options.interpreter,
            outcome = outcome(&result),
            "run_script"
        );
        result
    }

    fn write_file(&self, path: &Path, data: &[u8], perm: u32) -> Result<()> {
        let result = self.inner.write_file(path, data, perm);
        debug!(
            path = %path.display(),
            len = data.len(),
            perm = format_args!("{perm:o}"),
            outcome = outcome(&result),
            "write_file"
        );
        result
    }

    fn write_symlink(&self, linkname: &Path, path: &Path) -> Result<()> {
        let result = self.inner.write_symlink(linkname, path);
        debug!(path = %path.display(), linkname = %linkname.display(), outcome = outcome(&result), "write_symlink");
        result
    }
}
