// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use super::{describe_cmd, DirEntry, Error, FileInfo, Result, RunScriptOptions, System};
use crate::path::TargetRelPath;

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
};
use tempfile::TempDir;
use tracing::warn;

const DESTINATION: &str = "{destination}";
const TARGET: &str = "{target}";

/// Shows every content change through an external diff program, then
/// forwards it.
///
/// The program receives two files: the current destination contents and the
/// contents about to be written. Arguments may place them explicitly with
/// `{destination}` and `{target}`, otherwise both are appended in that order.
pub struct ExternalDiffSystem {
    inner: Arc<dyn System>,
    command: String,
    args: Vec<String>,
    dir_prefix: PathBuf,
    temp_dir: TempDir,
}

impl ExternalDiffSystem {
    /// Construct new external diff system over `inner`.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Io`] if scratch directory cannot be created.
    pub fn new(
        inner: Arc<dyn System>,
        command: impl Into<String>,
        args: Vec<String>,
        dir_prefix: impl Into<PathBuf>,
    ) -> Result<Self> {
        let temp_dir = tempfile::Builder::new()
            .prefix("chezmoi-diff-")
            .tempdir()
            .map_err(Error::io("create temporary directory for", Path::new("diff")))?;

        Ok(Self {
            inner,
            command: command.into(),
            args,
            dir_prefix: dir_prefix.into(),
            temp_dir,
        })
    }

    fn current_contents(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        let info = match self.inner.lstat(path) {
            Ok(info) => info,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };

        if info.is_symlink() {
            let linkname = self.inner.read_link(path)?;
            return Ok(Some(linkname.to_string_lossy().into_owned().into_bytes()));
        }
        if info.is_file() {
            return self.inner.read_file(path).map(Some);
        }

        Ok(None)
    }

    fn show(&self, path: &Path, target: Option<&[u8]>) -> Result<()> {
        let destination = self.current_contents(path)?;
        if destination.as_deref() == target {
            return Ok(());
        }

        let name = path.strip_prefix(&self.dir_prefix).unwrap_or(path);
        let destination_path = self.scratch("destination", name, destination.as_deref())?;
        let target_path = self.scratch("target", name, target)?;

        let mut cmd = Command::new(&self.command);
        let mut placed = false;
        for arg in &self.args {
            if arg.contains(DESTINATION) || arg.contains(TARGET) {
                placed = true;
            }
            cmd.arg(
                arg.replace(DESTINATION, &destination_path.to_string_lossy())
                    .replace(TARGET, &target_path.to_string_lossy()),
            );
        }
        if !placed {
            cmd.arg(&destination_path).arg(&target_path);
        }

        // INVARIANT: Diff programs exit with 1 when inputs differ.
        let status = cmd
            .status()
            .map_err(Error::io("run", Path::new(&self.command)))?;
        match status.code() {
            Some(0) | Some(1) => Ok(()),
            _ => Err(Error::Command {
                command: describe_cmd(&cmd),
                status,
                stderr: String::new(),
            }),
        }
    }

    fn scratch(&self, side: &str, name: &Path, contents: Option<&[u8]>) -> Result<PathBuf> {
        let Some(contents) = contents else {
            return Ok(PathBuf::from("/dev/null"));
        };

        let path = self.temp_dir.path().join(side).join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(Error::io("create directory", parent))?;
        }
        fs::write(&path, contents).map_err(Error::io("write", &path))?;

        Ok(path)
    }

    fn show_or_warn(&self, path: &Path, target: Option<&[u8]>) {
        if let Err(error) = self.show(path, target) {
            warn!("{error}");
        }
    }
}

impl System for ExternalDiffSystem {
    fn chmod(&self, path: &Path, perm: u32) -> Result<()> {
        self.inner.chmod(path, perm)
    }

    fn lstat(&self, path: &Path) -> Result<FileInfo> {
        self.inner.lstat(path)
    }

    fn stat(&self, path: &Path) -> Result<FileInfo> {
        self.inner.stat(path)
    }

    fn mkdir(&self, path: &Path, perm: u32) -> Result<()> {
        self.inner.mkdir(path, perm)
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
        self.show_or_warn(path, None);
        self.inner.remove(path)
    }

    fn remove_all(&self, path: &Path) -> Result<()> {
        self.show_or_warn(path, None);
        self.inner.remove_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.inner.rename(from, to)
    }

    fn run_cmd(&self, cmd: &mut Command) -> Result<()> {
        self.inner.run_cmd(cmd)
    }

    fn idempotent_cmd_output(&self, cmd: &mut Command) -> Result<Vec<u8>> {
        self.inner.idempotent_cmd_output(cmd)
    }

    fn run_script(
        &self,
        name: &TargetRelPath,
        dir: &Path,
        data: &[u8],
        options: &RunScriptOptions,
    ) -> Result<()> {
        self.inner.run_script(name, dir, data, options)
    }

    fn write_file(&self, path: &Path, data: &[u8], perm: u32) -> Result<()> {
        self.show_or_warn(path, Some(data));
        self.inner.write_file(path, data, perm)
    }

    fn write_symlink(&self, linkname: &Path, path: &Path) -> Result<()> {
        let target = linkname.to_string_lossy().into_owned().into_bytes();
        self.show_or_warn(path, Some(&target));
        self.inner.write_symlink(linkname, path)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::system::{DryRunSystem, RealSystem};
    use pretty_assertions::assert_eq;

    #[test]
    fn runs_program_with_both_sides() {
        let temp = TempDir::new().unwrap();
        let log = temp.path().join("log");
        std::fs::write(temp.path().join("f"), "old\n").unwrap();

        let real: Arc<dyn System> = Arc::new(RealSystem::new());
        let system = ExternalDiffSystem::new(
            Arc::new(DryRunSystem::new(real)),
            "sh",
            vec![
                "-c".into(),
                format!("cat \"$0\" \"$1\" > {}", log.display()),
                DESTINATION.into(),
                TARGET.into(),
            ],
            temp.path(),
        )
        .unwrap();

        system.write_file(&temp.path().join("f"), b"new\n", 0o644).unwrap();
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "old\nnew\n");
        assert_eq!(std::fs::read_to_string(temp.path().join("f")).unwrap(), "old\n");
    }
}
