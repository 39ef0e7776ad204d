// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use super::{
    describe_cmd, DirEntry, Error, FileInfo, Result, RunScriptOptions, System,
};
use crate::path::TargetRelPath;

use std::{
    collections::HashMap,
    ffi::OsStr,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    process::Command,
    sync::Mutex,
};
use tracing::debug;

/// The actual filesystem and process table.
#[derive(Debug, Default)]
pub struct RealSystem {
    script_temp_dir: Option<PathBuf>,
    cmd_cache: Mutex<HashMap<String, Vec<u8>>>,
}

impl RealSystem {
    /// Construct new real system.
    pub fn new() -> Self {
        Self::default()
    }

    /// Write scripts into `dir` before running them instead of the system
    /// temporary directory.
    pub fn with_script_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.script_temp_dir = Some(dir.into());
        self
    }
}

impl System for RealSystem {
    fn chmod(&self, path: &Path, perm: u32) -> Result<()> {
        set_perm(path, perm).map_err(Error::io("change mode of", path))
    }

    fn lstat(&self, path: &Path) -> Result<FileInfo> {
        fs::symlink_metadata(path)
            .map(|metadata| FileInfo::from(&metadata))
            .map_err(Error::io("stat", path))
    }

    fn stat(&self, path: &Path) -> Result<FileInfo> {
        fs::metadata(path)
            .map(|metadata| FileInfo::from(&metadata))
            .map_err(Error::io("stat", path))
    }

    fn mkdir(&self, path: &Path, perm: u32) -> Result<()> {
        let mut builder = fs::DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(perm);
        }
        #[cfg(not(unix))]
        let _ = perm;

        builder.create(path).map_err(Error::io("create directory", path))
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path).map_err(Error::io("read directory", path))? {
            let entry = entry.map_err(Error::io("read directory", path))?;
            let metadata = entry
                .metadata()
                .map_err(Error::io("stat", &entry.path()))?;
            entries.push(DirEntry {
                name: entry.file_name(),
                info: FileInfo::from(&metadata),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(entries)
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(Error::io("read", path))
    }

    fn read_link(&self, path: &Path) -> Result<PathBuf> {
        fs::read_link(path).map_err(Error::io("read link", path))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let info = self.lstat(path)?;
        if info.is_dir() {
            fs::remove_dir(path).map_err(Error::io("remove", path))
        } else {
            fs::remove_file(path).map_err(Error::io("remove", path))
        }
    }

    fn remove_all(&self, path: &Path) -> Result<()> {
        let info = match self.lstat(path) {
            Ok(info) => info,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };

        if info.is_dir() {
            fs::remove_dir_all(path).map_err(Error::io("remove", path))
        } else {
            fs::remove_file(path).map_err(Error::io("remove", path))
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).map_err(Error::io("rename", from))
    }

    fn run_cmd(&self, cmd: &mut Command) -> Result<()> {
        let command = describe_cmd(cmd);
        debug!("run {command}");
        let program = PathBuf::from(cmd.get_program());
        let status = cmd.status().map_err(Error::io("run", &program))?;
        if !status.success() {
            return Err(Error::Command {
                command,
                status,
                stderr: String::new(),
            });
        }

        Ok(())
    }

    fn idempotent_cmd_output(&self, cmd: &mut Command) -> Result<Vec<u8>> {
        let command = describe_cmd(cmd);
        if let Some(output) = self.cached_output(&command) {
            return Ok(output);
        }

        debug!("run {command}");
        let program = PathBuf::from(cmd.get_program());
        let output = cmd.output().map_err(Error::io("run", &program))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Command {
                command,
                status: output.status,
                stderr: chomp(&stderr).to_string(),
            });
        }

        if let Ok(mut cache) = self.cmd_cache.lock() {
            cache.insert(command, output.stdout.clone());
        }

        Ok(output.stdout)
    }

    fn run_script(
        &self,
        name: &TargetRelPath,
        dir: &Path,
        data: &[u8],
        options: &RunScriptOptions,
    ) -> Result<()> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("chezmoi-");
        let temp_dir = match &self.script_temp_dir {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(Error::io("create temporary directory for", name.as_path()))?;

        // INVARIANT: The script file is closed before it is executed.
        let script_path = temp_dir
            .path()
            .join(name.file_name().unwrap_or(OsStr::new("script")));
        fs::write(&script_path, data).map_err(Error::io("write", &script_path))?;
        set_perm(&script_path, 0o700).map_err(Error::io("change mode of", &script_path))?;

        let mut cmd = match &options.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(&interpreter.command);
                cmd.args(&interpreter.args).arg(&script_path);
                cmd
            }
            None => Command::new(&script_path),
        };
        cmd.current_dir(closest_existing_dir(dir));
        cmd.env("CHEZMOI", "1");
        cmd.envs(options.env.iter().map(|(key, value)| (key, value)));

        let status = cmd.status().map_err(Error::io("run", &script_path))?;
        if !status.success() {
            return Err(Error::Command {
                command: name.to_string(),
                status,
                stderr: String::new(),
            });
        }

        Ok(())
    }

    fn write_file(&self, path: &Path, data: &[u8], perm: u32) -> Result<()> {
        let parent = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or(Path::new("."));

        // INVARIANT: Readers never observe a partially written file.
        let mut file = tempfile::Builder::new()
            .prefix(".chezmoi-")
            .tempfile_in(parent)
            .map_err(Error::io("write", path))?;
        file.write_all(data).map_err(Error::io("write", path))?;
        set_perm(file.path(), perm).map_err(Error::io("change mode of", path))?;
        file.persist(path)
            .map_err(|err| err.error)
            .map_err(Error::io("write", path))?;

        Ok(())
    }

    fn write_symlink(&self, linkname: &Path, path: &Path) -> Result<()> {
        match self.lstat(path) {
            Ok(info) if !info.is_dir() => self.remove(path)?,
            _ => {}
        }

        symlink(linkname, path).map_err(Error::io("create symlink", path))
    }
}

impl RealSystem {
    fn cached_output(&self, command: &str) -> Option<Vec<u8>> {
        self.cmd_cache
            .lock()
            .ok()
            .and_then(|cache| cache.get(command).cloned())
    }
}

fn closest_existing_dir(dir: &Path) -> &Path {
    dir.ancestors()
        .find(|ancestor| ancestor.is_dir())
        .unwrap_or(Path::new("/"))
}

fn chomp(message: &str) -> &str {
    message
        .strip_suffix("\r\n")
        .or(message.strip_suffix('\n'))
        .unwrap_or(message)
}

#[cfg(unix)]
fn set_perm(path: &Path, perm: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(perm))
}

#[cfg(not(unix))]
fn set_perm(path: &Path, perm: u32) -> io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_readonly(perm & 0o222 == 0);
    fs::set_permissions(path, permissions)
}

#[cfg(unix)]
fn symlink(linkname: &Path, path: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(linkname, path)
}

#[cfg(windows)]
fn symlink(linkname: &Path, path: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(linkname, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::FileKind;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn write_file_sets_mode_and_replaces() {
        let temp = TempDir::new().unwrap();
        let system = RealSystem::new();
        let path = temp.path().join("file");

        system.write_file(&path, b"one", 0o600).unwrap();
        system.write_file(&path, b"two", 0o640).unwrap();
        assert_eq!(system.read_file(&path).unwrap(), b"two");

        let info = system.lstat(&path).unwrap();
        assert_eq!(info.kind, FileKind::File);
        #[cfg(unix)]
        assert_eq!(info.perm, 0o640);
    }

    #[cfg(unix)]
    #[test]
    fn write_symlink_replaces_file() {
        let temp = TempDir::new().unwrap();
        let system = RealSystem::new();
        let path = temp.path().join("link");

        system.write_file(&path, b"x", 0o644).unwrap();
        system.write_symlink(Path::new("target"), &path).unwrap();
        assert_eq!(system.read_link(&path).unwrap(), PathBuf::from("target"));
        assert!(system.lstat(&path).unwrap().is_symlink());
    }

    #[test]
    fn read_dir_is_sorted() {
        let temp = TempDir::new().unwrap();
        let system = RealSystem::new();
        for name in ["b", "c", "a"] {
            system.write_file(&temp.path().join(name), b"", 0o644).unwrap();
        }
        let names: Vec<_> = system
            .read_dir(temp.path())
            .unwrap()
            .into_iter()
            .map(|entry| entry.name.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn remove_all_ignores_missing() {
        let temp = TempDir::new().unwrap();
        let system = RealSystem::new();
        system.remove_all(&temp.path().join("missing")).unwrap();

        let dir = temp.path().join("dir");
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        system.remove_all(&dir).unwrap();
        assert!(!dir.exists());
    }

    #[cfg(unix)]
    #[test]
    fn run_script_uses_working_directory() {
        let temp = TempDir::new().unwrap();
        let system = RealSystem::new();
        let script = b"#!/bin/sh\necho ran > marker\n";
        system
            .run_script(
                &TargetRelPath::from("setup.sh"),
                temp.path(),
                script,
                &RunScriptOptions::default(),
            )
            .unwrap();
        assert_eq!(std::fs::read(temp.path().join("marker")).unwrap(), b"ran\n");
    }

    #[cfg(unix)]
    #[test]
    fn idempotent_cmd_output_is_cached() {
        let system = RealSystem::new();
        let first = system
            .idempotent_cmd_output(Command::new("sh").args(["-c", "date +%N"]))
            .unwrap();
        let second = system
            .idempotent_cmd_output(Command::new("sh").args(["-c", "date +%N"]))
            .unwrap();
        assert_eq!(first, second);
    }

    #[cfg(unix)]
    #[test]
    fn failed_command_reports_stderr() {
        let system = RealSystem::new();
        let err = system
            .idempotent_cmd_output(Command::new("sh").args(["-c", "echo boom >&2; exit 3"]))
            .unwrap_err();
        assert!(err.to_string().contains("boom"), "{err}");
    }
}
