// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use super::{DirEntry, ErrorClass, FileInfo, FileKind, Result, RunScriptOptions, System};
use crate::path::TargetRelPath;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::Command,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

/// Reads pass through, mutations are recorded as attempted and dropped.
///
/// Directories created along the way are remembered, so later reads see
/// them as existing and empty. Without that, every file under a new
/// directory would ask for the directory again.
pub struct DryRunSystem {
    inner: Arc<dyn System>,
    modified: AtomicBool,
    dirs: Mutex<BTreeMap<PathBuf, u32>>,
}

impl DryRunSystem {
    /// Construct new dry-run system over `inner`.
    pub fn new(inner: Arc<dyn System>) -> Self {
        Self {
            inner,
            modified: AtomicBool::new(false),
            dirs: Mutex::new(BTreeMap::new()),
        }
    }

    /// Check if any mutation was attempted.
    pub fn modified(&self) -> bool {
        self.modified.load(Ordering::Relaxed)
    }

    fn pretend(&self) -> Result<()> {
        self.modified.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn dirs(&self) -> MutexGuard<'_, BTreeMap<PathBuf, u32>> {
        self.dirs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn created_dir(&self, path: &Path) -> Option<FileInfo> {
        self.dirs().get(path).map(|&perm| FileInfo {
            kind: FileKind::Dir,
            perm,
            len: 0,
            modified: None,
        })
    }

    fn forget(&self, path: &Path) {
        self.dirs().retain(|dir, _| !dir.starts_with(path));
    }

    fn or_created(&self, path: &Path, result: Result<FileInfo>) -> Result<FileInfo> {
        match result {
            Err(err) if err.class() == ErrorClass::NotFound => self.created_dir(path).ok_or(err),
            result => result,
        }
    }
}

impl System for DryRunSystem {
    fn chmod(&self, _path: &Path, _perm: u32) -> Result<()> {
        self.pretend()
    }

    fn lstat(&self, path: &Path) -> Result<FileInfo> {
        self.or_created(path, self.inner.lstat(path))
    }

    fn stat(&self, path: &Path) -> Result<FileInfo> {
        self.or_created(path, self.inner.stat(path))
    }

    fn mkdir(&self, path: &Path, perm: u32) -> Result<()> {
        if self.inner.lstat(path).is_err() {
            self.dirs().insert(path.to_path_buf(), perm);
        }
        self.pretend()
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        match self.inner.read_dir(path) {
            Err(err) if err.class() == ErrorClass::NotFound && self.created_dir(path).is_some() => {
                Ok(Vec::new())
            }
            result => result,
        }
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        self.inner.read_file(path)
    }

    fn read_link(&self, path: &Path) -> Result<PathBuf> {
        self.inner.read_link(path)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        self.forget(path);
        self.pretend()
    }

    fn remove_all(&self, path: &Path) -> Result<()> {
        self.forget(path);
        self.pretend()
    }

    fn rename(&self, _from: &Path, _to: &Path) -> Result<()> {
        self.pretend()
    }

    fn run_cmd(&self, _cmd: &mut Command) -> Result<()> {
        self.pretend()
    }

    fn idempotent_cmd_output(&self, cmd: &mut Command) -> Result<Vec<u8>> {
        self.inner.idempotent_cmd_output(cmd)
    }

    fn run_script(
        &self,
        _name: &TargetRelPath,
        _dir: &Path,
        _data: &[u8],
        _options: &RunScriptOptions,
    ) -> Result<()> {
        self.pretend()
    }

    fn write_file(&self, _path: &Path, _data: &[u8], _perm: u32) -> Result<()> {
        self.pretend()
    }

    fn write_symlink(&self, _linkname: &Path, _path: &Path) -> Result<()> {
        self.pretend()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::RealSystem;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn mutations_never_reach_inner() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("file");
        std::fs::write(&path, b"old").unwrap();

        let system = DryRunSystem::new(Arc::new(RealSystem::new()));
        assert!(!system.modified());

        system.write_file(&path, b"new", 0o644).unwrap();
        system.remove_all(temp.path()).unwrap();
        system
            .run_script(
                &TargetRelPath::from("script.sh"),
                temp.path(),
                b"#!/bin/sh\ntouch marker\n",
                &RunScriptOptions::default(),
            )
            .unwrap();

        assert!(system.modified());
        assert_eq!(system.read_file(&path).unwrap(), b"old");
        assert!(!temp.path().join("marker").exists());
    }

    #[test]
    fn created_directories_are_seen_by_later_reads() {
        let temp = TempDir::new().unwrap();
        let config = temp.path().join(".config");
        let git = config.join("git");

        let system = DryRunSystem::new(Arc::new(RealSystem::new()));
        assert!(system.stat(&git).is_err());

        crate::system::mkdir_all(&system, &git, 0o755).unwrap();
        assert!(!config.exists());
        assert_eq!(system.stat(&git).unwrap().kind, FileKind::Dir);
        assert_eq!(system.lstat(&config).unwrap().perm, 0o755);
        assert_eq!(system.read_dir(&git).unwrap(), Vec::new());

        // A second pass finds everything in place and asks for nothing.
        let recorded = system.dirs().len();
        crate::system::mkdir_all(&system, &git, 0o755).unwrap();
        assert_eq!(system.dirs().len(), recorded);

        system.remove_all(&config).unwrap();
        assert!(system.stat(&git).is_err());
        assert!(system.stat(&config).is_err());
    }
}
