// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use super::{DirEntry, Error, FileInfo, FileKind, Result, RunScriptOptions, System};
use crate::path::TargetRelPath;

use similar::TextDiff;
use std::{
    io::Write,
    path::{Path, PathBuf},
    process::Command,
    sync::{Arc, Mutex, PoisonError},
};

const MODE_FILE: u32 = 0o100644;
const MODE_EXECUTABLE: u32 = 0o100755;
const MODE_SYMLINK: u32 = 0o120000;
const MODE_DIR: u32 = 0o040000;

/// Shared sink for patch output.
pub type DiffWriter = Arc<Mutex<dyn Write + Send>>;

/// Records every mutation as a git-style patch, then forwards it.
pub struct GitDiffSystem {
    inner: Arc<dyn System>,
    writer: DiffWriter,
    dir_prefix: PathBuf,
    include_scripts: bool,
    context_radius: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Side {
    mode: u32,
    contents: Vec<u8>,
}

impl GitDiffSystem {
    /// Construct new diff system over `inner`.
    ///
    /// Paths in the patch are shown relative to `dir_prefix`.
    pub fn new(inner: Arc<dyn System>, writer: DiffWriter, dir_prefix: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            writer,
            dir_prefix: dir_prefix.into(),
            include_scripts: true,
            context_radius: 3,
        }
    }

    /// Show script contents when scripts are run.
    pub fn with_scripts(mut self, include_scripts: bool) -> Self {
        self.include_scripts = include_scripts;
        self
    }

    fn name(&self, path: &Path) -> String {
        path.strip_prefix(&self.dir_prefix)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }

    fn current(&self, path: &Path) -> Result<Option<Side>> {
        let info = match self.inner.lstat(path) {
            Ok(info) => info,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };

        let side = match info.kind {
            FileKind::File => Side {
                mode: file_mode(info.perm),
                contents: self.inner.read_file(path)?,
            },
            FileKind::Symlink => Side {
                mode: MODE_SYMLINK,
                contents: self
                    .inner
                    .read_link(path)?
                    .to_string_lossy()
                    .into_owned()
                    .into_bytes(),
            },
            FileKind::Dir | FileKind::Other => Side {
                mode: MODE_DIR,
                contents: Vec::new(),
            },
        };

        Ok(Some(side))
    }

    fn record(&self, name: &str, from: Option<&Side>, to: Option<&Side>) -> Result<()> {
        let patch = encode_patch(name, from, to, self.context_radius);
        if patch.is_empty() {
            return Ok(());
        }

        // A panic elsewhere while holding the writer leaves it usable.
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer
            .write_all(patch.as_bytes())
            .map_err(Error::io("write diff for", Path::new(name)))
    }

    fn record_change(&self, path: &Path, to: Option<Side>) -> Result<()> {
        let from = self.current(path)?;
        self.record(&self.name(path), from.as_ref(), to.as_ref())
    }
}

fn file_mode(perm: u32) -> u32 {
    if perm & 0o111 != 0 {
        MODE_EXECUTABLE
    } else {
        MODE_FILE
    }
}

fn encode_patch(name: &str, from: Option<&Side>, to: Option<&Side>, context_radius: usize) -> String {
    if from == to {
        return String::new();
    }

    let mut out = format!("diff --git a/{name} b/{name}\n");
    match (from, to) {
        (None, Some(to)) => out.push_str(&format!("new file mode {:06o}\n", to.mode)),
        (Some(from), None) => out.push_str(&format!("deleted file mode {:06o}\n", from.mode)),
        (Some(from), Some(to)) if from.mode != to.mode => {
            out.push_str(&format!("old mode {:06o}\nnew mode {:06o}\n", from.mode, to.mode))
        }
        _ => {}
    }

    let empty = Vec::new();
    let old = from.map(|side| &side.contents).unwrap_or(&empty);
    let new = to.map(|side| &side.contents).unwrap_or(&empty);
    if old == new {
        return out;
    }

    let old_name = from.map(|_| format!("a/{name}")).unwrap_or("/dev/null".into());
    let new_name = to.map(|_| format!("b/{name}")).unwrap_or("/dev/null".into());
    match (std::str::from_utf8(old), std::str::from_utf8(new)) {
        (Ok(old), Ok(new)) if !old.contains('\0') && !new.contains('\0') => {
            let diff = TextDiff::from_lines(old, new);
            out.push_str(
                &diff
                    .unified_diff()
                    .context_radius(context_radius)
                    .header(&old_name, &new_name)
                    .to_string(),
            );
        }
        _ => out.push_str(&format!("Binary files {old_name} and {new_name} differ\n")),
    }

    out
}

impl System for GitDiffSystem {
    fn chmod(&self, path: &Path, perm: u32) -> Result<()> {
        if let Some(from) = self.current(path)? {
            if from.mode != MODE_DIR {
                let to = Side {
                    mode: file_mode(perm),
                    ..from.clone()
                };
                self.record(&self.name(path), Some(&from), Some(&to))?;
            }
        }

        self.inner.chmod(path, perm)
    }

    fn lstat(&self, path: &Path) -> Result<FileInfo> {
        self.inner.lstat(path)
    }

    fn stat(&self, path: &Path) -> Result<FileInfo> {
        self.inner.stat(path)
    }

    fn mkdir(&self, path: &Path, perm: u32) -> Result<()> {
        self.record_change(
            path,
            Some(Side {
                mode: MODE_DIR,
                contents: Vec::new(),
            }),
        )?;
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
        self.record_change(path, None)?;
        self.inner.remove(path)
    }

    fn remove_all(&self, path: &Path) -> Result<()> {
        self.record_change(path, None)?;
        self.inner.remove_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let (from_name, to_name) = (self.name(from), self.name(to));
        let patch = format!(
            "diff --git a/{from_name} b/{to_name}\nrename from {from_name}\nrename to {to_name}\n"
        );
        if let Ok(mut writer) = self.writer.lock() {
            writer
                .write_all(patch.as_bytes())
                .map_err(Error::io("write diff for", from))?;
        }

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
        if self.include_scripts {
            let to = Side {
                mode: MODE_EXECUTABLE,
                contents: data.to_vec(),
            };
            self.record(&name.to_string(), None, Some(&to))?;
        }

        self.inner.run_script(name, dir, data, options)
    }

    fn write_file(&self, path: &Path, data: &[u8], perm: u32) -> Result<()> {
        self.record_change(
            path,
            Some(Side {
                mode: file_mode(perm),
                contents: data.to_vec(),
            }),
        )?;
        self.inner.write_file(path, data, perm)
    }

    fn write_symlink(&self, linkname: &Path, path: &Path) -> Result<()> {
        self.record_change(
            path,
            Some(Side {
                mode: MODE_SYMLINK,
                contents: linkname.to_string_lossy().into_owned().into_bytes(),
            }),
        )?;
        self.inner.write_symlink(linkname, path)
    }
}
