// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use super::SourceContext;
use crate::{
    attr::{DirAttr, FileAttr, ScriptOrder, SourceFileKind},
    error::{Error, Result},
    filter::EntryTypeSet,
    lazy::Lazy,
    path::{SourceRelPath, TargetRelPath},
    system::{self, describe_cmd, RunScriptOptions, System},
    target::{Contents, DirCommand, TargetStateEntry},
};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    io::{self, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::Arc,
    thread,
    time::Duration,
};

const MODIFY_TEMPLATE_MARKER: &str = "chezmoi:modify-template";

/// Where a source state entry came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Origin {
    /// File or directory inside the source directory.
    Source(PathBuf),

    /// Imported by an externals manifest.
    External { url: String, defined_in: PathBuf },

    /// Generated to remove something from the destination.
    Remove,
}

impl Origin {
    pub fn is_external(&self) -> bool {
        matches!(self, Self::External { .. })
    }
}

impl Display for Origin {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Source(path) => write!(fmt, "{}", path.display()),
            Self::External { url, defined_in } => {
                write!(fmt, "{url} defined in {}", defined_in.display())
            }
            Self::Remove => fmt.write_str("remove"),
        }
    }
}

/// Directory of the source state.
#[derive(Clone, Debug)]
pub struct SourceDir {
    pub source_rel_path: Option<SourceRelPath>,
    pub attr: DirAttr,
    pub origin: Origin,
    pub perm: u32,
}

/// File of the source state, which may also be a script or symlink.
#[derive(Clone)]
pub struct SourceFile {
    pub source_rel_path: Option<SourceRelPath>,
    pub target_rel_path: TargetRelPath,
    pub attr: FileAttr,
    pub origin: Origin,
    pub perm: u32,
    pub(crate) contents: Contents,
    pub(crate) ctx: Arc<SourceContext>,
}

impl std::fmt::Debug for SourceFile {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.debug_struct("SourceFile")
            .field("source_rel_path", &self.source_rel_path)
            .field("target_rel_path", &self.target_rel_path)
            .field("attr", &self.attr)
            .field("origin", &self.origin)
            .field("perm", &self.perm)
            .finish_non_exhaustive()
    }
}

/// Request to remove a destination path.
#[derive(Clone, Debug)]
pub struct SourceRemove {
    pub source_rel_path: Option<SourceRelPath>,
    pub origin: Origin,
}

/// Directory maintained by an external command, like a git clone.
#[derive(Clone, Debug)]
pub struct SourceCommand {
    pub origin: Origin,
    pub command: DirCommand,
    pub refresh_period: Duration,

    /// Run even if the refresh period has not run out yet.
    pub force_refresh: bool,
}

/// Entry of the source state.
#[derive(Clone, Debug)]
pub enum SourceStateEntry {
    Dir(SourceDir),
    File(SourceFile),
    Remove(SourceRemove),
    Command(SourceCommand),
}

impl SourceStateEntry {
    pub fn origin(&self) -> &Origin {
        match self {
            Self::Dir(dir) => &dir.origin,
            Self::File(file) => &file.origin,
            Self::Remove(remove) => &remove.origin,
            Self::Command(command) => &command.origin,
        }
    }

    /// Path inside the source directory, if entry has one.
    pub fn source_rel_path(&self) -> Option<&SourceRelPath> {
        match self {
            Self::Dir(dir) => dir.source_rel_path.as_ref(),
            Self::File(file) => file.source_rel_path.as_ref(),
            Self::Remove(remove) => remove.source_rel_path.as_ref(),
            Self::Command(_) => None,
        }
    }

    /// Phase of an apply in which entry is processed.
    pub fn order(&self) -> ScriptOrder {
        match self {
            Self::File(file) if file.attr.kind == SourceFileKind::Script => file.attr.order,
            _ => ScriptOrder::During,
        }
    }

    /// Entry type bits for filtering.
    pub fn entry_type(&self) -> EntryTypeSet {
        let external = if self.origin().is_external() {
            EntryTypeSet::EXTERNALS
        } else {
            EntryTypeSet::NONE
        };

        match self {
            Self::Dir(_) => EntryTypeSet::DIRS | external,
            Self::File(file) => {
                let mut bits = match file.attr.kind {
                    SourceFileKind::File | SourceFileKind::Create | SourceFileKind::Modify => {
                        EntryTypeSet::FILES
                    }
                    SourceFileKind::Remove => EntryTypeSet::REMOVE,
                    SourceFileKind::Script => EntryTypeSet::SCRIPTS,
                    SourceFileKind::Symlink => EntryTypeSet::SYMLINKS,
                };
                if file.attr.is_encrypted() {
                    bits = bits | EntryTypeSet::ENCRYPTED;
                }
                if file.attr.template {
                    bits = bits | EntryTypeSet::TEMPLATES;
                }
                bits | external
            }
            Self::Remove(_) => EntryTypeSet::REMOVE,
            Self::Command(_) => EntryTypeSet::EXTERNALS,
        }
    }

    /// Check if two entries may share a target, which only equivalent
    /// directories can.
    pub fn is_equivalent(&self, other: &SourceStateEntry) -> bool {
        match (self, other) {
            (Self::Dir(a), Self::Dir(b)) => a.attr == b.attr,
            _ => false,
        }
    }

    /// Compute target state for destination path `dest_path`.
    ///
    /// Reads the destination through `dest_system` for entries whose target
    /// depends on what is already there.
    ///
    /// # Errors
    ///
    /// - Return [`Error`] if the destination cannot be read.
    pub fn target_state_entry(
        &self,
        dest_system: &dyn System,
        dest_path: &Path,
    ) -> Result<TargetStateEntry> {
        match self {
            Self::Dir(dir) => Ok(TargetStateEntry::Dir { perm: dir.perm }),
            Self::Remove(_) => Ok(TargetStateEntry::Remove),
            Self::Command(command) => Ok(TargetStateEntry::ModifyDirWithCmd {
                command: command.command.clone(),
                refresh_period: command.refresh_period,
                force_refresh: command.force_refresh,
            }),
            Self::File(file) => file.target_state_entry(dest_system, dest_path),
        }
    }
}

impl SourceFile {
    /// Processed source contents, decrypted and rendered.
    ///
    /// # Errors
    ///
    /// - Return [`Error`] if contents cannot be read, decrypted, or
    ///   rendered.
    pub fn contents(&self) -> Result<&Vec<u8>> {
        self.contents.get()
    }

    fn target_state_entry(
        &self,
        dest_system: &dyn System,
        dest_path: &Path,
    ) -> Result<TargetStateEntry> {
        let entry = match self.attr.kind {
            SourceFileKind::File => TargetStateEntry::File {
                contents: self.contents.clone(),
                perm: self.perm,
                empty: self.attr.empty,
                overwrite: false,
            },
            SourceFileKind::Create => {
                let contents = match read_existing(dest_system, dest_path)? {
                    Some(current) => Arc::new(Lazy::ready(current)),
                    None => self.contents.clone(),
                };
                TargetStateEntry::File {
                    contents,
                    perm: self.perm,
                    empty: true,
                    overwrite: false,
                }
            }
            SourceFileKind::Modify => {
                let current = read_existing(dest_system, dest_path)?.unwrap_or_default();
                let modifier = self.contents.clone();
                let ctx = self.ctx.clone();
                let name = self.name();
                let target = self.target_rel_path.clone();
                let options = self.ctx.script_options(&self.attr.target_name, &name);
                let contents = Lazy::new(move || {
                    modify(&ctx, &name, &target, modifier.get()?, &current, &options)
                });
                TargetStateEntry::File {
                    contents: Arc::new(contents),
                    perm: self.perm,
                    empty: false,
                    overwrite: true,
                }
            }
            SourceFileKind::Remove => TargetStateEntry::Remove,
            SourceFileKind::Script => TargetStateEntry::Script {
                name: self.target_rel_path.clone(),
                contents: self.contents.clone(),
                condition: self.attr.condition,
                options: self.ctx.script_options(&self.attr.target_name, &self.name()),
            },
            SourceFileKind::Symlink => {
                let contents = self.contents.clone();
                TargetStateEntry::Symlink {
                    linkname: Arc::new(Lazy::new(move || {
                        Ok(String::from_utf8_lossy(contents.get()?).trim().to_string())
                    })),
                }
            }
        };

        Ok(entry)
    }

    fn name(&self) -> String {
        match &self.source_rel_path {
            Some(path) => path.to_string(),
            None => self.target_rel_path.to_string(),
        }
    }
}

fn read_existing(system: &dyn System, path: &Path) -> Result<Option<Vec<u8>>> {
    match system.read_file(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn modify(
    ctx: &SourceContext,
    name: &str,
    target: &TargetRelPath,
    modifier: &[u8],
    current: &[u8],
    options: &RunScriptOptions,
) -> Result<Vec<u8>> {
    if modifier.iter().all(u8::is_ascii_whitespace) {
        return Ok(current.to_vec());
    }

    let text = String::from_utf8_lossy(modifier);
    if text.contains(MODIFY_TEMPLATE_MARKER) {
        let template: String = text
            .split_inclusive('\n')
            .filter(|line| !line.contains(MODIFY_TEMPLATE_MARKER))
            .collect();
        let stdin = String::from_utf8_lossy(current).into_owned();
        return ctx.execute_with(name, Some(target), template.as_bytes(), Some(stdin));
    }

    run_modifier(ctx, name, target, modifier, current, options)
}

fn run_modifier(
    ctx: &SourceContext,
    name: &str,
    target: &TargetRelPath,
    modifier: &[u8],
    current: &[u8],
    options: &RunScriptOptions,
) -> Result<Vec<u8>> {
    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut builder = tempfile::Builder::new();
    builder.prefix("chezmoi-modify-").suffix(&file_name);
    let temp = match &ctx.script_temp_dir {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile(),
    }
    .map_err(system::Error::io("create temporary file for", target.as_path()))?;

    let (mut file, script) = temp.into_parts();
    file.write_all(modifier)
        .map_err(system::Error::io("write", &script))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o700))
            .map_err(system::Error::io("change mode of", &script))?;
    }
    drop(file);

    let mut cmd = match &options.interpreter {
        Some(interpreter) => {
            let mut cmd = Command::new(&interpreter.command);
            cmd.args(&interpreter.args).arg(&*script);
            cmd
        }
        None => Command::new(&*script),
    };
    cmd.env("CHEZMOI", "1")
        .env("CHEZMOI_SOURCE_FILE", name)
        .envs(options.env.iter().map(|(key, value)| (key, value)))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let command = describe_cmd(&cmd);
    let mut child = cmd.spawn().map_err(system::Error::io("run", &script))?;

    // INVARIANT: Feed stdin from another thread so a large output cannot
    // deadlock against a full stdin pipe.
    let stdin = child.stdin.take();
    let (fed, output) = thread::scope(|scope| {
        let feeder = scope.spawn(move || match stdin {
            Some(mut stdin) => stdin.write_all(current),
            None => Ok(()),
        });
        let output = child.wait_with_output();
        (feeder.join(), output)
    });
    let output = output.map_err(system::Error::io("run", &script))?;

    if !output.status.success() {
        return Err(Error::System(system::Error::Command {
            command,
            status: output.status,
            stderr: String::new(),
        }));
    }

    // A modifier that exits without reading its input closes the pipe early.
    match fed.unwrap_or_else(|panic| std::panic::resume_unwind(panic)) {
        Err(err) if err.kind() != io::ErrorKind::BrokenPipe => {
            Err(system::Error::io("write current contents to", &script)(err).into())
        }
        _ => Ok(output.stdout),
    }
}
