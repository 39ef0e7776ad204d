// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Target state.
//!
//! A [`TargetStateEntry`] is the concrete form a source entry should take at
//! the destination: a directory with a mode, a file with contents and a mode,
//! a symlink, a script to run, something to remove, or a directory kept up to
//! date by an external command. Contents stay lazy until an entry is actually
//! compared or written.
//!
//! Every entry knows how to compute its [`EntryState`] for comparison, and how
//! to bring an [`ActualStateEntry`] in line with itself through a [`System`].

use crate::{
    actual::ActualStateEntry,
    attr::ScriptCondition,
    error::Result,
    filter::EntryTypeSet,
    lazy::Lazy,
    path::TargetRelPath,
    state::{
        get_json, path_key, put_json, sha256_hex, Bucket, EntryState, EntryStateKind,
        PersistentState, RunState,
    },
    system::{RunScriptOptions, System},
};

use chrono::Utc;
use std::{
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
    time::Duration,
};
use tracing::debug;

/// Shared lazily computed contents.
pub type Contents = Arc<Lazy<Vec<u8>>>;

/// External command that keeps a directory up to date.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirCommand {
    pub program: String,
    pub args: Vec<String>,
    pub dir: PathBuf,
}

impl DirCommand {
    /// Construct runnable command.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).current_dir(&self.dir);
        cmd
    }
}

/// Desired state of a single destination path.
#[derive(Clone, Debug)]
pub enum TargetStateEntry {
    Dir {
        perm: u32,
    },
    File {
        contents: Contents,
        perm: u32,
        /// Keep the file even when it has no contents.
        empty: bool,
        /// Replace the destination without treating changes as conflicts.
        overwrite: bool,
    },
    Symlink {
        linkname: Arc<Lazy<String>>,
    },
    Script {
        name: TargetRelPath,
        contents: Contents,
        condition: ScriptCondition,
        options: RunScriptOptions,
    },
    Remove,
    ModifyDirWithCmd {
        command: DirCommand,
        refresh_period: Duration,
        force_refresh: bool,
    },
}

impl TargetStateEntry {
    /// Entry type bits for filtering.
    pub fn entry_type(&self) -> EntryTypeSet {
        match self {
            Self::Dir { .. } | Self::ModifyDirWithCmd { .. } => EntryTypeSet::DIRS,
            Self::File { .. } => EntryTypeSet::FILES,
            Self::Symlink { .. } => EntryTypeSet::SYMLINKS,
            Self::Script { condition, .. } => match condition {
                ScriptCondition::Always => EntryTypeSet::SCRIPTS | EntryTypeSet::ALWAYS,
                _ => EntryTypeSet::SCRIPTS,
            },
            Self::Remove => EntryTypeSet::REMOVE,
        }
    }

    /// Compute the entry state this entry leaves behind once applied.
    ///
    /// # Errors
    ///
    /// - Return [`crate::error::Error`] if lazy contents fail to compute.
    pub fn entry_state(&self, umask: u32) -> Result<EntryState> {
        let state = match self {
            Self::Dir { perm } => EntryState::new(EntryStateKind::Dir, perm & !umask, None),
            Self::File {
                contents,
                perm,
                empty,
                overwrite,
            } => {
                let contents = contents.get()?;
                if contents.is_empty() && !empty {
                    EntryState::remove()
                } else {
                    EntryState {
                        overwrite: *overwrite,
                        ..EntryState::new(EntryStateKind::File, perm & !umask, Some(contents))
                    }
                }
            }
            Self::Symlink { linkname } => {
                let linkname = linkname.get()?;
                if linkname.is_empty() {
                    EntryState::remove()
                } else {
                    EntryState::new(EntryStateKind::Symlink, 0, Some(linkname.as_bytes()))
                }
            }
            Self::Script { contents, .. } => {
                EntryState::new(EntryStateKind::Script, 0, Some(contents.get()?))
            }
            Self::Remove => EntryState::remove(),
            Self::ModifyDirWithCmd { .. } => {
                EntryState::new(EntryStateKind::Dir, 0o777 & !umask, None)
            }
        };

        Ok(state)
    }

    /// Check if applying can be skipped based on bookkeeping alone.
    ///
    /// Only scripts and external directory commands ever skip.
    ///
    /// # Errors
    ///
    /// - Return [`crate::error::Error`] if lazy contents fail to compute or
    ///   persistent state cannot be read.
    pub fn skip_apply(&self, state: &dyn PersistentState, path: &Path) -> Result<bool> {
        match self {
            Self::Script {
                contents,
                condition,
                ..
            } => {
                let contents = contents.get()?;
                if contents.iter().all(u8::is_ascii_whitespace) {
                    return Ok(true);
                }

                let hash = sha256_hex(contents);
                match condition {
                    ScriptCondition::Always => Ok(false),
                    ScriptCondition::Once => Ok(state.get(Bucket::ScriptState, hash.as_bytes())?.is_some()),
                    ScriptCondition::OnChange => {
                        let last: Option<EntryState> =
                            get_json(state, Bucket::EntryState, &path_key(path))?;
                        Ok(last.and_then(|last| last.contents_sha256) == Some(hash))
                    }
                }
            }
            Self::ModifyDirWithCmd {
                refresh_period,
                force_refresh,
                ..
            } => {
                if *force_refresh {
                    return Ok(false);
                }

                let last: Option<RunState> =
                    get_json(state, Bucket::GitRepoExternalState, &path_key(path))?;
                let Some(last) = last else {
                    return Ok(false);
                };

                if refresh_period.is_zero() {
                    return Ok(true);
                }

                let elapsed = (Utc::now() - last.run_at).to_std().unwrap_or_default();
                Ok(elapsed < *refresh_period)
            }
            _ => Ok(false),
        }
    }

    /// Bring `actual` in line with this entry through `system`.
    ///
    /// Persistent state is left alone. The returned [`Change`] says what to
    /// remember about it.
    ///
    /// # Errors
    ///
    /// - Return [`crate::error::Error`] if contents fail to compute, or the
    ///   system fails.
    pub fn apply(&self, system: &dyn System, actual: &ActualStateEntry) -> Result<Change> {
        let path = actual.path();
        match self {
            Self::Dir { perm } => {
                if let ActualStateEntry::Dir { perm: actual_perm, .. } = actual {
                    if cfg!(windows) || actual_perm == perm {
                        return Ok(Change::None);
                    }
                    system.chmod(path, *perm)?;
                    return Ok(Change::Updated);
                }

                actual.remove(system)?;
                system.mkdir(path, *perm)?;
                Ok(Change::Updated)
            }
            Self::File {
                contents,
                perm,
                empty,
                ..
            } => {
                let contents = contents.get()?;
                if contents.is_empty() && !empty {
                    if actual.is_absent() {
                        return Ok(Change::None);
                    }
                    system.remove_all(path)?;
                    return Ok(Change::Updated);
                }

                if let ActualStateEntry::File {
                    perm: actual_perm,
                    contents: actual_contents,
                    ..
                } = actual
                {
                    if sha256_hex(actual_contents) == sha256_hex(contents) {
                        if cfg!(windows) || actual_perm == perm {
                            return Ok(Change::None);
                        }
                        system.chmod(path, *perm)?;
                        return Ok(Change::Updated);
                    }
                } else {
                    actual.remove(system)?;
                }

                system.write_file(path, contents, *perm)?;
                Ok(Change::Updated)
            }
            Self::Symlink { linkname } => {
                let linkname = linkname.get()?;
                if linkname.is_empty() {
                    if actual.is_absent() {
                        return Ok(Change::None);
                    }
                    system.remove_all(path)?;
                    return Ok(Change::Updated);
                }

                if let ActualStateEntry::Symlink {
                    linkname: actual_linkname,
                    ..
                } = actual
                {
                    if actual_linkname == linkname {
                        return Ok(Change::None);
                    }
                }

                actual.remove(system)?;
                system.write_symlink(Path::new(linkname), path)?;
                Ok(Change::Updated)
            }
            Self::Script {
                name,
                contents,
                options,
                ..
            } => {
                let contents = contents.get()?;
                let run_at = Utc::now();
                if !contents.iter().all(u8::is_ascii_whitespace) {
                    let dir = path.parent().unwrap_or(path);
                    system.run_script(name, dir, contents, options)?;
                }

                Ok(Change::Ran {
                    bucket: Bucket::ScriptState,
                    key: sha256_hex(contents).into_bytes(),
                    run: RunState {
                        name: name.to_string(),
                        run_at,
                    },
                })
            }
            Self::Remove => {
                if actual.is_absent() {
                    return Ok(Change::None);
                }
                system.remove_all(path)?;
                Ok(Change::Updated)
            }
            Self::ModifyDirWithCmd { command, .. } => {
                if !matches!(actual, ActualStateEntry::Dir { .. } | ActualStateEntry::Absent { .. }) {
                    actual.remove(system)?;
                }

                debug!("run {} {:?} in {:?}", command.program, command.args, command.dir);
                system.run_cmd(&mut command.to_command())?;
                Ok(Change::Ran {
                    bucket: Bucket::GitRepoExternalState,
                    key: path_key(path),
                    run: RunState {
                        name: path.to_string_lossy().into_owned(),
                        run_at: Utc::now(),
                    },
                })
            }
        }
    }

    /// Contents as the `cat` command shows them.
    ///
    /// # Errors
    ///
    /// - Return [`crate::error::Error`] if lazy contents fail to compute.
    pub fn contents(&self) -> Result<Option<Vec<u8>>> {
        match self {
            Self::File { contents, .. } | Self::Script { contents, .. } => {
                Ok(Some(contents.get()?.clone()))
            }
            Self::Symlink { linkname } => Ok(Some(format!("{}\n", linkname.get()?).into_bytes())),
            _ => Ok(None),
        }
    }
}

/// What applying a [`TargetStateEntry`] did to the destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change {
    /// Destination already matched.
    None,

    /// Destination was brought in line.
    Updated,

    /// Script or command ran, remembered as `run` under `key` of `bucket`.
    Ran {
        bucket: Bucket,
        key: Vec<u8>,
        run: RunState,
    },
}

impl Change {
    /// Check if the destination was left alone.
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Remember that `path` now holds `entry_state`.
    ///
    /// Entry state and any run record land in a single transaction, so a
    /// failure never leaves one without the other.
    ///
    /// # Errors
    ///
    /// - Return [`crate::state::Error`] if the persistent state fails.
    pub fn commit(
        &self,
        state: &dyn PersistentState,
        path: &Path,
        entry_state: &EntryState,
    ) -> crate::state::Result<()> {
        let entry_key = path_key(path);
        state.transaction(&mut |tx| {
            if let Self::Ran { bucket, key, run } = self {
                put_json(tx, *bucket, key, run)?;
            }
            put_json(tx, Bucket::EntryState, &entry_key, entry_state)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        state::{set_json, MemoryState, Result as StateResult, Transaction},
        system::{DryRunSystem, RealSystem},
    };
    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn file(contents: &[u8], perm: u32, empty: bool) -> TargetStateEntry {
        TargetStateEntry::File {
            contents: Arc::new(Lazy::ready(contents.to_vec())),
            perm,
            empty,
            overwrite: false,
        }
    }

    fn script(contents: &[u8], condition: ScriptCondition) -> TargetStateEntry {
        TargetStateEntry::Script {
            name: TargetRelPath::from("script.sh"),
            contents: Arc::new(Lazy::ready(contents.to_vec())),
            condition,
            options: RunScriptOptions::default(),
        }
    }

    fn apply(entry: &TargetStateEntry, system: &dyn System, state: &dyn PersistentState, path: &Path) -> bool {
        let actual = ActualStateEntry::new(system, path).unwrap();
        let change = entry.apply(system, &actual).unwrap();
        if change.is_none() {
            return false;
        }
        change
            .commit(state, path, &entry.entry_state(0o022).unwrap())
            .unwrap();
        true
    }

    #[test]
    fn empty_file_without_empty_attribute_is_removal() {
        assert_eq!(file(b"", 0o644, false).entry_state(0o022).unwrap(), EntryState::remove());
        assert_eq!(
            file(b"", 0o666, true).entry_state(0o022).unwrap(),
            EntryState::new(EntryStateKind::File, 0o644, Some(b""))
        );
    }

    #[cfg(unix)]
    #[test]
    fn file_apply_writes_then_settles() {
        let temp = TempDir::new().unwrap();
        let system = RealSystem::new();
        let state = MemoryState::new();
        let path = temp.path().join("file");

        let entry = file(b"X", 0o644, false);
        assert!(apply(&entry, &system, &state, &path));
        assert_eq!(std::fs::read(&path).unwrap(), b"X");
        assert!(!apply(&entry, &system, &state, &path));

        // Same contents, different mode only needs a chmod.
        assert!(apply(&file(b"X", 0o600, false), &system, &state, &path));
        let actual = ActualStateEntry::new(&system, &path).unwrap();
        assert_eq!(actual.entry_state(), EntryState::new(EntryStateKind::File, 0o600, Some(b"X")));

        // Empty contents remove the file.
        assert!(apply(&file(b"", 0o600, false), &system, &state, &path));
        assert!(!path.exists());
        assert!(!apply(&file(b"", 0o600, false), &system, &state, &path));
    }

    #[cfg(unix)]
    #[test]
    fn dir_replaces_file() {
        let temp = TempDir::new().unwrap();
        let system = RealSystem::new();
        let state = MemoryState::new();
        let path = temp.path().join("dir");
        std::fs::write(&path, b"in the way").unwrap();

        let entry = TargetStateEntry::Dir { perm: 0o755 };
        assert!(apply(&entry, &system, &state, &path));
        assert!(path.is_dir());
        assert!(!apply(&entry, &system, &state, &path));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_apply() {
        let temp = TempDir::new().unwrap();
        let system = RealSystem::new();
        let state = MemoryState::new();
        let path = temp.path().join("link");

        let entry = TargetStateEntry::Symlink {
            linkname: Arc::new(Lazy::ready(".dotfiles/vimrc".to_string())),
        };
        assert!(apply(&entry, &system, &state, &path));
        assert_eq!(std::fs::read_link(&path).unwrap(), PathBuf::from(".dotfiles/vimrc"));
        assert!(!apply(&entry, &system, &state, &path));
        assert_eq!(
            entry.contents().unwrap(),
            Some(b".dotfiles/vimrc\n".to_vec())
        );
    }

    #[test]
    fn remove_is_noop_when_absent() {
        let temp = TempDir::new().unwrap();
        let system = RealSystem::new();
        let state = MemoryState::new();
        let path = temp.path().join("gone");
        assert!(!apply(&TargetStateEntry::Remove, &system, &state, &path));

        std::fs::create_dir_all(path.join("nested")).unwrap();
        assert!(apply(&TargetStateEntry::Remove, &system, &state, &path));
        assert!(!path.exists());
    }

    #[test]
    fn once_script_skips_after_first_run() {
        let temp = TempDir::new().unwrap();
        let system = DryRunSystem::new(Arc::new(RealSystem::new()));
        let state = MemoryState::new();
        let path = temp.path().join("script.sh");

        let entry = script(b"#!/bin/sh\necho hi\n", ScriptCondition::Once);
        assert!(!entry.skip_apply(&state, &path).unwrap());
        assert!(apply(&entry, &system, &state, &path));
        assert!(entry.skip_apply(&state, &path).unwrap());

        // Different contents count as a different script.
        let changed = script(b"#!/bin/sh\necho bye\n", ScriptCondition::Once);
        assert!(!changed.skip_apply(&state, &path).unwrap());
    }

    #[derive(Default)]
    struct Counting {
        inner: MemoryState,
        sets: AtomicUsize,
        transactions: AtomicUsize,
    }

    impl PersistentState for Counting {
        fn get(&self, bucket: Bucket, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
            self.inner.get(bucket, key)
        }

        fn set(&self, bucket: Bucket, key: &[u8], value: &[u8]) -> StateResult<()> {
            self.sets.fetch_add(1, Ordering::Relaxed);
            self.inner.set(bucket, key, value)
        }

        fn delete(&self, bucket: Bucket, key: &[u8]) -> StateResult<()> {
            self.inner.delete(bucket, key)
        }

        fn delete_bucket(&self, bucket: Bucket) -> StateResult<()> {
            self.inner.delete_bucket(bucket)
        }

        fn for_each(
            &self,
            bucket: Bucket,
            visit: &mut dyn FnMut(&[u8], &[u8]) -> StateResult<()>,
        ) -> StateResult<()> {
            self.inner.for_each(bucket, visit)
        }

        fn transaction(
            &self,
            body: &mut dyn FnMut(&mut dyn Transaction) -> StateResult<()>,
        ) -> StateResult<()> {
            self.transactions.fetch_add(1, Ordering::Relaxed);
            self.inner.transaction(body)
        }
    }

    #[test]
    fn script_run_is_remembered_in_one_transaction() {
        let temp = TempDir::new().unwrap();
        let system = DryRunSystem::new(Arc::new(RealSystem::new()));
        let state = Counting::default();
        let path = temp.path().join("script.sh");
        let contents = b"#!/bin/sh\necho hi\n";

        let entry = script(contents, ScriptCondition::Once);
        assert!(apply(&entry, &system, &state, &path));

        assert_eq!(state.sets.load(Ordering::Relaxed), 0);
        assert_eq!(state.transactions.load(Ordering::Relaxed), 1);
        let run: Option<RunState> =
            get_json(&state, Bucket::ScriptState, sha256_hex(contents).as_bytes()).unwrap();
        assert_eq!(run.map(|run| run.name), Some("script.sh".to_string()));
        let recorded: Option<EntryState> =
            get_json(&state, Bucket::EntryState, &path_key(&path)).unwrap();
        assert_eq!(
            recorded,
            Some(EntryState::new(EntryStateKind::Script, 0, Some(contents)))
        );
    }

    #[test]
    fn onchange_script_reruns_when_contents_change() {
        let temp = TempDir::new().unwrap();
        let system = DryRunSystem::new(Arc::new(RealSystem::new()));
        let state = MemoryState::new();
        let path = temp.path().join("script.sh");

        let entry = script(b"echo one\n", ScriptCondition::OnChange);
        assert!(apply(&entry, &system, &state, &path));
        assert!(entry.skip_apply(&state, &path).unwrap());
        assert!(!script(b"echo two\n", ScriptCondition::OnChange)
            .skip_apply(&state, &path)
            .unwrap());

        // Always scripts never skip, blank ones always do.
        let always = script(b"echo one\n", ScriptCondition::Always);
        assert!(!always.skip_apply(&state, &path).unwrap());
        assert!(script(b"  \n", ScriptCondition::Always).skip_apply(&state, &path).unwrap());
    }

    #[test]
    fn dir_command_honors_refresh_period() {
        let state = MemoryState::new();
        let path = Path::new("/home/user/.oh-my-zsh");
        let entry = |refresh_period, force_refresh| TargetStateEntry::ModifyDirWithCmd {
            command: DirCommand {
                program: "git".into(),
                args: vec!["pull".into()],
                dir: path.to_path_buf(),
            },
            refresh_period,
            force_refresh,
        };

        assert!(!entry(Duration::ZERO, false).skip_apply(&state, path).unwrap());

        let run = RunState {
            name: path.to_string_lossy().into_owned(),
            run_at: Utc::now() - TimeDelta::hours(2),
        };
        set_json(&state, Bucket::GitRepoExternalState, &path_key(path), &run).unwrap();
        assert!(entry(Duration::ZERO, false).skip_apply(&state, path).unwrap());
        assert!(entry(Duration::from_secs(24 * 3600), false).skip_apply(&state, path).unwrap());
        assert!(!entry(Duration::from_secs(3600), false).skip_apply(&state, path).unwrap());
        assert!(!entry(Duration::ZERO, true).skip_apply(&state, path).unwrap());
    }
}
