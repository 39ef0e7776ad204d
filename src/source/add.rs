// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use super::{SourceState, SourceStateEntry};
use crate::{
    actual::ActualStateEntry,
    attr::{DirAttr, FileAttr, SourceFileKind},
    error::{Error, Result},
    filter::{EntryTypeSet, Filter},
    path::{SourceRelPath, TargetRelPath},
    state::{path_key, set_json, Bucket, PersistentState},
    system::{mkdir_all, System},
};

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use tracing::{info, instrument, warn};

const KEEP_FILE: &str = ".keep";

/// How destination paths become source entries.
#[derive(Clone, Debug, Default)]
pub struct AddOptions {
    /// Store file contents encrypted.
    pub encrypt: bool,

    /// Mark files as templates.
    pub template: bool,

    /// Add files as `create_` so existing copies are never overwritten.
    pub create: bool,

    /// Mark files as empty even if they have contents.
    pub empty: bool,

    /// Mark directories as exact.
    pub exact: bool,

    /// Add everything below directories too.
    pub recursive: bool,

    /// Only add entries of these types.
    pub filter: Filter,
}

impl SourceState {
    /// Import destination paths into the source directory.
    ///
    /// Missing parents are added along the way. Attributes are inferred from
    /// what is found at the destination, and the entry state of every added
    /// path is recorded, so a following apply sees nothing to do. The source
    /// state must be read again to see the new entries.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Add`] if a path is outside the destination
    ///   directory, inside the source directory, or has no parent in the
    ///   source state.
    /// - Return [`Error`] for any failed read, write, or encryption.
    #[instrument(level = "debug", skip_all)]
    pub fn add(
        &self,
        source_system: &dyn System,
        state: &dyn PersistentState,
        dest_system: &dyn System,
        dest_paths: &[PathBuf],
        options: &AddOptions,
    ) -> Result<()> {
        let mut targets = BTreeMap::new();
        for path in dest_paths {
            if path.starts_with(&self.source_dir) {
                return Err(Error::Add {
                    path: path.clone(),
                    reason: "cannot add something inside the source directory".into(),
                });
            }
            let target = TargetRelPath::from_abs(&self.dest_dir, path).ok_or_else(|| Error::Add {
                path: path.clone(),
                reason: "not in destination directory".into(),
            })?;
            if target.is_empty() {
                return Err(Error::Add {
                    path: path.clone(),
                    reason: "cannot add the destination directory itself".into(),
                });
            }

            self.collect(dest_system, &target, options.recursive, &mut targets)?;
            let mut parent = target.parent();
            while let Some(dir) = parent {
                if dir.is_empty() || self.root.contains_key(&dir) {
                    break;
                }
                self.collect(dest_system, &dir, false, &mut targets)?;
                parent = dir.parent();
            }
        }

        let mut new_dirs: BTreeMap<TargetRelPath, SourceRelPath> = BTreeMap::new();
        for (target, actual) in targets {
            if self.ignore.matches(&target) {
                warn!("skip ignored {target}");
                continue;
            }
            if !options.filter.includes(entry_type(&actual, options)) {
                continue;
            }

            let parent_rel = self.parent_rel(&target, &new_dirs, actual.path())?;
            let source_rel = self.add_one(source_system, dest_system, &target, &actual, &parent_rel, options)?;
            set_json(
                state,
                Bucket::EntryState,
                &path_key(actual.path()),
                &actual.entry_state(),
            )?;

            if matches!(actual, ActualStateEntry::Dir { .. }) {
                new_dirs.insert(target, source_rel);
            }
        }

        Ok(())
    }

    fn collect(
        &self,
        dest_system: &dyn System,
        target: &TargetRelPath,
        recursive: bool,
        targets: &mut BTreeMap<TargetRelPath, ActualStateEntry>,
    ) -> Result<()> {
        let path = target.to_abs(&self.dest_dir);
        let actual = ActualStateEntry::new(dest_system, &path)?;
        if actual.is_absent() {
            return Err(Error::Add {
                path,
                reason: "does not exist".into(),
            });
        }

        let is_dir = matches!(actual, ActualStateEntry::Dir { .. });
        targets.insert(target.clone(), actual);
        if recursive && is_dir {
            for child in dest_system.read_dir(&path)? {
                self.collect(dest_system, &target.join(&child.name), true, targets)?;
            }
        }

        Ok(())
    }

    fn parent_rel(
        &self,
        target: &TargetRelPath,
        new_dirs: &BTreeMap<TargetRelPath, SourceRelPath>,
        path: &Path,
    ) -> Result<SourceRelPath> {
        let Some(parent) = target.parent().filter(|parent| !parent.is_empty()) else {
            return Ok(SourceRelPath::new_dir(""));
        };

        if let Some(rel) = new_dirs.get(&parent) {
            return Ok(rel.clone());
        }

        match self.root.get(&parent) {
            Some(SourceStateEntry::Dir(dir)) => dir.source_rel_path.clone().ok_or_else(|| Error::Add {
                path: path.to_path_buf(),
                reason: "parent directory comes from an external".into(),
            }),
            _ => Err(Error::Add {
                path: path.to_path_buf(),
                reason: "parent directory is not in the source state".into(),
            }),
        }
    }

    fn add_one(
        &self,
        source_system: &dyn System,
        dest_system: &dyn System,
        target: &TargetRelPath,
        actual: &ActualStateEntry,
        parent_rel: &SourceRelPath,
        options: &AddOptions,
    ) -> Result<SourceRelPath> {
        let name = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let suffix = self.encryption.encrypted_suffix();

        let (source_rel, contents) = match actual {
            ActualStateEntry::Dir { perm, .. } => {
                let mut attr = DirAttr::new(name);
                attr.exact = options.exact;
                attr.private = perm & 0o077 == 0;
                attr.readonly = perm & 0o222 == 0;
                (parent_rel.join_dir(attr.source_name()), None)
            }
            ActualStateEntry::File { perm, contents, .. } => {
                let kind = if options.create {
                    SourceFileKind::Create
                } else {
                    SourceFileKind::File
                };
                let mut attr = FileAttr::new(name, kind);
                attr.encrypted = options.encrypt;
                attr.executable = perm & 0o111 != 0;
                attr.private = perm & 0o077 == 0;
                attr.readonly = perm & 0o222 == 0;
                attr.empty = options.empty || contents.is_empty();
                attr.template = options.template;

                let contents = if attr.is_encrypted() {
                    self.encryption
                        .encrypt(contents)
                        .map_err(|source| Error::Encryption {
                            path: actual.path().to_path_buf(),
                            source,
                        })?
                } else {
                    contents.clone()
                };
                (parent_rel.join_file(attr.source_name(suffix)), Some(contents))
            }
            ActualStateEntry::Symlink { linkname, .. } => {
                let mut attr = FileAttr::new(name, SourceFileKind::Symlink);
                attr.template = options.template;
                let contents = format!("{linkname}\n").into_bytes();
                (parent_rel.join_file(attr.source_name(suffix)), Some(contents))
            }
            ActualStateEntry::Absent { path } => {
                return Err(Error::Add {
                    path: path.clone(),
                    reason: "does not exist".into(),
                })
            }
        };

        let abs = source_rel.to_abs(&self.source_dir);
        let old = self
            .root
            .get(target)
            .and_then(SourceStateEntry::source_rel_path)
            .filter(|old| **old != source_rel);
        if let Some(old) = old {
            let old_abs = old.to_abs(&self.source_dir);
            if old.is_dir() && source_rel.is_dir() {
                info!("rename {old} to {source_rel}");
                source_system.rename(&old_abs, &abs)?;
            } else {
                info!("replace {old} with {source_rel}");
                source_system.remove_all(&old_abs)?;
            }
        }

        match contents {
            None => {
                mkdir_all(source_system, &abs, 0o777)?;
                if dest_system.read_dir(actual.path())?.is_empty() {
                    source_system.write_file(&abs.join(KEEP_FILE), b"", 0o666)?;
                }
            }
            Some(contents) => {
                info!("add {target} as {source_rel}");
                source_system.write_file(&abs, &contents, 0o666)?;
            }
        }

        Ok(source_rel)
    }
}

fn entry_type(actual: &ActualStateEntry, options: &AddOptions) -> EntryTypeSet {
    match actual {
        ActualStateEntry::Absent { .. } => EntryTypeSet::NONE,
        ActualStateEntry::Dir { .. } => EntryTypeSet::DIRS,
        ActualStateEntry::File { .. } => {
            let mut bits = EntryTypeSet::FILES;
            if options.encrypt {
                bits = bits | EntryTypeSet::ENCRYPTED;
            }
            if options.template {
                bits = bits | EntryTypeSet::TEMPLATES;
            }
            bits
        }
        ActualStateEntry::Symlink { .. } => EntryTypeSet::SYMLINKS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        source::ReadOptions,
        state::{get_json, EntryState, MemoryState},
        system::RealSystem,
    };
    use pretty_assertions::assert_eq;
    use std::{fs, sync::Arc};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        source: TempDir,
        dest: TempDir,
        system: Arc<RealSystem>,
        state: MemoryState,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                source: TempDir::new().unwrap(),
                dest: TempDir::new().unwrap(),
                system: Arc::new(RealSystem::new()),
                state: MemoryState::new(),
            }
        }

        async fn source_state(&self) -> SourceState {
            let mut source =
                SourceState::new(self.system.clone(), self.source.path(), self.dest.path());
            source
                .read(&CancellationToken::new(), &ReadOptions::default())
                .await
                .unwrap();
            source
        }

        async fn add(&self, rel: &str, options: &AddOptions) -> Result<()> {
            let source = self.source_state().await;
            source.add(
                self.system.as_ref(),
                &self.state,
                self.system.as_ref(),
                &[self.dest.path().join(rel)],
                options,
            )
        }

        fn source_names(&self) -> Vec<String> {
            let mut names = Vec::new();
            collect_names(self.source.path(), self.source.path(), &mut names);
            names.sort();
            names
        }
    }

    fn collect_names(root: &Path, dir: &Path, names: &mut Vec<String>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            names.push(path.strip_prefix(root).unwrap().to_string_lossy().into_owned());
            if path.is_dir() {
                collect_names(root, &path, names);
            }
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn add_infers_attributes_and_parents() {
        use std::os::unix::fs::PermissionsExt;

        let fixture = Fixture::new();
        let bin = fixture.dest.path().join(".local/bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("tool"), "#!/bin/sh\n").unwrap();
        fs::set_permissions(bin.join("tool"), fs::Permissions::from_mode(0o755)).unwrap();

        fixture
            .add(".local/bin/tool", &AddOptions::default())
            .await
            .unwrap();

        assert_eq!(
            fixture.source_names(),
            vec!["dot_local", "dot_local/bin", "dot_local/bin/executable_tool"]
        );

        let recorded: Option<EntryState> = get_json(
            &fixture.state,
            Bucket::EntryState,
            &path_key(&bin.join("tool")),
        )
        .unwrap();
        assert!(recorded.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn add_symlink_and_empty_dir() {
        let fixture = Fixture::new();
        std::os::unix::fs::symlink("target", fixture.dest.path().join(".link")).unwrap();
        fs::create_dir(fixture.dest.path().join("empty")).unwrap();

        fixture.add(".link", &AddOptions::default()).await.unwrap();
        fixture.add("empty", &AddOptions::default()).await.unwrap();

        assert_eq!(
            fixture.source_names(),
            vec!["empty", "empty/.keep", "symlink_dot_link"]
        );
        assert_eq!(
            fs::read_to_string(fixture.source.path().join("symlink_dot_link")).unwrap(),
            "target\n"
        );
    }

    #[tokio::test]
    async fn add_replaces_old_source_name() {
        let fixture = Fixture::new();
        fs::write(fixture.dest.path().join(".vimrc"), "set nu\n").unwrap();
        fixture.add(".vimrc", &AddOptions::default()).await.unwrap();

        let options = AddOptions {
            template: true,
            ..Default::default()
        };
        fixture.add(".vimrc", &options).await.unwrap();

        assert_eq!(fixture.source_names(), vec!["dot_vimrc.tmpl"]);
    }

    #[tokio::test]
    async fn add_refuses_source_dir_paths() {
        let fixture = Fixture::new();
        let source = fixture.source_state().await;
        let result = source.add(
            fixture.system.as_ref(),
            &fixture.state,
            fixture.system.as_ref(),
            &[fixture.source.path().join("dot_x")],
            &AddOptions::default(),
        );
        assert!(matches!(result, Err(Error::Add { .. })), "{result:?}");
    }
}
