// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT


use chezmoi::{
    apply::{ApplyOptions, ApplyReport},
    error::Result,
    source::{ReadOptions, SourceState},
    state::{PersistentState, RedbState},
    system::{RealSystem, System},
};

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Throwaway home directory holding a source directory, a destination
/// directory, and a persistent state file.
pub(crate) struct Home {
    root: TempDir,
    pub(crate) system: Arc<RealSystem>,
}

impl Home {
    pub(crate) fn new() -> Self {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("source")).unwrap();
        fs::create_dir_all(root.path().join("dest")).unwrap();

        Self {
            root,
            system: Arc::new(RealSystem::new()),
        }
    }

    pub(crate) fn source_dir(&self) -> PathBuf {
        self.root.path().join("source")
    }

    pub(crate) fn dest_dir(&self) -> PathBuf {
        self.root.path().join("dest")
    }

    pub(crate) fn state_file(&self) -> PathBuf {
        self.root.path().join("chezmoistate.boltdb")
    }

    pub(crate) fn source(&self, rel: &str) -> PathBuf {
        self.source_dir().join(rel)
    }

    pub(crate) fn dest(&self, rel: &str) -> PathBuf {
        self.dest_dir().join(rel)
    }

    pub(crate) fn write_source(&self, rel: &str, contents: &str) -> &Self {
        write(&self.source(rel), contents);
        self
    }

    pub(crate) fn write_dest(&self, rel: &str, contents: &str) -> &Self {
        write(&self.dest(rel), contents);
        self
    }

    pub(crate) fn read_dest(&self, rel: &str) -> String {
        fs::read_to_string(self.dest(rel)).unwrap()
    }

    pub(crate) fn open_state(&self) -> RedbState {
        RedbState::open(self.state_file()).unwrap()
    }

    pub(crate) fn source_state(&self) -> SourceState {
        SourceState::new(self.system.clone(), self.source_dir(), self.dest_dir())
    }

    pub(crate) async fn read(&self) -> SourceState {
        let mut source = self.source_state();
        source
            .read(&CancellationToken::new(), &ReadOptions::default())
            .await
            .unwrap();
        source
    }

    pub(crate) fn apply(
        &self,
        source: &SourceState,
        target_system: &dyn System,
        state: &dyn PersistentState,
        options: &mut ApplyOptions<'_>,
    ) -> Result<ApplyReport> {
        source.apply_all(
            target_system,
            self.system.as_ref(),
            state,
            &source.target_rel_paths(),
            options,
            false,
        )
    }
}

fn write(path: &Path, contents: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}
