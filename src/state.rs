// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Persistent state.
//!
//! Chezmoi remembers what it last wrote to every destination path, which
//! scripts it already ran, and a few other bits of bookkeeping. All of it
//! lives in a small transactional key/value store split into named
//! [`Bucket`]s. Values are JSON documents.
//!
//! # Backends
//!
//! The [`PersistentState`] trait is the only thing the engine sees. It is
//! backed by:
//!
//! - [`RedbState`]: an embedded B-tree file on disk.
//! - [`MemoryState`]: an in-memory map.
//! - [`ReadOnlyState`], [`DryRunState`], [`DebugState`]: wrappers that
//!   refuse writes, divert writes into memory, or log every call.
//!
//! # Entry state
//!
//! The [`EntryState`] record is the heart of conflict detection. It is
//! written right after a destination path is successfully updated, and read
//! before the next update to tell "the user edited this file" apart from
//! "this file always differed and apply is expected to change it".

mod layered;
mod memory;
mod redb_store;

pub use layered::{DebugState, DryRunState, ReadOnlyState};
pub use memory::MemoryState;
pub use redb_store::RedbState;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
};

/// Named partition of the persistent state.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bucket {
    /// Hash of the last config template used to generate the config file.
    ConfigState,

    /// [`EntryState`] keyed by absolute destination path.
    EntryState,

    /// [`RunState`] of git-repo externals keyed by absolute destination path.
    GitRepoExternalState,

    /// [`RunState`] keyed by SHA-256 of script contents.
    ScriptState,
}

impl Bucket {
    pub const ALL: [Bucket; 4] = [
        Self::ConfigState,
        Self::EntryState,
        Self::GitRepoExternalState,
        Self::ScriptState,
    ];

    /// Name of bucket inside the store.
    pub fn name(self) -> &'static str {
        match self {
            Self::ConfigState => "configState",
            Self::EntryState => "entryState",
            Self::GitRepoExternalState => "gitRepoExternalState",
            Self::ScriptState => "scriptState",
        }
    }
}

impl Display for Bucket {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.name())
    }
}

impl FromStr for Bucket {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|bucket| bucket.name() == name)
            .ok_or_else(|| Error::UnknownBucket(name.to_string()))
    }
}

/// Mutable view of the store inside [`PersistentState::transaction`].
pub trait Transaction {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn set(&mut self, bucket: Bucket, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&mut self, bucket: Bucket, key: &[u8]) -> Result<()>;
}

/// Transactional bucketed key/value store.
pub trait PersistentState: Send + Sync {
    /// Read value, `None` when missing.
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Insert or replace value.
    fn set(&self, bucket: Bucket, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove value. Removing a missing key is not an error.
    fn delete(&self, bucket: Bucket, key: &[u8]) -> Result<()>;

    /// Remove every value of bucket.
    fn delete_bucket(&self, bucket: Bucket) -> Result<()>;

    /// Visit every key/value pair of bucket in key order.
    fn for_each(
        &self,
        bucket: Bucket,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()>;

    /// Run `body` atomically. Nothing is kept if it returns an error.
    fn transaction(&self, body: &mut dyn FnMut(&mut dyn Transaction) -> Result<()>) -> Result<()>;
}

/// Copy every bucket of `from` into `to`.
///
/// # Errors
///
/// - Return [`Error`] if either side fails.
pub fn copy_to(from: &dyn PersistentState, to: &dyn PersistentState) -> Result<()> {
    for bucket in Bucket::ALL {
        from.for_each(bucket, &mut |key, value| to.set(bucket, key, value))?;
    }

    Ok(())
}

/// Read and decode JSON value.
///
/// # Errors
///
/// - Return [`Error::Decode`] if stored value is not valid JSON for `T`.
pub fn get_json<T: DeserializeOwned>(
    state: &dyn PersistentState,
    bucket: Bucket,
    key: &[u8],
) -> Result<Option<T>> {
    let Some(data) = state.get(bucket, key)? else {
        return Ok(None);
    };

    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|source| Error::Decode {
            bucket,
            key: String::from_utf8_lossy(key).into_owned(),
            source,
        })
}

/// Encode and store JSON value.
///
/// # Errors
///
/// - Return [`Error::Encode`] if value cannot be serialized.
pub fn set_json<T: Serialize>(
    state: &dyn PersistentState,
    bucket: Bucket,
    key: &[u8],
    value: &T,
) -> Result<()> {
    state.set(bucket, key, &encode_json(bucket, value)?)
}

/// Encode and store JSON value inside a transaction.
///
/// # Errors
///
/// - Return [`Error::Encode`] if value cannot be serialized.
pub fn put_json<T: Serialize>(
    tx: &mut dyn Transaction,
    bucket: Bucket,
    key: &[u8],
    value: &T,
) -> Result<()> {
    tx.set(bucket, key, &encode_json(bucket, value)?)
}

fn encode_json<T: Serialize>(bucket: Bucket, value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|source| Error::Encode { bucket, source })
}

/// Key of an absolute destination path.
pub fn path_key(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

/// Lowercase hex SHA-256 of data.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Kind of destination entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStateKind {
    Dir,
    File,
    Symlink,
    Remove,
    Script,
}

/// Durable record of a destination path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryState {
    #[serde(rename = "type")]
    pub kind: EntryStateKind,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub mode: u32,

    #[serde(
        rename = "contentsSHA256",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub contents_sha256: Option<String>,

    /// The entry replaces whatever is there without asking.
    #[serde(skip)]
    pub overwrite: bool,
}

fn is_zero(mode: &u32) -> bool {
    *mode == 0
}

impl EntryState {
    pub fn new(kind: EntryStateKind, mode: u32, contents: Option<&[u8]>) -> Self {
        Self {
            kind,
            mode,
            contents_sha256: contents.map(sha256_hex),
            overwrite: false,
        }
    }

    pub fn remove() -> Self {
        Self::new(EntryStateKind::Remove, 0, None)
    }

    /// Compare type, mode, and contents hash.
    pub fn same_as(&self, other: &EntryState) -> bool {
        self.kind == other.kind
            && self.mode == other.mode
            && self.contents_sha256 == other.contents_sha256
    }

    /// Compare possibly missing states, where missing counts as removed.
    pub fn equivalent(a: Option<&EntryState>, b: Option<&EntryState>) -> bool {
        match (a, b) {
            (None, None) => true,
            (Some(state), None) | (None, Some(state)) => state.kind == EntryStateKind::Remove,
            (Some(a), Some(b)) => a.same_as(b),
        }
    }
}

/// When something keyed by name was last run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub name: String,

    #[serde(rename = "runAt")]
    pub run_at: DateTime<Utc>,
}

/// Hash of the config template the config file was generated from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigState {
    #[serde(rename = "configTemplateContentsSHA256")]
    pub config_template_contents_sha256: String,
}

/// Persistent state error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// State file cannot be opened.
    #[error("failed to open persistent state at {:?}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: redb::DatabaseError,
    },

    /// Directory of state file cannot be created.
    #[error("failed to create directory {:?}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Underlying database failed.
    #[error(transparent)]
    Database(#[from] redb::Error),

    /// Value cannot be serialized.
    #[error("failed to encode {bucket} value")]
    Encode {
        bucket: Bucket,
        #[source]
        source: serde_json::Error,
    },

    /// Stored value cannot be deserialized.
    #[error("failed to decode {bucket} value at {key:?}")]
    Decode {
        bucket: Bucket,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Write attempted through a read-only state.
    #[error("cannot modify {0} of read-only persistent state")]
    ReadOnly(Bucket),

    /// Bucket name not recognized.
    #[error("unknown bucket {0:?}")]
    UnknownBucket(String),
}

/// Friendly result alias :3
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn entry_state_json_layout() {
        let state = EntryState::new(EntryStateKind::File, 0o644, Some(b"X"));
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(
            json,
            r#"{"type":"file","mode":420,"contentsSHA256":"4b68ab3847feda7d6c62c1fbcbeebfa35eab7351ed5e78f4ddadea5df64b8015"}"#
        );

        let decoded: EntryState = serde_json::from_str(r#"{"type":"remove"}"#).unwrap();
        assert_eq!(decoded, EntryState::remove());
    }

    #[test]
    fn missing_is_equivalent_to_remove() {
        let remove = EntryState::remove();
        let file = EntryState::new(EntryStateKind::File, 0o644, Some(b""));
        assert!(EntryState::equivalent(None, None));
        assert!(EntryState::equivalent(Some(&remove), None));
        assert!(EntryState::equivalent(None, Some(&remove)));
        assert!(!EntryState::equivalent(Some(&file), None));
        assert!(!EntryState::equivalent(
            Some(&file),
            Some(&EntryState::new(EntryStateKind::File, 0o600, Some(b"")))
        ));
    }

    #[test]
    fn equivalence_ignores_overwrite() {
        let a = EntryState::new(EntryStateKind::Dir, 0o755, None);
        let b = EntryState {
            overwrite: true,
            ..a.clone()
        };
        assert!(EntryState::equivalent(Some(&a), Some(&b)));
    }

    #[test]
    fn bucket_names_round_trip() {
        for bucket in Bucket::ALL {
            assert_eq!(bucket.name().parse::<Bucket>().unwrap(), bucket);
        }
        assert!("nope".parse::<Bucket>().is_err());
    }

    #[test]
    fn json_helpers() {
        let state = MemoryState::new();
        let run = RunState {
            name: "setup.sh".into(),
            run_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        };
        set_json(&state, Bucket::ScriptState, b"abc", &run).unwrap();
        let result: Option<RunState> = get_json(&state, Bucket::ScriptState, b"abc").unwrap();
        assert_eq!(result, Some(run));

        let missing: Option<RunState> = get_json(&state, Bucket::ScriptState, b"def").unwrap();
        assert_eq!(missing, None);

        state.set(Bucket::ScriptState, b"bad", b"not json").unwrap();
        let bad: Result<Option<RunState>> = get_json(&state, Bucket::ScriptState, b"bad");
        assert!(matches!(bad, Err(Error::Decode { .. })));
    }
}
