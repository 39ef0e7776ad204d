// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use super::{copy_to, Bucket, Error, MemoryState, PersistentState, Result, Transaction};

use std::sync::Arc;
use tracing::debug;

/// Persistent state that refuses every write.
pub struct ReadOnlyState {
    inner: Arc<dyn PersistentState>,
}

impl ReadOnlyState {
    pub fn new(inner: Arc<dyn PersistentState>) -> Self {
        Self { inner }
    }
}

struct ReadOnlyTransaction<'a> {
    inner: &'a dyn PersistentState,
}

impl Transaction for ReadOnlyTransaction<'_> {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(bucket, key)
    }

    fn set(&mut self, bucket: Bucket, _: &[u8], _: &[u8]) -> Result<()> {
        Err(Error::ReadOnly(bucket))
    }

    fn delete(&mut self, bucket: Bucket, _: &[u8]) -> Result<()> {
        Err(Error::ReadOnly(bucket))
    }
}

impl PersistentState for ReadOnlyState {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(bucket, key)
    }

    fn set(&self, bucket: Bucket, _: &[u8], _: &[u8]) -> Result<()> {
        Err(Error::ReadOnly(bucket))
    }

    fn delete(&self, bucket: Bucket, _: &[u8]) -> Result<()> {
        Err(Error::ReadOnly(bucket))
    }

    fn delete_bucket(&self, bucket: Bucket) -> Result<()> {
        Err(Error::ReadOnly(bucket))
    }

    fn for_each(
        &self,
        bucket: Bucket,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        self.inner.for_each(bucket, visit)
    }

    fn transaction(&self, body: &mut dyn FnMut(&mut dyn Transaction) -> Result<()>) -> Result<()> {
        body(&mut ReadOnlyTransaction {
            inner: self.inner.as_ref(),
        })
    }
}

/// Persistent state whose writes land in a private in-memory copy.
///
/// The copy is taken when the dry-run state is constructed, so reads see
/// everything the base had plus whatever this run would have written. The
/// base is never modified.
pub struct DryRunState {
    scratch: MemoryState,
}

impl DryRunState {
    /// Snapshot `base` into a fresh scratch store.
    ///
    /// # Errors
    ///
    /// - Return [`Error`] if `base` cannot be read.
    pub fn new(base: &dyn PersistentState) -> Result<Self> {
        let scratch = MemoryState::new();
        copy_to(base, &scratch)?;
        Ok(Self { scratch })
    }
}

impl PersistentState for DryRunState {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.scratch.get(bucket, key)
    }

    fn set(&self, bucket: Bucket, key: &[u8], value: &[u8]) -> Result<()> {
        self.scratch.set(bucket, key, value)
    }

    fn delete(&self, bucket: Bucket, key: &[u8]) -> Result<()> {
        self.scratch.delete(bucket, key)
    }

    fn delete_bucket(&self, bucket: Bucket) -> Result<()> {
        self.scratch.delete_bucket(bucket)
    }

    fn for_each(
        &self,
        bucket: Bucket,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        self.scratch.for_each(bucket, visit)
    }

    fn transaction(&self, body: &mut dyn FnMut(&mut dyn Transaction) -> Result<()>) -> Result<()> {
        self.scratch.transaction(body)
    }
}

/// Persistent state that logs every call before forwarding it.
pub struct DebugState {
    inner: Arc<dyn PersistentState>,
}

impl DebugState {
    pub fn new(inner: Arc<dyn PersistentState>) -> Self {
        Self { inner }
    }
}

fn outcome<T>(result: &Result<T>) -> String {
    match result {
        Ok(_) => "ok".into(),
        Err(error) => error.to_string(),
    }
}

impl PersistentState for DebugState {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let result = self.inner.get(bucket, key);
        debug!(
            %bucket,
            key = %String::from_utf8_lossy(key),
            found = matches!(result, Ok(Some(_))),
            outcome = outcome(&result),
            "state get"
        );
        result
    }

    fn set(&self, bucket: Bucket, key: &[u8], value: &[u8]) -> Result<()> {
        let result = self.inner.set(bucket, key, value);
        debug!(
            %bucket,
            key = %String::from_utf8_lossy(key),
            value = %String::from_utf8_lossy(value),
            outcome = outcome(&result),
            "state set"
        );
        result
    }

    fn delete(&self, bucket: Bucket, key: &[u8]) -> Result<()> {
        let result = self.inner.delete(bucket, key);
        debug!(
            %bucket,
            key = %String::from_utf8_lossy(key),
            outcome = outcome(&result),
            "state delete"
        );
        result
    }

    fn delete_bucket(&self, bucket: Bucket) -> Result<()> {
        let result = self.inner.delete_bucket(bucket);
        debug!(%bucket, outcome = outcome(&result), "state delete bucket");
        result
    }

    fn for_each(
        &self,
        bucket: Bucket,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        let result = self.inner.for_each(bucket, visit);
        debug!(%bucket, outcome = outcome(&result), "state for each");
        result
    }

    fn transaction(&self, body: &mut dyn FnMut(&mut dyn Transaction) -> Result<()>) -> Result<()> {
        let result = self.inner.transaction(body);
        debug!(outcome = outcome(&result), "state transaction");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn seeded() -> Arc<MemoryState> {
        let base = Arc::new(MemoryState::new());
        base.set(Bucket::EntryState, b"a", b"1").unwrap();
        base
    }

    #[test]
    fn read_only_refuses_writes() {
        let base = seeded();
        let state = ReadOnlyState::new(base.clone());
        assert_eq!(state.get(Bucket::EntryState, b"a").unwrap(), Some(b"1".to_vec()));
        assert!(matches!(
            state.set(Bucket::EntryState, b"b", b"2"),
            Err(Error::ReadOnly(Bucket::EntryState))
        ));
        assert!(state.delete_bucket(Bucket::EntryState).is_err());
        assert!(state
            .transaction(&mut |txn| txn.delete(Bucket::EntryState, b"a"))
            .is_err());
        assert_eq!(base.get(Bucket::EntryState, b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn dry_run_never_touches_base() {
        let base = seeded();
        let state = DryRunState::new(base.as_ref()).unwrap();
        state.set(Bucket::EntryState, b"b", b"2").unwrap();
        state.delete(Bucket::EntryState, b"a").unwrap();

        assert_eq!(state.get(Bucket::EntryState, b"a").unwrap(), None);
        assert_eq!(state.get(Bucket::EntryState, b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(base.get(Bucket::EntryState, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(base.get(Bucket::EntryState, b"b").unwrap(), None);
    }

    #[test]
    fn debug_forwards() {
        let base = seeded();
        let state = DebugState::new(base.clone());
        state.set(Bucket::ScriptState, b"k", b"v").unwrap();
        assert_eq!(base.get(Bucket::ScriptState, b"k").unwrap(), Some(b"v".to_vec()));
    }
}
