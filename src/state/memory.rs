// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use super::{Bucket, PersistentState, Result, Transaction};

use std::{
    collections::BTreeMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

type Buckets = BTreeMap<Bucket, BTreeMap<Vec<u8>, Vec<u8>>>;

/// Persistent state that lives and dies with the process.
#[derive(Debug, Default)]
pub struct MemoryState {
    buckets: RwLock<Buckets>,
}

impl MemoryState {
    /// Construct new empty memory state.
    pub fn new() -> Self {
        Self::default()
    }

    // INVARIANT: A panic while holding the lock cannot leave a bucket half
    // written, so a poisoned lock still guards consistent data.
    fn read(&self) -> RwLockReadGuard<'_, Buckets> {
        self.buckets.read().unwrap_or_else(|poison| poison.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Buckets> {
        self.buckets.write().unwrap_or_else(|poison| poison.into_inner())
    }
}

struct MemoryTransaction<'a> {
    buckets: &'a mut Buckets,
}

impl Transaction for MemoryTransaction<'_> {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .buckets
            .get(&bucket)
            .and_then(|values| values.get(key))
            .cloned())
    }

    fn set(&mut self, bucket: Bucket, key: &[u8], value: &[u8]) -> Result<()> {
        self.buckets
            .entry(bucket)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, bucket: Bucket, key: &[u8]) -> Result<()> {
        if let Some(values) = self.buckets.get_mut(&bucket) {
            values.remove(key);
        }
        Ok(())
    }
}

impl PersistentState for MemoryState {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .read()
            .get(&bucket)
            .and_then(|values| values.get(key))
            .cloned())
    }

    fn set(&self, bucket: Bucket, key: &[u8], value: &[u8]) -> Result<()> {
        let mut guard = self.write();
        MemoryTransaction {
            buckets: &mut guard,
        }
        .set(bucket, key, value)
    }

    fn delete(&self, bucket: Bucket, key: &[u8]) -> Result<()> {
        let mut guard = self.write();
        MemoryTransaction {
            buckets: &mut guard,
        }
        .delete(bucket, key)
    }

    fn delete_bucket(&self, bucket: Bucket) -> Result<()> {
        self.write().remove(&bucket);
        Ok(())
    }

    fn for_each(
        &self,
        bucket: Bucket,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        // INVARIANT: Snapshot first so the visitor may write to this state.
        let values = self.read().get(&bucket).cloned().unwrap_or_default();
        for (key, value) in &values {
            visit(key, value)?;
        }

        Ok(())
    }

    fn transaction(&self, body: &mut dyn FnMut(&mut dyn Transaction) -> Result<()>) -> Result<()> {
        let mut guard = self.write();
        let mut scratch = guard.clone();
        body(&mut MemoryTransaction {
            buckets: &mut scratch,
        })?;
        *guard = scratch;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Error;
    use pretty_assertions::assert_eq;

    #[test]
    fn get_set_delete() {
        let state = MemoryState::new();
        assert_eq!(state.get(Bucket::EntryState, b"k").unwrap(), None);
        state.set(Bucket::EntryState, b"k", b"v").unwrap();
        assert_eq!(state.get(Bucket::EntryState, b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(state.get(Bucket::ScriptState, b"k").unwrap(), None);
        state.delete(Bucket::EntryState, b"k").unwrap();
        state.delete(Bucket::EntryState, b"k").unwrap();
        assert_eq!(state.get(Bucket::EntryState, b"k").unwrap(), None);
    }

    #[test]
    fn for_each_in_key_order() {
        let state = MemoryState::new();
        for key in ["b", "a", "c"] {
            state.set(Bucket::EntryState, key.as_bytes(), b"").unwrap();
        }
        let mut keys = Vec::new();
        state
            .for_each(Bucket::EntryState, &mut |key, _| {
                keys.push(String::from_utf8_lossy(key).into_owned());
                Ok(())
            })
            .unwrap();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn failed_transaction_keeps_nothing() {
        let state = MemoryState::new();
        let result = state.transaction(&mut |txn| {
            txn.set(Bucket::EntryState, b"k", b"v")?;
            Err(Error::ReadOnly(Bucket::EntryState))
        });
        assert!(result.is_err());
        assert_eq!(state.get(Bucket::EntryState, b"k").unwrap(), None);

        state
            .transaction(&mut |txn| {
                txn.set(Bucket::EntryState, b"k", b"v")?;
                assert_eq!(txn.get(Bucket::EntryState, b"k")?, Some(b"v".to_vec()));
                Ok(())
            })
            .unwrap();
        assert_eq!(state.get(Bucket::EntryState, b"k").unwrap(), Some(b"v".to_vec()));
    }
}
