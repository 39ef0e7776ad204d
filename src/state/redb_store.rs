// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use super::{Bucket, Error, PersistentState, Result, Transaction};

use redb::{Database, ReadableTable, TableDefinition, TableError, WriteTransaction};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::debug;

type Table = TableDefinition<'static, &'static [u8], &'static [u8]>;

fn table(bucket: Bucket) -> Table {
    TableDefinition::new(bucket.name())
}

fn db_err(err: impl Into<redb::Error>) -> Error {
    Error::Database(err.into())
}

/// Persistent state stored in an embedded B-tree file.
///
/// Each [`Bucket`] maps onto its own table. Tables are created lazily on
/// first write, so reading a bucket that was never written yields nothing.
pub struct RedbState {
    db: Database,
    path: PathBuf,
}

impl RedbState {
    /// Open state file at `path`, creating it and its parent directory if
    /// needed.
    ///
    /// # Errors
    ///
    /// - Return [`Error::CreateDir`] if parent directory cannot be created.
    /// - Return [`Error::Open`] if database cannot be opened or created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| Error::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        debug!("open persistent state at {:?}", path.display());
        let db = Database::create(&path).map_err(|source| Error::Open {
            path: path.clone(),
            source,
        })?;

        Ok(Self { db, path })
    }

    /// Location of state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write<T>(&self, body: impl FnOnce(&WriteTransaction) -> Result<T>) -> Result<T> {
        let txn = self.db.begin_write().map_err(db_err)?;
        let value = body(&txn)?;
        txn.commit().map_err(db_err)?;
        Ok(value)
    }
}

struct RedbTransaction<'a> {
    txn: &'a WriteTransaction,
}

impl Transaction for RedbTransaction<'_> {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let table = self.txn.open_table(table(bucket)).map_err(db_err)?;
        let value = table.get(key).map_err(db_err)?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn set(&mut self, bucket: Bucket, key: &[u8], value: &[u8]) -> Result<()> {
        let mut table = self.txn.open_table(table(bucket)).map_err(db_err)?;
        table.insert(key, value).map_err(db_err)?;
        Ok(())
    }

    fn delete(&mut self, bucket: Bucket, key: &[u8]) -> Result<()> {
        let mut table = self.txn.open_table(table(bucket)).map_err(db_err)?;
        table.remove(key).map_err(db_err)?;
        Ok(())
    }
}

impl PersistentState for RedbState {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = match txn.open_table(table(bucket)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(db_err(err)),
        };

        let value = table.get(key).map_err(db_err)?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn set(&self, bucket: Bucket, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(|txn| RedbTransaction { txn }.set(bucket, key, value))
    }

    fn delete(&self, bucket: Bucket, key: &[u8]) -> Result<()> {
        self.write(|txn| RedbTransaction { txn }.delete(bucket, key))
    }

    fn delete_bucket(&self, bucket: Bucket) -> Result<()> {
        self.write(|txn| txn.delete_table(table(bucket)).map(|_| ()).map_err(db_err))
    }

    fn for_each(
        &self,
        bucket: Bucket,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = match txn.open_table(table(bucket)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(err) => return Err(db_err(err)),
        };

        for item in table.iter().map_err(db_err)? {
            let (key, value) = item.map_err(db_err)?;
            visit(key.value(), value.value())?;
        }

        Ok(())
    }

    fn transaction(&self, body: &mut dyn FnMut(&mut dyn Transaction) -> Result<()>) -> Result<()> {
        self.write(|txn| body(&mut RedbTransaction { txn }))
    }
}
