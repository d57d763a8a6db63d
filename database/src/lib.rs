//! Key-addressed durable storage.
//!
//! [`Database`] has no knowledge of what it stores. Every write goes through a single atomic
//! batch commit, reads observe either all of a batch or none of it, and iterators read from the
//! snapshot that was current when they were created.

use core::ops::{Range, RangeFrom, RangeToInclusive};
use std::{
    borrow::Cow,
    path::{Path, PathBuf},
    sync::{Arc, MutexGuard},
};

use anyhow::{Context as _, Error as AnyhowError, Result};
use bytesize::ByteSize;
use im::OrdMap;
use itertools::Either;
use libmdbx::{DatabaseFlags, Environment, Geometry, WriteFlags};
use log::{debug, info};
use snap::raw::{Decoder, Encoder};
use tap::Pipe as _;
use thiserror::Error;
use unwrap_none::UnwrapNone as _;

pub use crate::lock::InMemoryLocation;

use crate::lock::{DirectoryLock, InMemoryLease};

mod lock;

const GROWTH_STEP: ByteSize = ByteSize::mib(256);
const MAX_NAMED_DATABASES: usize = 10;

/// Number of attempts made for an operation that keeps failing with transient faults.
pub const MAX_ATTEMPTS: usize = 3;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DatabaseMode {
    ReadOnly,
    ReadWrite,
}

impl DatabaseMode {
    #[must_use]
    pub const fn is_read_only(self) -> bool {
        matches!(self, Self::ReadOnly)
    }

    #[must_use]
    pub const fn mode_permissions(self) -> u16 {
        match self {
            // <https://erthink.github.io/libmdbx/group__c__opening.html#gabb7dd3b10dd31639ba252df545e11768>
            // The UNIX permissions to set on created files. Zero value means to open existing, but do not create.
            Self::ReadOnly => 0,
            Self::ReadWrite => 0o600,
        }
    }

    #[must_use]
    #[cfg(target_os = "linux")]
    pub fn permissions(self) -> u32 {
        self.mode_permissions().into()
    }

    #[must_use]
    #[cfg(not(target_os = "linux"))]
    pub const fn permissions(self) -> u16 {
        self.mode_permissions()
    }
}

/// Keys of one kind share a prefix so that they can be scanned together.
pub trait PrefixableKey {
    const PREFIX: &'static str;

    #[must_use]
    fn has_prefix(bytes: &[u8]) -> bool {
        bytes.starts_with(Self::PREFIX.as_bytes())
    }
}

/// Writes that are committed together or not at all.
///
/// Operations are applied in insertion order, so a later write to a key wins.
#[derive(Default, Debug)]
pub struct Batch {
    operations: Vec<Operation>,
}

#[derive(Debug)]
enum Operation {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

impl Batch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> &mut Self {
        self.operations.push(Operation::Put(
            key.as_ref().to_vec(),
            value.as_ref().to_vec(),
        ));

        self
    }

    pub fn delete(&mut self, key: impl AsRef<[u8]>) -> &mut Self {
        self.operations.push(Operation::Delete(key.as_ref().to_vec()));
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }
}

impl<K: AsRef<[u8]>, V: AsRef<[u8]>> Extend<(K, V)> for Batch {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, pairs: I) {
        for (key, value) in pairs {
            self.put(key, value);
        }
    }
}

pub struct Database(DatabaseKind);

impl Database {
    pub fn persistent(
        name: &str,
        directory: impl AsRef<Path>,
        max_size: ByteSize,
        mode: DatabaseMode,
    ) -> Result<Self> {
        let directory = directory.as_ref();

        if !mode.is_read_only() {
            fs_err::create_dir_all(directory)?;
        }

        // Take the lock before opening the environment.
        // A second environment for the same files must never exist.
        let lock = DirectoryLock::acquire(directory, mode)?;

        let environment = Environment::builder()
            .set_max_dbs(MAX_NAMED_DATABASES)
            .set_geometry(Geometry {
                size: Some(..usize::try_from(max_size.as_u64())?),
                growth_step: Some(isize::try_from(GROWTH_STEP.as_u64())?),
                shrink_threshold: None,
                page_size: None,
            })
            .open_with_permissions(directory, mode.permissions())
            .context(Error::StorageFault { operation: "open" })?;

        if !mode.is_read_only() {
            let transaction = environment.begin_rw_txn()?;
            transaction.create_db(Some(name), DatabaseFlags::default())?;
            transaction.commit()?;
        }

        info!(
            "opened database {name} in {} ({mode:?})",
            directory.display(),
        );

        Ok(Self(DatabaseKind::Persistent {
            database_name: name.to_owned(),
            environment,
            _lock: lock,
        }))
    }

    /// Opens a fresh in-memory database that nothing else refers to.
    #[must_use]
    pub fn in_memory() -> Self {
        let lease = InMemoryLocation::new()
            .lease()
            .expect("a newly created in-memory location cannot be open yet");

        Self(DatabaseKind::InMemory { lease })
    }

    /// Opens the database stored at `location`.
    ///
    /// Fails with [`Error::LockHeld`] if another handle for `location` is still alive.
    pub fn in_memory_at(location: &InMemoryLocation) -> Result<Self> {
        let lease = location.lease()?;
        Ok(Self(DatabaseKind::InMemory { lease }))
    }

    /// Releases the handle.
    ///
    /// Dropping has the same effect. This exists to make the point of release explicit.
    pub fn close(self) {
        debug!("closing database");
    }

    pub fn delete(&self, key: impl AsRef<[u8]>) -> Result<()> {
        let mut batch = Batch::new();
        batch.delete(key);
        self.commit(&batch)
    }

    /// Atomically deletes all of `keys`. Missing keys are ignored.
    pub fn delete_batch(&self, keys: impl IntoIterator<Item = impl AsRef<[u8]>>) -> Result<()> {
        let mut batch = Batch::new();

        for key in keys {
            batch.delete(key);
        }

        self.commit(&batch)
    }

    pub fn delete_range(&self, range: Range<impl AsRef<[u8]>>) -> Result<()> {
        let start = range.start.as_ref();
        let end = range.end.as_ref();

        with_retries("delete_range", || match self.kind() {
            DatabaseKind::Persistent {
                database_name,
                environment,
                ..
            } => {
                let transaction = environment.begin_rw_txn()?;
                let database = transaction.open_db(Some(database_name))?;

                let mut cursor = transaction.cursor(&database)?;

                let Some((mut key, ())) = cursor.set_range::<Cow<_>, _>(start)? else {
                    return Ok(());
                };

                while *key < *end {
                    cursor.del(WriteFlags::default())?;
                    match cursor.next::<Cow<_>, _>()? {
                        Some((new_key, ())) => key = new_key,
                        None => break,
                    }
                }

                transaction.commit()?;

                Ok(())
            }
            DatabaseKind::InMemory { lease } => {
                // Replace the whole map at once for consistency with `Database::commit`.
                let mut map = lock_map(lease);
                let mut new_map = map.clone();

                let end_pair = map.get_key_value(end);
                let (below, _) = new_map.split(start);
                let (_, above) = new_map.split(end);

                new_map = below.union(above);

                if let Some((key, value)) = end_pair {
                    new_map
                        .insert(Arc::clone(key), Arc::clone(value))
                        .expect_none("end_pair should have been discarded by OrdMap::split");
                }

                *map = new_map;

                Ok(())
            }
        })
    }

    pub fn contains_key(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        let key = key.as_ref();

        with_retries("contains_key", || match self.kind() {
            DatabaseKind::Persistent {
                database_name,
                environment,
                ..
            } => {
                let transaction = environment.begin_ro_txn()?;
                let database = transaction.open_db(Some(database_name))?;

                transaction
                    .get::<()>(database.dbi(), key)?
                    .is_some()
                    .pipe(Ok)
            }
            DatabaseKind::InMemory { lease } => Ok(lock_map(lease).contains_key(key)),
        })
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        let key = key.as_ref();

        with_retries("get", || {
            match self.kind() {
                DatabaseKind::Persistent {
                    database_name,
                    environment,
                    ..
                } => {
                    let transaction = environment.begin_ro_txn()?;
                    let database = transaction.open_db(Some(database_name))?;

                    transaction
                        .get::<Cow<_>>(database.dbi(), key)?
                        .map(|compressed| decompress(&compressed))
                }
                DatabaseKind::InMemory { lease } => lock_map(lease)
                    .get(key)
                    .map(|compressed| decompress(compressed)),
            }
            .transpose()
        })
    }

    #[expect(clippy::type_complexity)]
    pub fn iterator_ascending(
        &self,
        range: RangeFrom<impl AsRef<[u8]>>,
    ) -> Result<impl Iterator<Item = Result<(Cow<[u8]>, Vec<u8>)>>> {
        let start = range.start.as_ref();

        match self.kind() {
            DatabaseKind::Persistent {
                database_name,
                environment,
                ..
            } => {
                let transaction = environment.begin_ro_txn()?;
                let database = transaction.open_db(Some(database_name))?;

                let mut cursor = transaction.cursor(&database)?;

                cursor
                    .set_range(start)
                    .transpose()
                    .into_iter()
                    .chain(core::iter::from_fn(move || cursor.next().transpose()))
                    .map(|result| decompress_pair(result?))
                    .pipe(Either::Left)
            }
            DatabaseKind::InMemory { lease } => {
                let map = lock_map(lease);
                let start_pair = map.get_key_value(start);
                let (_, mut above) = map.split(start);

                if let Some((key, value)) = start_pair {
                    above
                        .insert(Arc::clone(key), Arc::clone(value))
                        .expect_none("start_pair should have been discarded by OrdMap::split");
                }

                above
                    .into_iter()
                    .map(|(key, value)| Ok((Cow::Owned(key.to_vec()), decompress(value.as_ref())?)))
                    .pipe(Either::Right)
            }
        }
        .pipe(Ok)
    }

    #[expect(clippy::type_complexity)]
    pub fn iterator_descending(
        &self,
        range: RangeToInclusive<impl AsRef<[u8]>>,
    ) -> Result<impl Iterator<Item = Result<(Cow<[u8]>, Vec<u8>)>>> {
        let end = range.end.as_ref();

        match self.kind() {
            DatabaseKind::Persistent {
                database_name,
                environment,
                ..
            } => {
                let transaction = environment.begin_ro_txn()?;
                let database = transaction.open_db(Some(database_name))?;

                let mut cursor = transaction.cursor(&database)?;

                // `set_range` positions the cursor at the first key not less than `end`.
                // Step back once if that key is past `end` or if there is no such key.
                let first = match cursor.set_range::<Cow<_>, Cow<_>>(end)? {
                    Some((key, value)) if *key == *end => Some(Ok((key, value))),
                    Some(_) => cursor.prev().transpose(),
                    None => cursor.last().transpose(),
                };

                first
                    .into_iter()
                    .chain(core::iter::from_fn(move || cursor.prev().transpose()))
                    .map(|result| decompress_pair(result?))
                    .pipe(Either::Left)
            }
            DatabaseKind::InMemory { lease } => {
                let map = lock_map(lease);
                let end_pair = map.get_key_value(end);
                let (mut below, _) = map.split(end);

                if let Some((key, value)) = end_pair {
                    below
                        .insert(Arc::clone(key), Arc::clone(value))
                        .expect_none("end_pair should have been discarded by OrdMap::split");
                }

                below
                    .into_iter()
                    .rev()
                    .map(|(key, value)| Ok((Cow::Owned(key.to_vec()), decompress(value.as_ref())?)))
                    .pipe(Either::Right)
            }
        }
        .pipe(Ok)
    }

    /// Iterates over all pairs whose keys start with `prefix` in ascending key order.
    ///
    /// The iterator reads from the snapshot current at the time of the call.
    /// Calling this again restarts the scan from a new snapshot.
    #[expect(clippy::type_complexity)]
    pub fn iterator_prefix(
        &self,
        prefix: impl AsRef<[u8]>,
    ) -> Result<impl Iterator<Item = Result<(Cow<[u8]>, Vec<u8>)>>> {
        let prefix = prefix.as_ref().to_vec();

        let iterator = self
            .iterator_ascending(prefix.clone()..)
            .context(Error::StorageFault { operation: "scan" })?;

        iterator
            .take_while(move |result| match result {
                Ok((key, _)) => key.starts_with(&prefix),
                Err(_) => true,
            })
            .pipe(Ok)
    }

    pub fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        self.put_batch(core::iter::once((key, value)))
    }

    pub fn put_batch(
        &self,
        pairs: impl IntoIterator<Item = (impl AsRef<[u8]>, impl AsRef<[u8]>)>,
    ) -> Result<()> {
        let mut batch = Batch::new();
        batch.extend(pairs);
        self.commit(&batch)
    }

    /// Commits all operations in `batch` atomically.
    ///
    /// The changes are visible to reads started after this returns `Ok`.
    /// If this returns an error, none of the changes are visible.
    pub fn commit(&self, batch: &Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        with_retries("commit", || match self.kind() {
            DatabaseKind::Persistent {
                database_name,
                environment,
                ..
            } => {
                let transaction = environment.begin_rw_txn()?;
                let database = transaction.open_db(Some(database_name))?;

                for operation in &batch.operations {
                    match operation {
                        Operation::Put(key, value) => {
                            let compressed = compress(value)?;
                            transaction.put(
                                database.dbi(),
                                key,
                                compressed,
                                WriteFlags::default(),
                            )?;
                        }
                        Operation::Delete(key) => {
                            transaction.del(database.dbi(), key, None)?;
                        }
                    }
                }

                transaction.commit()?;

                Ok(())
            }
            DatabaseKind::InMemory { lease } => {
                let mut map = lock_map(lease);
                let mut new_map = map.clone();

                for operation in &batch.operations {
                    match operation {
                        Operation::Put(key, value) => {
                            let key = key.as_slice().into();
                            let compressed = compress(value)?.into();
                            new_map.insert(key, compressed);
                        }
                        Operation::Delete(key) => {
                            new_map.remove(key.as_slice());
                        }
                    }
                }

                *map = new_map;

                Ok(())
            }
        })
    }

    /// Returns the first key-value pair whose key is less than or equal to `key`.
    ///
    /// Behaves like [`im::OrdMap::get_prev`].
    ///
    /// [`im::OrdMap::get_prev`]: https://docs.rs/im/15.1.0/im/ordmap/struct.OrdMap.html#method.get_prev
    pub fn prev(&self, key: impl AsRef<[u8]>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.iterator_descending(..=key.as_ref())?
            .next()
            .transpose()?
            .map(|(key, value)| (key.into_owned(), value))
            .pipe(Ok)
    }

    /// Returns the first key-value pair whose key is greater than or equal to `key`.
    ///
    /// Behaves like [`im::OrdMap::get_next`].
    ///
    /// [`im::OrdMap::get_next`]: https://docs.rs/im/15.1.0/im/ordmap/struct.OrdMap.html#method.get_next
    pub fn next(&self, key: impl AsRef<[u8]>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.iterator_ascending(key.as_ref()..)?
            .next()
            .transpose()?
            .map(|(key, value)| (key.into_owned(), value))
            .pipe(Ok)
    }

    const fn kind(&self) -> &DatabaseKind {
        &self.0
    }
}

// Fields are dropped in declaration order, so the environment is closed before the lock is released.
enum DatabaseKind {
    Persistent {
        database_name: String,
        environment: Environment,
        _lock: DirectoryLock,
    },
    InMemory {
        lease: InMemoryLease,
    },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage fault during {operation}")]
    StorageFault { operation: &'static str },
    #[error("storage location is already open: {location:?}")]
    LockHeld { location: PathBuf },
}

// Various methods of `OrdMap` and `Database` clone the elements of the map,
// so they should be cheaply cloneable. This disqualifies `Vec<u8>` and `Box<[u8]>`.
type InMemoryMap = OrdMap<Arc<[u8]>, Arc<[u8]>>;

fn lock_map(lease: &InMemoryLease) -> MutexGuard<'_, InMemoryMap> {
    lease
        .location()
        .map()
        .lock()
        .expect("in-memory database mutex is poisoned")
}

fn with_retries<T>(operation: &'static str, attempt: impl FnMut() -> Result<T>) -> Result<T> {
    retry_transient(operation, MAX_ATTEMPTS, is_transient, attempt)
}

fn retry_transient<T>(
    operation: &'static str,
    max_attempts: usize,
    is_transient: impl Fn(&AnyhowError) -> bool,
    mut attempt: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempts = 0;

    loop {
        attempts += 1;

        match attempt() {
            Ok(value) => return Ok(value),
            Err(error) if attempts < max_attempts && is_transient(&error) => {
                debug!("retrying {operation} after transient fault (attempt {attempts}): {error}");
            }
            Err(error) => return Err(error.context(Error::StorageFault { operation })),
        }
    }
}

fn is_transient(error: &AnyhowError) -> bool {
    matches!(
        error.downcast_ref::<libmdbx::Error>(),
        Some(libmdbx::Error::Busy),
    )
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    Encoder::new().compress_vec(data).map_err(Into::into)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    Decoder::new().decompress_vec(data).map_err(Into::into)
}

fn decompress_pair<K>((key, compressed_value): (K, Cow<[u8]>)) -> Result<(K, Vec<u8>)> {
    let value = decompress(&compressed_value)?;
    Ok((key, value))
}
