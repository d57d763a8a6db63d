use core::{
    fmt::{Debug, Formatter, Result as FmtResult},
    sync::atomic::{AtomicBool, Ordering},
};
use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::Result;
use fs2::FileExt;

use crate::{DatabaseMode, Error, InMemoryMap};

const LOCK_FILE_NAME: &str = "LOCK";

// `flock` locks belong to open file descriptions, so a second `DirectoryLock` for the same
// directory fails even within one process. The kernel releases the lock if the process dies.
pub struct DirectoryLock {
    file: File,
}

impl DirectoryLock {
    pub fn acquire(directory: &Path, mode: DatabaseMode) -> Result<Self> {
        let path = directory.join(LOCK_FILE_NAME);

        let file = fs_err::OpenOptions::new()
            .create(!mode.is_read_only())
            .truncate(false)
            .read(true)
            .write(!mode.is_read_only())
            .open(&path)?
            .into_parts()
            .0;

        let locked = match mode {
            DatabaseMode::ReadOnly => FileExt::try_lock_shared(&file),
            DatabaseMode::ReadWrite => FileExt::try_lock_exclusive(&file),
        };

        if locked.is_err() {
            return Err(Error::LockHeld { location: path }.into());
        }

        Ok(Self { file })
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        // Closing the file would release the lock anyway.
        let _result = FileExt::unlock(&self.file);
    }
}

/// A reopenable in-memory storage location.
///
/// Clones refer to the same location. Data outlives [`Database`] handles opened at the location,
/// which makes restart cycles possible without touching the filesystem.
///
/// [`Database`]: crate::Database
#[derive(Clone, Default)]
pub struct InMemoryLocation(Arc<InMemoryShared>);

#[derive(Default)]
struct InMemoryShared {
    map: Mutex<InMemoryMap>,
    open: AtomicBool,
}

impl InMemoryLocation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.0.open.load(Ordering::Acquire)
    }

    pub(crate) fn lease(&self) -> Result<InMemoryLease> {
        let acquired = self
            .0
            .open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if !acquired {
            return Err(Error::LockHeld {
                location: PathBuf::from(":memory:"),
            }
            .into());
        }

        Ok(InMemoryLease {
            location: self.clone(),
        })
    }

    pub(crate) fn map(&self) -> &Mutex<InMemoryMap> {
        &self.0.map
    }
}

impl Debug for InMemoryLocation {
    fn fmt(&self, formatter: &mut Formatter) -> FmtResult {
        formatter
            .debug_struct("InMemoryLocation")
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

pub struct InMemoryLease {
    location: InMemoryLocation,
}

impl InMemoryLease {
    pub const fn location(&self) -> &InMemoryLocation {
        &self.location
    }
}

impl Drop for InMemoryLease {
    fn drop(&mut self) {
        self.location.0.open.store(false, Ordering::Release);
    }
}
