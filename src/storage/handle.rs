//! Vector handles
//!
//! A [`VectorHandle`] is resolved once from a [`Locator`] into one of two
//! variants and never re-inspects the locator afterwards.

use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::MutexGuard;

use tracing::debug;

use super::locator::Locator;
use super::persisted::{Access, PersistedStore, SyncReport};
use super::registry::{Registry, SharedStore};
use super::store::{Store, StoreError};

/// A reference to an open vector store
#[derive(Debug)]
pub enum VectorHandle {
    Persisted(PersistedStore),
    SharedMemory(SharedStore),
}

impl VectorHandle {
    /// Resolves a locator. Memory names are acquired, or created when absent.
    pub fn open(locator: &Locator, registry: &Registry, access: Access) -> Result<Self, StoreError> {
        let handle = match locator {
            Locator::Persisted(path) => VectorHandle::Persisted(PersistedStore::open(path, access)?),
            Locator::Memory { name, srs } => {
                VectorHandle::SharedMemory(registry.acquire_or_create(name, srs.clone()))
            }
        };
        debug!(%locator, "opened vector handle");
        Ok(handle)
    }

    /// Creates a new store. Memory names must not be registered yet.
    pub fn create(locator: &Locator, registry: &Registry) -> Result<Self, StoreError> {
        match locator {
            Locator::Persisted(path) => Ok(VectorHandle::Persisted(PersistedStore::create(
                path, None,
            )?)),
            Locator::Memory { name, srs } => Ok(VectorHandle::SharedMemory(
                registry.create(name, srs.clone())?,
            )),
        }
    }

    /// Creates a new persisted store with a spatial reference
    pub fn create_persisted(path: &Path, srs: Option<String>) -> Result<Self, StoreError> {
        Ok(VectorHandle::Persisted(PersistedStore::create(path, srs)?))
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, VectorHandle::SharedMemory(_))
    }

    pub fn is_writable(&self) -> bool {
        match self {
            VectorHandle::Persisted(p) => p.access() == Access::Update,
            VectorHandle::SharedMemory(_) => true,
        }
    }

    /// The locator this handle resolves to
    pub fn locator(&self) -> Locator {
        match self {
            VectorHandle::Persisted(p) => Locator::Persisted(p.path().to_path_buf()),
            VectorHandle::SharedMemory(s) => Locator::memory(s.name(), s.srs().map(str::to_string)),
        }
    }

    /// Borrows the underlying store
    pub fn store(&mut self) -> StoreGuard<'_> {
        match self {
            VectorHandle::Persisted(p) => StoreGuard::Owned(p.store_mut()),
            VectorHandle::SharedMemory(s) => StoreGuard::Shared(s.lock()),
        }
    }

    /// Flushes pending changes. Memory stores are always up to date.
    pub fn sync(&mut self) -> Result<SyncReport, StoreError> {
        match self {
            VectorHandle::Persisted(p) => p.sync(),
            VectorHandle::SharedMemory(_) => Ok(SyncReport::default()),
        }
    }

    /// Closes the handle, flushing writable persisted stores first.
    ///
    /// Memory handles are released back to `registry`.
    pub fn close(self, registry: &Registry) -> Result<(), StoreError> {
        match self {
            VectorHandle::Persisted(mut p) => {
                if p.access() == Access::Update && p.store().is_dirty() {
                    p.sync()?;
                }
                debug!(path = %p.path().display(), "closed persisted store");
                Ok(())
            }
            VectorHandle::SharedMemory(s) => {
                registry.release(s);
                Ok(())
            }
        }
    }
}

/// Access to a store borrowed from a handle
pub enum StoreGuard<'a> {
    Owned(&'a mut Store),
    Shared(MutexGuard<'a, Store>),
}

impl Deref for StoreGuard<'_> {
    type Target = Store;

    fn deref(&self) -> &Store {
        match self {
            StoreGuard::Owned(store) => store,
            StoreGuard::Shared(guard) => guard,
        }
    }
}

impl DerefMut for StoreGuard<'_> {
    fn deref_mut(&mut self) -> &mut Store {
        match self {
            StoreGuard::Owned(store) => store,
            StoreGuard::Shared(guard) => guard,
        }
    }
}
