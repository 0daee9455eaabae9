//! Process-wide registry of named in-memory stores
//!
//! Every name maps to at most one live [`Store`]. Handles are
//! [`SharedStore`] values holding a strong reference; the registry itself only
//! keeps a weak one, so the store is freed when the last handle is released
//! and its entry disappears with it.
//!
//! Tests construct a private [`Registry`]; the application uses
//! [`Registry::global`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use tracing::debug;

use super::store::{Store, StoreError};

#[derive(Default)]
struct RegistryInner {
    entries: Mutex<HashMap<String, Weak<SharedCell>>>,
    scratch_counter: AtomicU64,
}

impl RegistryInner {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Weak<SharedCell>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The registered store plus its identity
struct SharedCell {
    name: String,
    srs: Option<String>,
    store: Mutex<Store>,
    registry: Weak<RegistryInner>,
}

impl Drop for SharedCell {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut entries = registry.entries();
        // A newer store may already be registered under this name
        if entries
            .get(&self.name)
            .is_some_and(|weak| weak.strong_count() == 0)
        {
            entries.remove(&self.name);
            debug!(name = %self.name, "released shared store");
        }
    }
}

/// Table of named in-memory stores
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Creates an empty, private registry
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-lifetime default registry
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Registry::new)
    }

    /// Returns a new handle to the store registered under `name`, if any
    pub fn acquire(&self, name: &str) -> Option<SharedStore> {
        let cell = self.inner.entries().get(name).and_then(Weak::upgrade)?;
        debug!(name, refs = Arc::strong_count(&cell), "acquired shared store");
        Some(SharedStore { cell })
    }

    /// Registers a new empty store under `name`
    pub fn create(&self, name: &str, srs: Option<String>) -> Result<SharedStore, StoreError> {
        let mut entries = self.inner.entries();
        if entries
            .get(name)
            .is_some_and(|weak| weak.strong_count() > 0)
        {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }

        let cell = Arc::new(SharedCell {
            name: name.to_string(),
            store: Mutex::new(Store::new(srs.clone())),
            srs,
            registry: Arc::downgrade(&self.inner),
        });
        entries.insert(name.to_string(), Arc::downgrade(&cell));
        debug!(name, "created shared store");

        Ok(SharedStore { cell })
    }

    /// Acquires `name`, creating it with `srs` when absent. The spatial
    /// reference only matters on creation.
    pub fn acquire_or_create(&self, name: &str, srs: Option<String>) -> SharedStore {
        loop {
            if let Some(store) = self.acquire(name) {
                return store;
            }
            if let Ok(store) = self.create(name, srs.clone()) {
                return store;
            }
        }
    }

    /// Binds a second handle to the same underlying store.
    ///
    /// Identity is checked before the name: a handle whose name is registered
    /// to a different live store indicates a logic error and panics.
    pub fn retain(&self, store: &SharedStore) -> SharedStore {
        let registered = self.inner.entries().get(store.name()).and_then(Weak::upgrade);
        match registered {
            Some(registered) if Arc::ptr_eq(&registered, &store.cell) => {}
            Some(_) => panic!(
                "shared store '{}' is registered to a different store instance",
                store.name()
            ),
            None => {
                self.inner
                    .entries()
                    .insert(store.name().to_string(), Arc::downgrade(&store.cell));
            }
        }

        let retained = SharedStore {
            cell: Arc::clone(&store.cell),
        };
        debug!(name = store.name(), refs = retained.ref_count(), "retained shared store");
        retained
    }

    /// Releases a handle. The store is freed when this was the last one.
    pub fn release(&self, store: SharedStore) {
        debug!(name = store.name(), refs = store.ref_count() - 1, "releasing shared store handle");
        drop(store);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .entries()
            .get(name)
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    /// Number of live handles for `name` (0 if not registered)
    pub fn ref_count(&self, name: &str) -> usize {
        self.inner
            .entries()
            .get(name)
            .map_or(0, Weak::strong_count)
    }

    /// Number of live stores
    pub fn len(&self) -> usize {
        self.inner
            .entries()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Generates a store name not currently registered, from a counter that
    /// only ever increases for the registry's lifetime
    pub fn unique_name(&self, prefix: &str) -> String {
        loop {
            let n = self.inner.scratch_counter.fetch_add(1, Ordering::Relaxed) + 1;
            let name = format!("{}{}", prefix, n);
            if !self.contains(&name) {
                return name;
            }
        }
    }
}

/// Handle to a registered in-memory store.
///
/// Not `Clone`: additional handles come from [`Registry::retain`] or
/// [`Registry::acquire`].
pub struct SharedStore {
    cell: Arc<SharedCell>,
}

impl SharedStore {
    pub fn name(&self) -> &str {
        &self.cell.name
    }

    /// Spatial reference captured when the store was created
    pub fn srs(&self) -> Option<&str> {
        self.cell.srs.as_deref()
    }

    /// Locks the store for reading or mutation
    pub fn lock(&self) -> MutexGuard<'_, Store> {
        self.cell.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live handles to this store
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.cell)
    }

    /// Returns true if both handles refer to the same store instance
    pub fn same_store(&self, other: &SharedStore) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore")
            .field("name", &self.cell.name)
            .field("refs", &self.ref_count())
            .finish()
    }
}
