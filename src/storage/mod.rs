//! # Storage Layer
//!
//! Vector stores and the handles used to reach them.
//!
//! ## Store Kinds
//!
//! | Kind | Locator | Backing |
//! |------|---------|---------|
//! | Persisted | `/path/to/file.vec` | JSON manifest + JSONL rows sidecars |
//! | Shared memory | `mem:<name>[:<srs>]` | [`Registry`] entry shared by every handle |
//!
//! ## Sharing Model
//!
//! - A memory store name maps to at most one live [`Store`]
//! - Handles to the same name observe each other's changes immediately
//! - The store is freed when its last [`SharedStore`] handle is released
//!
//! ## Concurrency Safety
//!
//! - [`PersistedStore`] opened for update holds an exclusive `fs2` lock on
//!   its manifest
//! - Rows files are written atomically (temp file + rename)
//!
//! ## Key Types
//!
//! - [`VectorHandle`] - Open store, either persisted or shared memory
//! - [`Registry`] - Named in-memory stores with shared ownership
//! - [`PersistedStore`] - File-backed store and its sidecars
//! - [`Config`] - User configuration

mod config;
mod handle;
mod locator;
mod persisted;
mod registry;
mod store;

pub use config::{Config, ConfigError, EditingConfig, OutputConfig, OutputFormat, CONFIG_ENV};
pub use handle::{StoreGuard, VectorHandle};
pub use locator::{Locator, LocatorError};
pub use persisted::{prj_path, rows_path, Access, PersistedStore, SyncReport, FORMAT_VERSION};
pub use registry::{Registry, SharedStore};
pub use store::{LayerSelector, Store, StoreError};
