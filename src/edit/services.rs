//! Collaborators the orchestrator calls into
//!
//! Rendering styles, reprojection and the element property tree live outside
//! the engine. Each one is a trait so hosts can plug in their own; the crate
//! ships small implementations used by the CLI and the tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::info;

use super::error::{EditError, EditResult};
use crate::domain::{Coord, Extent};
use crate::storage::Config;

/// Looks up the rendering style for a layer category
pub trait StyleCatalog {
    fn style_for(&self, category: &str) -> Option<String>;
}

/// Reprojects coordinates between spatial references
pub trait CoordinateTransform {
    fn transform(&self, coord: Coord, src: &str, dst: &str) -> EditResult<Coord>;
}

/// Receives element properties after a save or an init
pub trait MetadataSink {
    fn publish(&self, metadata: &ElementMetadata);
}

/// Properties of a saved or initialised vector element
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementMetadata {
    pub name: String,
    pub path: PathBuf,
    pub srs: Option<String>,
    pub layer_count: usize,
    pub feature_count: usize,
    pub extent: Option<Extent>,
    pub style: Option<String>,
}

/// Style table keyed by category name
#[derive(Debug, Clone, Default)]
pub struct CategoryStyles {
    styles: HashMap<String, String>,
}

impl CategoryStyles {
    pub fn new(styles: HashMap<String, String>) -> Self {
        Self { styles }
    }
}

impl StyleCatalog for CategoryStyles {
    fn style_for(&self, category: &str) -> Option<String> {
        self.styles.get(category).cloned()
    }
}

/// Accepts coordinates that are already in the destination reference.
///
/// Spatial references are compared ignoring case and surrounding whitespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransform;

impl CoordinateTransform for IdentityTransform {
    fn transform(&self, coord: Coord, src: &str, dst: &str) -> EditResult<Coord> {
        if src.trim().eq_ignore_ascii_case(dst.trim()) {
            Ok(coord)
        } else {
            Err(EditError::Transform(format!(
                "no transform available from {} to {}",
                src, dst
            )))
        }
    }
}

/// Logs published metadata
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MetadataSink for TracingSink {
    fn publish(&self, metadata: &ElementMetadata) {
        info!(
            name = %metadata.name,
            path = %metadata.path.display(),
            layers = metadata.layer_count,
            features = metadata.feature_count,
            "element metadata updated"
        );
    }
}

/// Keeps every published record; clones share the same list
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    records: Arc<Mutex<Vec<ElementMetadata>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ElementMetadata> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn last(&self) -> Option<ElementMetadata> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .last()
            .cloned()
    }
}

impl MetadataSink for RecordingSink {
    fn publish(&self, metadata: &ElementMetadata) {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(metadata.clone());
    }
}

/// The collaborators an orchestrator works with
pub struct Services {
    pub styles: Box<dyn StyleCatalog>,
    pub transform: Box<dyn CoordinateTransform>,
    pub metadata: Box<dyn MetadataSink>,
}

impl Services {
    /// Styles from the config's `[styles]` table, identity transform,
    /// metadata logged through `tracing`
    pub fn from_config(config: &Config) -> Self {
        Self {
            styles: Box::new(CategoryStyles::new(config.styles.clone())),
            transform: Box::new(IdentityTransform),
            metadata: Box::new(TracingSink),
        }
    }

    pub fn with_metadata(mut self, sink: impl MetadataSink + 'static) -> Self {
        self.metadata = Box::new(sink);
        self
    }

    pub fn with_transform(mut self, transform: impl CoordinateTransform + 'static) -> Self {
        self.transform = Box::new(transform);
        self
    }
}

impl Default for Services {
    fn default() -> Self {
        Self {
            styles: Box::new(CategoryStyles::default()),
            transform: Box::new(IdentityTransform),
            metadata: Box::new(TracingSink),
        }
    }
}
