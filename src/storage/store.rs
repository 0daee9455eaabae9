//! In-memory store: an addressable collection of layers

use std::path::PathBuf;

use thiserror::Error;

use crate::domain::{GeometryType, Layer};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Vector store not found: {0}")]
    NotFound(String),

    #[error("Vector store is unreadable: {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("Vector store already exists: {0}")]
    AlreadyExists(String),

    #[error("Layer not found: {0}")]
    LayerNotFound(String),

    #[error("Layer already exists: {0}")]
    LayerExists(String),

    #[error("Target is locked or read-only: {0}")]
    Locked(PathBuf),

    #[error("Vector store is open read-only: {0}")]
    ReadOnly(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn unreadable(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        StoreError::Unreadable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Selects a layer by position or by name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerSelector {
    Index(usize),
    Name(String),
}

impl From<usize> for LayerSelector {
    fn from(idx: usize) -> Self {
        LayerSelector::Index(idx)
    }
}

impl From<&str> for LayerSelector {
    fn from(name: &str) -> Self {
        LayerSelector::Name(name.to_string())
    }
}

impl std::fmt::Display for LayerSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerSelector::Index(idx) => write!(f, "#{}", idx),
            LayerSelector::Name(name) => f.write_str(name),
        }
    }
}

/// A collection of layers plus the spatial reference captured at creation
#[derive(Debug, Clone, Default)]
pub struct Store {
    srs: Option<String>,
    layers: Vec<Layer>,
}

impl Store {
    pub fn new(srs: Option<String>) -> Self {
        Self {
            srs,
            layers: Vec::new(),
        }
    }

    pub fn srs(&self) -> Option<&str> {
        self.srs.as_deref()
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Layer] {
        &mut self.layers
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, idx: usize) -> Option<&Layer> {
        self.layers.get(idx)
    }

    pub fn layer_mut(&mut self, idx: usize) -> Option<&mut Layer> {
        self.layers.get_mut(idx)
    }

    /// Resolves a selector to a layer position
    pub fn find(&self, selector: &LayerSelector) -> Option<usize> {
        match selector {
            LayerSelector::Index(idx) => (*idx < self.layers.len()).then_some(*idx),
            LayerSelector::Name(name) => self.layers.iter().position(|l| l.name() == name),
        }
    }

    /// Creates a new empty layer and returns its position
    pub fn create_layer(
        &mut self,
        name: &str,
        geometry_type: GeometryType,
        srs: Option<String>,
    ) -> Result<usize, StoreError> {
        if self.layers.iter().any(|l| l.name() == name) {
            return Err(StoreError::LayerExists(name.to_string()));
        }
        self.layers.push(Layer::new(name, geometry_type, srs));
        Ok(self.layers.len() - 1)
    }

    /// Appends an already built layer (used when loading and copying)
    pub fn push_layer(&mut self, layer: Layer) -> Result<usize, StoreError> {
        if self.layers.iter().any(|l| l.name() == layer.name()) {
            return Err(StoreError::LayerExists(layer.name().to_string()));
        }
        self.layers.push(layer);
        Ok(self.layers.len() - 1)
    }

    pub fn feature_count(&self) -> usize {
        self.layers.iter().map(Layer::feature_count).sum()
    }

    pub fn is_dirty(&self) -> bool {
        self.layers.iter().any(Layer::is_dirty)
    }
}
