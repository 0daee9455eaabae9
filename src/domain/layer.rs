//! Layer model
//!
//! A layer is a homogeneous collection of features sharing one geometry type,
//! one spatial reference and one field schema.

use std::collections::BTreeMap;

use super::feature::{Feature, FeatureId};
use super::field::{FieldDefn, FieldError, FieldNamePolicy, FieldValue, Schema};
use super::geometry::{Extent, GeometryType};

#[derive(Debug, Clone)]
pub struct Layer {
    name: String,
    geometry_type: GeometryType,
    srs: Option<String>,
    schema: Schema,
    features: BTreeMap<FeatureId, Feature>,
    next_fid: u64,
    /// Bumped whenever a feature is added or removed, or ids are renumbered
    generation: u64,
    /// Bumped only by [`Layer::repack`]
    repack_epoch: u64,
    nonconformant_winding: bool,
    dirty: bool,
}

impl Layer {
    pub fn new(name: impl Into<String>, geometry_type: GeometryType, srs: Option<String>) -> Self {
        Self {
            name: name.into(),
            geometry_type,
            srs,
            schema: Schema::new(),
            features: BTreeMap::new(),
            next_fid: 0,
            generation: 0,
            repack_epoch: 0,
            nonconformant_winding: false,
            // Not yet persisted anywhere
            dirty: true,
        }
    }

    /// Creates an empty layer with the same definition (name, type, srs, schema)
    pub fn empty_like(other: &Layer) -> Self {
        let mut layer = Self::new(other.name.clone(), other.geometry_type, other.srs.clone());
        layer.schema = other.schema.clone();
        layer.nonconformant_winding = other.nonconformant_winding;
        layer
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn geometry_type(&self) -> GeometryType {
        self.geometry_type
    }

    pub fn srs(&self) -> Option<&str> {
        self.srs.as_deref()
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Restores a schema read from storage
    pub fn set_schema(&mut self, schema: Schema) {
        self.schema = schema;
    }

    pub fn feature_count(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn repack_epoch(&self) -> u64 {
        self.repack_epoch
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn nonconformant_winding(&self) -> bool {
        self.nonconformant_winding
    }

    pub fn set_nonconformant_winding(&mut self, value: bool) {
        if self.nonconformant_winding != value {
            self.nonconformant_winding = value;
            self.dirty = true;
        }
    }

    /// Adds a field; existing features get a null value for it
    pub fn add_field(&mut self, defn: FieldDefn, policy: FieldNamePolicy) -> Result<String, FieldError> {
        let name = self.schema.add(defn, policy)?;
        for feature in self.features.values_mut() {
            feature.values.push(FieldValue::Null);
        }
        self.dirty = true;
        Ok(name)
    }

    pub fn get(&self, fid: FeatureId) -> Option<&Feature> {
        self.features.get(&fid)
    }

    pub fn contains(&self, fid: FeatureId) -> bool {
        self.features.contains_key(&fid)
    }

    pub fn features(&self) -> impl Iterator<Item = &Feature> {
        self.features.values()
    }

    /// Feature ids in ascending order
    pub fn ids(&self) -> Vec<FeatureId> {
        self.features.keys().copied().collect()
    }

    /// Allocates a new empty feature and returns its id
    pub fn allocate(&mut self) -> FeatureId {
        let fid = FeatureId::new(self.next_fid);
        self.next_fid += 1;
        self.features
            .insert(fid, Feature::empty(fid, self.schema.len()));
        self.generation += 1;
        self.dirty = true;
        fid
    }

    /// Inserts a feature under its own id (used when loading from storage)
    pub fn insert(&mut self, feature: Feature) {
        self.next_fid = self.next_fid.max(feature.fid.value() + 1);
        self.features.insert(feature.fid, feature);
        self.generation += 1;
        self.dirty = true;
    }

    /// Appends a copy of `feature` under a freshly allocated id
    pub fn append(&mut self, mut feature: Feature) -> FeatureId {
        let fid = FeatureId::new(self.next_fid);
        feature.fid = fid;
        self.insert(feature);
        fid
    }

    /// Replaces an existing feature. Returns false if the id is unknown.
    pub fn update(&mut self, feature: Feature) -> bool {
        match self.features.get_mut(&feature.fid) {
            Some(slot) => {
                *slot = feature;
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, fid: FeatureId) -> Option<Feature> {
        let removed = self.features.remove(&fid);
        if removed.is_some() {
            self.generation += 1;
            self.dirty = true;
        }
        removed
    }

    /// Returns true if ids are not the dense range `0..feature_count`
    pub fn has_gaps(&self) -> bool {
        self.features
            .keys()
            .enumerate()
            .any(|(row, fid)| fid.value() != row as u64)
            || self.next_fid != self.features.len() as u64
    }

    /// Renumbers features densely in ascending id order.
    ///
    /// Returns the `(old, new)` pairs of every id that changed.
    pub fn repack(&mut self) -> Vec<(FeatureId, FeatureId)> {
        let old = std::mem::take(&mut self.features);
        let mut moved = Vec::new();

        for (row, (old_fid, mut feature)) in old.into_iter().enumerate() {
            let new_fid = FeatureId::new(row as u64);
            if new_fid != old_fid {
                moved.push((old_fid, new_fid));
            }
            feature.fid = new_fid;
            self.features.insert(new_fid, feature);
        }

        self.next_fid = self.features.len() as u64;
        self.generation += 1;
        self.repack_epoch += 1;
        if !moved.is_empty() {
            self.dirty = true;
        }
        moved
    }

    pub fn extent(&self) -> Option<Extent> {
        self.features
            .values()
            .filter_map(|f| f.geometry.as_ref().and_then(|g| g.extent()))
            .fold(None, |acc, e| Extent::union(acc, Some(e)))
    }
}
