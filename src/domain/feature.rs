//! Features and feature identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::field::FieldValue;
use super::geometry::Geometry;

/// Feature identifier, unique within a layer.
///
/// Stable once assigned. Only a repack renumbers identifiers, after which
/// freed values may be handed out again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureId(u64);

impl FeatureId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FeatureId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(FeatureId)
    }
}

impl From<u64> for FeatureId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// One record of a layer: optional geometry plus one value per schema field
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub fid: FeatureId,
    pub geometry: Option<Geometry>,
    /// Values in schema order
    pub values: Vec<FieldValue>,
}

impl Feature {
    /// Creates an empty feature with `field_count` null values
    pub fn empty(fid: FeatureId, field_count: usize) -> Self {
        Self {
            fid,
            geometry: None,
            values: vec![FieldValue::Null; field_count],
        }
    }

    pub fn point_count(&self) -> usize {
        self.geometry.as_ref().map_or(0, Geometry::point_count)
    }
}
