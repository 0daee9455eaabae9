//! Tunables shared by edit sessions and orchestrators

use serde::{Deserialize, Serialize};

use crate::domain::FieldNamePolicy;

/// What to do with polygons whose exterior ring is counter-clockwise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindingPolicy {
    /// Reverse rings on commit so exteriors are clockwise
    #[default]
    Reverse,
    /// Keep input order and flag the layer as nonconformant
    MarkNonconformant,
}

/// When file-backed layers renumber their features after deletions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepackPolicy {
    /// Before rows are written to disk
    #[default]
    OnSync,
    /// Right after every deletion
    Eager,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EditOptions {
    pub field_names: FieldNamePolicy,
    pub winding: WindingPolicy,
    pub repack: RepackPolicy,
    /// Tolerance used for ring closure and coordinate comparison
    pub epsilon: f64,
}

impl Default for EditOptions {
    fn default() -> Self {
        Self {
            field_names: FieldNamePolicy::Truncate,
            winding: WindingPolicy::Reverse,
            repack: RepackPolicy::OnSync,
            epsilon: 1e-9,
        }
    }
}
