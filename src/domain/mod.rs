//! Domain models for vecedit
//!
//! Geometry, field schema, features and layers, without any I/O concerns.

mod feature;
mod field;
mod geometry;
mod layer;

pub use feature::{Feature, FeatureId};
pub use field::{
    normalize_name, FieldDefn, FieldError, FieldNamePolicy, FieldType, FieldValue, Schema,
    DEFAULT_TEXT_LEN, MAX_FIELD_NAME_LEN,
};
pub(crate) use geometry::resolve_index;
pub use geometry::{
    ring_is_closed, signed_area2, winding, Coord, Extent, Geometry, GeometryError,
    GeometryPolicy, GeometryType, Winding,
};
pub use layer::Layer;
