//! vecedit - A vector editing engine for georeferenced data
//!
//! Points, lines, polygons and annotations are edited through a strictly
//! nested session (vector, layer, feature) over either a file-backed store or
//! a named in-memory store shared between sessions. Drawing gestures edit a
//! scratch store and commit it to disk with a save/rollback protocol.

pub mod domain;
pub mod storage;
pub mod edit;
pub mod cli;

pub use domain::{Coord, Feature, FeatureId, Geometry, GeometryType, Layer};
pub use edit::{EditError, EditSession, ErrorKind, GestureKind, GestureRequest, Orchestrator};
pub use storage::{Locator, Registry, VectorHandle};
