//! Editing errors
//!
//! Every recoverable failure maps onto an [`ErrorKind`]. Wrong-state calls
//! are not represented here: they panic.

use thiserror::Error;

use crate::domain::{FeatureId, FieldError, GeometryError, GeometryType};
use crate::storage::{LocatorError, StoreError};

/// Coarse classification callers use to decide how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    TypeMismatch,
    GeometryInvalid,
    TargetLocked,
    IoFailure,
    /// Reported by a collaborator such as the transform service
    External,
}

#[derive(Debug, Error)]
pub enum EditError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Locator(#[from] LocatorError),

    #[error(transparent)]
    Field(#[from] FieldError),

    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error("Feature not found: {0}")]
    FeatureNotFound(FeatureId),

    #[error("Coordinate transform failed: {0}")]
    Transform(String),

    #[error("Layer '{layer}' holds {found} geometries, cannot draw {expected}")]
    GestureMismatch {
        layer: String,
        expected: GeometryType,
        found: GeometryType,
    },
}

impl EditError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EditError::Store(e) => match e {
                StoreError::NotFound(_) | StoreError::LayerNotFound(_) => ErrorKind::NotFound,
                StoreError::AlreadyExists(_) | StoreError::LayerExists(_) => {
                    ErrorKind::AlreadyExists
                }
                StoreError::Locked(_) | StoreError::ReadOnly(_) => ErrorKind::TargetLocked,
                StoreError::Unreadable { .. } | StoreError::Io { .. } => ErrorKind::IoFailure,
            },
            EditError::Locator(_) => ErrorKind::NotFound,
            EditError::Field(e) => match e {
                FieldError::Duplicate(_) => ErrorKind::AlreadyExists,
                FieldError::Unknown(_) => ErrorKind::NotFound,
                _ => ErrorKind::TypeMismatch,
            },
            EditError::Geometry(_) => ErrorKind::GeometryInvalid,
            EditError::FeatureNotFound(_) => ErrorKind::NotFound,
            EditError::Transform(_) => ErrorKind::External,
            EditError::GestureMismatch { .. } => ErrorKind::GeometryInvalid,
        }
    }
}

pub type EditResult<T> = Result<T, EditError>;
