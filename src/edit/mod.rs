//! # Editing Engine
//!
//! [`EditSession`] is the state machine every mutation passes through.
//! [`Orchestrator`] builds one feature at a time on top of it and owns the
//! save/rollback protocol.
//!
//! ## Failure Model
//!
//! - Wrong-state calls panic: they are bugs in the caller
//! - Data problems return [`EditError`]; [`EditError::kind`] classifies them
//! - A failed operation leaves the session as it was before the call

mod error;
mod options;
mod orchestrator;
mod services;
mod session;

pub use error::{EditError, EditResult, ErrorKind};
pub use options::{EditOptions, RepackPolicy, WindingPolicy};
pub use orchestrator::{
    describe, GestureKind, GestureRequest, Orchestrator, PointRemoval, ANNOTATION_FIELD,
};
pub use services::{
    CategoryStyles, CoordinateTransform, ElementMetadata, IdentityTransform, MetadataSink,
    RecordingSink, Services, StyleCatalog, TracingSink,
};
pub use session::{DeleteOutcome, EditSession, FeatureClose, LayerInfo, SessionState};
