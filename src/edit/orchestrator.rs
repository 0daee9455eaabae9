//! Gesture orchestration and the save protocol
//!
//! An [`Orchestrator`] drives one drawing gesture at a time. Each gesture
//! edits a fresh scratch memory store; [`Orchestrator::save`] replaces a
//! persisted file with the scratch content, and [`Orchestrator::cancel`]
//! throws it away.
//!
//! ## Save protocol
//!
//! 1. Close the open feature and layer, keeping the scratch vector open
//! 2. Check that an existing target can be replaced (`TargetLocked` otherwise)
//! 3. Delete the target and its sidecars
//! 4. Copy every layer and feature into a new persisted store at the target
//! 5. Publish the new element metadata and release the scratch store
//!
//! A failure in steps 2-5 keeps the scratch store and reopens the gesture
//! layer, so the save can be retried elsewhere.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::error::{EditError, EditResult};
use super::options::EditOptions;
use super::services::{ElementMetadata, Services};
use super::session::{EditSession, FeatureClose, SessionState};
use crate::domain::{Coord, Extent, FeatureId, FieldDefn, GeometryType, Layer, DEFAULT_TEXT_LEN};
use crate::storage::{Access, Locator, PersistedStore, Registry, Store, StoreError};

/// Field holding the text of annotation features
pub const ANNOTATION_FIELD: &str = "text";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GestureKind {
    Point,
    Line,
    Polygon,
    /// A point carrying a text field
    Annotation,
}

impl GestureKind {
    pub fn geometry_type(&self) -> GeometryType {
        match self {
            GestureKind::Point | GestureKind::Annotation => GeometryType::Point,
            GestureKind::Line => GeometryType::Line,
            GestureKind::Polygon => GeometryType::Polygon,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GestureKind::Point => "point",
            GestureKind::Line => "line",
            GestureKind::Polygon => "polygon",
            GestureKind::Annotation => "annotation",
        }
    }

    /// True when a feature is complete after its first point
    pub fn single_point(&self) -> bool {
        self.geometry_type().policy().single_point_closes
    }
}

impl fmt::Display for GestureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GestureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "point" => Ok(GestureKind::Point),
            "line" => Ok(GestureKind::Line),
            "polygon" => Ok(GestureKind::Polygon),
            "annotation" => Ok(GestureKind::Annotation),
            _ => Err(format!("Unknown gesture kind: {}", s)),
        }
    }
}

/// What the caller wants to draw
#[derive(Debug, Clone, PartialEq)]
pub struct GestureRequest {
    pub kind: GestureKind,
    /// Target layer name
    pub layer: String,
    /// Spatial reference of a newly created layer
    pub srs: String,
    /// Spatial reference of incoming coordinates, when it differs from the layer's
    pub source_srs: Option<String>,
    /// Style category; defaults to the layer name
    pub category: Option<String>,
}

impl GestureRequest {
    pub fn new(kind: GestureKind, layer: impl Into<String>, srs: impl Into<String>) -> Self {
        Self {
            kind,
            layer: layer.into(),
            srs: srs.into(),
            source_srs: None,
            category: None,
        }
    }

    pub fn with_source_srs(mut self, srs: impl Into<String>) -> Self {
        self.source_srs = Some(srs.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

/// Result of [`Orchestrator::delete_last_point`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointRemoval {
    /// A point was removed; the feature has `remaining` points left
    Removed { remaining: usize },
    /// The feature lost its last point and was deleted
    FeatureDeleted,
    /// The deleted feature was the layer's last, so the gesture ended
    GestureEnded,
    Nothing,
}

struct Gesture {
    request: GestureRequest,
    scratch: String,
    /// Spatial reference of the gesture layer
    target_srs: String,
    style: Option<String>,
    drawn: Vec<FeatureId>,
}

/// Drives drawing gestures and commits them to persisted stores
pub struct Orchestrator {
    registry: Registry,
    services: Services,
    session: EditSession,
    gesture: Option<Gesture>,
}

impl Orchestrator {
    pub fn new(registry: Registry, options: EditOptions, services: Services) -> Self {
        let session = EditSession::new(registry.clone(), options);
        Self {
            registry,
            services,
            session,
            gesture: None,
        }
    }

    pub fn session(&self) -> &EditSession {
        &self.session
    }

    /// Direct access to the session, e.g. to set fields on the open feature
    pub fn session_mut(&mut self) -> &mut EditSession {
        &mut self.session
    }

    pub fn is_active(&self) -> bool {
        self.gesture.is_some()
    }

    pub fn scratch_name(&self) -> Option<&str> {
        self.gesture.as_ref().map(|g| g.scratch.as_str())
    }

    pub fn request(&self) -> Option<&GestureRequest> {
        self.gesture.as_ref().map(|g| &g.request)
    }

    pub fn style(&self) -> Option<&str> {
        self.gesture.as_ref().and_then(|g| g.style.as_deref())
    }

    /// Features committed during the current gesture
    pub fn drawn(&self) -> &[FeatureId] {
        match &self.gesture {
            Some(gesture) => &gesture.drawn,
            None => &[],
        }
    }

    #[track_caller]
    fn active(&self, op: &str) -> &Gesture {
        match &self.gesture {
            Some(gesture) => gesture,
            None => panic!("{} called with no gesture in progress", op),
        }
    }

    /// Starts a gesture on a fresh scratch store and returns its name
    #[track_caller]
    pub fn begin(&mut self, request: GestureRequest) -> EditResult<String> {
        self.start(request, None)
    }

    /// Starts a gesture whose scratch store is seeded with the content of an
    /// existing persisted store
    #[track_caller]
    pub fn begin_from(&mut self, path: &Path, request: GestureRequest) -> EditResult<String> {
        self.start(request, Some(path))
    }

    #[track_caller]
    fn start(&mut self, request: GestureRequest, seed: Option<&Path>) -> EditResult<String> {
        if let Some(current) = &self.gesture {
            panic!("begin called while gesture on {} is in progress", current.scratch);
        }

        let scratch = self.registry.unique_name("scratch");
        let locator = Locator::memory(scratch.clone(), Some(request.srs.clone()));
        self.session.create_vector(&locator, None)?;

        let target_srs = match self.prepare_scratch(&request, seed) {
            Ok(srs) => srs,
            Err(e) => {
                self.session.discard_feature();
                if let Err(close) = self.session.close_vector() {
                    warn!(error = %close, "failed to release scratch store");
                }
                return Err(e);
            }
        };

        let category = request.category.as_deref().unwrap_or(&request.layer);
        let style = self.services.styles.style_for(category);

        debug!(%scratch, kind = %request.kind, layer = %request.layer, "gesture started");
        self.gesture = Some(Gesture {
            request,
            scratch: scratch.clone(),
            target_srs,
            style,
            drawn: Vec::new(),
        });
        Ok(scratch)
    }

    /// Seeds and opens the gesture layer; returns its spatial reference
    fn prepare_scratch(&mut self, request: &GestureRequest, seed: Option<&Path>) -> EditResult<String> {
        if let Some(path) = seed {
            let source = PersistedStore::open(path, Access::ReadOnly)?;
            let mut scratch = self.session.store();
            for layer in source.store().layers() {
                scratch.push_layer(layer.clone())?;
            }
            debug!(path = %path.display(), layers = scratch.layer_count(), "scratch store seeded");
        }

        let wanted = request.kind.geometry_type();
        let info = self
            .session
            .open_layer(request.layer.as_str(), Some(&request.srs), Some(wanted))?;

        if info.geometry_type != wanted {
            return Err(EditError::GestureMismatch {
                layer: info.name,
                expected: wanted,
                found: info.geometry_type,
            });
        }

        if request.kind == GestureKind::Annotation
            && !info
                .fields
                .iter()
                .any(|f| f.name.eq_ignore_ascii_case(ANNOTATION_FIELD))
        {
            self.session
                .create_field(FieldDefn::text(ANNOTATION_FIELD, DEFAULT_TEXT_LEN))?;
        }

        Ok(info.srs.unwrap_or_else(|| request.srs.clone()))
    }

    /// Reprojects a world coordinate into the gesture layer's reference
    fn project(&self, coord: Coord) -> EditResult<Coord> {
        let gesture = self.active("add_point");
        match &gesture.request.source_srs {
            Some(src) => self
                .services
                .transform
                .transform(coord, src, &gesture.target_srs),
            None => Ok(coord),
        }
    }

    /// Adds a point to the feature being drawn, opening one if needed.
    ///
    /// Single-point kinds commit right away and return the new feature id.
    #[track_caller]
    pub fn add_point(&mut self, world: Coord) -> EditResult<Option<FeatureId>> {
        let kind = self.active("add_point").request.kind;
        let coord = self.project(world)?;

        let opened = self.session.state() == SessionState::LayerOpen;
        if opened {
            self.session.open_feature(None)?;
        }

        if let Err(e) = self.session.add_point(-1, coord) {
            if opened {
                self.session.discard_feature();
            }
            return Err(e);
        }

        if kind.single_point() {
            return self.commit_feature().map_err(|e| {
                self.session.discard_feature();
                e
            });
        }
        Ok(None)
    }

    /// Places an annotation and returns its feature id
    #[track_caller]
    pub fn add_annotation(&mut self, world: Coord, text: &str) -> EditResult<FeatureId> {
        let kind = self.active("add_annotation").request.kind;
        if kind != GestureKind::Annotation {
            panic!("add_annotation called during a {} gesture", kind);
        }
        let coord = self.project(world)?;

        let fid = self.session.open_feature(None)?;
        let staged = self
            .session
            .set_field(ANNOTATION_FIELD, text)
            .and_then(|_| self.session.add_point(-1, coord));
        if let Err(e) = staged {
            self.session.discard_feature();
            return Err(e);
        }

        match self.commit_feature() {
            Ok(Some(fid)) => Ok(fid),
            Ok(None) => Err(EditError::FeatureNotFound(fid)),
            Err(e) => {
                self.session.discard_feature();
                Err(e)
            }
        }
    }

    /// Starts a new ring (polygon hole) after closing the current one
    #[track_caller]
    pub fn begin_part(&mut self) -> EditResult<usize> {
        self.active("begin_part");
        self.close_ring()?;
        self.session.begin_part()
    }

    /// Completes the open feature. Polygon rings are closed automatically.
    ///
    /// Returns the committed id, or `None` if nothing was open or the
    /// feature ended up deleted.
    #[track_caller]
    pub fn finish_feature(&mut self) -> EditResult<Option<FeatureId>> {
        self.active("finish_feature");
        if self.session.state() != SessionState::FeatureOpen {
            return Ok(None);
        }

        let closed = self.close_ring()?;
        self.commit_feature().map_err(|e| {
            if closed {
                if let Err(undo) = self.session.delete_point(-1) {
                    warn!(error = %undo, "failed to undo automatic ring closure");
                }
            }
            e
        })
    }

    /// Appends the first point of the current polygon ring if it is not closed
    fn close_ring(&mut self) -> EditResult<bool> {
        let polygon = self
            .gesture
            .as_ref()
            .is_some_and(|g| g.request.kind == GestureKind::Polygon);
        if !polygon || self.session.state() != SessionState::FeatureOpen {
            return Ok(false);
        }

        let epsilon = self.session.options().epsilon;
        let geometry = self.session.geometry();
        let first = match geometry.parts.last() {
            Some(ring) if ring.len() >= 3 => match (ring.first(), ring.last()) {
                (Some(first), Some(last)) if !first.approx_eq(last, epsilon) => *first,
                _ => return Ok(false),
            },
            _ => return Ok(false),
        };

        self.session.add_point(-1, first)?;
        Ok(true)
    }

    fn commit_feature(&mut self) -> EditResult<Option<FeatureId>> {
        match self.session.close_feature()? {
            FeatureClose::Written(fid) => {
                if let Some(gesture) = self.gesture.as_mut() {
                    gesture.drawn.push(fid);
                }
                Ok(Some(fid))
            }
            FeatureClose::Deleted {
                layer_empty: true, ..
            } => {
                self.end_gesture();
                Ok(None)
            }
            FeatureClose::Deleted { .. } | FeatureClose::NotOpen => Ok(None),
        }
    }

    fn end_gesture(&mut self) {
        if let Some(gesture) = self.gesture.take() {
            debug!(scratch = %gesture.scratch, "gesture ended");
        }
    }

    /// Removes the most recently added point.
    ///
    /// With no feature open, single-point gestures reopen their most recent
    /// feature and delete it.
    pub fn delete_last_point(&mut self) -> EditResult<PointRemoval> {
        let Some(gesture) = self.gesture.as_mut() else {
            return Ok(PointRemoval::Nothing);
        };

        match self.session.state() {
            SessionState::FeatureOpen => {}
            SessionState::LayerOpen if gesture.request.kind.single_point() => {
                let Some(&fid) = gesture.drawn.last() else {
                    return Ok(PointRemoval::Nothing);
                };
                self.session.open_feature(Some(fid))?;
                gesture.drawn.pop();
            }
            _ => return Ok(PointRemoval::Nothing),
        }

        let remaining = self.session.delete_point(-1)?;
        if remaining > 0 {
            return Ok(PointRemoval::Removed { remaining });
        }

        match self.session.close_feature()? {
            FeatureClose::Deleted {
                layer_empty: true, ..
            } => {
                self.end_gesture();
                Ok(PointRemoval::GestureEnded)
            }
            FeatureClose::Deleted { .. } => Ok(PointRemoval::FeatureDeleted),
            FeatureClose::Written(_) | FeatureClose::NotOpen => {
                Ok(PointRemoval::Removed { remaining: 0 })
            }
        }
    }

    /// Commits the scratch store to `target`, replacing whatever is there.
    #[track_caller]
    pub fn save(&mut self, target: &Path) -> EditResult<ElementMetadata> {
        let (scratch, layer, style) = {
            let gesture = self.active("save");
            (
                gesture.scratch.clone(),
                gesture.request.layer.clone(),
                gesture.style.clone(),
            )
        };

        self.finish_feature()?;
        if self.gesture.is_none() {
            // The last feature was emptied, taking the scratch store with it
            return Err(StoreError::NotFound(scratch).into());
        }
        self.session.close_layer()?;

        match self.commit_to(target, style) {
            Ok(metadata) => {
                self.services.metadata.publish(&metadata);
                self.session.close_vector()?;
                self.end_gesture();
                info!(
                    path = %target.display(),
                    layers = metadata.layer_count,
                    features = metadata.feature_count,
                    "saved"
                );
                Ok(metadata)
            }
            Err(e) => {
                warn!(path = %target.display(), error = %e, "save failed, scratch edits kept");
                if let Err(reopen) = self.session.open_layer(layer.as_str(), None, None) {
                    warn!(error = %reopen, "failed to reopen gesture layer");
                }
                Err(e)
            }
        }
    }

    fn commit_to(&mut self, target: &Path, style: Option<String>) -> EditResult<ElementMetadata> {
        PersistedStore::check_writable(target)?;

        let (srs, layers) = {
            let store = self.session.store();
            (store.srs().map(str::to_string), store.layers().to_vec())
        };

        let removed = PersistedStore::delete_files(target)?;
        debug!(path = %target.display(), removed, "previous target removed");

        if let Err(e) = write_copy(target, srs, &layers) {
            if let Err(cleanup) = PersistedStore::delete_files(target) {
                warn!(error = %cleanup, "failed to remove partial target");
            }
            return Err(e);
        }

        describe(target, |_| style)
    }

    /// Drops the gesture without writing anything
    pub fn cancel(&mut self) {
        let Some(gesture) = self.gesture.take() else {
            return;
        };
        self.session.discard_feature();
        if let Err(e) = self.session.close_vector() {
            warn!(error = %e, "failed to release scratch store");
        }
        debug!(scratch = %gesture.scratch, "gesture cancelled");
    }

    /// Describes an existing persisted store and publishes its metadata
    pub fn init_vector(&self, path: &Path) -> EditResult<ElementMetadata> {
        let styles = &self.services.styles;
        let metadata = describe(path, |store| {
            store
                .layers()
                .first()
                .and_then(|layer| styles.style_for(layer.name()))
        })?;
        self.services.metadata.publish(&metadata);
        Ok(metadata)
    }
}

/// Writes `layers` into a new persisted store at `target`
fn write_copy(target: &Path, srs: Option<String>, layers: &[Layer]) -> EditResult<()> {
    let mut persisted = PersistedStore::create(target, srs)?;
    for layer in layers {
        let mut copy = Layer::empty_like(layer);
        for feature in layer.features() {
            copy.append(feature.clone());
        }
        persisted.store_mut().push_layer(copy)?;
    }
    persisted.sync()?;
    Ok(())
}

/// Reads element metadata back from a persisted store
pub fn describe(
    path: &Path,
    style: impl FnOnce(&Store) -> Option<String>,
) -> EditResult<ElementMetadata> {
    let persisted = PersistedStore::open(path, Access::ReadOnly)?;
    let store = persisted.store();
    let extent = store
        .layers()
        .iter()
        .fold(None, |acc, layer| Extent::union(acc, layer.extent()));

    Ok(ElementMetadata {
        name: path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default(),
        path: path.to_path_buf(),
        srs: store.srs().map(str::to_string),
        layer_count: store.layer_count(),
        feature_count: store.feature_count(),
        extent,
        style: style(store),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Geometry, FieldValue};
    use crate::edit::{ErrorKind, RecordingSink};
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    const WGS84: &str = "EPSG:4326";

    fn orchestrator(registry: &Registry) -> (Orchestrator, RecordingSink) {
        let sink = RecordingSink::new();
        let services = Services::default().with_metadata(sink.clone());
        (
            Orchestrator::new(registry.clone(), EditOptions::default(), services),
            sink,
        )
    }

    fn read_back(path: &Path) -> Store {
        PersistedStore::open(path, Access::ReadOnly)
            .unwrap()
            .store()
            .clone()
    }

    #[test]
    fn scratch_names_are_unique() {
        let registry = Registry::new();
        let (mut orch, _) = orchestrator(&registry);
        let first = orch
            .begin(GestureRequest::new(GestureKind::Line, "roads", WGS84))
            .unwrap();
        assert!(registry.contains(&first));
        orch.cancel();
        assert!(!registry.contains(&first));

        let second = orch
            .begin(GestureRequest::new(GestureKind::Line, "roads", WGS84))
            .unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn points_close_immediately() {
        let registry = Registry::new();
        let (mut orch, _) = orchestrator(&registry);
        orch.begin(GestureRequest::new(GestureKind::Point, "wells", WGS84))
            .unwrap();

        let a = orch.add_point(Coord::new(1.0, 1.0)).unwrap();
        let b = orch.add_point(Coord::new(2.0, 2.0)).unwrap();
        assert_eq!(a, Some(FeatureId::new(0)));
        assert_eq!(b, Some(FeatureId::new(1)));
        assert_eq!(orch.session().state(), SessionState::LayerOpen);
        assert_eq!(orch.drawn().len(), 2);
    }

    #[test]
    fn line_stays_open_until_finished() {
        let registry = Registry::new();
        let (mut orch, _) = orchestrator(&registry);
        orch.begin(GestureRequest::new(GestureKind::Line, "roads", WGS84))
            .unwrap();

        assert_eq!(orch.add_point(Coord::new(0.0, 0.0)).unwrap(), None);
        assert_eq!(orch.add_point(Coord::new(1.0, 0.0)).unwrap(), None);
        assert_eq!(orch.session().state(), SessionState::FeatureOpen);
        assert_eq!(orch.finish_feature().unwrap(), Some(FeatureId::new(0)));
    }

    #[test]
    fn polygon_ring_closed_on_finish() {
        let registry = Registry::new();
        let (mut orch, _) = orchestrator(&registry);
        orch.begin(GestureRequest::new(GestureKind::Polygon, "parcels", WGS84))
            .unwrap();
        for (x, y) in [(0.0, 0.0), (0.0, 1.0), (1.0, 1.0)] {
            orch.add_point(Coord::new(x, y)).unwrap();
        }
        let fid = orch.finish_feature().unwrap().unwrap();
        let feature = orch.session_mut().feature(fid).unwrap();
        let ring = &feature.geometry.unwrap().parts[0];
        assert_eq!(ring.len(), 4);
        assert_eq!(ring[0], ring[3]);
    }

    #[test]
    fn invalid_polygon_is_left_untouched() {
        let registry = Registry::new();
        let (mut orch, _) = orchestrator(&registry);
        orch.begin(GestureRequest::new(GestureKind::Polygon, "parcels", WGS84))
            .unwrap();
        orch.add_point(Coord::new(0.0, 0.0)).unwrap();
        orch.add_point(Coord::new(1.0, 0.0)).unwrap();

        let err = orch.finish_feature().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GeometryInvalid);
        assert_eq!(orch.session_mut().point_count(), 2);
    }

    #[test]
    fn delete_last_point_walks_back_to_gesture_end() {
        let registry = Registry::new();
        let (mut orch, _) = orchestrator(&registry);
        let scratch = orch
            .begin(GestureRequest::new(GestureKind::Line, "roads", WGS84))
            .unwrap();
        orch.add_point(Coord::new(0.0, 0.0)).unwrap();
        orch.add_point(Coord::new(1.0, 0.0)).unwrap();

        assert_eq!(
            orch.delete_last_point().unwrap(),
            PointRemoval::Removed { remaining: 1 }
        );
        assert_eq!(orch.delete_last_point().unwrap(), PointRemoval::GestureEnded);
        assert!(!orch.is_active());
        assert!(!registry.contains(&scratch));
        assert_eq!(orch.delete_last_point().unwrap(), PointRemoval::Nothing);
    }

    #[test]
    fn delete_last_point_keeps_other_features() {
        let registry = Registry::new();
        let (mut orch, _) = orchestrator(&registry);
        orch.begin(GestureRequest::new(GestureKind::Point, "wells", WGS84))
            .unwrap();
        orch.add_point(Coord::new(0.0, 0.0)).unwrap();
        orch.add_point(Coord::new(1.0, 1.0)).unwrap();

        assert_eq!(orch.delete_last_point().unwrap(), PointRemoval::FeatureDeleted);
        assert_eq!(orch.session_mut().feature_count(), 1);
        assert_eq!(orch.delete_last_point().unwrap(), PointRemoval::GestureEnded);
        assert!(!orch.is_active());
    }

    #[test]
    fn delete_last_point_keeps_history_when_reopen_fails() {
        let registry = Registry::new();
        let (mut orch, _) = orchestrator(&registry);
        orch.begin(GestureRequest::new(GestureKind::Point, "wells", WGS84))
            .unwrap();
        let first = orch.add_point(Coord::new(0.0, 0.0)).unwrap().unwrap();
        let second = orch.add_point(Coord::new(1.0, 1.0)).unwrap().unwrap();
        orch.session_mut().delete_feature(second).unwrap();

        let err = orch.delete_last_point().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(orch.drawn(), &[first, second]);
        assert_eq!(orch.session().state(), SessionState::LayerOpen);
    }

    #[test]
    fn annotation_sets_text_field() {
        let registry = Registry::new();
        let (mut orch, _) = orchestrator(&registry);
        orch.begin(GestureRequest::new(GestureKind::Annotation, "labels", WGS84))
            .unwrap();
        let fid = orch.add_annotation(Coord::new(3.0, 4.0), "Town hall").unwrap();

        let feature = orch.session_mut().feature(fid).unwrap();
        assert_eq!(feature.values[0], FieldValue::Text("Town hall".into()));
        assert_eq!(feature.point_count(), 1);
    }

    #[test]
    fn annotation_text_too_long_is_rejected() {
        let registry = Registry::new();
        let (mut orch, _) = orchestrator(&registry);
        orch.begin(GestureRequest::new(GestureKind::Annotation, "labels", WGS84))
            .unwrap();
        let text = "x".repeat(DEFAULT_TEXT_LEN + 1);
        let err = orch.add_annotation(Coord::new(0.0, 0.0), &text).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
        assert_eq!(orch.session_mut().feature_count(), 0);
        assert_eq!(orch.session().state(), SessionState::LayerOpen);
    }

    #[test]
    #[should_panic(expected = "add_annotation called during a line gesture")]
    fn annotation_on_line_gesture_panics() {
        let registry = Registry::new();
        let (mut orch, _) = orchestrator(&registry);
        orch.begin(GestureRequest::new(GestureKind::Line, "roads", WGS84))
            .unwrap();
        let _ = orch.add_annotation(Coord::new(0.0, 0.0), "x");
    }

    #[test]
    fn foreign_source_srs_needs_transform() {
        let registry = Registry::new();
        let (mut orch, _) = orchestrator(&registry);
        orch.begin(
            GestureRequest::new(GestureKind::Point, "wells", WGS84).with_source_srs("EPSG:3857"),
        )
        .unwrap();
        let err = orch.add_point(Coord::new(0.0, 0.0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::External);
        assert_eq!(orch.session_mut().feature_count(), 0);
    }

    #[test]
    fn save_writes_clockwise_polygon() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out.vec");
        let registry = Registry::new();
        let (mut orch, sink) = orchestrator(&registry);

        let scratch = orch
            .begin(GestureRequest::new(GestureKind::Polygon, "L", WGS84))
            .unwrap();
        for (x, y) in [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0), (0.0, 0.0)] {
            orch.add_point(Coord::new(x, y)).unwrap();
        }
        let metadata = orch.save(&target).unwrap();

        assert_eq!(metadata.layer_count, 1);
        assert_eq!(metadata.feature_count, 1);
        assert_eq!(metadata.name, "out");
        assert_eq!(sink.records(), vec![metadata]);
        assert!(!orch.is_active());
        assert!(!registry.contains(&scratch));

        let store = read_back(&target);
        let layer = store.layer(0).unwrap();
        let geometry: &Geometry = layer.features().next().unwrap().geometry.as_ref().unwrap();
        assert_eq!(geometry.parts[0].len(), 5);
        assert!(geometry.has_conformant_winding());
    }

    #[test]
    fn save_to_locked_target_keeps_everything() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("busy.vec");
        let registry = Registry::new();

        let mut holder = PersistedStore::create(&target, Some(WGS84.into())).unwrap();
        holder
            .store_mut()
            .create_layer("existing", GeometryType::Point, None)
            .unwrap();
        holder.sync().unwrap();
        let before = fs::read(&target).unwrap();

        let (mut orch, sink) = orchestrator(&registry);
        orch.begin(GestureRequest::new(GestureKind::Point, "wells", WGS84))
            .unwrap();
        orch.add_point(Coord::new(1.0, 2.0)).unwrap();

        let err = orch.save(&target).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TargetLocked);
        assert_eq!(fs::read(&target).unwrap(), before);
        assert!(sink.records().is_empty());

        assert!(orch.is_active());
        assert_eq!(orch.session().state(), SessionState::LayerOpen);
        assert_eq!(orch.session_mut().feature_count(), 1);

        drop(holder);
        let other = dir.path().join("free.vec");
        let metadata = orch.save(&other).unwrap();
        assert_eq!(metadata.feature_count, 1);
    }

    #[test]
    fn non_finite_point_never_reaches_saved_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("wells.vec");
        let registry = Registry::new();
        let (mut orch, _) = orchestrator(&registry);

        orch.begin(GestureRequest::new(GestureKind::Point, "wells", WGS84))
            .unwrap();
        orch.add_point(Coord::new(0.0, 0.0)).unwrap();
        orch.save(&target).unwrap();

        orch.begin(GestureRequest::new(GestureKind::Point, "wells", WGS84))
            .unwrap();
        let err = orch.add_point(Coord::new(f64::NAN, 2.0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GeometryInvalid);
        assert_eq!(orch.session().state(), SessionState::LayerOpen);
        assert_eq!(orch.session_mut().feature_count(), 0);

        orch.add_point(Coord::new(3.0, 4.0)).unwrap();
        orch.save(&target).unwrap();

        let store = read_back(&target);
        let layer = store.layer(0).unwrap();
        assert_eq!(layer.feature_count(), 1);
        let feature = layer.features().next().unwrap();
        let geometry = feature.geometry.as_ref().unwrap();
        assert_eq!(geometry.parts, vec![vec![Coord::new(3.0, 4.0)]]);
    }

    #[test]
    fn save_replaces_existing_store_and_sidecars() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("roads.vec");
        let registry = Registry::new();
        let (mut orch, _) = orchestrator(&registry);

        orch.begin(GestureRequest::new(GestureKind::Line, "a", WGS84))
            .unwrap();
        orch.add_point(Coord::new(0.0, 0.0)).unwrap();
        orch.add_point(Coord::new(1.0, 1.0)).unwrap();
        orch.save(&target).unwrap();
        let stray = dir.path().join("roads.7.jsonl");
        fs::write(&stray, "{}\n").unwrap();

        orch.begin(GestureRequest::new(GestureKind::Point, "b", WGS84))
            .unwrap();
        orch.add_point(Coord::new(5.0, 5.0)).unwrap();
        orch.save(&target).unwrap();

        let store = read_back(&target);
        assert_eq!(store.layer_count(), 1);
        assert_eq!(store.layer(0).unwrap().name(), "b");
        assert!(!stray.exists());
    }

    #[test]
    fn begin_from_appends_to_existing_store() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("wells.vec");
        let registry = Registry::new();
        let (mut orch, _) = orchestrator(&registry);

        orch.begin(GestureRequest::new(GestureKind::Point, "wells", WGS84))
            .unwrap();
        orch.add_point(Coord::new(0.0, 0.0)).unwrap();
        orch.save(&target).unwrap();

        orch.begin_from(&target, GestureRequest::new(GestureKind::Point, "wells", WGS84))
            .unwrap();
        orch.add_point(Coord::new(1.0, 1.0)).unwrap();
        let metadata = orch.save(&target).unwrap();
        assert_eq!(metadata.feature_count, 2);
        assert_eq!(metadata.layer_count, 1);
    }

    #[test]
    fn begin_from_rejects_wrong_layer_kind() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("mixed.vec");
        let registry = Registry::new();
        let (mut orch, _) = orchestrator(&registry);

        orch.begin(GestureRequest::new(GestureKind::Point, "wells", WGS84))
            .unwrap();
        orch.add_point(Coord::new(0.0, 0.0)).unwrap();
        orch.save(&target).unwrap();

        let err = orch
            .begin_from(&target, GestureRequest::new(GestureKind::Line, "wells", WGS84))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GeometryInvalid);
        assert!(!orch.is_active());
        assert!(registry.is_empty());
    }

    #[test]
    fn cancel_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::new();
        let (mut orch, sink) = orchestrator(&registry);

        orch.begin(GestureRequest::new(GestureKind::Line, "roads", WGS84))
            .unwrap();
        orch.add_point(Coord::new(0.0, 0.0)).unwrap();
        orch.cancel();
        orch.cancel();

        assert!(registry.is_empty());
        assert!(sink.records().is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn init_vector_publishes_metadata_with_style() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("roads.vec");
        let registry = Registry::new();

        let mut styles = HashMap::new();
        styles.insert("roads".to_string(), "line:#c00".to_string());
        let sink = RecordingSink::new();
        let services = Services {
            styles: Box::new(crate::edit::CategoryStyles::new(styles)),
            ..Services::default()
        }
        .with_metadata(sink.clone());
        let mut orch = Orchestrator::new(registry.clone(), EditOptions::default(), services);

        orch.begin(GestureRequest::new(GestureKind::Line, "roads", WGS84))
            .unwrap();
        assert_eq!(orch.style(), Some("line:#c00"));
        orch.add_point(Coord::new(0.0, 0.0)).unwrap();
        orch.add_point(Coord::new(2.0, 3.0)).unwrap();
        orch.save(&target).unwrap();

        let metadata = orch.init_vector(&target).unwrap();
        assert_eq!(metadata.style.as_deref(), Some("line:#c00"));
        assert_eq!(metadata.srs.as_deref(), Some(WGS84));
        let extent = metadata.extent.unwrap();
        assert_eq!((extent.max_x, extent.max_y), (2.0, 3.0));
        assert_eq!(sink.records().len(), 2);
    }
}
