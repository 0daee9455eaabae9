//! Edit session state machine
//!
//! ```text
//! Closed --open_vector--> VectorOpen --open_layer--> LayerOpen --open_feature--> FeatureOpen
//!    ^                        |                          |                           |
//!    +------ close_vector ----+------ close_layer -------+------ close_feature ------+
//! ```
//!
//! Every mutation goes through the session. Calling an operation in the wrong
//! state is a programming error and panics; data problems come back as
//! [`EditError`]s and leave the session as it was before the call. Close
//! operations are idempotent.

use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use super::error::{EditError, EditResult};
use super::options::{EditOptions, RepackPolicy, WindingPolicy};
use crate::domain::{
    resolve_index, Coord, Extent, Feature, FeatureId, FieldDefn, FieldError, FieldValue,
    Geometry, GeometryError, GeometryPolicy, GeometryType, Layer,
};
use crate::storage::{
    Access, LayerSelector, Locator, Registry, StoreError, StoreGuard, SyncReport, VectorHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    VectorOpen,
    LayerOpen,
    FeatureOpen,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Closed => "Closed",
            SessionState::VectorOpen => "VectorOpen",
            SessionState::LayerOpen => "LayerOpen",
            SessionState::FeatureOpen => "FeatureOpen",
        };
        f.write_str(name)
    }
}

/// Result of [`EditSession::close_feature`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureClose {
    /// No feature was open
    NotOpen,
    Written(FeatureId),
    /// The feature had no points left and was removed. When `layer_empty`
    /// is set the layer and vector were closed as well.
    Deleted { fid: FeatureId, layer_empty: bool },
}

/// Result of [`EditSession::delete_feature`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// The layer has no features left; closing the vector is up to the caller
    pub layer_empty: bool,
}

/// Summary of a layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerInfo {
    pub name: String,
    pub geometry_type: GeometryType,
    pub srs: Option<String>,
    pub feature_count: usize,
    pub fields: Vec<FieldDefn>,
    pub extent: Option<Extent>,
    pub nonconformant_winding: bool,
}

impl From<&Layer> for LayerInfo {
    fn from(layer: &Layer) -> Self {
        Self {
            name: layer.name().to_string(),
            geometry_type: layer.geometry_type(),
            srs: layer.srs().map(str::to_string),
            feature_count: layer.feature_count(),
            fields: layer.schema().fields().to_vec(),
            extent: layer.extent(),
            nonconformant_winding: layer.nonconformant_winding(),
        }
    }
}

struct OpenLayer {
    index: usize,
    name: String,
    policy: GeometryPolicy,
}

/// Working copy of the open feature
struct OpenFeature {
    fid: FeatureId,
    is_new: bool,
    values: Vec<FieldValue>,
    /// `None` until loaded when opened deferred
    geometry: Option<Geometry>,
    geometry_loaded: bool,
    geometry_touched: bool,
    fields_touched: bool,
    part: usize,
    /// Layer repack epoch the fid belongs to
    epoch: u64,
}

/// Row position -> feature id, rebuilt when the layer generation moves
#[derive(Default)]
struct FidCache {
    layer: Option<usize>,
    generation: u64,
    ids: Vec<FeatureId>,
}

impl FidCache {
    fn invalidate(&mut self) {
        self.layer = None;
        self.ids.clear();
    }
}

#[track_caller]
fn invalid_state(op: &str, state: SessionState) -> ! {
    panic!("invalid edit session state: {} called in state {}", op, state)
}

/// The nested vector/layer/feature editing state machine
pub struct EditSession {
    registry: Registry,
    options: EditOptions,
    handle: Option<VectorHandle>,
    layer: Option<OpenLayer>,
    feature: Option<OpenFeature>,
    cache: FidCache,
}

impl EditSession {
    pub fn new(registry: Registry, options: EditOptions) -> Self {
        Self {
            registry,
            options,
            handle: None,
            layer: None,
            feature: None,
            cache: FidCache::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        match (&self.handle, &self.layer, &self.feature) {
            (None, _, _) => SessionState::Closed,
            (Some(_), None, _) => SessionState::VectorOpen,
            (Some(_), Some(_), None) => SessionState::LayerOpen,
            (Some(_), Some(_), Some(_)) => SessionState::FeatureOpen,
        }
    }

    pub fn options(&self) -> &EditOptions {
        &self.options
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Locator of the open vector
    pub fn locator(&self) -> Option<Locator> {
        self.handle.as_ref().map(VectorHandle::locator)
    }

    #[track_caller]
    fn require(&self, op: &str, allowed: &[SessionState]) {
        let state = self.state();
        if !allowed.contains(&state) {
            invalid_state(op, state);
        }
    }

    #[track_caller]
    fn handle_mut(&mut self, op: &str) -> &mut VectorHandle {
        let state = self.state();
        match self.handle.as_mut() {
            Some(handle) => handle,
            None => invalid_state(op, state),
        }
    }

    #[track_caller]
    fn open_layer_index(&self, op: &str) -> usize {
        match &self.layer {
            Some(open) => open.index,
            None => invalid_state(op, self.state()),
        }
    }

    /// Runs `f` against the open layer
    #[track_caller]
    fn with_layer<R>(&mut self, op: &str, f: impl FnOnce(&mut Layer) -> R) -> R {
        let idx = self.open_layer_index(op);
        let mut store = self.handle_mut(op).store();
        match store.layer_mut(idx) {
            Some(layer) => f(layer),
            None => unreachable!("layers are never removed from an open store"),
        }
    }

    fn require_writable(&self) -> EditResult<()> {
        match &self.handle {
            Some(handle) if !handle.is_writable() => {
                let path = match handle.locator() {
                    Locator::Persisted(path) => path,
                    other => other.to_string().into(),
                };
                Err(StoreError::ReadOnly(path).into())
            }
            _ => Ok(()),
        }
    }

    // ----------------------------------------------------------------------
    // Vector
    // ----------------------------------------------------------------------

    /// Opens a vector for update from a locator string
    pub fn open_vector(&mut self, locator: &str) -> EditResult<()> {
        let locator: Locator = locator.parse()?;
        self.open_vector_with(&locator, Access::Update)
    }

    pub fn open_vector_with(&mut self, locator: &Locator, access: Access) -> EditResult<()> {
        self.require("open_vector", &[SessionState::Closed]);
        let handle = VectorHandle::open(locator, &self.registry, access)?;
        self.handle = Some(handle);
        debug!(%locator, "session: vector open");
        Ok(())
    }

    /// Creates a new vector store and opens it.
    ///
    /// `srs` overrides the spatial reference embedded in a memory locator.
    pub fn create_vector(&mut self, locator: &Locator, srs: Option<String>) -> EditResult<()> {
        self.require("create_vector", &[SessionState::Closed]);
        let handle = match locator {
            Locator::Persisted(path) => VectorHandle::create_persisted(path, srs)?,
            Locator::Memory { name, srs: embedded } => {
                let srs = srs.or_else(|| embedded.clone());
                VectorHandle::create(&Locator::memory(name.clone(), srs), &self.registry)?
            }
        };
        self.handle = Some(handle);
        debug!(%locator, "session: vector created");
        Ok(())
    }

    /// Borrows the open store directly
    #[track_caller]
    pub fn store(&mut self) -> StoreGuard<'_> {
        self.handle_mut("store").store()
    }

    #[track_caller]
    pub fn layer_count(&mut self) -> usize {
        self.store().layer_count()
    }

    #[track_caller]
    pub fn layer_names(&mut self) -> Vec<String> {
        self.store()
            .layers()
            .iter()
            .map(|l| l.name().to_string())
            .collect()
    }

    /// Closes the vector, tearing down any open layer and feature first.
    ///
    /// Memory stores are released; update-mode persisted stores are synced.
    pub fn close_vector(&mut self) -> EditResult<()> {
        self.close_layer()?;
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let locator = handle.locator();
        self.cache.invalidate();
        handle.close(&self.registry)?;
        debug!(%locator, "session: vector closed");
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Layer
    // ----------------------------------------------------------------------

    /// Opens a layer, creating it when it does not exist and both `srs` and
    /// `geometry_type` are given. A previously open layer is closed first.
    pub fn open_layer(
        &mut self,
        selector: impl Into<LayerSelector>,
        srs: Option<&str>,
        geometry_type: Option<GeometryType>,
    ) -> EditResult<LayerInfo> {
        self.require(
            "open_layer",
            &[
                SessionState::VectorOpen,
                SessionState::LayerOpen,
                SessionState::FeatureOpen,
            ],
        );
        let selector = selector.into();

        let existing = self.store().find(&selector);
        let create = match (existing, &selector, srs, geometry_type) {
            (Some(_), _, _, _) => None,
            (None, LayerSelector::Name(name), Some(srs), Some(kind)) => {
                self.require_writable()?;
                Some((name.clone(), srs.to_string(), kind))
            }
            (None, _, _, _) => return Err(StoreError::LayerNotFound(selector.to_string()).into()),
        };

        self.close_layer()?;

        let index = match (existing, create) {
            (Some(idx), _) => idx,
            (None, Some((name, srs, kind))) => {
                let idx = self.store().create_layer(&name, kind, Some(srs))?;
                debug!(layer = %name, %kind, "session: layer created");
                idx
            }
            (None, None) => unreachable!("missing layer without creation parameters returned above"),
        };

        let info = self.with_layer_at(index, |layer| LayerInfo::from(&*layer));
        self.layer = Some(OpenLayer {
            index,
            name: info.name.clone(),
            policy: info.geometry_type.policy(),
        });
        self.cache.invalidate();
        debug!(layer = %info.name, features = info.feature_count, "session: layer open");
        Ok(info)
    }

    fn with_layer_at<R>(&mut self, index: usize, f: impl FnOnce(&mut Layer) -> R) -> R {
        let mut store = self.handle_mut("open_layer").store();
        match store.layer_mut(index) {
            Some(layer) => f(layer),
            None => unreachable!("layer index resolved from the same store"),
        }
    }

    /// Closes the open layer (and feature). No-op when none is open.
    pub fn close_layer(&mut self) -> EditResult<()> {
        self.close_feature_for_teardown()?;
        if let Some(layer) = self.layer.take() {
            self.cache.invalidate();
            debug!(layer = %layer.name, "session: layer closed");
        }
        Ok(())
    }

    /// Closes an open feature on the way down without cascading past
    /// the caller's own teardown
    fn close_feature_for_teardown(&mut self) -> EditResult<()> {
        self.close_feature_inner(false).map(|_| ())
    }

    #[track_caller]
    pub fn layer_info(&mut self) -> LayerInfo {
        self.with_layer("layer_info", |layer| LayerInfo::from(&*layer))
    }

    #[track_caller]
    pub fn geometry_policy(&self) -> GeometryPolicy {
        match &self.layer {
            Some(open) => open.policy,
            None => invalid_state("geometry_policy", self.state()),
        }
    }

    /// Adds a field to the open layer and returns the stored name
    pub fn create_field(&mut self, defn: FieldDefn) -> EditResult<String> {
        self.require("create_field", &[SessionState::LayerOpen]);
        self.require_writable()?;
        let policy = self.options.field_names;
        let name = self.with_layer("create_field", |layer| layer.add_field(defn, policy))?;
        Ok(name)
    }

    #[track_caller]
    pub fn feature_count(&mut self) -> usize {
        self.with_layer("feature_count", |layer| layer.feature_count())
    }

    #[track_caller]
    pub fn layer_extent(&mut self) -> Option<Extent> {
        self.with_layer("layer_extent", |layer| layer.extent())
    }

    /// Feature id at row position `n`, served from the cache
    #[track_caller]
    pub fn feature_id_at(&mut self, n: usize) -> Option<FeatureId> {
        let idx = self.open_layer_index("feature_id_at");
        let cache = &mut self.cache;
        let Some(handle) = self.handle.as_mut() else {
            invalid_state("feature_id_at", SessionState::Closed)
        };
        let store = handle.store();
        let Some(layer) = store.layer(idx) else {
            unreachable!("layers are never removed from an open store")
        };
        if cache.layer != Some(idx) || cache.generation != layer.generation() {
            cache.ids = layer.ids();
            cache.layer = Some(idx);
            cache.generation = layer.generation();
        }
        cache.ids.get(n).copied()
    }

    /// Snapshot of a committed feature
    #[track_caller]
    pub fn feature(&mut self, fid: FeatureId) -> Option<Feature> {
        self.with_layer("feature", |layer| layer.get(fid).cloned())
    }

    /// Snapshot of every committed feature in id order
    #[track_caller]
    pub fn features(&mut self) -> Vec<Feature> {
        self.with_layer("features", |layer| layer.features().cloned().collect())
    }

    // ----------------------------------------------------------------------
    // Feature
    // ----------------------------------------------------------------------

    /// Opens a feature. `None` allocates a new empty feature in the layer.
    pub fn open_feature(&mut self, fid: Option<FeatureId>) -> EditResult<FeatureId> {
        self.open_feature_inner(fid, true)
    }

    /// Opens an existing feature with its geometry loaded on first use
    pub fn open_feature_deferred(&mut self, fid: FeatureId) -> EditResult<FeatureId> {
        self.open_feature_inner(Some(fid), false)
    }

    fn open_feature_inner(&mut self, fid: Option<FeatureId>, load_geometry: bool) -> EditResult<FeatureId> {
        self.require("open_feature", &[SessionState::LayerOpen]);

        let open = match fid {
            None => {
                self.require_writable()?;
                let (fid, values, epoch) = self.with_layer("open_feature", |layer| {
                    let fid = layer.allocate();
                    (fid, vec![FieldValue::Null; layer.schema().len()], layer.repack_epoch())
                });
                OpenFeature {
                    fid,
                    is_new: true,
                    values,
                    geometry: Some(Geometry::new()),
                    geometry_loaded: true,
                    geometry_touched: false,
                    fields_touched: false,
                    part: 0,
                    epoch,
                }
            }
            Some(fid) => {
                let loaded = self.with_layer("open_feature", |layer| {
                    layer
                        .get(fid)
                        .map(|f| (f.values.clone(), f.geometry.clone(), layer.repack_epoch()))
                });
                let (values, geometry, epoch) = loaded.ok_or(EditError::FeatureNotFound(fid))?;
                let part = geometry.as_ref().map_or(0, |g| g.parts.len().saturating_sub(1));
                OpenFeature {
                    fid,
                    is_new: false,
                    values,
                    geometry: if load_geometry { geometry } else { None },
                    geometry_loaded: load_geometry,
                    geometry_touched: false,
                    fields_touched: false,
                    part,
                    epoch,
                }
            }
        };

        let fid = open.fid;
        debug!(%fid, new = open.is_new, deferred = !load_geometry, "session: feature open");
        self.feature = Some(open);
        Ok(fid)
    }

    /// Id of the open feature
    pub fn feature_id(&self) -> Option<FeatureId> {
        self.feature.as_ref().map(|f| f.fid)
    }

    /// Loads deferred geometry and returns the working copy
    #[track_caller]
    fn open_feature_mut(&mut self, op: &str) -> &mut OpenFeature {
        let state = self.state();
        if state != SessionState::FeatureOpen {
            invalid_state(op, state);
        }

        let needs_load = self.feature.as_ref().is_some_and(|f| !f.geometry_loaded);
        if needs_load {
            let fid = self.feature.as_ref().map(|f| f.fid);
            let geometry = fid.and_then(|fid| {
                self.with_layer(op, |layer| layer.get(fid).and_then(|f| f.geometry.clone()))
            });
            if let Some(open) = self.feature.as_mut() {
                open.part = geometry.as_ref().map_or(0, |g| g.parts.len().saturating_sub(1));
                open.geometry = geometry;
                open.geometry_loaded = true;
            }
        }

        match self.feature.as_mut() {
            Some(open) => open,
            None => invalid_state(op, state),
        }
    }

    /// Copy of the open feature's geometry (empty if it has none)
    #[track_caller]
    pub fn geometry(&mut self) -> Geometry {
        self.open_feature_mut("geometry")
            .geometry
            .clone()
            .unwrap_or_default()
    }

    #[track_caller]
    pub fn point_count(&mut self) -> usize {
        self.open_feature_mut("point_count")
            .geometry
            .as_ref()
            .map_or(0, Geometry::point_count)
    }

    /// Starts a new part (polygon hole or collection member) and returns its
    /// index. An empty current part is reused.
    pub fn begin_part(&mut self) -> EditResult<usize> {
        let policy = self.geometry_policy();
        let open = self.open_feature_mut("begin_part");
        let geometry = open.geometry.get_or_insert_with(Geometry::new);

        if geometry.parts.get(open.part).map_or(true, Vec::is_empty) {
            return Ok(open.part);
        }
        policy.check_can_begin_part(geometry)?;

        geometry.parts.push(Vec::new());
        open.part = geometry.parts.len() - 1;
        open.geometry_touched = true;
        Ok(open.part)
    }

    /// Inserts a point in the current part; `-1` appends
    pub fn add_point(&mut self, index: isize, coord: Coord) -> EditResult<()> {
        let policy = self.geometry_policy();
        let open = self.open_feature_mut("add_point");
        if !coord.is_finite() {
            return Err(GeometryError::NonFinite(coord).into());
        }
        let geometry = open.geometry.get_or_insert_with(Geometry::new);

        policy.check_can_add(geometry)?;
        let len = geometry.parts.get(open.part).map_or(0, Vec::len);
        let at = resolve_index(index, len, true)?;

        if geometry.parts.is_empty() {
            geometry.parts.push(Vec::new());
            open.part = 0;
        }
        geometry.parts[open.part].insert(at, coord);
        open.geometry_touched = true;
        Ok(())
    }

    /// Moves a point of the current part; `-1` is the last point
    pub fn set_point(&mut self, index: isize, coord: Coord) -> EditResult<()> {
        let open = self.open_feature_mut("set_point");
        if !coord.is_finite() {
            return Err(GeometryError::NonFinite(coord).into());
        }
        let part = open
            .geometry
            .as_mut()
            .and_then(|g| g.parts.get_mut(open.part));
        let len = part.as_ref().map_or(0, |p| p.len());
        let at = resolve_index(index, len, false)?;

        if let Some(part) = part {
            part[at] = coord;
            open.geometry_touched = true;
        }
        Ok(())
    }

    /// Removes a point of the current part; `-1` is the last point.
    ///
    /// Returns the number of points left in the whole geometry. An empty
    /// part is dropped and editing continues on the previous one.
    pub fn delete_point(&mut self, index: isize) -> EditResult<usize> {
        let open = self.open_feature_mut("delete_point");
        let Some(geometry) = open.geometry.as_mut() else {
            return Err(GeometryError::IndexOutOfRange { index, len: 0 }.into());
        };
        // An empty current part is dropped and the index applies to the previous
        // one, but nothing changes until the index is known to be valid.
        let drop_empty =
            geometry.parts.len() > 1 && geometry.parts.get(open.part).is_some_and(Vec::is_empty);
        let target = match (drop_empty, open.part) {
            (false, part) => part,
            (true, 0) => 1,
            (true, part) => part - 1,
        };
        let len = geometry.parts.get(target).map_or(0, Vec::len);
        let at = resolve_index(index, len, false)?;

        if drop_empty {
            geometry.parts.remove(open.part);
            open.part = open.part.saturating_sub(1).min(geometry.parts.len() - 1);
        }
        geometry.parts[open.part].remove(at);
        if geometry.parts[open.part].is_empty() && geometry.parts.len() > 1 {
            geometry.parts.remove(open.part);
            open.part = open.part.saturating_sub(1).min(geometry.parts.len() - 1);
        }
        open.geometry_touched = true;
        Ok(geometry.point_count())
    }

    /// Sets a field value on the open feature
    pub fn set_field(&mut self, name: &str, value: impl Into<FieldValue>) -> EditResult<()> {
        self.require("set_field", &[SessionState::FeatureOpen]);
        let value = value.into();
        let (idx, defn) = self.with_layer("set_field", |layer| {
            let schema = layer.schema();
            schema
                .index_of(name)
                .map(|idx| (idx, schema.fields()[idx].clone()))
        })
        .ok_or_else(|| FieldError::Unknown(name.to_string()))?;

        defn.check(&value)?;

        if let Some(open) = self.feature.as_mut() {
            if let Some(slot) = open.values.get_mut(idx) {
                *slot = value;
                open.fields_touched = true;
            }
        }
        Ok(())
    }

    /// Reads a field value from the open feature
    pub fn field(&mut self, name: &str) -> EditResult<FieldValue> {
        self.require("field", &[SessionState::FeatureOpen]);
        let idx = self
            .with_layer("field", |layer| layer.schema().index_of(name))
            .ok_or_else(|| FieldError::Unknown(name.to_string()))?;
        Ok(self
            .feature
            .as_ref()
            .and_then(|open| open.values.get(idx).cloned())
            .unwrap_or_default())
    }

    /// Writes the open feature back to the layer.
    ///
    /// A feature whose geometry was emptied is deleted instead, and deleting
    /// the layer's last feature closes the layer and the vector. Invalid
    /// geometry is rejected and the feature stays open.
    pub fn close_feature(&mut self) -> EditResult<FeatureClose> {
        self.close_feature_inner(true)
    }

    fn close_feature_inner(&mut self, cascade: bool) -> EditResult<FeatureClose> {
        let Some(open) = self.feature.take() else {
            return Ok(FeatureClose::NotOpen);
        };
        let policy = self.geometry_policy();
        let epsilon = self.options.epsilon;
        let winding = self.options.winding;

        if open.is_new || open.geometry_touched || open.fields_touched {
            if let Err(e) = self.require_writable() {
                self.feature = Some(open);
                return Err(e);
            }
        }

        let emptied = open.geometry_loaded
            && (open.is_new || open.geometry_touched)
            && open.geometry.as_ref().map_or(true, Geometry::is_empty);

        if emptied {
            return self.delete_open_feature(open, cascade);
        }

        let mut geometry = open.geometry.clone();
        let mut nonconformant = false;
        if open.geometry_touched {
            if let Some(geometry) = geometry.as_mut() {
                if let Err(e) = policy.validate(geometry, epsilon) {
                    self.feature = Some(open);
                    return Err(e.into());
                }
                if policy.kind == GeometryType::Polygon {
                    match winding {
                        WindingPolicy::Reverse => {
                            geometry.orient_rings();
                        }
                        WindingPolicy::MarkNonconformant => {
                            nonconformant = !geometry.has_conformant_winding();
                        }
                    }
                }
            }
        }

        let fid = open.fid;
        let epoch = open.epoch;
        let write_geometry = open.geometry_loaded;
        let values = open.values.clone();
        let outcome = self.with_layer("close_feature", |layer| {
            if layer.repack_epoch() != epoch || !layer.contains(fid) {
                return false;
            }
            let geometry = if write_geometry {
                geometry
            } else {
                layer.get(fid).and_then(|f| f.geometry.clone())
            };
            if nonconformant {
                layer.set_nonconformant_winding(true);
            }
            layer.update(Feature {
                fid,
                geometry,
                values,
            })
        });

        if !outcome {
            // Renumbered or removed by another session sharing the store
            self.feature = Some(open);
            return Err(EditError::FeatureNotFound(fid));
        }

        debug!(%fid, "session: feature written");
        Ok(FeatureClose::Written(fid))
    }

    fn delete_open_feature(&mut self, open: OpenFeature, cascade: bool) -> EditResult<FeatureClose> {
        let fid = open.fid;
        let epoch = open.epoch;
        let removed = self.with_layer("close_feature", |layer| {
            (layer.repack_epoch() == epoch)
                .then(|| layer.remove(fid))
                .flatten()
                .map(|_| layer.is_empty())
        });

        let Some(layer_empty) = removed else {
            self.feature = Some(open);
            return Err(EditError::FeatureNotFound(fid));
        };
        debug!(%fid, layer_empty, "session: emptied feature deleted");

        self.after_delete()?;

        if layer_empty && cascade {
            self.close_vector()?;
        }
        Ok(FeatureClose::Deleted { fid, layer_empty })
    }

    /// Drops the open feature's edits. A newly allocated feature is removed.
    ///
    /// Returns false when no feature was open.
    pub fn discard_feature(&mut self) -> bool {
        let Some(open) = self.feature.take() else {
            return false;
        };
        if open.is_new {
            let fid = open.fid;
            let epoch = open.epoch;
            self.with_layer("discard_feature", |layer| {
                if layer.repack_epoch() == epoch {
                    layer.remove(fid);
                }
            });
        }
        debug!(fid = %open.fid, "session: feature discarded");
        true
    }

    /// Deletes a committed feature; no feature may be open
    pub fn delete_feature(&mut self, fid: FeatureId) -> EditResult<DeleteOutcome> {
        self.require("delete_feature", &[SessionState::LayerOpen]);
        self.require_writable()?;

        let layer_empty = self
            .with_layer("delete_feature", |layer| layer.remove(fid).map(|_| layer.is_empty()))
            .ok_or(EditError::FeatureNotFound(fid))?;
        debug!(%fid, layer_empty, "session: feature deleted");

        self.after_delete()?;
        Ok(DeleteOutcome { layer_empty })
    }

    /// Applies the repack policy after a deletion in a file-backed layer
    fn after_delete(&mut self) -> EditResult<()> {
        let eager = self.options.repack == RepackPolicy::Eager;
        let persisted = self.handle.as_ref().is_some_and(|h| !h.is_memory());
        if eager && persisted && self.layer.is_some() {
            self.repack()?;
        }
        Ok(())
    }

    /// Renumbers the open layer's features densely.
    ///
    /// The open feature follows its renumbered id. Returns how many ids moved.
    pub fn repack(&mut self) -> EditResult<usize> {
        self.require("repack", &[SessionState::LayerOpen, SessionState::FeatureOpen]);
        self.require_writable()?;

        let (moved, epoch) =
            self.with_layer("repack", |layer| (layer.repack(), layer.repack_epoch()));
        self.remap_open_feature(&moved, epoch);
        self.cache.invalidate();
        debug!(moved = moved.len(), "session: layer repacked");
        Ok(moved.len())
    }

    fn remap_open_feature(&mut self, moved: &[(FeatureId, FeatureId)], epoch: u64) {
        if let Some(open) = self.feature.as_mut() {
            if let Some((_, new)) = moved.iter().find(|(old, _)| *old == open.fid) {
                open.fid = *new;
            }
            open.epoch = epoch;
        }
    }

    /// Flushes committed changes to disk without changing state.
    ///
    /// Edits of the open feature are committed by [`close_feature`](Self::close_feature).
    pub fn sync_to_disk(&mut self) -> EditResult<()> {
        self.require("sync_to_disk", &[SessionState::LayerOpen, SessionState::FeatureOpen]);
        let index = self.open_layer_index("sync_to_disk");
        let report: SyncReport = self.handle_mut("sync_to_disk").sync()?;

        if let Some((_, moved)) = report.repacked.iter().find(|(idx, _)| *idx == index) {
            let epoch = self.with_layer("sync_to_disk", |layer| layer.repack_epoch());
            self.remap_open_feature(moved, epoch);
        }
        if !report.repacked.is_empty() {
            self.cache.invalidate();
        }
        Ok(())
    }
}

impl Drop for EditSession {
    fn drop(&mut self) {
        if self.handle.is_none() {
            return;
        }
        self.discard_feature();
        self.layer = None;
        if let Err(e) = self.close_vector() {
            warn!(error = %e, "failed to close vector while dropping edit session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FieldType;
    use tempfile::TempDir;

    const WGS84: &str = "EPSG:4326";

    fn session(registry: &Registry) -> EditSession {
        EditSession::new(registry.clone(), EditOptions::default())
    }

    fn line_session(registry: &Registry) -> EditSession {
        let mut s = session(registry);
        s.open_vector("mem:lines").unwrap();
        s.open_layer("roads", Some(WGS84), Some(GeometryType::Line))
            .unwrap();
        s
    }

    #[test]
    fn state_transitions() {
        let registry = Registry::new();
        let mut s = session(&registry);
        assert_eq!(s.state(), SessionState::Closed);

        s.open_vector("mem:a").unwrap();
        assert_eq!(s.state(), SessionState::VectorOpen);

        s.open_layer("pts", Some(WGS84), Some(GeometryType::Point))
            .unwrap();
        assert_eq!(s.state(), SessionState::LayerOpen);

        s.open_feature(None).unwrap();
        assert_eq!(s.state(), SessionState::FeatureOpen);
        s.add_point(-1, Coord::new(1.0, 2.0)).unwrap();

        assert!(matches!(s.close_feature().unwrap(), FeatureClose::Written(_)));
        assert_eq!(s.state(), SessionState::LayerOpen);

        s.close_vector().unwrap();
        assert_eq!(s.state(), SessionState::Closed);
        assert!(!registry.contains("a"));
    }

    #[test]
    fn missing_layer_without_creation_params() {
        let registry = Registry::new();
        let mut s = session(&registry);
        s.open_vector("mem:b").unwrap();
        let err = s.open_layer("nope", Some(WGS84), None).unwrap_err();
        assert_eq!(err.kind(), crate::edit::ErrorKind::NotFound);
        assert_eq!(s.state(), SessionState::VectorOpen);
    }

    #[test]
    fn existing_layer_ignores_creation_params() {
        let registry = Registry::new();
        let mut s = line_session(&registry);
        let info = s
            .open_layer("roads", Some("EPSG:3857"), Some(GeometryType::Polygon))
            .unwrap();
        assert_eq!(info.geometry_type, GeometryType::Line);
        assert_eq!(info.srs.as_deref(), Some(WGS84));
    }

    #[test]
    fn close_feature_twice_is_noop() {
        let registry = Registry::new();
        let mut s = line_session(&registry);
        s.open_feature(None).unwrap();
        s.add_point(-1, Coord::new(0.0, 0.0)).unwrap();
        s.add_point(-1, Coord::new(1.0, 1.0)).unwrap();
        assert!(matches!(s.close_feature().unwrap(), FeatureClose::Written(_)));
        assert_eq!(s.close_feature().unwrap(), FeatureClose::NotOpen);
        assert_eq!(s.feature_count(), 1);
    }

    #[test]
    #[should_panic(expected = "set_field called in state LayerOpen")]
    fn set_field_without_feature_panics() {
        let registry = Registry::new();
        let mut s = line_session(&registry);
        let _ = s.set_field("name", "x");
    }

    #[test]
    #[should_panic(expected = "open_layer called in state Closed")]
    fn open_layer_without_vector_panics() {
        let registry = Registry::new();
        let mut s = session(&registry);
        let _ = s.open_layer("x", None, None);
    }

    #[test]
    fn invalid_geometry_keeps_feature_open() {
        let registry = Registry::new();
        let mut s = line_session(&registry);
        s.open_feature(None).unwrap();
        s.add_point(-1, Coord::new(0.0, 0.0)).unwrap();

        let err = s.close_feature().unwrap_err();
        assert_eq!(err.kind(), crate::edit::ErrorKind::GeometryInvalid);
        assert_eq!(s.state(), SessionState::FeatureOpen);
        assert_eq!(s.point_count(), 1);

        s.add_point(-1, Coord::new(1.0, 0.0)).unwrap();
        assert!(matches!(s.close_feature().unwrap(), FeatureClose::Written(_)));
    }

    #[test]
    fn point_layer_rejects_second_point() {
        let registry = Registry::new();
        let mut s = session(&registry);
        s.open_vector("mem:p").unwrap();
        s.open_layer("p", Some(WGS84), Some(GeometryType::Point))
            .unwrap();
        s.open_feature(None).unwrap();
        s.add_point(-1, Coord::new(0.0, 0.0)).unwrap();
        let err = s.add_point(-1, Coord::new(1.0, 1.0)).unwrap_err();
        assert_eq!(err.kind(), crate::edit::ErrorKind::GeometryInvalid);
        assert_eq!(s.point_count(), 1);
    }

    #[test]
    fn point_index_semantics() {
        let registry = Registry::new();
        let mut s = line_session(&registry);
        s.open_feature(None).unwrap();
        s.add_point(-1, Coord::new(0.0, 0.0)).unwrap();
        s.add_point(-1, Coord::new(2.0, 0.0)).unwrap();
        s.add_point(1, Coord::new(1.0, 0.0)).unwrap();
        s.set_point(-1, Coord::new(3.0, 0.0)).unwrap();

        let geometry = s.geometry();
        let xs: Vec<f64> = geometry.parts[0].iter().map(|c| c.x).collect();
        assert_eq!(xs, vec![0.0, 1.0, 3.0]);

        assert!(s.add_point(7, Coord::new(9.0, 9.0)).is_err());
        assert!(s.set_point(3, Coord::new(9.0, 9.0)).is_err());
        assert_eq!(s.delete_point(0).unwrap(), 2);
    }

    #[test]
    fn field_type_mismatch_leaves_value() {
        let registry = Registry::new();
        let mut s = line_session(&registry);
        s.create_field(FieldDefn::integer("lanes")).unwrap();
        s.open_feature(None).unwrap();
        s.set_field("lanes", 2i64).unwrap();

        let err = s.set_field("lanes", "two").unwrap_err();
        assert_eq!(err.kind(), crate::edit::ErrorKind::TypeMismatch);
        assert_eq!(s.field("lanes").unwrap(), FieldValue::Integer(2));

        let err = s.set_field("width", 1.0).unwrap_err();
        assert_eq!(err.kind(), crate::edit::ErrorKind::NotFound);
    }

    #[test]
    fn field_names_truncate_by_default() {
        let registry = Registry::new();
        let mut s = line_session(&registry);
        let name = s
            .create_field(FieldDefn::text("LongFieldName12345", 20))
            .unwrap();
        assert_eq!(name, "LongFieldN");
        assert_eq!(s.layer_info().fields[0].field_type, FieldType::Text);
    }

    #[test]
    fn deleting_last_point_of_only_feature_cascades() {
        let registry = Registry::new();
        let mut s = line_session(&registry);
        s.open_feature(None).unwrap();
        s.add_point(-1, Coord::new(0.0, 0.0)).unwrap();
        assert_eq!(s.delete_point(-1).unwrap(), 0);

        let outcome = s.close_feature().unwrap();
        assert!(matches!(outcome, FeatureClose::Deleted { layer_empty: true, .. }));
        assert_eq!(s.state(), SessionState::Closed);
        assert!(!registry.contains("lines"));
    }

    #[test]
    fn deleting_emptied_feature_keeps_other_features() {
        let registry = Registry::new();
        let mut s = line_session(&registry);
        s.open_feature(None).unwrap();
        s.add_point(-1, Coord::new(0.0, 0.0)).unwrap();
        s.add_point(-1, Coord::new(1.0, 0.0)).unwrap();
        s.close_feature().unwrap();

        let fid = s.open_feature(None).unwrap();
        s.add_point(-1, Coord::new(5.0, 5.0)).unwrap();
        s.delete_point(-1).unwrap();
        assert_eq!(
            s.close_feature().unwrap(),
            FeatureClose::Deleted {
                fid,
                layer_empty: false
            }
        );
        assert_eq!(s.state(), SessionState::LayerOpen);
        assert_eq!(s.feature_count(), 1);
    }

    #[test]
    fn delete_feature_signals_empty_without_closing() {
        let registry = Registry::new();
        let mut s = line_session(&registry);
        let fid = s.open_feature(None).unwrap();
        s.add_point(-1, Coord::new(0.0, 0.0)).unwrap();
        s.add_point(-1, Coord::new(1.0, 0.0)).unwrap();
        s.close_feature().unwrap();

        let outcome = s.delete_feature(fid).unwrap();
        assert!(outcome.layer_empty);
        assert_eq!(s.state(), SessionState::LayerOpen);

        assert!(matches!(
            s.delete_feature(fid),
            Err(EditError::FeatureNotFound(_))
        ));
    }

    #[test]
    fn fid_cache_follows_additions_and_repack() {
        let registry = Registry::new();
        let mut s = line_session(&registry);
        for i in 0..3 {
            s.open_feature(None).unwrap();
            s.add_point(-1, Coord::new(i as f64, 0.0)).unwrap();
            s.add_point(-1, Coord::new(i as f64, 1.0)).unwrap();
            s.close_feature().unwrap();
        }
        assert_eq!(s.feature_id_at(2), Some(FeatureId::new(2)));

        s.delete_feature(FeatureId::new(0)).unwrap();
        assert_eq!(s.feature_id_at(0), Some(FeatureId::new(1)));
        assert_eq!(s.feature_id_at(2), None);

        assert_eq!(s.repack().unwrap(), 2);
        assert_eq!(s.feature_id_at(0), Some(FeatureId::new(0)));
        assert_eq!(s.feature_id_at(1), Some(FeatureId::new(1)));
        let moved = s.feature(FeatureId::new(0)).unwrap();
        assert_eq!(moved.geometry.unwrap().parts[0][0].x, 1.0);
    }

    #[test]
    fn repack_remaps_open_feature() {
        let registry = Registry::new();
        let mut s = line_session(&registry);
        for _ in 0..2 {
            s.open_feature(None).unwrap();
            s.add_point(-1, Coord::new(0.0, 0.0)).unwrap();
            s.add_point(-1, Coord::new(1.0, 0.0)).unwrap();
            s.close_feature().unwrap();
        }
        s.delete_feature(FeatureId::new(0)).unwrap();
        s.open_feature(Some(FeatureId::new(1))).unwrap();
        s.repack().unwrap();
        assert_eq!(s.feature_id(), Some(FeatureId::new(0)));

        s.set_point(0, Coord::new(9.0, 9.0)).unwrap();
        assert_eq!(s.close_feature().unwrap(), FeatureClose::Written(FeatureId::new(0)));
    }

    #[test]
    fn write_back_after_foreign_repack_is_rejected() {
        let registry = Registry::new();
        let mut a = line_session(&registry);
        for _ in 0..2 {
            a.open_feature(None).unwrap();
            a.add_point(-1, Coord::new(0.0, 0.0)).unwrap();
            a.add_point(-1, Coord::new(1.0, 0.0)).unwrap();
            a.close_feature().unwrap();
        }
        a.delete_feature(FeatureId::new(0)).unwrap();
        a.open_feature(Some(FeatureId::new(1))).unwrap();
        a.set_point(0, Coord::new(5.0, 5.0)).unwrap();

        let mut b = line_session(&registry);
        b.repack().unwrap();

        assert!(matches!(a.close_feature(), Err(EditError::FeatureNotFound(_))));
        assert_eq!(a.state(), SessionState::FeatureOpen);
        assert!(a.discard_feature());
    }

    #[test]
    fn deferred_geometry_loads_on_demand() {
        let registry = Registry::new();
        let mut s = line_session(&registry);
        s.create_field(FieldDefn::text("name", 10)).unwrap();
        let fid = s.open_feature(None).unwrap();
        s.add_point(-1, Coord::new(0.0, 0.0)).unwrap();
        s.add_point(-1, Coord::new(1.0, 0.0)).unwrap();
        s.close_feature().unwrap();

        s.open_feature_deferred(fid).unwrap();
        s.set_field("name", "main").unwrap();
        s.close_feature().unwrap();
        let stored = s.feature(fid).unwrap();
        assert_eq!(stored.point_count(), 2);
        assert_eq!(stored.values[0], FieldValue::Text("main".into()));

        s.open_feature_deferred(fid).unwrap();
        assert_eq!(s.point_count(), 2);
        s.discard_feature();
    }

    #[test]
    fn open_missing_feature_fails() {
        let registry = Registry::new();
        let mut s = line_session(&registry);
        assert!(matches!(
            s.open_feature(Some(FeatureId::new(9))),
            Err(EditError::FeatureNotFound(_))
        ));
        assert_eq!(s.state(), SessionState::LayerOpen);
    }

    #[test]
    fn discard_removes_new_feature() {
        let registry = Registry::new();
        let mut s = line_session(&registry);
        s.open_feature(None).unwrap();
        assert_eq!(s.feature_count(), 1);
        assert!(s.discard_feature());
        assert_eq!(s.feature_count(), 0);
        assert!(!s.discard_feature());
    }

    #[test]
    fn polygon_holes_use_parts() {
        let registry = Registry::new();
        let mut s = session(&registry);
        s.open_vector("mem:poly").unwrap();
        s.open_layer("parcels", Some(WGS84), Some(GeometryType::Polygon))
            .unwrap();
        s.open_feature(None).unwrap();
        for (x, y) in [(0.0, 0.0), (0.0, 4.0), (4.0, 4.0), (4.0, 0.0), (0.0, 0.0)] {
            s.add_point(-1, Coord::new(x, y)).unwrap();
        }
        assert_eq!(s.begin_part().unwrap(), 1);
        for (x, y) in [(1.0, 1.0), (2.0, 1.0), (2.0, 2.0), (1.0, 1.0)] {
            s.add_point(-1, Coord::new(x, y)).unwrap();
        }
        assert!(matches!(s.close_feature().unwrap(), FeatureClose::Written(_)));
        let feature = s.feature(FeatureId::new(0)).unwrap();
        assert_eq!(feature.geometry.unwrap().parts.len(), 2);
    }

    #[test]
    fn non_finite_points_are_rejected() {
        let registry = Registry::new();
        let mut s = line_session(&registry);
        s.open_feature(None).unwrap();
        s.add_point(-1, Coord::new(0.0, 0.0)).unwrap();

        let err = s.add_point(-1, Coord::new(f64::NAN, 1.0)).unwrap_err();
        assert_eq!(err.kind(), crate::edit::ErrorKind::GeometryInvalid);
        let err = s
            .set_point(0, Coord::with_z(0.0, 0.0, f64::INFINITY))
            .unwrap_err();
        assert_eq!(err.kind(), crate::edit::ErrorKind::GeometryInvalid);

        let geometry = s.geometry();
        assert_eq!(geometry.parts, vec![vec![Coord::new(0.0, 0.0)]]);
    }

    #[test]
    fn bad_delete_on_empty_part_keeps_the_part() {
        let registry = Registry::new();
        let mut s = session(&registry);
        s.open_vector("mem:poly").unwrap();
        s.open_layer("parcels", Some(WGS84), Some(GeometryType::Polygon))
            .unwrap();
        s.open_feature(None).unwrap();
        for (x, y) in [(0.0, 0.0), (0.0, 4.0), (4.0, 4.0), (4.0, 0.0), (0.0, 0.0)] {
            s.add_point(-1, Coord::new(x, y)).unwrap();
        }
        assert_eq!(s.begin_part().unwrap(), 1);

        assert!(s.delete_point(9).is_err());
        assert_eq!(s.geometry().parts.len(), 2);
        assert_eq!(s.point_count(), 5);

        // A valid index still drops the empty part and edits the ring before it
        assert_eq!(s.delete_point(-1).unwrap(), 4);
        assert_eq!(s.geometry().parts.len(), 1);
    }

    fn draw_ccw_square(s: &mut EditSession) -> FeatureId {
        let fid = s.open_feature(None).unwrap();
        for (x, y) in [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0), (0.0, 0.0)] {
            s.add_point(-1, Coord::new(x, y)).unwrap();
        }
        s.close_feature().unwrap();
        fid
    }

    #[test]
    fn counter_clockwise_exterior_is_reversed() {
        let registry = Registry::new();
        let mut s = session(&registry);
        s.open_vector("mem:wind").unwrap();
        s.open_layer("parcels", Some(WGS84), Some(GeometryType::Polygon))
            .unwrap();
        let fid = draw_ccw_square(&mut s);

        let stored = s.feature(fid).unwrap().geometry.unwrap();
        assert!(stored.has_conformant_winding());
        assert!(!s.layer_info().nonconformant_winding);
    }

    #[test]
    fn counter_clockwise_exterior_marks_layer() {
        let registry = Registry::new();
        let options = EditOptions {
            winding: WindingPolicy::MarkNonconformant,
            ..EditOptions::default()
        };
        let mut s = EditSession::new(registry.clone(), options);
        s.open_vector("mem:wind2").unwrap();
        s.open_layer("parcels", Some(WGS84), Some(GeometryType::Polygon))
            .unwrap();
        let fid = draw_ccw_square(&mut s);

        let stored = s.feature(fid).unwrap().geometry.unwrap();
        assert!(!stored.has_conformant_winding());
        assert!(s.layer_info().nonconformant_winding);
    }

    #[test]
    fn persisted_eager_repack_after_delete() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("roads.vec");
        let registry = Registry::new();
        let options = EditOptions {
            repack: RepackPolicy::Eager,
            ..EditOptions::default()
        };

        let mut s = EditSession::new(registry.clone(), options);
        s.create_vector(&Locator::Persisted(path.clone()), Some(WGS84.into()))
            .unwrap();
        s.open_layer("roads", Some(WGS84), Some(GeometryType::Line))
            .unwrap();
        for i in 0..3 {
            s.open_feature(None).unwrap();
            s.add_point(-1, Coord::new(i as f64, 0.0)).unwrap();
            s.add_point(-1, Coord::new(i as f64, 1.0)).unwrap();
            s.close_feature().unwrap();
        }
        s.delete_feature(FeatureId::new(1)).unwrap();
        assert_eq!(s.feature_id_at(1), Some(FeatureId::new(1)));
        let second = s.feature(FeatureId::new(1)).unwrap();
        assert_eq!(second.geometry.unwrap().parts[0][0].x, 2.0);
        s.close_vector().unwrap();
    }

    #[test]
    fn read_only_vector_rejects_mutation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pts.vec");
        let registry = Registry::new();

        let mut writer = session(&registry);
        writer
            .create_vector(&Locator::Persisted(path.clone()), None)
            .unwrap();
        writer
            .open_layer("pts", Some(WGS84), Some(GeometryType::Point))
            .unwrap();
        writer.close_vector().unwrap();

        let mut reader = session(&registry);
        reader
            .open_vector_with(&Locator::Persisted(path), Access::ReadOnly)
            .unwrap();
        reader.open_layer("pts", None, None).unwrap();
        let err = reader.open_feature(None).unwrap_err();
        assert_eq!(err.kind(), crate::edit::ErrorKind::TargetLocked);
    }
}
