//! File-backed vector stores
//!
//! A persisted store at `P` is a JSON manifest at `P` plus sidecar files
//! sharing its stem:
//!
//! ```text
//! parcels.vec        # manifest: layers, schemas, extents, checksums
//! parcels.0.jsonl    # rows of layer 0, line index = feature id
//! parcels.1.jsonl    # rows of layer 1
//! parcels.prj        # spatial reference of the store
//! ```
//!
//! Rows files are replaced atomically (temp file + rename). A store opened
//! for update holds an exclusive lock on the manifest until it is dropped.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::store::{Store, StoreError};
use crate::domain::{
    Extent, Feature, FeatureId, FieldValue, Geometry, GeometryType, Layer, Schema,
};

/// Manifest format version written by this crate
pub const FORMAT_VERSION: u32 = 1;

/// How a persisted store is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Access {
    ReadOnly,
    #[default]
    Update,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    format: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    srs: Option<String>,
    #[serde(default)]
    layers: Vec<LayerEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LayerEntry {
    name: String,
    geometry_type: GeometryType,
    #[serde(default)]
    srs: Option<String>,
    #[serde(default)]
    fields: Schema,
    feature_count: usize,
    #[serde(default)]
    extent: Option<Extent>,
    #[serde(default)]
    nonconformant_winding: bool,
    rows: String,
    checksum: String,
}

/// One line of a rows file
#[derive(Debug, Serialize, Deserialize)]
struct Row {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    geometry: Option<Geometry>,
    #[serde(default)]
    fields: BTreeMap<String, FieldValue>,
}

/// Feature ids renumbered while syncing, per layer position
#[derive(Debug, Default)]
pub struct SyncReport {
    pub repacked: Vec<(usize, Vec<(FeatureId, FeatureId)>)>,
}

/// A vector store backed by a manifest and sidecar files
pub struct PersistedStore {
    path: PathBuf,
    store: Store,
    access: Access,
    /// Locked manifest handle, present for update access
    lock: Option<File>,
    created_at: DateTime<Utc>,
}

impl PersistedStore {
    /// Opens an existing store
    pub fn open(path: impl Into<PathBuf>, access: Access) -> Result<Self, StoreError> {
        let path = path.into();
        if !path.is_file() {
            return Err(StoreError::NotFound(path.display().to_string()));
        }

        let lock = match access {
            Access::Update => Some(lock_manifest(&path)?),
            Access::ReadOnly => None,
        };

        let manifest = read_manifest(&path)?;
        let mut store = Store::new(manifest.srs.clone());
        for (idx, entry) in manifest.layers.iter().enumerate() {
            let layer = load_layer(&path, idx, entry)?;
            store
                .push_layer(layer)
                .map_err(|e| StoreError::unreadable(&path, e))?;
        }

        debug!(
            path = %path.display(),
            layers = store.layer_count(),
            ?access,
            "opened persisted store"
        );

        Ok(Self {
            path,
            store,
            access,
            lock,
            created_at: manifest.created_at,
        })
    }

    /// Creates a new empty store and opens it for update
    pub fn create(path: impl Into<PathBuf>, srs: Option<String>) -> Result<Self, StoreError> {
        let path = path.into();
        if path.exists() {
            return Err(StoreError::AlreadyExists(path.display().to_string()));
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        file.try_lock_exclusive()
            .map_err(|_| StoreError::Locked(path.clone()))?;

        let mut created = Self {
            path,
            store: Store::new(srs),
            access: Access::Update,
            lock: Some(file),
            created_at: Utc::now(),
        };
        created.write_manifest()?;
        created.write_prj()?;

        debug!(path = %created.path.display(), "created persisted store");
        Ok(created)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    /// Writes every dirty layer and the manifest.
    ///
    /// Rows are stored densely, so layers with id gaps are repacked first;
    /// the renumbering is returned for callers holding feature ids.
    pub fn sync(&mut self) -> Result<SyncReport, StoreError> {
        if self.access == Access::ReadOnly {
            return Err(StoreError::ReadOnly(self.path.clone()));
        }

        let mut report = SyncReport::default();
        for (idx, layer) in self.store.layers_mut().iter_mut().enumerate() {
            if layer.has_gaps() {
                let moved = layer.repack();
                debug!(layer = layer.name(), moved = moved.len(), "repacked before sync");
                report.repacked.push((idx, moved));
            }
        }

        for idx in 0..self.store.layer_count() {
            let rows = rows_path(&self.path, idx);
            let dirty = self.store.layer(idx).is_some_and(Layer::is_dirty);
            if dirty || !rows.exists() {
                if let Some(layer) = self.store.layer(idx) {
                    write_rows(&rows, layer)?;
                }
            }
        }

        self.write_manifest()?;
        self.write_prj()?;
        for layer in self.store.layers_mut() {
            layer.mark_clean();
        }

        debug!(path = %self.path.display(), "synced persisted store");
        Ok(report)
    }

    fn write_manifest(&mut self) -> Result<(), StoreError> {
        let mut layers = Vec::with_capacity(self.store.layer_count());
        for (idx, layer) in self.store.layers().iter().enumerate() {
            let rows = rows_path(&self.path, idx);
            let checksum = if rows.exists() {
                file_checksum(&rows)?
            } else {
                blake3::hash(b"").to_hex().to_string()
            };
            layers.push(LayerEntry {
                name: layer.name().to_string(),
                geometry_type: layer.geometry_type(),
                srs: layer.srs().map(str::to_string),
                fields: layer.schema().clone(),
                feature_count: layer.feature_count(),
                extent: layer.extent(),
                nonconformant_winding: layer.nonconformant_winding(),
                rows: file_name(&rows),
                checksum,
            });
        }

        let manifest = Manifest {
            format: FORMAT_VERSION,
            created_at: self.created_at,
            updated_at: Utc::now(),
            srs: self.store.srs().map(str::to_string),
            layers,
        };
        let content = serde_json::to_string_pretty(&manifest)
            .map_err(|e| StoreError::unreadable(&self.path, e))?;

        let file = self
            .lock
            .as_mut()
            .ok_or_else(|| StoreError::ReadOnly(self.path.clone()))?;

        // Rewritten in place: renaming over the manifest would drop the lock
        let io = |e| StoreError::io(&self.path, e);
        file.set_len(0).map_err(io)?;
        file.seek(SeekFrom::Start(0)).map_err(io)?;
        file.write_all(content.as_bytes()).map_err(io)?;
        file.sync_all().map_err(io)?;
        Ok(())
    }

    fn write_prj(&self) -> Result<(), StoreError> {
        let prj = prj_path(&self.path);
        match self.store.srs() {
            Some(srs) => fs::write(&prj, srs).map_err(|e| StoreError::io(&prj, e)),
            None => Ok(()),
        }
    }

    /// Checks that an existing store could be replaced: its manifest must be
    /// lockable and no layer file may be read-only. Missing targets pass.
    pub fn check_writable(path: &Path) -> Result<(), StoreError> {
        if !path.exists() {
            return Ok(());
        }

        let locked = || StoreError::Locked(path.to_path_buf());

        if is_readonly(path) {
            return Err(locked());
        }
        {
            let file = match OpenOptions::new().read(true).write(true).open(path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::PermissionDenied => return Err(locked()),
                Err(e) => return Err(StoreError::io(path, e)),
            };
            file.try_lock_exclusive().map_err(|_| locked())?;
            // Lock released when `file` drops
        }

        // An unparsable manifest has no layers to protect
        let layer_count = read_manifest(path).map_or(0, |m| m.layers.len());
        for idx in 0..layer_count {
            let rows = rows_path(path, idx);
            if rows.exists() && is_readonly(&rows) {
                return Err(locked());
            }
        }

        Ok(())
    }

    /// Removes the manifest and every sidecar sharing its stem.
    ///
    /// Returns the number of files removed.
    pub fn delete_files(path: &Path) -> Result<usize, StoreError> {
        let mut removed = 0;

        if path.exists() {
            fs::remove_file(path).map_err(|e| StoreError::io(path, e))?;
            removed += 1;
        }

        let stem = file_stem(path);
        let dir = parent_dir(path);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(removed),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let candidate = entry.path();
            if candidate != path && is_sidecar(&name, &stem) {
                fs::remove_file(&candidate).map_err(|e| StoreError::io(&candidate, e))?;
                removed += 1;
            }
        }

        debug!(path = %path.display(), removed, "deleted persisted store files");
        Ok(removed)
    }
}

impl std::fmt::Debug for PersistedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistedStore")
            .field("path", &self.path)
            .field("access", &self.access)
            .field("layers", &self.store.layer_count())
            .finish()
    }
}

fn lock_manifest(path: &Path) -> Result<File, StoreError> {
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            return Err(StoreError::Locked(path.to_path_buf()))
        }
        Err(e) => return Err(StoreError::io(path, e)),
    };
    file.try_lock_exclusive()
        .map_err(|_| StoreError::Locked(path.to_path_buf()))?;
    Ok(file)
}

fn read_manifest(path: &Path) -> Result<Manifest, StoreError> {
    let mut content = String::new();
    File::open(path)
        .and_then(|mut f| f.read_to_string(&mut content))
        .map_err(|e| StoreError::io(path, e))?;

    let manifest: Manifest =
        serde_json::from_str(&content).map_err(|e| StoreError::unreadable(path, e))?;
    if manifest.format > FORMAT_VERSION {
        return Err(StoreError::unreadable(
            path,
            format!("unsupported format version {}", manifest.format),
        ));
    }
    Ok(manifest)
}

fn load_layer(path: &Path, idx: usize, entry: &LayerEntry) -> Result<Layer, StoreError> {
    let rows = rows_path(path, idx);
    let content = match fs::read_to_string(&rows) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound && entry.feature_count == 0 => String::new(),
        Err(e) => return Err(StoreError::unreadable(&rows, e)),
    };

    let checksum = blake3::hash(content.as_bytes()).to_hex().to_string();
    if checksum != entry.checksum {
        return Err(StoreError::unreadable(&rows, "checksum mismatch"));
    }

    let mut layer = Layer::new(entry.name.clone(), entry.geometry_type, entry.srs.clone());
    layer.set_schema(entry.fields.clone());
    layer.set_nonconformant_winding(entry.nonconformant_winding);

    let fields = entry.fields.fields();
    for (row_num, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let row: Row = serde_json::from_str(line).map_err(|e| {
            StoreError::unreadable(&rows, format!("line {}: {}", row_num + 1, e))
        })?;

        let mut values = Vec::with_capacity(fields.len());
        for defn in fields {
            let value = row.fields.get(&defn.name).cloned().unwrap_or_default();
            defn.check(&value).map_err(|e| {
                StoreError::unreadable(&rows, format!("line {}: {}", row_num + 1, e))
            })?;
            values.push(value);
        }

        layer.insert(Feature {
            fid: FeatureId::new(row_num as u64),
            geometry: row.geometry,
            values,
        });
    }

    if layer.feature_count() != entry.feature_count {
        warn!(
            layer = %entry.name,
            expected = entry.feature_count,
            found = layer.feature_count(),
            "feature count differs from manifest"
        );
    }

    layer.mark_clean();
    Ok(layer)
}

fn write_rows(rows: &Path, layer: &Layer) -> Result<(), StoreError> {
    let temp_path = rows.with_extension("jsonl.tmp");

    {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| StoreError::io(&temp_path, e))?;
        let mut writer = BufWriter::new(&file);

        let names: Vec<&str> = layer
            .schema()
            .fields()
            .iter()
            .map(|f| f.name.as_str())
            .collect();
        for feature in layer.features() {
            let row = Row {
                geometry: feature.geometry.clone(),
                fields: names
                    .iter()
                    .zip(&feature.values)
                    .filter(|(_, v)| !v.is_null())
                    .map(|(n, v)| (n.to_string(), v.clone()))
                    .collect(),
            };
            let line =
                serde_json::to_string(&row).map_err(|e| StoreError::unreadable(rows, e))?;
            writeln!(writer, "{}", line).map_err(|e| StoreError::io(&temp_path, e))?;
        }

        writer.flush().map_err(|e| StoreError::io(&temp_path, e))?;
        file.sync_all().map_err(|e| StoreError::io(&temp_path, e))?;
    }

    fs::rename(&temp_path, rows).map_err(|e| StoreError::io(rows, e))?;
    Ok(())
}

fn file_checksum(path: &Path) -> Result<String, StoreError> {
    let content = fs::read(path).map_err(|e| StoreError::io(path, e))?;
    Ok(blake3::hash(&content).to_hex().to_string())
}

fn is_readonly(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| m.permissions().readonly())
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Path of the rows file for layer `idx`
pub fn rows_path(path: &Path, idx: usize) -> PathBuf {
    parent_dir(path).join(format!("{}.{}.jsonl", file_stem(path), idx))
}

/// Path of the spatial reference sidecar
pub fn prj_path(path: &Path) -> PathBuf {
    parent_dir(path).join(format!("{}.prj", file_stem(path)))
}

/// Matches `<stem>.prj`, `<stem>.<n>.jsonl` and `<stem>.<n>.jsonl.tmp`
fn is_sidecar(name: &str, stem: &str) -> bool {
    let Some(rest) = name
        .strip_prefix(stem)
        .and_then(|r| r.strip_prefix('.'))
    else {
        return false;
    };
    if rest == "prj" {
        return true;
    }
    let index = rest
        .strip_suffix(".jsonl")
        .or_else(|| rest.strip_suffix(".jsonl.tmp"));
    index.is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}
