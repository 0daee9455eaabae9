//! Commands that inspect or maintain existing vector files

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use super::output::Output;
use crate::domain::{Coord, FeatureId, FieldValue};
use crate::edit::{EditSession, LayerInfo};
use crate::storage::{Access, Config, Locator, Registry};

fn open_session(config: &Config, path: &Path, access: Access) -> Result<EditSession> {
    let mut session = EditSession::new(Registry::global().clone(), config.editing.options());
    session
        .open_vector_with(&Locator::Persisted(path.to_path_buf()), access)
        .with_context(|| format!("Failed to open vector: {}", path.display()))?;
    Ok(session)
}

#[derive(Serialize)]
struct VectorSummary {
    path: String,
    srs: Option<String>,
    layers: Vec<LayerInfo>,
}

/// Show layers, geometry types, counts and extents
pub fn info(output: &Output, config: &Config, path: &Path) -> Result<()> {
    let mut session = open_session(config, path, Access::ReadOnly)?;
    let srs = session.store().srs().map(str::to_string);

    let mut layers = Vec::new();
    for name in session.layer_names() {
        layers.push(session.open_layer(name.as_str(), None, None)?);
    }
    session.close_vector()?;
    output.verbose_ctx("info", &format!("Read {} layer(s)", layers.len()));

    if output.is_json() {
        output.data(&VectorSummary {
            path: path.display().to_string(),
            srs,
            layers,
        });
        return Ok(());
    }

    println!("{}", path.display());
    println!("SRS: {}", srs.as_deref().unwrap_or("-"));
    println!();
    println!("{:<20} {:<12} {:>8}  EXTENT", "LAYER", "TYPE", "FEATURES");
    println!("{}", "-".repeat(70));
    for layer in &layers {
        let extent = layer
            .extent
            .map(|e| e.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<12} {:>8}  {}",
            layer.name, layer.geometry_type, layer.feature_count, extent
        );
        if layer.nonconformant_winding {
            output.warn(&format!("layer '{}' has nonconformant ring winding", layer.name));
        }
    }

    Ok(())
}

#[derive(Serialize)]
struct FeatureRecord {
    layer: String,
    fid: FeatureId,
    fields: BTreeMap<String, FieldValue>,
    parts: Vec<Vec<Coord>>,
}

/// Print every feature with its fields and coordinates
pub fn dump(output: &Output, config: &Config, path: &Path, layer: Option<&str>) -> Result<()> {
    let mut session = open_session(config, path, Access::ReadOnly)?;

    let names = match layer {
        Some(name) => vec![name.to_string()],
        None => session.layer_names(),
    };

    let mut records = Vec::new();
    for name in names {
        let info = session
            .open_layer(name.as_str(), None, None)
            .with_context(|| format!("Layer not found: {}", name))?;
        for feature in session.features() {
            let fields = info
                .fields
                .iter()
                .zip(feature.values)
                .map(|(defn, value)| (defn.name.clone(), value))
                .collect();
            records.push(FeatureRecord {
                layer: info.name.clone(),
                fid: feature.fid,
                fields,
                parts: feature.geometry.map(|g| g.parts).unwrap_or_default(),
            });
        }
    }
    session.close_vector()?;

    if output.is_json() {
        output.data(&records);
        return Ok(());
    }

    for record in &records {
        let fields: Vec<String> = record
            .fields
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        let parts: Vec<String> = record
            .parts
            .iter()
            .map(|part| {
                part.iter()
                    .map(Coord::to_string)
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect();
        let fid = record.fid.to_string();
        let fields = fields.join(" ");
        let parts = parts.join(" | ");
        output.row(&[record.layer.as_str(), fid.as_str(), fields.as_str(), parts.as_str()]);
    }

    Ok(())
}

/// Delete one feature and flush the file
pub fn delete_feature(
    output: &Output,
    config: &Config,
    path: &Path,
    layer: &str,
    fid: u64,
) -> Result<()> {
    let mut session = open_session(config, path, Access::Update)?;
    session
        .open_layer(layer, None, None)
        .with_context(|| format!("Layer not found: {}", layer))?;

    let fid = FeatureId::new(fid);
    let outcome = session
        .delete_feature(fid)
        .with_context(|| format!("Failed to delete feature {} from {}", fid, layer))?;
    session.sync_to_disk()?;
    session.close_vector()?;

    if output.is_json() {
        output.data(&serde_json::json!({
            "deleted": fid,
            "layer": layer,
            "layer_empty": outcome.layer_empty,
        }));
    } else {
        output.success(&format!("Deleted feature {} from {}", fid, layer));
        if outcome.layer_empty {
            println!("Layer '{}' is now empty.", layer);
        }
    }

    Ok(())
}

/// Renumber feature ids densely in every layer
pub fn repack(output: &Output, config: &Config, path: &Path) -> Result<()> {
    let mut session = open_session(config, path, Access::Update)?;

    let mut moved = 0;
    for name in session.layer_names() {
        session.open_layer(name.as_str(), None, None)?;
        let n = session.repack()?;
        output.verbose_ctx("repack", &format!("{}: {} id(s) moved", name, n));
        moved += n;
    }
    session.close_vector()?;

    if output.is_json() {
        output.data(&serde_json::json!({ "moved": moved }));
    } else {
        output.success(&format!("Repacked {}: {} feature id(s) moved", path.display(), moved));
    }

    Ok(())
}

/// Show the effective configuration or its location
pub fn show_config(output: &Output, config: &Config, path_only: bool) -> Result<()> {
    let location = config.source.clone().or_else(Config::default_path);

    if path_only {
        let location = location
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        if output.is_json() {
            output.data(&serde_json::json!({ "path": location }));
        } else {
            println!("{}", location);
        }
        return Ok(());
    }

    if output.is_json() {
        output.data(config);
    } else {
        let rendered = toml::to_string_pretty(config).context("Failed to serialize config")?;
        print!("{}", rendered);
    }
    Ok(())
}
