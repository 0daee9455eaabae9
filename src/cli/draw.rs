//! The `draw` command: one gesture per invocation, saved to a file

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;

use super::output::Output;
use crate::domain::Coord;
use crate::edit::{ElementMetadata, GestureKind, GestureRequest, Orchestrator, Services};
use crate::storage::{Config, Registry};

#[derive(Args)]
pub struct DrawArgs {
    /// What to draw: point, line, polygon or annotation
    pub kind: GestureKind,

    /// Vector file to write
    pub out: PathBuf,

    /// Layer to draw into (created when missing)
    #[arg(long)]
    pub layer: String,

    /// One feature's coordinates as "x,y x,y ...", rings separated by '|'.
    /// Repeat for several features.
    #[arg(long = "coords", required = true)]
    pub coords: Vec<String>,

    /// Annotation text, one per --coords
    #[arg(long)]
    pub text: Vec<String>,

    /// Spatial reference of a new layer (defaults to editing.default_srs)
    #[arg(long)]
    pub srs: Option<String>,

    /// Spatial reference of the given coordinates
    #[arg(long)]
    pub source_srs: Option<String>,

    /// Style category (defaults to the layer name)
    #[arg(long)]
    pub category: Option<String>,

    /// Keep the existing content of OUT and add to it
    #[arg(long)]
    pub append: bool,
}

/// Parses "x,y x,y | x,y ..." into rings of coordinates
fn parse_rings(raw: &str) -> Result<Vec<Vec<Coord>>> {
    let rings: Vec<Vec<Coord>> = raw
        .split('|')
        .map(|ring| {
            ring.split_whitespace()
                .map(|c| c.parse::<Coord>().map_err(|e| anyhow!(e)))
                .collect::<Result<Vec<_>>>()
        })
        .collect::<Result<_>>()?;

    if rings.iter().all(Vec::is_empty) {
        bail!("No coordinates in '{}'", raw);
    }
    Ok(rings)
}

pub fn run(output: &Output, config: &Config, args: DrawArgs) -> Result<()> {
    let srs = args
        .srs
        .clone()
        .unwrap_or_else(|| config.editing.default_srs.clone());
    let mut request = GestureRequest::new(args.kind, args.layer.clone(), srs);
    if let Some(source) = &args.source_srs {
        request = request.with_source_srs(source.clone());
    }
    if let Some(category) = &args.category {
        request = request.with_category(category.clone());
    }

    let mut orch = Orchestrator::new(
        Registry::global().clone(),
        config.editing.options(),
        Services::from_config(config),
    );

    let scratch = if args.append && args.out.exists() {
        orch.begin_from(&args.out, request)
            .with_context(|| format!("Failed to load {}", args.out.display()))?
    } else {
        orch.begin(request)?
    };
    output.verbose_ctx("draw", &format!("Editing in scratch store {}", scratch));

    if let Err(e) = draw_features(output, &mut orch, &args) {
        orch.cancel();
        return Err(e);
    }

    let metadata = match orch.save(&args.out) {
        Ok(metadata) => metadata,
        Err(e) => {
            orch.cancel();
            return Err(e).with_context(|| format!("Failed to save {}", args.out.display()));
        }
    };

    report(output, &metadata);
    Ok(())
}

fn draw_features(output: &Output, orch: &mut Orchestrator, args: &DrawArgs) -> Result<()> {
    if args.kind == GestureKind::Annotation && args.text.len() != args.coords.len() {
        bail!(
            "Annotations need one --text per --coords ({} given, {} expected)",
            args.text.len(),
            args.coords.len()
        );
    }

    for (idx, raw) in args.coords.iter().enumerate() {
        let rings = parse_rings(raw)?;

        match args.kind {
            GestureKind::Point => {
                for coord in rings.into_iter().flatten() {
                    orch.add_point(coord)?;
                }
            }
            GestureKind::Annotation => {
                let coord = match rings.as_slice() {
                    [ring] if ring.len() == 1 => ring[0],
                    _ => bail!("An annotation takes exactly one coordinate, got '{}'", raw),
                };
                orch.add_annotation(coord, &args.text[idx])?;
            }
            GestureKind::Line | GestureKind::Polygon => {
                for (part, ring) in rings.into_iter().enumerate() {
                    if part > 0 {
                        orch.begin_part()?;
                    }
                    for coord in ring {
                        orch.add_point(coord)?;
                    }
                }
                let fid = orch
                    .finish_feature()
                    .with_context(|| format!("Invalid {} '{}'", args.kind, raw))?;
                if let Some(fid) = fid {
                    output.verbose_ctx("draw", &format!("Committed feature {}", fid));
                }
            }
        }
    }

    Ok(())
}

fn report(output: &Output, metadata: &ElementMetadata) {
    if output.is_json() {
        output.data(metadata);
        return;
    }

    output.success(&format!(
        "Saved {} ({} layer(s), {} feature(s))",
        metadata.path.display(),
        metadata.layer_count,
        metadata.feature_count
    ));
    if let Some(extent) = &metadata.extent {
        println!("Extent: {}", extent);
    }
    if let Some(style) = &metadata.style {
        println!("Style: {}", style);
    }
}
