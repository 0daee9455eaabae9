//! Main CLI application structure

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use super::draw::{self, DrawArgs};
use super::output::{Output, OutputFormat};
use super::vector;
use crate::storage::{Config, CONFIG_ENV};

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "VECEDIT_LOG";

#[derive(Parser)]
#[command(name = "vecedit")]
#[command(author, version, about = "Draw and edit georeferenced vector files")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output format (defaults to output.format from the config)
    #[arg(long, short = 'f', global = true)]
    pub format: Option<OutputFormat>,

    /// Enable verbose output for debugging
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Config file to use instead of the default location
    #[arg(long, global = true, env = CONFIG_ENV)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show layers, feature counts and extents of a vector file
    Info {
        /// Vector file
        path: PathBuf,
    },

    /// Print features with their fields and coordinates
    Dump {
        /// Vector file
        path: PathBuf,

        /// Only this layer
        #[arg(long)]
        layer: Option<String>,
    },

    /// Draw features and save them to a vector file
    ///
    /// Examples:
    ///   vecedit draw point wells.vec --layer wells --coords "1,2 3,4"
    ///   vecedit draw polygon parcels.vec --layer parcels --coords "0,0 0,1 1,1 1,0"
    ///   vecedit draw annotation labels.vec --layer labels --coords "5,5" --text "Town hall"
    Draw(DrawArgs),

    /// Delete a feature by id
    DeleteFeature {
        /// Vector file
        path: PathBuf,

        /// Layer name
        layer: String,

        /// Feature id
        fid: u64,
    },

    /// Renumber feature ids densely after deletions
    Repack {
        /// Vector file
        path: PathBuf,
    },

    /// Show the effective configuration
    Config {
        /// Print only the config file location
        #[arg(long)]
        path: bool,
    },
}

/// Installs the stderr log subscriber.
///
/// `VECEDIT_LOG` takes precedence; otherwise `warn`, or `debug` when verbose.
fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback));

    // A subscriber may already be installed when embedded
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}

/// Main entry point for the CLI
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Config::load(cli.config.as_deref())?;
    let format = cli
        .format
        .unwrap_or_else(|| OutputFormat::from(config.output.format));
    let output = Output::new(format, cli.verbose);

    output.verbose("vecedit starting");
    if let Some(source) = &config.source {
        output.verbose(&format!("Loaded config from {}", source.display()));
    }

    match cli.command {
        Commands::Info { path } => vector::info(&output, &config, &path)?,
        Commands::Dump { path, layer } => vector::dump(&output, &config, &path, layer.as_deref())?,
        Commands::Draw(args) => {
            output.verbose_ctx(
                "draw",
                &format!("{} into {} ({})", args.kind, args.layer, args.out.display()),
            );
            draw::run(&output, &config, args)?
        }
        Commands::DeleteFeature { path, layer, fid } => {
            vector::delete_feature(&output, &config, &path, &layer, fid)?
        }
        Commands::Repack { path } => vector::repack(&output, &config, &path)?,
        Commands::Config { path } => vector::show_config(&output, &config, path)?,
    }

    output.verbose("Command completed successfully");
    Ok(())
}
