//! # Command-Line Interface
//!
//! User-facing CLI commands and output formatting.
//!
//! ## Commands
//!
//! | Command | Purpose |
//! |---------|---------|
//! | `info` | Layers, geometry types, feature counts, extents |
//! | `dump` | Features with fields and coordinates |
//! | `draw` | Run one drawing gesture and save it |
//! | `delete-feature` | Remove a feature and flush the file |
//! | `repack` | Renumber feature ids densely |
//! | `config` | Show the effective configuration |
//!
//! ## Output Formats
//!
//! All commands support `--format` flag:
//! - `text` (default) - Human-readable output
//! - `json` - Machine-parseable JSON
//!
//! ## Verbose Mode
//!
//! Use `--verbose` (or `-v`) for debug output; logs go to stderr and honour
//! `VECEDIT_LOG`:
//! ```bash
//! VECEDIT_LOG=vecedit=trace vecedit info roads.vec
//! ```
//!
//! ## Entry Point
//!
//! Call [`run()`] to parse arguments and execute the appropriate command.

mod app;
mod draw;
mod output;
mod vector;

pub use app::{run, Cli, Commands, LOG_ENV};
pub use output::{Output, OutputFormat};
