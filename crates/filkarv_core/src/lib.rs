//! Recursive binary analysis and carving engine.
//!
//! Given an arbitrary file, the engine identifies embedded formats,
//! carves out their spans, extracts their contents and recursively scans
//! everything it produces. The result is a tree of meta-directories on
//! disk mirroring the containment structure of the input.

pub mod carve;
pub mod config;
pub mod identify;
pub mod meta_directory;
pub mod parser;
pub mod parsers;
pub mod registry;
pub mod scheduler;
pub(crate) mod tool;

pub use filkarv_types as types;

use eyre::WrapErr;
use std::path::Path;
use std::sync::Arc;

/// Scan one input file with the built-in parsers.
///
/// Creates the meta-directory tree under the configured unpack directory
/// and returns a report with the root meta-directory path. Individual
/// parser failures never fail the scan.
pub fn scan(
    env: Arc<config::ScanEnvironment>,
    input: &Path,
) -> eyre::Result<scheduler::ScanReport> {
    let registry = Arc::new(
        registry::ParserRegistry::new(parsers::default_parsers())
            .wrap_err("Failed to build parser registry")?,
    );
    scheduler::Scheduler::new(env, registry).scan(input)
}
