use std::path::{Path, PathBuf};
use std::sync::Arc;

use color_eyre::{Result, eyre::bail};

use stagehand::instance::Backend;

pub mod execute;
pub mod export;
pub mod stage;
pub mod status;

/// Resolve an instance reference: either an instance id under the backend's
/// instances directory, or a path to a raw working directory.
pub fn resolve_instance_dir(backend: &Arc<Backend>, reference: &str) -> Result<PathBuf> {
    let as_path = Path::new(reference);
    if as_path.is_dir() {
        return Ok(as_path.to_path_buf());
    }
    let under_home = backend.instances_dir.join(reference);
    if under_home.is_dir() {
        return Ok(under_home);
    }
    bail!("no staged instance named {reference:?} (looked in {:?})", backend.instances_dir)
}
