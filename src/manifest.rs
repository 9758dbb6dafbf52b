//! Script-order manifests.
//!
//! Each `order.yaml` lists script file names relative to its own directory:
//!
//! ```yaml
//! script-order:
//!   - install.sh
//!   - configure.sh
//! ```
//!
//! A missing, empty, or malformed manifest contributes zero scripts; the
//! agent must keep running on hosts with half-written appstacks.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Default, Deserialize)]
struct OrderFile {
    #[serde(rename = "script-order", default)]
    script_order: Option<Vec<String>>,
}

/// Resolve the scripts named by a manifest, in manifest order, as absolute
/// paths next to the manifest itself.
pub fn scripts(manifest: &Path) -> Vec<PathBuf> {
    let dir = match manifest.parent() {
        Some(dir) => dir,
        None => return Vec::new(),
    };
    let content = match std::fs::read_to_string(manifest) {
        Ok(content) => content,
        Err(e) => {
            warn!("skipping unreadable manifest {}: {e}", manifest.display());
            return Vec::new();
        }
    };
    let order: OrderFile = match serde_yaml::from_str(&content) {
        Ok(order) => order,
        Err(e) => {
            warn!("skipping malformed manifest {}: {e}", manifest.display());
            return Vec::new();
        }
    };
    order
        .script_order
        .unwrap_or_default()
        .iter()
        .map(|name| dir.join(name))
        .collect()
}
