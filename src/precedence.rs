//! Layered-configuration walk.
//!
//! One traversal primitive serves two purposes: *lookup* mode discovers the
//! effective ordered set of files matching a pattern, and *merge* mode
//! materializes `overrides` layers by copying each override file onto its
//! non-override destination. Keeping both in a single walk means the
//! precedence semantics are defined exactly once.
//!
//! Sibling directories are always visited in layer order: `extends` layers
//! first, then `stack-` layers, then `overrides` layers, then everything
//! else, ties broken by name. Files directly inside a directory are visited
//! before its subdirectories. Traversal uses an explicit work stack, so
//! arbitrarily deep override hierarchies cannot exhaust the call stack.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

/// Category a directory belongs to, derived from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Extends,
    Stack,
    Overrides,
    Plain,
}

impl Layer {
    pub fn of(name: &str) -> Self {
        if name.contains("extends") {
            Layer::Extends
        } else if name.contains("stack-") {
            Layer::Stack
        } else if name.contains("overrides") {
            Layer::Overrides
        } else {
            Layer::Plain
        }
    }

    const fn rank(self) -> u8 {
        match self {
            Layer::Extends => 0,
            Layer::Stack => 1,
            Layer::Overrides => 2,
            Layer::Plain => 3,
        }
    }
}

const VCS_DIRS: &[&str] = &[".git", ".hg", ".svn"];

/// Lookup mode: collect matching files in precedence order without touching
/// the tree. Overrides layers are not descended into.
pub fn resolve(root: &Path, pattern: &str, label: &str) -> anyhow::Result<Vec<PathBuf>> {
    walk(root, pattern, label, false)
}

/// Merge mode: walk the whole tree (overrides layers included) and copy
/// every matching file found under an overrides layer onto its destination,
/// overwriting unconditionally. Returns the copied source paths in
/// traversal order.
pub fn apply_overrides(root: &Path, pattern: &str, label: &str) -> anyhow::Result<Vec<PathBuf>> {
    walk(root, pattern, label, true)
}

fn walk(
    root: &Path,
    pattern: &str,
    label: &str,
    apply_overrides: bool,
) -> anyhow::Result<Vec<PathBuf>> {
    let pattern = pattern.to_lowercase();
    let label = label.to_lowercase();
    let mut matched = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut files = Vec::new();
        let mut subdirs = Vec::new();
        for entry in
            fs::read_dir(&dir).with_context(|| format!("reading directory {}", dir.display()))?
        {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                subdirs.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }

        files.sort();
        for file in files {
            let path_text = file.to_string_lossy().to_lowercase();
            if !pattern.is_empty() && !path_text.contains(&pattern) {
                continue;
            }
            if !label.is_empty() && !path_text.contains(&label) {
                continue;
            }
            if apply_overrides {
                // Only files sitting under an overrides layer participate
                // in the merge; everything else is already in place.
                let Some(dest) = override_destination(root, &file) else {
                    continue;
                };
                copy_over(&file, &dest)?;
                matched.push(file);
            } else {
                matched.push(file);
            }
        }

        subdirs.retain(|sub| {
            let name = sub
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if VCS_DIRS.contains(&name.as_str()) {
                return false;
            }
            apply_overrides || Layer::of(&name) != Layer::Overrides
        });
        subdirs.sort_by_key(|sub| {
            let name = sub
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            (Layer::of(&name).rank(), name)
        });
        // Reversed so the lowest-ranked sibling is popped first.
        for sub in subdirs.into_iter().rev() {
            pending.push(sub);
        }
    }

    Ok(matched)
}

/// Destination for an override file: its path with the first (leftmost)
/// overrides directory component removed. Returns None when no directory
/// component of the root-relative path is an overrides layer — a *file*
/// merely named "overrides" does not count.
fn override_destination(root: &Path, file: &Path) -> Option<PathBuf> {
    let rel = file.strip_prefix(root).ok()?;
    let components: Vec<OsString> = rel.iter().map(OsString::from).collect();
    let (dirs, name) = components.split_at(components.len().checked_sub(1)?);
    let skip = dirs
        .iter()
        .position(|c| Layer::of(&c.to_string_lossy()) == Layer::Overrides)?;

    let mut dest = root.to_path_buf();
    for (i, component) in dirs.iter().enumerate() {
        if i != skip {
            dest.push(component);
        }
    }
    dest.push(&name[0]);
    Some(dest)
}

fn copy_over(source: &Path, dest: &Path) -> anyhow::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    fs::copy(source, dest).with_context(|| {
        format!("copying {} over {}", source.display(), dest.display())
    })?;
    debug!("override applied: {} -> {}", source.display(), dest.display());
    Ok(())
}
