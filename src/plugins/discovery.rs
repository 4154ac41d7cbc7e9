//! Plugin discovery - classifies candidates under the plugin root
//!
//! A single-unit plugin is a `<name>.plugin.yaml` manifest file; a package
//! plugin is a subdirectory carrying a `plugin.yaml` entry point. A leading
//! `_` on either excludes the candidate regardless of configuration.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::application::errors::{CycleError, PluginError};

/// Filesystem naming convention that disables a candidate unconditionally
pub const DISABLE_MARKER: char = '_';

/// Suffix marking a single-unit plugin manifest
pub const UNIT_SUFFIX: &str = ".plugin.yaml";

/// Entry-point file marking a directory as a package plugin
pub const PACKAGE_ENTRY: &str = "plugin.yaml";

/// Overlay configuration document, lives inside the plugin root
pub const OVERLAY_FILE: &str = "plugins.yaml";

/// Names never treated as plugin candidates
const RESERVED_NAMES: &[&str] = &["base", "manager", "plugins"];

/// How a candidate is laid out on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Unit,
    Package,
}

/// A loadable plugin candidate produced by discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub source_path: PathBuf,
    pub source_kind: SourceKind,
    /// Cheap content signature used for change detection and carry-over
    pub signature: u64,
}

/// Per-plugin manifest artifact.
///
/// The manifest is the discovery unit; the implementation itself comes from
/// the factory registry. `entry` names the factory to construct, defaulting
/// to the candidate name.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PluginManifest {
    pub entry: Option<String>,
    pub description: Option<String>,
}

impl PluginManifest {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PluginError> {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| PluginError::Load(format!("Failed to read manifest: {}", e)))?;

        serde_yaml::from_str(&content)
            .map_err(|e| PluginError::Load(format!("Failed to parse manifest: {}", e)))
    }
}

/// Scan the plugin root and produce the ordered candidate set.
///
/// A missing root is fatal to the reload cycle. Unreadable individual
/// entries are skipped with a warning.
pub fn discover(root: impl AsRef<Path>) -> Result<Vec<Candidate>, CycleError> {
    let root = root.as_ref();

    if !root.is_dir() {
        return Err(CycleError::Discovery(format!(
            "plugin root does not exist: {}",
            root.display()
        )));
    }

    let entries = std::fs::read_dir(root)
        .map_err(|e| CycleError::Discovery(format!("failed to read plugin root: {}", e)))?;

    let mut candidates = Vec::new();

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("Failed to read directory entry: {}", e);
                continue;
            }
        };

        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if file_name.starts_with(DISABLE_MARKER) || file_name.starts_with('.') {
            tracing::debug!("Skipping disabled candidate: {}", file_name);
            continue;
        }

        let candidate = if path.is_dir() {
            if !path.join(PACKAGE_ENTRY).is_file() {
                continue;
            }
            Some((file_name.to_string(), SourceKind::Package))
        } else if let Some(name) = file_name.strip_suffix(UNIT_SUFFIX) {
            Some((name.to_string(), SourceKind::Unit))
        } else {
            None
        };

        let Some((name, kind)) = candidate else {
            continue;
        };

        if is_reserved(&name) {
            tracing::debug!("Skipping reserved name: {}", name);
            continue;
        }

        candidates.push(Candidate {
            signature: source_signature(&path, kind),
            name,
            source_path: path,
            source_kind: kind,
        });
    }

    // Lexicographic order makes conflict resolution deterministic
    candidates.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(candidates)
}

fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// Signature over a candidate's files: mtime plus size, order-stable.
///
/// Zero when nothing is readable, which still compares unequal to any
/// previously recorded signature of a readable source.
pub fn source_signature(path: &Path, kind: SourceKind) -> u64 {
    let mut hasher = DefaultHasher::new();
    match kind {
        SourceKind::Unit => hash_file(path, &mut hasher),
        SourceKind::Package => hash_dir(path, &mut hasher),
    }
    hasher.finish()
}

fn hash_file(path: &Path, hasher: &mut DefaultHasher) {
    if let Ok(meta) = std::fs::metadata(path) {
        meta.len().hash(hasher);
        if let Ok(modified) = meta.modified() {
            if let Ok(d) = modified.duration_since(std::time::UNIX_EPOCH) {
                d.as_nanos().hash(hasher);
            }
        }
    }
}

fn hash_dir(dir: &Path, hasher: &mut DefaultHasher) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    paths.sort();
    for path in paths {
        path.hash(hasher);
        if path.is_dir() {
            hash_dir(&path, hasher);
        } else {
            hash_file(&path, hasher);
        }
    }
}
