use std::path::{Component, Path, PathBuf};
use crate::config::ThreadMapping;

/// Rebuild a path from its components.
///
/// Drops `.` segments, repeated and trailing separators, and on Windows
/// turns `/` into the native separator, so that paths from the config file
/// and paths reported by the watcher compare equal.
pub fn normalize_path<P: AsRef<Path>>(path: P) -> PathBuf {
    path.as_ref()
        .components()
        .filter(|comp| !matches!(comp, Component::CurDir))
        .collect()
}

/// Find the mapping that owns a newly created path.
///
/// A mapping owns `path` when the path sits directly inside its source
/// directory; deeper descendants do not match. Mappings are tried in
/// configured order and the first hit wins.
pub fn match_mapping<P: AsRef<Path>>(path: P, mappings: &[ThreadMapping]) -> Option<usize> {
    let path = normalize_path(path);
    let parent = path.parent()?;

    // The root directory has an empty parent: it is never a created file
    if path.file_name().is_none() {
        return None;
    }

    mappings
        .iter()
        .position(|mapping| normalize_path(&mapping.source) == parent)
}
