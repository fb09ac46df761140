//! Persistent marker files
//!
//! Markers are presence-only sentinels under `.ais.markers/` at a mountpath
//! root, signaling work (rebalance, resilver) that must resume after a
//! restart. When a mountpath leaves the Available set its markers are copied
//! to a surviving mountpath, best effort.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

use tessera_common::fsutil;

/// Directory holding marker files at a mountpath root
pub const MARKERS_DIR: &str = ".ais.markers";

/// Known marker kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Marker {
    /// Cluster-wide rebalance was interrupted
    Rebalance,
    /// Local resilver was interrupted
    Resilver,
}

impl Marker {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Rebalance => "rebalance",
            Self::Resilver => "resilver",
        }
    }
}

fn marker_path(root: &str, marker: Marker) -> PathBuf {
    Path::new(root).join(MARKERS_DIR).join(marker.as_str())
}

/// Drop a marker on a mountpath root
pub fn place(root: &str, marker: Marker) -> std::io::Result<()> {
    let path = marker_path(root, marker);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, b"")
}

/// Remove a marker; absence is not an error
pub fn remove(root: &str, marker: Marker) -> std::io::Result<()> {
    match fs::remove_file(marker_path(root, marker)) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Check for a marker
#[must_use]
pub fn exists(root: &str, marker: Marker) -> bool {
    marker_path(root, marker).exists()
}

/// Copy every marker from a departing mountpath root to the first surviving
/// root that accepts all of them. Failures are logged; the departing copy is
/// cleared regardless, so a marker is never double-counted.
pub fn migrate<'a>(survivors: impl Iterator<Item = &'a str>, from: &str) {
    let src_dir = Path::new(from).join(MARKERS_DIR);
    let entries = match fs::read_dir(&src_dir) {
        Ok(e) => e.flatten().collect::<Vec<_>>(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            error!(dir = %src_dir.display(), %e, "failed to read markers directory");
            return;
        }
    };
    if entries.is_empty() {
        return;
    }
    'survivors: for root in survivors {
        for entry in &entries {
            let name = entry.file_name();
            let to = Path::new(root).join(MARKERS_DIR).join(&name);
            if let Err(e) = fsutil::copy_file(entry.path(), &to) {
                warn!(
                    from = %entry.path().display(),
                    to = %to.display(),
                    %e,
                    "failed to migrate marker"
                );
                continue 'survivors;
            }
        }
        break;
    }
    if let Err(e) = fs::remove_dir_all(&src_dir) {
        warn!(dir = %src_dir.display(), %e, "failed to clear markers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_place_exists_remove() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_str().unwrap();

        assert!(!exists(root, Marker::Rebalance));
        place(root, Marker::Rebalance).unwrap();
        assert!(exists(root, Marker::Rebalance));
        assert!(!exists(root, Marker::Resilver));

        remove(root, Marker::Rebalance).unwrap();
        assert!(!exists(root, Marker::Rebalance));
        // removing an absent marker is fine
        remove(root, Marker::Rebalance).unwrap();
    }

    #[test]
    fn test_migrate_to_survivor() {
        let from = tempdir().unwrap();
        let to = tempdir().unwrap();
        let from_root = from.path().to_str().unwrap();
        let to_root = to.path().to_str().unwrap();

        place(from_root, Marker::Rebalance).unwrap();
        place(from_root, Marker::Resilver).unwrap();

        migrate(std::iter::once(to_root), from_root);

        assert!(exists(to_root, Marker::Rebalance));
        assert!(exists(to_root, Marker::Resilver));
        assert!(!exists(from_root, Marker::Rebalance));
        assert!(!exists(from_root, Marker::Resilver));
    }

    #[test]
    fn test_migrate_without_markers_is_noop() {
        let from = tempdir().unwrap();
        let to = tempdir().unwrap();
        migrate(
            std::iter::once(to.path().to_str().unwrap()),
            from.path().to_str().unwrap(),
        );
        assert!(!to.path().join(MARKERS_DIR).exists());
    }
}
