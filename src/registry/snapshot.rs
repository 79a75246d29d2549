//! Registry snapshot persistence
//!
//! A single JSON file holds the serialized record map plus a monotonic
//! generation counter. Writes go to a temporary sibling and rename over the
//! previous file, keeping the prior generation as a `.prev` rotation so a
//! torn write never destroys the last good snapshot.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use super::AgentRecord;

/// Errors from snapshot I/O
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Filesystem failure
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure
    #[error("snapshot serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// On-disk snapshot layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    /// Monotonic generation, bumped on every write
    pub generation: u64,
    /// Epoch millis at write time
    pub saved_at: u64,
    /// Serialized record map
    pub records: Vec<AgentRecord>,
}

/// Writes a snapshot atomically, rotating the previous file
///
/// # Errors
/// Returns [`SnapshotError`] on serialization or filesystem failure.
pub fn write(path: &Path, file: &SnapshotFile) -> Result<(), SnapshotError> {
    let payload = serde_json::to_vec_pretty(file)?;

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, payload)?;

    if path.exists() {
        let prev = path.with_extension("prev");
        // Best effort: losing the rotation is acceptable, losing the
        // current generation is not.
        let _ = std::fs::rename(path, prev);
    }
    std::fs::rename(&tmp, path)?;
    debug!(generation = file.generation, path = %path.display(), "snapshot written");
    Ok(())
}

/// Loads the latest snapshot, falling back to the rotated previous one
#[must_use]
pub fn load(path: &Path) -> Option<SnapshotFile> {
    read_file(path).or_else(|| read_file(&path.with_extension("prev")))
}

fn read_file(path: &Path) -> Option<SnapshotFile> {
    let bytes = std::fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}
