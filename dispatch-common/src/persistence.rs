//! Durable snapshot of queue state: a single JSON object written
//! atomically (temp file + rename) so a crash mid-write never leaves a
//! truncated file behind. Grounded in the "key-value file" described for
//! the queue's `pending`/`confirmationMap`/`idCounter` triple; `npsgd`
//! itself has no direct analog (the Python source never persists across
//! restarts), so the shape here follows the specification rather than a
//! source file.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;
use crate::task::TaskDict;

/// The entire durable state of the queue daemon, keyed exactly as
/// described: `pending`, `confirmationMap`, `idCounter`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub pending: Vec<TaskDict>,
    #[serde(rename = "confirmationMap")]
    pub confirmation_map: HashMap<String, TaskDict>,
    #[serde(rename = "idCounter")]
    pub id_counter: u64,
}

/// Load a snapshot from `path`. A missing file yields an empty snapshot
/// (first run); a corrupt file is reported so the caller can log a
/// warning and fall back to an empty snapshot rather than refusing to
/// start.
pub fn load(path: &Path) -> Result<Snapshot, PersistenceError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Snapshot::default()),
        Err(err) => Err(PersistenceError::Io(err)),
    }
}

/// Write `snapshot` to `path` atomically: serialize to a sibling temp
/// file, flush, then rename over the target. The rename is atomic on the
/// same filesystem, so readers never observe a partially-written file.
pub fn save(path: &Path, snapshot: &Snapshot) -> Result<(), PersistenceError> {
    let tmp_path = path.with_extension("tmp");
    let body = serde_json::to_vec_pretty(snapshot)?;

    let mut file = std::fs::File::create(&tmp_path)?;
    file.write_all(&body)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
