//! Finalizer (spec.md §4.F).
//!
//! Generalizes the teacher's `verify_checksum` (hardcoded SHA-256) to the
//! full `HashType` set via `hash.rs`, and adds the collision-safe rename and
//! overwrite policy spec.md requires that the teacher (which always
//! overwrites in place) doesn't implement at all.

use std::path::{Path, PathBuf};

use crate::error::{Result, TurboDlError};
use crate::hash;
use crate::model::JobPaths;
use crate::options::HashType;

/// Runs the finalization sequence: optional hash verification, then
/// collision-safe rename from the sentinel path to the final destination.
/// Returns the path the file actually landed at.
pub fn finalize(
    paths: &JobPaths,
    overwrite: bool,
    expected_hash: Option<&str>,
    hash_type: HashType,
) -> Result<PathBuf> {
    if let Some(expected) = expected_hash {
        if let Err(err) = hash::verify_file(&paths.sentinel, expected, hash_type) {
            // spec.md §8 property 7: "no file appears at destination_path".
            let _ = std::fs::remove_file(&paths.sentinel);
            return Err(err);
        }
    }

    let final_path = resolve_final_path(&paths.destination, overwrite)?;
    atomic_rename(&paths.sentinel, &final_path)?;
    Ok(final_path)
}

/// Determines the final path: if `destination` exists and `overwrite` is
/// true, it's removed first and `destination` is reused. Otherwise finds the
/// smallest `k >= 1` such that `<stem>_<k><ext>` doesn't exist
/// (spec.md §4.F, property 6 / scenario S6).
fn resolve_final_path(destination: &Path, overwrite: bool) -> Result<PathBuf> {
    if !destination.exists() {
        return Ok(destination.to_path_buf());
    }

    if overwrite {
        std::fs::remove_file(destination)?;
        return Ok(destination.to_path_buf());
    }

    let stem = destination
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = destination.extension().map(|e| e.to_string_lossy().into_owned());
    let parent = destination.parent().unwrap_or_else(|| Path::new(""));

    let mut k = 1u64;
    loop {
        let candidate_name = match &ext {
            Some(ext) => format!("{stem}_{k}.{ext}"),
            None => format!("{stem}_{k}"),
        };
        let candidate = parent.join(candidate_name);
        if !candidate.exists() {
            return Ok(candidate);
        }
        k += 1;
    }
}

fn atomic_rename(from: &Path, to: &Path) -> Result<()> {
    std::fs::rename(from, to).map_err(|e| {
        if let Some(code) = e.raw_os_error() {
            tracing::error!(code, "rename from sentinel path failed");
        }
        TurboDlError::from(e)
    })
}
