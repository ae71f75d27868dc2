//! Injected host capabilities (spec.md §9): temp directories, free-memory
//! probing, and RAM-backed filesystem detection. The core never calls an OS
//! primitive directly for these — it goes through this trait, so tests can
//! substitute a fake without touching the real filesystem or `/proc`.

use std::path::Path;

/// Capabilities the controller needs from its host that aren't part of the
/// core download algorithm itself.
pub trait Environment: Send + Sync {
    /// Total physical RAM in bytes, used by the ring buffer's capacity
    /// policy (spec.md §4.C: "20% of system RAM").
    fn total_memory_bytes(&self) -> u64;

    /// Whether `path`'s filesystem is RAM-backed (tmpfs/ramfs on Linux),
    /// used to resolve `use_ram_buffer = auto` (spec.md §4.B).
    fn is_ram_backed(&self, path: &Path) -> bool;
}

/// The real implementation, backed by `sysinfo` and a `/proc/mounts` scan.
pub struct SystemEnvironment {
    total_memory_bytes: u64,
}

impl SystemEnvironment {
    pub fn new() -> Self {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        Self {
            total_memory_bytes: sys.total_memory(),
        }
    }
}

impl Default for SystemEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for SystemEnvironment {
    fn total_memory_bytes(&self) -> u64 {
        self.total_memory_bytes
    }

    fn is_ram_backed(&self, path: &Path) -> bool {
        is_ram_backed_linux(path)
    }
}

#[cfg(target_os = "linux")]
fn is_ram_backed_linux(path: &Path) -> bool {
    let Ok(canonical) = std::fs::canonicalize(path).or_else(|_| {
        path.parent()
            .map(std::fs::canonicalize)
            .unwrap_or_else(|| Ok(path.to_path_buf()))
    }) else {
        return false;
    };

    let Ok(mounts) = std::fs::read_to_string("/proc/mounts") else {
        return false;
    };

    let mut best_match: Option<(&str, &str)> = None;
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let Some(_device) = fields.next() else {
            continue;
        };
        let Some(mount_point) = fields.next() else {
            continue;
        };
        let Some(fs_type) = fields.next() else {
            continue;
        };
        if canonical.starts_with(mount_point) {
            let is_better = match best_match {
                Some((prev, _)) => mount_point.len() > prev.len(),
                None => true,
            };
            if is_better {
                best_match = Some((mount_point, fs_type));
            }
        }
    }

    matches!(best_match, Some((_, "tmpfs")) | Some((_, "ramfs")))
}

#[cfg(not(target_os = "linux"))]
fn is_ram_backed_linux(_path: &Path) -> bool {
    false
}
