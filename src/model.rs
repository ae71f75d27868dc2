//! Shared data model (spec.md §3): the value types the probe, plan builder,
//! buffer, worker pool, and finalizer all pass between each other.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The sentinel size used when a server gives no usable length.
pub const UNKNOWN_SIZE: Option<u64> = None;

/// What the probe (`src/probe.rs`) learns about a remote resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFileInfo {
    /// Absolute URL after following redirects.
    pub url: String,
    /// `None` means "unknown" (spec.md's sentinel).
    pub size: Option<u64>,
    pub filename: String,
    pub content_type: Option<String>,
    pub supports_ranges: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// A single contiguous byte range assigned to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub start: u64,
    /// Inclusive.
    pub end: u64,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Resolved `use_ram_buffer` / `max_connections` preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tri {
    Auto,
    On,
    Off,
}

/// The fixed content plan the controller executes against (spec.md's
/// `DownloadPlan`).
#[derive(Debug, Clone)]
pub struct DownloadPlan {
    pub worker_count: usize,
    pub chunks: Vec<Chunk>,
    pub use_ram_buffer: bool,
    pub pre_allocate: bool,
    pub total_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub inactivity_timeout: Duration,
}

/// Per-worker lifecycle state (spec.md's `WorkerState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Pending,
    Running,
    Retrying,
    Done,
    Failed,
    Canceled,
}

#[derive(Debug, Clone)]
pub struct WorkerState {
    pub chunk_index: usize,
    pub attempt_number: u32,
    pub bytes_completed_within_chunk: u64,
    pub status: WorkerStatus,
}

impl WorkerState {
    pub fn new(chunk_index: usize) -> Self {
        Self {
            chunk_index,
            attempt_number: 0,
            bytes_completed_within_chunk: 0,
            status: WorkerStatus::Pending,
        }
    }
}

/// Paths the job manipulates on disk.
#[derive(Debug, Clone)]
pub struct JobPaths {
    pub destination: PathBuf,
    pub sentinel: PathBuf,
}

impl JobPaths {
    pub fn new(destination: PathBuf) -> Self {
        let mut sentinel = destination.clone().into_os_string();
        sentinel.push(".turbodownload");
        Self {
            destination,
            sentinel: PathBuf::from(sentinel),
        }
    }
}

/// The phase a controller reports progress events against (spec.md §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Probing,
    Downloading,
    Hashing,
}
