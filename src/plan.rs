//! Plan Builder (spec.md §4.B).
//!
//! Replaces the teacher's fixed "connections * 8, cap sub-chunks at 10 MiB"
//! heuristic (`downloader.rs::download`) with the worker-count policy and
//! interpolated bandwidth/size table spec.md §4.B specifies, while keeping
//! the teacher's shape of "compute boundaries in a loop, push chunk
//! records".

use std::path::Path;
use std::time::Duration;

use crate::environment::Environment;
use crate::model::{Chunk, DownloadPlan, Tri};
use crate::options::{DownloadOptions, MaxConnections};

const ONE_MIB: u64 = 1024 * 1024;
const ONE_GIB: u64 = 1024 * 1024 * 1024;

/// Builds a [`DownloadPlan`] from a probed size, range support, and the
/// caller's options (spec.md §4.B contract).
pub fn build_plan(
    size: Option<u64>,
    supports_ranges: bool,
    destination: &Path,
    options: &DownloadOptions,
    env: &dyn Environment,
) -> DownloadPlan {
    let worker_count = resolve_worker_count(size, supports_ranges, options);
    let chunks = match size {
        Some(size) if size > 0 => partition(size, worker_count),
        _ => vec![Chunk { index: 0, start: 0, end: 0 }],
    };
    let worker_count = chunks.len().max(1);

    let use_ram_buffer = resolve_use_ram_buffer(options.use_ram_buffer, destination, env);

    DownloadPlan {
        worker_count,
        chunks,
        use_ram_buffer,
        pre_allocate: options.pre_allocate_space,
        total_timeout: options.timeout,
        connect_timeout: Duration::from_secs(10),
        inactivity_timeout: options.inactivity_timeout,
    }
}

fn resolve_worker_count(size: Option<u64>, supports_ranges: bool, options: &DownloadOptions) -> usize {
    let size = match size {
        Some(s) => s,
        None => return 1,
    };

    if !supports_ranges || size <= ONE_MIB {
        return 1;
    }

    match options.max_connections {
        MaxConnections::Fixed(n) => n.clamp(1, 24) as usize,
        MaxConnections::Auto => {
            let raw = worker_count_from_table(size, options.connection_speed_mbps);
            raw.round().clamp(2.0, 24.0) as usize
        }
    }
}

/// Row anchors: the lower bound of each size band (`<10MiB, 10-100MiB,
/// 100MiB-1GiB, 1-5GiB, >5GiB`). Column anchors: the lower bound of each
/// bandwidth band (`<=10, 10-100, 100-500, >=500 Mbps`). Values beyond the
/// last anchor extrapolate flat, keeping `f` non-decreasing as spec.md
/// §4.B requires.
const SIZE_ANCHORS: [f64; 5] = [0.0, 10.0 * ONE_MIB as f64, 100.0 * ONE_MIB as f64, ONE_GIB as f64, 5.0 * ONE_GIB as f64];
const MBPS_ANCHORS: [f64; 4] = [0.0, 10.0, 100.0, 500.0];

const TABLE: [[f64; 4]; 5] = [
    [2.0, 2.0, 4.0, 4.0],
    [2.0, 4.0, 8.0, 10.0],
    [4.0, 8.0, 12.0, 16.0],
    [4.0, 12.0, 16.0, 20.0],
    [8.0, 16.0, 20.0, 24.0],
];

fn worker_count_from_table(size: u64, mbps: f64) -> f64 {
    let (row_lo, row_hi, row_t) = interpolation_position(&SIZE_ANCHORS, size as f64);
    let (col_lo, col_hi, col_t) = interpolation_position(&MBPS_ANCHORS, mbps);

    let top = lerp(TABLE[row_lo][col_lo], TABLE[row_lo][col_hi], col_t);
    let bottom = lerp(TABLE[row_hi][col_lo], TABLE[row_hi][col_hi], col_t);
    lerp(top, bottom, row_t)
}

/// Finds the bracketing indices in a monotonic `anchors` array for `value`,
/// returning `(lower_index, upper_index, fraction_between)`. Values at or
/// past the last anchor extrapolate flat (`upper == lower`).
fn interpolation_position(anchors: &[f64], value: f64) -> (usize, usize, f64) {
    let last = anchors.len() - 1;
    if value <= anchors[0] {
        return (0, 0, 0.0);
    }
    if value >= anchors[last] {
        return (last, last, 0.0);
    }
    for i in 0..last {
        if value >= anchors[i] && value < anchors[i + 1] {
            let t = (value - anchors[i]) / (anchors[i + 1] - anchors[i]);
            return (i, i + 1, t);
        }
    }
    (last, last, 0.0)
}

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

/// Partitions `[0, size-1]` into `worker_count` contiguous segments of
/// length `ceil(size / worker_count)`, the last absorbing the remainder.
/// Decrements `worker_count` and retries if that would yield a zero-length
/// segment (spec.md §4.B: "reject a plan that produces any zero-length
/// segment").
fn partition(size: u64, worker_count: usize) -> Vec<Chunk> {
    let mut workers = worker_count.max(1);
    loop {
        let chunk_len = size.div_ceil(workers as u64);
        if chunk_len == 0 {
            workers -= 1;
            continue;
        }

        let mut chunks = Vec::with_capacity(workers);
        let mut start = 0u64;
        let mut index = 0usize;
        while start < size {
            let end = (start + chunk_len - 1).min(size - 1);
            chunks.push(Chunk { index, start, end });
            start = end + 1;
            index += 1;
        }

        if chunks.iter().all(|c| c.len() > 0) {
            return chunks;
        }
        workers -= 1;
        if workers == 0 {
            return vec![Chunk { index: 0, start: 0, end: size - 1 }];
        }
    }
}

/// Downgrades `plan` to a single worker covering the whole resource,
/// keeping every other resolved setting (spec.md §9's resolved open
/// question: a server that advertises range support but doesn't honor it
/// falls back to single-worker in-place).
pub fn force_single_worker_plan(plan: &DownloadPlan, size: Option<u64>) -> DownloadPlan {
    let chunks = match size {
        Some(size) if size > 0 => vec![Chunk { index: 0, start: 0, end: size - 1 }],
        _ => vec![Chunk { index: 0, start: 0, end: 0 }],
    };
    DownloadPlan {
        worker_count: 1,
        chunks,
        use_ram_buffer: plan.use_ram_buffer,
        pre_allocate: plan.pre_allocate,
        total_timeout: plan.total_timeout,
        connect_timeout: plan.connect_timeout,
        inactivity_timeout: plan.inactivity_timeout,
    }
}

fn resolve_use_ram_buffer(preference: Tri, destination: &Path, env: &dyn Environment) -> bool {
    match preference {
        Tri::On => true,
        Tri::Off => false,
        Tri::Auto => !env.is_ram_backed(destination),
    }
}
