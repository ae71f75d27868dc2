//! Range Worker Pool (spec.md §4.D).
//!
//! Generalizes the teacher's `'worker_mission` retry loop in
//! `downloader.rs::download` — compose `Range` header, stream the body in
//! sub-chunks, responsive-sleep through backoff while polling cancellation —
//! to the exact retry/backoff formula and inactivity timeout spec.md §4.D
//! specifies, and to the buffered-or-direct-write split §4.E requires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use rand::Rng;
use reqwest::Client;
use tokio::sync::watch;

use crate::buffer::{DepositOutcome, RingBuffer};
use crate::error::{Result, TurboDlError};
use crate::model::{Chunk, WorkerState, WorkerStatus};
use crate::output::OutputHandle;

const BACKOFF_BASE_MS: f64 = 500.0;
const BACKOFF_CAP_MS: f64 = 30_000.0;
const MAX_ATTEMPTS: u32 = 5;

/// Where a worker deposits the bytes it reads.
pub enum Sink {
    Buffer(Arc<RingBuffer>),
    Direct(Arc<OutputHandle>),
}

/// Shared, process-wide progress counters the controller reads for events.
#[derive(Default)]
pub struct ProgressCounters {
    pub bytes_received: AtomicU64,
}

/// Runs one chunk end-to-end, including retries, until it either completes,
/// exhausts its retry budget, or is canceled.
pub async fn run_worker(
    client: Client,
    url: String,
    headers: reqwest::header::HeaderMap,
    chunk: Chunk,
    single_request: bool,
    sink: Sink,
    inactivity_timeout: Duration,
    progress: Arc<ProgressCounters>,
    mut cancel: watch::Receiver<bool>,
) -> Result<WorkerState> {
    let mut state = WorkerState::new(chunk.index);
    state.status = WorkerStatus::Running;

    loop {
        if *cancel.borrow() {
            state.status = WorkerStatus::Canceled;
            return Err(TurboDlError::DownloadInterrupted);
        }

        let result = attempt_chunk(
            &client,
            &url,
            &headers,
            chunk,
            single_request,
            &sink,
            inactivity_timeout,
            &progress,
            &mut state,
            &mut cancel,
        )
        .await;

        match result {
            Ok(()) => {
                state.status = WorkerStatus::Done;
                return Ok(state);
            }
            Err(TurboDlError::DownloadInterrupted) => {
                state.status = WorkerStatus::Canceled;
                return Err(TurboDlError::DownloadInterrupted);
            }
            Err(err) if err.is_retryable() && state.attempt_number + 1 < MAX_ATTEMPTS => {
                state.attempt_number += 1;
                state.status = WorkerStatus::Retrying;
                tracing::warn!(
                    chunk = chunk.index,
                    attempt = state.attempt_number,
                    error = %err,
                    "chunk attempt failed, retrying"
                );
                if sleep_with_cancel(backoff_delay(state.attempt_number), &mut cancel).await {
                    state.status = WorkerStatus::Canceled;
                    return Err(TurboDlError::DownloadInterrupted);
                }
            }
            Err(err) => {
                state.status = WorkerStatus::Failed;
                return Err(err);
            }
        }
    }
}

/// A single try at a chunk, resuming from `state.bytes_completed_within_chunk`
/// (spec.md §4.D: "retries that made partial progress continue ... by
/// adjusting the Range header").
#[allow(clippy::too_many_arguments)]
async fn attempt_chunk(
    client: &Client,
    url: &str,
    headers: &reqwest::header::HeaderMap,
    chunk: Chunk,
    single_request: bool,
    sink: &Sink,
    inactivity_timeout: Duration,
    progress: &Arc<ProgressCounters>,
    state: &mut WorkerState,
    cancel: &mut watch::Receiver<bool>,
) -> Result<()> {
    // In single-request mode there is no Range header, so a retry always
    // re-receives the body from byte 0 — any partial progress from a prior
    // attempt must be discarded rather than used to offset where the new
    // bytes land, or they'd be written past where they belong.
    if single_request {
        state.bytes_completed_within_chunk = 0;
    }
    let resume_start = chunk.start + state.bytes_completed_within_chunk;

    let mut request = client.get(url).headers(headers.clone());
    if !single_request {
        request = request.header("Range", format!("bytes={}-{}", resume_start, chunk.end));
    }

    let response = request.send().await.map_err(TurboDlError::from)?;
    let status = response.status();

    if single_request {
        if !status.is_success() {
            return Err(TurboDlError::RemoteError { status: status.as_u16() });
        }
    } else if status.as_u16() != 206 {
        // A 200 here means the body is the *entire* resource, not just
        // [start, end] — writing it at this chunk's offset would corrupt
        // the file. Surface a distinct error so the controller can restart
        // the whole job as a single connection instead of silently
        // misplacing bytes.
        if status.is_success() {
            return Err(TurboDlError::RangeNotHonored);
        }
        return Err(TurboDlError::RemoteError { status: status.as_u16() });
    }

    let mut stream = response.bytes_stream();
    loop {
        if *cancel.borrow() {
            return Err(TurboDlError::DownloadInterrupted);
        }

        let next = tokio::time::timeout(inactivity_timeout, stream.next()).await;
        let item = match next {
            Ok(item) => item,
            Err(_) => return Err(TurboDlError::InactivityTimeout(inactivity_timeout)),
        };

        let bytes = match item {
            Some(chunk_result) => chunk_result.map_err(TurboDlError::from)?,
            None => break,
        };

        let offset = chunk.start + state.bytes_completed_within_chunk;
        let len = bytes.len() as u64;
        write_subchunk(sink, offset, bytes).await?;

        state.bytes_completed_within_chunk += len;
        progress.bytes_received.fetch_add(len, Ordering::Relaxed);
    }

    Ok(())
}

async fn write_subchunk(sink: &Sink, offset: u64, bytes: Bytes) -> Result<()> {
    match sink {
        Sink::Buffer(buffer) => {
            let buffer = buffer.clone();
            let data = bytes.to_vec();
            let outcome = tokio::task::spawn_blocking(move || buffer.deposit(offset, data))
                .await
                .expect("buffer deposit task panicked");
            match outcome {
                DepositOutcome::Accepted => Ok(()),
                // Aborted means the controller is tearing the job down (a
                // sibling's fatal error or a cancel) — this worker should
                // stop like any other cancellation, not retry.
                DepositOutcome::Aborted => Err(TurboDlError::DownloadInterrupted),
                // Should be impossible given correct chunking (spec.md §4.C
                // invariant iv); surface it rather than silently dropping
                // the bytes and leaving the writer waiting on a gap forever.
                DepositOutcome::LateArrival => {
                    tracing::error!(offset, "ring buffer rejected a late-arriving deposit");
                    Err(TurboDlError::Io(format!(
                        "ring buffer invariant violation: late arrival at offset {offset}"
                    )))
                }
            }
        }
        Sink::Direct(handle) => handle.write_at(offset, bytes.to_vec()).await,
    }
}

/// `delay_k = min(base * 2^(k-1) * (1 + U(0, 0.3)), cap)` (spec.md §4.D).
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_MS * 2f64.powi(attempt as i32 - 1);
    let jitter = rand::thread_rng().gen_range(0.0..0.3);
    let with_jitter = exp * (1.0 + jitter);
    Duration::from_millis(with_jitter.min(BACKOFF_CAP_MS) as u64)
}

/// Sleeps in short increments so cancellation is observed within one
/// suspension point rather than only after the full backoff elapses
/// (spec.md §5). Returns `true` if canceled mid-sleep.
async fn sleep_with_cancel(total: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(total) => false,
        _ = cancel.changed() => *cancel.borrow(),
    }
}
