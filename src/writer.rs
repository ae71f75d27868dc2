//! Writer (spec.md §4.E).
//!
//! In buffered mode, a single task repeatedly drains the ring buffer's
//! head-contiguous prefix and appends it to the output file, so bytes reach
//! disk strictly in ascending offset order (spec.md's "Order invariant").
//! In unbuffered mode, workers themselves hold the `OutputHandle` and write
//! positionally (`worker.rs`/`output.rs`); there is no writer task at all.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::buffer::RingBuffer;
use crate::error::Result;
use crate::output::OutputHandle;

/// Drains `buffer` into `output` until the buffer reports end-of-stream
/// (`producers_closed` and empty) or is aborted, updating `bytes_written` as
/// it goes. On abort, any segment still stranded behind a gap that will
/// never fill is left undrained rather than looped on.
pub async fn run_writer(
    buffer: Arc<RingBuffer>,
    output: Arc<OutputHandle>,
    bytes_written: Arc<AtomicU64>,
) -> Result<()> {
    loop {
        let buffer_for_wait = buffer.clone();
        let drainable = tokio::task::spawn_blocking(move || buffer_for_wait.wait_for_drainable_or_close())
            .await
            .expect("writer wait task panicked");

        let buffer_for_drain = buffer.clone();
        let chunk = tokio::task::spawn_blocking(move || buffer_for_drain.drain_contiguous())
            .await
            .expect("writer drain task panicked");

        if !chunk.is_empty() {
            let len = chunk.len() as u64;
            output.append(chunk).await?;
            bytes_written.fetch_add(len, Ordering::Relaxed);
        }

        if drainable.is_none() {
            break;
        }
    }

    output.flush()?;
    Ok(())
}
