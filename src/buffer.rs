//! Ring Buffer (spec.md §4.C).
//!
//! spec.md §9 calls for exactly this shape: "an internal mutex guarding an
//! ordered map of segments plus two condition variables for
//! fullness/emptiness" and explicitly warns off lock-free attempts since the
//! consumer is singular. This is a fresh module — the teacher has no
//! buffering layer of its own (it writes positionally from every worker) —
//! built from that guidance plus the std `Mutex`/`Condvar` idiom the pack's
//! `psst-core` storage module (`examples/other_examples`) uses for a similar
//! single-consumer cache.

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex};

/// A fixed-capacity, ordered byte store decoupling network ingress from disk
/// egress while preserving byte order (spec.md §3 `ChunkBuffer`).
pub struct RingBuffer {
    capacity: u64,
    state: Mutex<State>,
    not_full: Condvar,
    not_empty: Condvar,
}

struct State {
    /// Segments keyed by absolute file offset, never overlapping.
    segments: BTreeMap<u64, Vec<u8>>,
    occupied: u64,
    head_offset: u64,
    producers_closed: bool,
    /// Set by [`RingBuffer::abort`] when the controller is tearing the job
    /// down early (a fatal worker error or cancellation) — distinct from
    /// `producers_closed`, which only means "no more deposits are coming"
    /// and still requires draining the existing contiguous prefix first.
    aborted: bool,
}

/// Outcome of [`RingBuffer::deposit`].
#[derive(Debug, PartialEq, Eq)]
pub enum DepositOutcome {
    Accepted,
    /// spec.md §4.C invariant (iv): a deposit whose `offset + length <=
    /// head_offset` is rejected as a late arrival that should be impossible
    /// given correct chunking.
    LateArrival,
    /// The buffer was aborted (see [`RingBuffer::abort`]) while this deposit
    /// was blocked on backpressure or had not yet been recorded.
    Aborted,
}

impl RingBuffer {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            state: Mutex::new(State {
                segments: BTreeMap::new(),
                occupied: 0,
                head_offset: 0,
                producers_closed: false,
                aborted: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Blocks while `free_space < bytes.len()`, then records the segment at
    /// `offset` and wakes the writer if the head-contiguous prefix grew.
    /// Run this from a blocking context (`spawn_blocking`) — it parks the
    /// calling thread on a condvar, not an async waker.
    pub fn deposit(&self, offset: u64, bytes: Vec<u8>) -> DepositOutcome {
        if bytes.is_empty() {
            return DepositOutcome::Accepted;
        }
        let len = bytes.len() as u64;
        let mut state = self.state.lock().unwrap();

        if state.aborted {
            return DepositOutcome::Aborted;
        }
        if offset + len <= state.head_offset {
            return DepositOutcome::LateArrival;
        }

        while state.occupied + len > self.capacity {
            if state.aborted {
                return DepositOutcome::Aborted;
            }
            state = self.not_full.wait(state).unwrap();
        }
        if state.aborted {
            return DepositOutcome::Aborted;
        }

        state.segments.insert(offset, bytes);
        state.occupied += len;
        drop(state);
        self.not_empty.notify_all();
        DepositOutcome::Accepted
    }

    /// Returns and removes the longest contiguous prefix starting at
    /// `head_offset` (possibly empty if the next byte hasn't arrived yet),
    /// advancing `head_offset` by the returned length and waking any
    /// blocked depositor.
    pub fn drain_contiguous(&self) -> Vec<u8> {
        let mut state = self.state.lock().unwrap();
        let mut out = Vec::new();

        loop {
            let Some((&offset, _)) = state.segments.iter().next() else {
                break;
            };
            if offset != state.head_offset {
                break;
            }
            let segment = state.segments.remove(&offset).unwrap();
            state.occupied -= segment.len() as u64;
            state.head_offset += segment.len() as u64;
            out.extend_from_slice(&segment);
        }

        drop(state);
        if !out.is_empty() {
            self.not_full.notify_all();
        }
        out
    }

    /// Blocks until either new contiguous bytes are available to drain, the
    /// producers have finished, or the buffer is aborted, returning `None`
    /// for the latter two (the writer's end-of-stream signal).
    pub fn wait_for_drainable_or_close(&self) -> Option<()> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.aborted {
                return None;
            }
            let head_is_present = state
                .segments
                .keys()
                .next()
                .map(|&offset| offset == state.head_offset)
                .unwrap_or(false);
            if head_is_present {
                return Some(());
            }
            if state.producers_closed && state.segments.is_empty() {
                return None;
            }
            state = self.not_empty.wait(state).unwrap();
        }
    }

    /// Marks producers finished; the writer drains whatever remains in
    /// order and then observes end-of-stream.
    pub fn close_input(&self) {
        let mut state = self.state.lock().unwrap();
        state.producers_closed = true;
        drop(state);
        self.not_empty.notify_all();
    }

    /// Tears the buffer down immediately: any depositor blocked on
    /// backpressure and the writer's drain wait both unblock and observe
    /// termination, regardless of whether the head-contiguous prefix is
    /// complete. Used by the controller when a fatal worker error or
    /// cancellation means the remaining bytes will never arrive (spec.md
    /// §4.G: "other workers are canceled; pending retries are dropped").
    /// Unlike [`Self::close_input`], this does not wait for the buffer to
    /// drain naturally — it is the teardown path, not the success path.
    pub fn abort(&self) {
        let mut state = self.state.lock().unwrap();
        state.aborted = true;
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Only legal when empty and no producer/consumer is active; returns the
    /// buffer to its initial state.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.segments.is_empty(), "reset() called on a non-empty buffer");
        state.occupied = 0;
        state.head_offset = 0;
        state.producers_closed = false;
        state.aborted = false;
    }

    pub fn head_offset(&self) -> u64 {
        self.state.lock().unwrap().head_offset
    }

    pub fn occupied(&self) -> u64 {
        self.state.lock().unwrap().occupied
    }
}

/// Computes ring buffer capacity per spec.md §4.C: `min(20% of system RAM,
/// 1 GiB, next power-of-two >= average chunk size * 2)`.
pub fn compute_capacity(total_memory_bytes: u64, average_chunk_size: u64) -> u64 {
    const ONE_GIB: u64 = 1024 * 1024 * 1024;
    let ram_cap = total_memory_bytes / 5;
    let pow2_floor = (average_chunk_size.max(1) * 2).next_power_of_two();
    ram_cap.min(ONE_GIB).min(pow2_floor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn drain_contiguous_returns_only_the_head_prefix() {
        let buf = RingBuffer::new(1024);
        buf.deposit(0, vec![1, 2, 3]);
        buf.deposit(10, vec![9, 9, 9]); // not contiguous yet
        let out = buf.drain_contiguous();
        assert_eq!(out, vec![1, 2, 3]);
        assert_eq!(buf.head_offset(), 3);

        // Still nothing drainable until the gap [3,10) is filled.
        assert_eq!(buf.drain_contiguous(), Vec::<u8>::new());
    }

    #[test]
    fn out_of_order_deposits_drain_in_order() {
        let buf = RingBuffer::new(1024);
        buf.deposit(3, vec![4, 5, 6]);
        buf.deposit(0, vec![1, 2, 3]);
        assert_eq!(buf.drain_contiguous(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(buf.head_offset(), 6);
    }

    #[test]
    fn late_arrival_is_rejected() {
        let buf = RingBuffer::new(1024);
        buf.deposit(0, vec![1, 2, 3]);
        buf.drain_contiguous();
        assert_eq!(buf.deposit(0, vec![9]), DepositOutcome::LateArrival);
    }

    #[test]
    fn head_offset_is_monotonically_non_decreasing() {
        let buf = RingBuffer::new(1024);
        let mut last = buf.head_offset();
        buf.deposit(0, vec![0; 10]);
        buf.drain_contiguous();
        assert!(buf.head_offset() >= last);
        last = buf.head_offset();
        buf.deposit(10, vec![0; 10]);
        buf.drain_contiguous();
        assert!(buf.head_offset() >= last);
    }

    #[test]
    fn deposit_blocks_until_capacity_frees_up() {
        let buf = Arc::new(RingBuffer::new(8));
        buf.deposit(0, vec![0; 8]); // fill capacity completely

        let buf2 = buf.clone();
        let handle = thread::spawn(move || {
            // Should block until the first segment is drained.
            buf2.deposit(8, vec![1, 2, 3, 4]);
        });

        thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(buf.occupied(), 8);
        buf.drain_contiguous();
        handle.join().unwrap();
        assert_eq!(buf.occupied(), 4);
    }

    #[test]
    fn resident_bytes_never_exceed_capacity() {
        let buf = Arc::new(RingBuffer::new(16));
        let mut handles = Vec::new();
        for i in 0..8u64 {
            let buf = buf.clone();
            handles.push(thread::spawn(move || {
                buf.deposit(i * 4, vec![i as u8; 4]);
            }));
        }
        // Concurrently drain so producers make progress.
        for _ in 0..8 {
            thread::sleep(std::time::Duration::from_millis(5));
            assert!(buf.occupied() <= 16);
            buf.drain_contiguous();
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(buf.occupied() <= 16);
    }

    #[test]
    fn abort_unblocks_a_depositor_parked_on_backpressure() {
        let buf = Arc::new(RingBuffer::new(8));
        buf.deposit(0, vec![0; 8]); // fill capacity completely

        let buf2 = buf.clone();
        let handle = thread::spawn(move || buf2.deposit(8, vec![1, 2, 3, 4]));

        thread::sleep(std::time::Duration::from_millis(30));
        buf.abort();
        assert_eq!(handle.join().unwrap(), DepositOutcome::Aborted);
    }

    #[test]
    fn abort_unblocks_a_writer_waiting_on_a_gap_that_will_never_fill() {
        let buf = Arc::new(RingBuffer::new(1024));
        // A later segment arrives but the head-contiguous prefix never will
        // (the worker owning [0, head) failed and will never deposit it).
        buf.deposit(10, vec![9, 9, 9]);

        let buf2 = buf.clone();
        let handle = thread::spawn(move || buf2.wait_for_drainable_or_close());
        thread::sleep(std::time::Duration::from_millis(30));
        buf.abort();
        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn close_input_unblocks_waiting_consumer_at_end_of_stream() {
        let buf = Arc::new(RingBuffer::new(1024));
        buf.deposit(0, vec![1, 2, 3]);
        buf.drain_contiguous();

        let buf2 = buf.clone();
        let handle = thread::spawn(move || buf2.wait_for_drainable_or_close());
        thread::sleep(std::time::Duration::from_millis(30));
        buf.close_input();
        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn reset_returns_buffer_to_initial_state() {
        let buf = RingBuffer::new(1024);
        buf.deposit(0, vec![1, 2, 3]);
        buf.drain_contiguous();
        buf.reset();
        assert_eq!(buf.head_offset(), 0);
        assert_eq!(buf.occupied(), 0);
    }

    #[test]
    fn compute_capacity_respects_one_gib_ceiling() {
        let cap = compute_capacity(64 * 1024 * 1024 * 1024, 4 * 1024 * 1024);
        assert!(cap <= 1024 * 1024 * 1024);
    }

    #[test]
    fn compute_capacity_respects_twenty_percent_ram_ceiling() {
        let total = 1024 * 1024 * 1024; // 1 GiB total RAM
        let cap = compute_capacity(total, 4 * 1024 * 1024);
        assert!(cap <= total / 5);
    }
}
