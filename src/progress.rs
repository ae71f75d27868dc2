//! Progress events the controller emits (spec.md §9: "decouple entirely").
//! The core only ever produces [`ProgressEvent`] values; rendering them is a
//! collaborator's problem, handed off through the [`ProgressSink`] trait.

use crate::model::Phase;

/// A single progress observation, emitted at >= 10 Hz while a job runs
/// (spec.md §4.G).
#[derive(Debug, Clone, Copy)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub bytes_received: u64,
    pub bytes_written: u64,
    pub total_size: Option<u64>,
    pub speed_bytes_per_sec: u64,
    pub active_workers: usize,
}

/// Something that wants to observe progress events. The no-op default is
/// what `show_progress = false` wires up.
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// A sink that drops every event; used when `show_progress` is disabled.
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn on_event(&self, _event: ProgressEvent) {}
}

/// A sink that forwards events to a plain closure, for embedding TurboDL in
/// another async application without pulling in `indicatif`.
pub struct CallbackProgressSink<F>(pub F)
where
    F: Fn(ProgressEvent) + Send + Sync;

impl<F> ProgressSink for CallbackProgressSink<F>
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn on_event(&self, event: ProgressEvent) {
        (self.0)(event)
    }
}
