//! Controller (spec.md §4.G).
//!
//! Generalizes the teacher's `Downloader` — one shared `Client` built once
//! with pooling/keep-alive (`downloader.rs::Downloader::new`), a builder
//! method attaching a cancellation signal, and a `download()` orchestration
//! method — into probe -> plan -> spawn exactly `worker_count` workers up
//! front -> writer/direct sink -> finalize. The teacher's dynamic
//! `SharedRateLimiter`-driven worker scale-down has no counterpart in
//! spec.md (no bandwidth-shaping feature), so it's not carried forward; see
//! DESIGN.md.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::buffer::{self, RingBuffer};
use crate::environment::{Environment, SystemEnvironment};
use crate::error::{Result, TurboDlError};
use crate::finalize;
use crate::model::{DownloadPlan, JobPaths, Phase};
use crate::options::DownloadOptions;
use crate::output::OutputHandle;
use crate::plan;
use crate::probe;
use crate::progress::{NullProgressSink, ProgressEvent, ProgressSink};
use crate::worker::{self, ProgressCounters, Sink};
use crate::writer;

const PROGRESS_TICK: Duration = Duration::from_millis(100);

/// Runs one job end to end: probe, plan, download, finalize. `cancel`
/// mirrors the teacher's `with_cancel_signal`, generalized from
/// `Arc<AtomicBool>` to a `watch::Receiver<bool>` so every worker (and the
/// progress loop) observes cancellation without polling.
pub async fn run(
    url: &str,
    destination: PathBuf,
    options: DownloadOptions,
    progress_sink: Option<Arc<dyn ProgressSink>>,
    cancel: watch::Receiver<bool>,
) -> Result<PathBuf> {
    let progress_sink: Arc<dyn ProgressSink> = match progress_sink {
        Some(sink) if options.show_progress => sink,
        _ => Arc::new(NullProgressSink),
    };
    let client = build_client(&options)?;
    let env = SystemEnvironment::new();

    progress_sink.on_event(ProgressEvent {
        phase: Phase::Probing,
        bytes_received: 0,
        bytes_written: 0,
        total_size: None,
        speed_bytes_per_sec: 0,
        active_workers: 0,
    });

    let info = probe::probe(&client, url, &options.headers).await?;

    let destination = resolve_destination_filename(destination, &info.filename);
    let plan = plan::build_plan(info.size, info.supports_ranges, &destination, &options, &env);
    let attempted_multi_worker = plan.chunks.len() > 1;

    let result = run_plan_with_deadline(
        &client,
        &info.url,
        info.size,
        &options,
        destination.clone(),
        plan,
        progress_sink.clone(),
        cancel.clone(),
        &env,
    )
    .await;

    match result {
        Err(TurboDlError::RangeNotHonored) if attempted_multi_worker => {
            tracing::warn!(
                url = %info.url,
                "server advertised range support but returned 200 to a ranged request; \
                 retrying the job as a single connection"
            );
            let single_worker_plan =
                plan::build_plan(info.size, false, &destination, &options, &env);
            run_plan_with_deadline(
                &client,
                &info.url,
                info.size,
                &options,
                destination,
                single_worker_plan,
                progress_sink,
                cancel,
                &env,
            )
            .await
        }
        other => other,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_plan_with_deadline(
    client: &Client,
    url: &str,
    total_size_opt: Option<u64>,
    options: &DownloadOptions,
    destination: PathBuf,
    plan: DownloadPlan,
    progress_sink: Arc<dyn ProgressSink>,
    cancel: watch::Receiver<bool>,
    env: &SystemEnvironment,
) -> Result<PathBuf> {
    let Some(deadline) = plan.total_timeout else {
        return run_plan(client, url, total_size_opt, options, destination, plan, progress_sink, cancel, env).await;
    };

    match tokio::time::timeout(
        deadline,
        run_plan(client, url, total_size_opt, options, destination, plan, progress_sink, cancel, env),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(TurboDlError::JobTimeout),
    }
}

/// Builds the shared, connection-pooled client every worker issues requests
/// through (teacher: `Downloader::new`'s `Client::builder()` chain).
fn build_client(options: &DownloadOptions) -> Result<Client> {
    let mut builder = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(32)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .tcp_nodelay(true)
        .redirect(reqwest::redirect::Policy::limited(10));

    if let Some(ua) = options.headers.get("User-Agent") {
        builder = builder.user_agent(ua.clone());
    }

    builder.build().map_err(TurboDlError::from)
}

/// Appends the probed filename onto `destination` when it was given as a
/// directory (spec.md §6: "output_path may name a directory").
fn resolve_destination_filename(destination: PathBuf, probed_filename: &str) -> PathBuf {
    if destination.is_dir() {
        destination.join(probed_filename)
    } else {
        destination
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_plan(
    client: &Client,
    url: &str,
    total_size_opt: Option<u64>,
    options: &DownloadOptions,
    destination: PathBuf,
    plan: DownloadPlan,
    progress_sink: Arc<dyn ProgressSink>,
    cancel: watch::Receiver<bool>,
    env: &SystemEnvironment,
) -> Result<PathBuf> {
    let paths = JobPaths::new(destination);
    let headers = build_header_map(&options.headers);
    let planned_size = plan.chunks.iter().map(|c| c.len()).sum::<u64>();

    let single_request = plan.chunks.len() == 1;
    let output = Arc::new(OutputHandle::create(
        &paths.sentinel,
        total_size_opt,
        plan.pre_allocate,
    )?);

    let average_chunk_size = planned_size / plan.chunks.len().max(1) as u64;
    let progress = Arc::new(ProgressCounters::default());
    let bytes_written = Arc::new(AtomicU64::new(0));

    let ring_buffer = if plan.use_ram_buffer {
        let capacity = buffer::compute_capacity(env.total_memory_bytes(), average_chunk_size);
        Some(Arc::new(RingBuffer::new(capacity)))
    } else {
        None
    };

    // Every worker and the writer observe this channel instead of the
    // caller's `cancel` directly, so `join_workers` can broadcast teardown
    // the moment it sees the first fatal error (spec.md §4.G: "other
    // workers are canceled; pending retries are dropped") without waiting
    // for them to finish naturally first. `forward_external_cancel` mirrors
    // the caller's own cancel signal onto the same channel.
    let (internal_cancel_tx, internal_cancel_rx) = watch::channel(false);
    tokio::spawn(forward_external_cancel(cancel.clone(), internal_cancel_tx.clone()));

    let mut workers = JoinSet::new();
    for chunk in &plan.chunks {
        let sink = match &ring_buffer {
            Some(buffer) => Sink::Buffer(buffer.clone()),
            None => Sink::Direct(output.clone()),
        };
        workers.spawn(worker::run_worker(
            client.clone(),
            url.to_string(),
            headers.clone(),
            *chunk,
            single_request,
            sink,
            plan.inactivity_timeout,
            progress.clone(),
            internal_cancel_rx.clone(),
        ));
    }

    let writer_handle = ring_buffer.as_ref().map(|buffer| {
        tokio::spawn(writer::run_writer(buffer.clone(), output.clone(), bytes_written.clone()))
    });

    let progress_task = tokio::spawn(run_progress_loop(
        progress.clone(),
        bytes_written.clone(),
        ring_buffer.clone(),
        total_size_opt,
        progress_sink.clone(),
        plan.chunks.len(),
        cancel.clone(),
    ));

    let worker_outcome = join_workers(workers, &internal_cancel_tx).await;

    // On success, let the writer drain the buffer's remaining contiguous
    // bytes naturally. On a fatal error, abort it instead: the worker
    // owning the gap at `head_offset` is never going to deposit, so
    // `close_input` alone would leave `wait_for_drainable_or_close`
    // parked forever.
    if let Some(buffer) = &ring_buffer {
        if worker_outcome.is_err() {
            buffer.abort();
        } else {
            buffer.close_input();
        }
    }
    if let Some(handle) = writer_handle {
        handle.await.expect("writer task panicked")?;
    }
    progress_task.abort();

    worker_outcome?;

    progress_sink.on_event(ProgressEvent {
        phase: Phase::Hashing,
        bytes_received: progress.bytes_received.load(Ordering::Relaxed),
        bytes_written: bytes_written.load(Ordering::Relaxed),
        total_size: total_size_opt,
        speed_bytes_per_sec: 0,
        active_workers: 0,
    });

    let overwrite = options.overwrite;
    let expected_hash = options.expected_hash.clone();
    let hash_type = options.hash_type;
    tokio::task::spawn_blocking(move || {
        finalize::finalize(&paths, overwrite, expected_hash.as_deref(), hash_type)
    })
    .await
    .expect("finalize task panicked")
}

/// Drains every worker's result, returning the first terminal (non-retry-
/// exhausted) error encountered, if any (spec.md §4.G: "first non-retryable
/// error becomes terminal"). The moment that first error is observed,
/// `cancel` is flipped so every other still-running worker aborts at its
/// next suspension point instead of continuing to retry for up to 5
/// attempts with backoff (spec.md §4.G: "other workers are canceled;
/// pending retries are dropped"); this call still awaits all of them so the
/// `JoinSet` is fully drained before returning.
async fn join_workers(
    mut workers: JoinSet<Result<crate::model::WorkerState>>,
    cancel: &watch::Sender<bool>,
) -> Result<()> {
    let mut first_error = None;
    while let Some(result) = workers.join_next().await {
        let outcome = result.expect("worker task panicked");
        if let Err(err) = outcome {
            if first_error.is_none() {
                first_error = Some(err);
                let _ = cancel.send(true);
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Mirrors the caller-supplied cancellation signal onto `internal`, so a
/// single `watch::Sender` drives worker/writer teardown regardless of
/// whether cancellation originated from the caller or from a fatal worker
/// error observed in [`join_workers`].
async fn forward_external_cancel(mut external: watch::Receiver<bool>, internal: watch::Sender<bool>) {
    if *external.borrow() {
        let _ = internal.send(true);
        return;
    }
    while external.changed().await.is_ok() {
        if *external.borrow() {
            let _ = internal.send(true);
            return;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_progress_loop(
    progress: Arc<ProgressCounters>,
    bytes_written: Arc<AtomicU64>,
    ring_buffer: Option<Arc<RingBuffer>>,
    total_size: Option<u64>,
    sink: Arc<dyn ProgressSink>,
    active_workers: usize,
    mut cancel: watch::Receiver<bool>,
) {
    let mut last_tick = Instant::now();
    let mut last_bytes = 0u64;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(PROGRESS_TICK) => {}
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return;
                }
            }
        }

        let received = progress.bytes_received.load(Ordering::Relaxed);
        let written = ring_buffer
            .as_ref()
            .map(|_| bytes_written.load(Ordering::Relaxed))
            .unwrap_or(received);

        let elapsed = last_tick.elapsed().as_secs_f64().max(0.001);
        let speed = ((received.saturating_sub(last_bytes)) as f64 / elapsed) as u64;
        last_tick = Instant::now();
        last_bytes = received;

        sink.on_event(ProgressEvent {
            phase: Phase::Downloading,
            bytes_received: received,
            bytes_written: written,
            total_size,
            speed_bytes_per_sec: speed,
            active_workers,
        });
    }
}

fn build_header_map(headers: &std::collections::HashMap<String, String>) -> reqwest::header::HeaderMap {
    let mut map = reqwest::header::HeaderMap::new();
    for (key, value) in headers {
        if let (Ok(name), Ok(val)) = (
            reqwest::header::HeaderName::from_bytes(key.as_bytes()),
            reqwest::header::HeaderValue::from_str(value),
        ) {
            map.insert(name, val);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_destination_filename_keeps_plain_file_path() {
        let destination = PathBuf::from("/tmp/does-not-exist-turbodl/out.bin");
        let resolved = resolve_destination_filename(destination.clone(), "probed.bin");
        assert_eq!(resolved, destination);
    }

    #[test]
    fn resolve_destination_filename_joins_directory_with_probed_name() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_destination_filename(dir.path().to_path_buf(), "probed.bin");
        assert_eq!(resolved, dir.path().join("probed.bin"));
    }

    #[tokio::test]
    async fn join_workers_broadcasts_cancellation_on_first_fatal_error() {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let mut workers = JoinSet::new();

        workers.spawn(async { Err(TurboDlError::RemoteError { status: 404 }) });

        let mut sibling_cancel = cancel_rx.clone();
        workers.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(5)) => Ok(crate::model::WorkerState::new(1)),
                _ = sibling_cancel.changed() => Err(TurboDlError::DownloadInterrupted),
            }
        });

        let result = join_workers(workers, &cancel_tx).await;
        assert!(matches!(result, Err(TurboDlError::RemoteError { status: 404 })));
        assert!(*cancel_rx.borrow_and_update());
    }

    #[tokio::test]
    async fn forward_external_cancel_mirrors_signal_onto_internal_channel() {
        let (external_tx, external_rx) = watch::channel(false);
        let (internal_tx, mut internal_rx) = watch::channel(false);

        tokio::spawn(forward_external_cancel(external_rx, internal_tx));
        external_tx.send(true).unwrap();

        internal_rx.changed().await.unwrap();
        assert!(*internal_rx.borrow());
    }
}
