//! TurboDL — a parallel ranged-download engine for single-file HTTP
//! transfers.
//!
//! Given a URL, this crate probes the remote resource, builds a download
//! plan sized to the file and the caller's bandwidth estimate, runs a pool
//! of ranged-GET workers with retry/backoff, stages bytes through an
//! in-memory ring buffer (or writes positionally when that buffer would
//! cost more than it saves), and finalizes the result with an optional
//! hash check. [`download`] is the sole entry point; everything else is
//! public only so the pieces can be composed or tested independently.

pub mod buffer;
pub mod controller;
pub mod environment;
pub mod error;
pub mod finalize;
pub mod hash;
pub mod model;
pub mod options;
pub mod output;
pub mod plan;
pub mod probe;
pub mod progress;
pub mod worker;
pub mod writer;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::watch;

pub use error::{Result, TurboDlError};
pub use model::{Phase, RemoteFileInfo, Tri};
pub use options::{DownloadOptions, HashType, MaxConnections};
pub use progress::{CallbackProgressSink, NullProgressSink, ProgressEvent, ProgressSink};

/// Downloads `url` to `output_path`, returning the path the file actually
/// landed at (which may differ from `output_path` if collision resolution
/// picked a suffixed name, or if `output_path` named a directory and the
/// probed remote filename was appended to it).
///
/// This installs no signal handling of its own — embedders that want
/// Ctrl-C to cancel an in-flight download should use
/// [`download_with_cancellation`] and wire up their own
/// `tokio::signal::ctrl_c()` listener (the CLI binary in this crate does
/// exactly that).
pub async fn download(
    url: &str,
    output_path: impl AsRef<Path>,
    options: DownloadOptions,
) -> Result<PathBuf> {
    let (_tx, rx) = watch::channel(false);
    controller::run(url, output_path.as_ref().to_path_buf(), options, None, rx).await
}

/// Like [`download`], but lets the caller supply a progress sink and a
/// cancellation signal (flip the paired `watch::Sender` to `true` to abort
/// every in-flight worker and leave the sentinel file in place).
pub async fn download_with_cancellation(
    url: &str,
    output_path: impl AsRef<Path>,
    options: DownloadOptions,
    progress_sink: Option<Arc<dyn ProgressSink>>,
    cancel: watch::Receiver<bool>,
) -> Result<PathBuf> {
    controller::run(url, output_path.as_ref().to_path_buf(), options, progress_sink, cancel).await
}
