//! Thin CLI shell (SPEC_FULL.md §0): argument parsing, wiring a terminal
//! progress sink, and translating Ctrl-C into the library's cancellation
//! signal. No download logic lives here — it all runs through
//! `turbodl::download_with_cancellation`.
//!
//! Grounded in the retrieval pack's `indicatif`/`console`-based CLI
//! downloaders (e.g. the `TralahM-multifiledownloader-rs` example) for the
//! progress bar shape, generalized to the single-file multi-chunk case.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;

use turbodl::{DownloadOptions, HashType, MaxConnections, Phase, ProgressEvent, ProgressSink, Tri};

/// Parallel ranged-download engine for accelerating single-file HTTP
/// transfers.
#[derive(Parser, Debug)]
#[command(name = "turbodl", version, about)]
struct Args {
    /// URL to download.
    url: String,

    /// Destination file or directory. Defaults to the current directory.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Number of parallel connections, or "auto" (default).
    #[arg(short = 'n', long, default_value = "auto")]
    connections: String,

    /// Estimated connection speed in Mbps, used by the "auto" worker-count
    /// policy.
    #[arg(long, default_value_t = 80.0)]
    speed_mbps: f64,

    /// Pre-allocate the destination file to the full expected size.
    #[arg(long)]
    pre_allocate: bool,

    /// Force the in-memory staging buffer on or off; default lets TurboDL
    /// decide based on the destination filesystem.
    #[arg(long)]
    ram_buffer: Option<bool>,

    /// Overwrite an existing file at the destination instead of picking a
    /// suffixed name.
    #[arg(long, default_value_t = true)]
    overwrite: bool,

    /// Extra HTTP header, repeatable: `-H "Key: Value"`.
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Overall job timeout in seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Expected hash digest to verify after download.
    #[arg(long)]
    hash: Option<String>,

    /// Hash algorithm for `--hash` (default: md5).
    #[arg(long, default_value = "md5")]
    hash_type: String,

    /// Suppress the progress bar.
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    run(args).await
}

async fn run(args: Args) -> ExitCode {
    let options = match build_options(&args) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{} {message}", style("error:").red().bold());
            return ExitCode::from(1);
        }
    };

    let output_path = args.output.clone().unwrap_or_else(|| PathBuf::from("."));

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    let sink: Option<Arc<dyn ProgressSink>> = if args.quiet {
        None
    } else {
        Some(Arc::new(CliProgressSink::new()))
    };

    match turbodl::download_with_cancellation(&args.url, &output_path, options, sink, cancel_rx).await {
        Ok(final_path) => {
            println!("{} {}", style("saved:").green().bold(), final_path.display());
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{} {err}", style("error:").red().bold());
            exit_code_for(&err)
        }
    }
}

fn build_options(args: &Args) -> Result<DownloadOptions, String> {
    let mut options = DownloadOptions::default();

    options.max_connections = match args.connections.as_str() {
        "auto" => MaxConnections::Auto,
        n => {
            let n: u8 = n.parse().map_err(|_| format!("invalid --connections value: {n}"))?;
            MaxConnections::Fixed(n)
        }
    };
    options.connection_speed_mbps = args.speed_mbps;
    options.pre_allocate_space = args.pre_allocate;
    options.use_ram_buffer = match args.ram_buffer {
        Some(true) => Tri::On,
        Some(false) => Tri::Off,
        None => Tri::Auto,
    };
    options.overwrite = args.overwrite;
    options.timeout = args.timeout_secs.map(Duration::from_secs);
    options.expected_hash = args.hash.clone();
    options.hash_type = parse_hash_type(&args.hash_type)?;
    options.show_progress = !args.quiet;

    let mut headers: HashMap<String, String> = options.headers;
    for raw in &args.headers {
        let (key, value) = raw
            .split_once(':')
            .ok_or_else(|| format!("invalid --header value (expected \"Key: Value\"): {raw}"))?;
        headers.insert(key.trim().to_string(), value.trim().to_string());
    }
    options.headers = headers;

    Ok(options)
}

fn parse_hash_type(value: &str) -> Result<HashType, String> {
    match value.to_ascii_lowercase().as_str() {
        "md5" => Ok(HashType::Md5),
        "sha1" => Ok(HashType::Sha1),
        "sha224" => Ok(HashType::Sha224),
        "sha256" => Ok(HashType::Sha256),
        "sha384" => Ok(HashType::Sha384),
        "sha512" => Ok(HashType::Sha512),
        "blake2b" => Ok(HashType::Blake2b),
        "blake2s" => Ok(HashType::Blake2s),
        other => Err(format!("unknown --hash-type: {other}")),
    }
}

/// Exit codes: 0 success, 2 hash mismatch, 130 interrupted, 1 otherwise.
fn exit_code_for(err: &turbodl::TurboDlError) -> ExitCode {
    match err {
        turbodl::TurboDlError::HashMismatch { .. } => ExitCode::from(2),
        turbodl::TurboDlError::DownloadInterrupted => ExitCode::from(130),
        _ => ExitCode::from(1),
    }
}

/// Renders [`ProgressEvent`]s as a single `indicatif` bar, switching its
/// length between "known" and "spinner" style the moment a total size
/// becomes known.
struct CliProgressSink {
    bar: ProgressBar,
}

impl CliProgressSink {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        Self { bar }
    }
}

impl ProgressSink for CliProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event.phase {
            Phase::Probing => self.bar.set_message("probing..."),
            Phase::Hashing => self.bar.set_message("verifying hash..."),
            Phase::Downloading => {
                if let Some(total) = event.total_size {
                    if self.bar.length() != Some(total) {
                        self.bar.set_style(
                            ProgressStyle::with_template(
                                "{bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, workers: {msg})",
                            )
                            .unwrap_or_else(|_| ProgressStyle::default_bar()),
                        );
                        self.bar.set_length(total);
                    }
                    self.bar.set_position(event.bytes_written);
                }
                self.bar.set_message(event.active_workers.to_string());
            }
        }
    }
}
