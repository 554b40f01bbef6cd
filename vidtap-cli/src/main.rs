// Vidtap CLI: record a captured or manifest-declared video stream to a file.

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};
use url::Url;
use vidtap_engine::{
    ChannelTap, Exchange, ExchangeBody, SessionConfig, SessionEvent, SessionOutcome, TapFeed,
    replay_capture_log, start_session,
};

#[derive(Parser, Debug)]
#[command(
    name = "vidtap",
    about = "Capture and reassemble browser video streams into a single file",
    version
)]
struct Args {
    /// Media playlist or manifest URL to record from directly.
    #[arg(long, conflicts_with = "capture_log")]
    manifest_url: Option<Url>,

    /// JSONL capture log to replay, one HTTP exchange per line.
    #[arg(long)]
    capture_log: Option<PathBuf>,

    /// Output file path.
    #[arg(short, long, default_value = "capture.ts")]
    output: PathBuf,

    /// Only consider exchanges whose URL contains one of these patterns.
    #[arg(long = "scope")]
    scope: Vec<String>,

    /// Parallel segment fetches.
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Verbose logging (debug level).
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Errors only.
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);
    run(args).await
}

async fn run(args: Args) -> anyhow::Result<()> {
    if args.manifest_url.is_none() && args.capture_log.is_none() {
        bail!("one of --manifest-url or --capture-log is required");
    }

    let mut config = if args.manifest_url.is_some() {
        SessionConfig::manifest_driven()
    } else {
        SessionConfig::default()
    };
    config.capture.scope = args.scope.clone();
    config.supervisor.fetch_concurrency = args.concurrency;

    let (feed, tap) = ChannelTap::new(config.capture.channel_capacity);
    let mut handle = start_session(&args.output, config, Box::new(tap));
    let mut events = handle
        .take_events()
        .context("session event channel was already taken")?;

    if let Some(url) = args.manifest_url.clone() {
        tokio::spawn(async move {
            if let Err(error) = seed_manifest(url, feed).await {
                error!(error = %error, "failed to seed manifest");
            }
        });
    } else if let Some(path) = args.capture_log.clone() {
        tokio::spawn(async move {
            if let Err(error) = replay_capture_log(&path, feed).await {
                error!(error = %error, "capture log replay failed");
            }
        });
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupt received, finishing up");
                handle.cancel();
                break;
            }
            event = events.recv() => match event {
                Some(event) => report_event(&event),
                None => break,
            },
        }
    }

    match handle.wait().await {
        SessionOutcome::Completed {
            path,
            bytes_written,
        } => {
            info!(path = %path.display(), bytes = bytes_written, "recording complete");
            Ok(())
        }
        SessionOutcome::Failed {
            reason,
            partial_path,
        } => {
            if let Some(path) = partial_path {
                warn!(path = %path.display(), "partial output retained");
            }
            bail!("recording failed: {reason}");
        }
        SessionOutcome::Cancelled { partial_path } => {
            if let Some(path) = partial_path {
                info!(path = %path.display(), "partial output retained");
            }
            Ok(())
        }
    }
}

/// Fetch the manifest once and hand it to the session as if it had been
/// sniffed off the wire; the engine takes over segment fetching from there.
async fn seed_manifest(url: Url, feed: TapFeed) -> anyhow::Result<()> {
    let client = reqwest::Client::builder().build()?;
    let response = client
        .get(url.clone())
        .send()
        .await
        .with_context(|| format!("failed to fetch manifest {url}"))?
        .error_for_status()?;

    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await?;

    let mut exchange = Exchange::new("GET", url, status);
    exchange.response_headers = headers;
    exchange.body = ExchangeBody::buffered(body);
    feed.publish(exchange)
        .await
        .context("session closed before the manifest was delivered")?;
    Ok(())
}

fn report_event(event: &SessionEvent) {
    match event {
        SessionEvent::Started { destination } => {
            info!(destination = %destination.display(), "recording started");
        }
        SessionEvent::SegmentReady {
            sequence_key,
            byte_length,
        } => {
            debug!(sequence_key, bytes = byte_length, "segment written");
        }
        SessionEvent::Progress(snapshot) => match snapshot.percent() {
            Some(percent) => info!(
                "{percent:.1}% ({} bytes, {} segments)",
                snapshot.bytes_written, snapshot.segments_ready
            ),
            None => info!(
                "{} bytes, {} segments",
                snapshot.bytes_written, snapshot.segments_ready
            ),
        },
        SessionEvent::StreamEnded { total_count } => {
            info!(total = ?total_count, "stream ended");
        }
        SessionEvent::SegmentSkipped {
            sequence_key,
            reason,
        } => {
            warn!(sequence_key, reason = %reason, "segment skipped");
        }
        SessionEvent::Finished(_) => {}
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}
