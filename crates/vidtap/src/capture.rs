// Flow capture: taps that feed observed exchanges into a session.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::SessionError;
use crate::exchange::{Exchange, ExchangeBody};

/// Source of observed exchanges. Implementations wrap whatever is watching
/// the browser's traffic: a devtools client, an intercepting proxy, or a
/// capture log on disk.
#[async_trait]
pub trait TrafficTap: Send {
    /// Next observed exchange, or None once the tap has closed.
    async fn next_exchange(&mut self) -> Option<Exchange>;
}

/// Tap backed by an in-process channel. The `TapFeed` half is handed to the
/// producer; the tap half goes to the session.
pub struct ChannelTap {
    rx: mpsc::Receiver<Exchange>,
}

#[derive(Clone)]
pub struct TapFeed {
    tx: mpsc::Sender<Exchange>,
}

impl ChannelTap {
    pub fn new(capacity: usize) -> (TapFeed, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (TapFeed { tx }, Self { rx })
    }
}

#[async_trait]
impl TrafficTap for ChannelTap {
    async fn next_exchange(&mut self) -> Option<Exchange> {
        self.rx.recv().await
    }
}

impl TapFeed {
    /// Hand one exchange to the session. Errors once the session has torn
    /// its tap down.
    pub async fn publish(&self, exchange: Exchange) -> Result<(), SessionError> {
        self.tx
            .send(exchange)
            .await
            .map_err(|_| SessionError::capture_unavailable("session closed its capture tap"))
    }
}

/// Restricts capture to URLs containing one of the configured patterns,
/// matched case-insensitively against the full URL text. An empty filter
/// admits everything.
#[derive(Debug, Clone, Default)]
pub struct ScopeFilter {
    patterns: Vec<String>,
}

impl ScopeFilter {
    pub fn new(patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.into().trim().to_ascii_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn admits(&self, url: &Url) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        let text = url.as_str().to_ascii_lowercase();
        self.patterns.iter().any(|p| text.contains(p))
    }
}

/// Pump a tap into the session's exchange channel until the tap closes or
/// the session is cancelled.
pub(crate) fn spawn_capture_task(
    mut tap: Box<dyn TrafficTap>,
    filter: ScopeFilter,
    tx: mpsc::Sender<Exchange>,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let mut exchange = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = tap.next_exchange() => match next {
                    Some(exchange) => exchange,
                    None => break,
                },
            };
            if !filter.admits(&exchange.url) {
                trace!(url = %exchange.url, "exchange outside capture scope");
                continue;
            }
            exchange.observed_at = SystemTime::now();
            // The send races cancellation so teardown never leaves this task
            // parked on a full channel.
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                sent = tx.send(exchange) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("capture task finished");
    })
}

/// One line of a JSONL capture log, as written by a recording proxy or
/// browser extension. The body is either inline text or a file referenced
/// relative to the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureRecord {
    #[serde(default)]
    pub method: Option<String>,
    pub url: String,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub request_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub response_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub body_file: Option<PathBuf>,
}

impl CaptureRecord {
    /// Build an exchange, resolving a body file relative to `base_dir`.
    pub async fn into_exchange(self, base_dir: &Path) -> Result<Exchange, SessionError> {
        let url = Url::parse(&self.url).map_err(|e| {
            SessionError::capture_unavailable(format!("bad URL in capture record: {e}"))
        })?;
        let status = StatusCode::from_u16(self.status.unwrap_or(200)).map_err(|_| {
            SessionError::capture_unavailable("bad status code in capture record")
        })?;

        let mut exchange = Exchange::new(self.method.unwrap_or_else(|| "GET".to_string()), url, status);
        exchange.request_headers = header_map(&self.request_headers);
        exchange.response_headers = header_map(&self.response_headers);
        exchange.body = match (self.body_file, self.body) {
            (Some(file), _) => {
                let path = if file.is_absolute() {
                    file
                } else {
                    base_dir.join(file)
                };
                ExchangeBody::buffered(tokio::fs::read(&path).await?)
            }
            (None, Some(text)) => ExchangeBody::buffered(text.into_bytes()),
            (None, None) => ExchangeBody::empty(),
        };
        Ok(exchange)
    }
}

fn header_map(source: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(source.len());
    for (name, value) in source {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            continue;
        };
        map.append(name, value);
    }
    map
}

/// Replay a capture log through a feed, one JSON record per line. Blank
/// lines and `#` comments are skipped; malformed records are logged and
/// dropped rather than aborting the replay.
pub async fn replay_capture_log(
    path: impl AsRef<Path>,
    feed: TapFeed,
) -> Result<(), SessionError> {
    let path = path.as_ref();
    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let record: CaptureRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = line_no, error = %e, "skipping malformed capture record");
                continue;
            }
        };
        match record.into_exchange(&base_dir).await {
            Ok(exchange) => {
                if feed.publish(exchange).await.is_err() {
                    debug!(line = line_no, "session went away mid-replay");
                    break;
                }
            }
            Err(e) => warn!(line = line_no, error = %e, "skipping unusable capture record"),
        }
    }
    Ok(())
}
