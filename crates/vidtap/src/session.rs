// Session orchestration: wires capture, classification, indexing, fetching,
// and assembly into one cancellable task.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::StreamExt;
use reqwest::Client;
use reqwest::header::HeaderMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::assembler::{Assembler, SidecarMarker, remove_sidecar, write_sidecar};
use crate::capture::{ScopeFilter, TrafficTap, spawn_capture_task};
use crate::classify::{Classification, classify};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::events::SessionEvent;
use crate::exchange::{Exchange, ExchangeBody};
use crate::index::{SegmentDescriptor, SegmentIndex};
use crate::manifest::{MediaManifest, ParsedManifest, parse_manifest};
use crate::net::create_client;
use crate::progress::{ProgressSnapshot, SessionState, SharedProgress};
use crate::supervisor::{DownloadSupervisor, FetchJob, FetchOutcome};

/// How a session ended. `Failed` and `Cancelled` point at the partial output
/// file when one was created; a sidecar marker sits next to it on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed {
        path: PathBuf,
        bytes_written: u64,
    },
    Failed {
        reason: String,
        partial_path: Option<PathBuf>,
    },
    Cancelled {
        partial_path: Option<PathBuf>,
    },
}

/// Caller-side handle to a running session.
#[derive(Debug)]
pub struct SessionHandle {
    token: CancellationToken,
    progress: SharedProgress,
    events: Option<mpsc::Receiver<SessionEvent>>,
    join: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    /// Request cooperative shutdown. The session drains in-flight work, keeps
    /// whatever contiguous prefix it already assembled, and resolves to
    /// `Cancelled`.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    /// The event receiver, available exactly once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events.take()
    }

    pub async fn wait(self) -> SessionOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(error) => SessionOutcome::Failed {
                reason: format!("session task aborted: {error}"),
                partial_path: None,
            },
        }
    }
}

/// Spawn a recording session that consumes `tap` until the stream ends, the
/// capture source closes, or the session is cancelled.
pub fn start_session(
    destination: impl Into<PathBuf>,
    config: SessionConfig,
    tap: Box<dyn TrafficTap>,
) -> SessionHandle {
    let config = config.normalized();
    let token = CancellationToken::new();
    let progress = SharedProgress::new();
    let (events_tx, events_rx) = mpsc::channel(config.event_capacity);
    let join = tokio::spawn(run_session(
        destination.into(),
        config,
        tap,
        token.clone(),
        progress.clone(),
        events_tx,
    ));
    SessionHandle {
        token,
        progress,
        events: Some(events_rx),
        join,
    }
}

pub fn cancel_session(handle: &SessionHandle) {
    handle.cancel();
}

async fn run_session(
    destination: PathBuf,
    config: SessionConfig,
    tap: Box<dyn TrafficTap>,
    token: CancellationToken,
    progress: SharedProgress,
    events_tx: mpsc::Sender<SessionEvent>,
) -> SessionOutcome {
    let client = match create_client(&config.net) {
        Ok(client) => client,
        Err(error) => {
            error!(error = %error, "failed to build http client");
            progress.update(|p| p.state = SessionState::Failed);
            let outcome = SessionOutcome::Failed {
                reason: error.to_string(),
                partial_path: None,
            };
            let _ = events_tx.try_send(SessionEvent::Finished(outcome.clone()));
            return outcome;
        }
    };

    let (exchange_tx, exchange_rx) = mpsc::channel(config.capture.channel_capacity);
    let (job_tx, job_rx) = mpsc::channel(config.supervisor.fetch_concurrency * 4);
    let (outcome_tx, outcome_rx) = mpsc::channel(config.supervisor.fetch_concurrency * 2);
    let (body_tx, body_rx) = mpsc::channel(8);

    let filter = ScopeFilter::new(config.capture.scope.iter().cloned());
    let capture_task = spawn_capture_task(tap, filter, exchange_tx, token.clone());

    let supervisor = DownloadSupervisor::new(
        client.clone(),
        config.supervisor.retry.clone(),
        config.supervisor.fetch_concurrency,
        job_rx,
        outcome_tx,
        token.clone(),
    );
    let supervisor_task = tokio::spawn(supervisor.run());

    let mut sweep = interval(config.supervisor.sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let runtime = SessionRuntime {
        destination,
        config,
        client,
        token,
        progress,
        events_tx,
        events_open: true,
        index: SegmentIndex::new(),
        assembler: None,
        mode: None,
        primary_stream: None,
        rebase: None,
        url_to_key: HashMap::new(),
        manifest_seen: false,
        end_seen: false,
        capture_done: false,
        supervisor_done: false,
        body_active: false,
        generation: 0,
        exchange_rx,
        job_tx: Some(job_tx),
        outcome_rx,
        body_tx,
        body_rx,
        body_task: None,
        capture_task: Some(capture_task),
        supervisor_task: Some(supervisor_task),
        sweep,
        last_arrival_at: Instant::now(),
        last_progress_at: Instant::now(),
    };
    runtime.run().await
}

enum FinishKind {
    Completed,
    Failed(String),
    Cancelled,
}

/// What the primary stream looks like, fixed at adoption time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamMode {
    SingleFile,
    Segmented { domain: KeyDomain },
}

/// Meaning of sequence keys for the primary stream. Ordinal streams advance
/// by one per segment; byte-offset streams advance by each segment's length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyDomain {
    Ordinal,
    ByteOffset,
}

/// Key translation applied after a stalled stream is replaced: the new
/// stream's keys continue where the old output left off.
#[derive(Debug, Clone, Copy)]
struct Rebase {
    from_first: u64,
    to_base: u64,
}

/// Messages from the body-drain task that incrementally consumes a streaming
/// single-file response.
enum BodyMessage {
    Chunk {
        generation: u64,
        sequence_key: u64,
        payload: Bytes,
    },
    Ended {
        generation: u64,
        next_key: u64,
    },
    Failed {
        generation: u64,
        error: SessionError,
    },
}

struct SessionRuntime {
    destination: PathBuf,
    config: SessionConfig,
    client: Client,
    token: CancellationToken,
    progress: SharedProgress,
    events_tx: mpsc::Sender<SessionEvent>,
    events_open: bool,

    index: SegmentIndex,
    assembler: Option<Assembler>,
    mode: Option<StreamMode>,
    primary_stream: Option<String>,
    rebase: Option<Rebase>,
    /// URLs the index already knows, so a re-observed exchange always maps to
    /// the key it was registered under rather than whatever the classifier
    /// would derive.
    url_to_key: HashMap<String, u64>,

    manifest_seen: bool,
    end_seen: bool,
    capture_done: bool,
    supervisor_done: bool,
    body_active: bool,
    /// Increments per body-drain task; stale tasks' messages are discarded.
    generation: u64,

    exchange_rx: mpsc::Receiver<Exchange>,
    job_tx: Option<mpsc::Sender<FetchJob>>,
    outcome_rx: mpsc::Receiver<FetchOutcome>,
    body_tx: mpsc::Sender<BodyMessage>,
    body_rx: mpsc::Receiver<BodyMessage>,
    body_task: Option<JoinHandle<()>>,
    capture_task: Option<JoinHandle<()>>,
    supervisor_task: Option<JoinHandle<()>>,

    sweep: Interval,
    last_arrival_at: Instant,
    last_progress_at: Instant,
}

impl SessionRuntime {
    async fn run(mut self) -> SessionOutcome {
        self.set_state(SessionState::Capturing);
        self.emit(SessionEvent::Started {
            destination: self.destination.clone(),
        });
        info!(destination = %self.destination.display(), "session started");

        let kind = loop {
            match self.step().await {
                Ok(Some(kind)) => break kind,
                Ok(None) => {}
                Err(error) => {
                    error!(error = %error, "session failed");
                    break FinishKind::Failed(error.to_string());
                }
            }
        };
        self.finish(kind).await
    }

    async fn step(&mut self) -> Result<Option<FinishKind>, SessionError> {
        tokio::select! {
            biased;

            _ = self.token.cancelled() => {
                return Ok(Some(FinishKind::Cancelled));
            }

            maybe_exchange = self.exchange_rx.recv(), if !self.capture_done => {
                match maybe_exchange {
                    Some(exchange) => {
                        self.last_arrival_at = Instant::now();
                        self.handle_exchange(exchange).await?;
                    }
                    None => self.on_capture_closed().await?,
                }
            }

            Some(message) = self.body_rx.recv(), if self.body_active => {
                self.handle_body_message(message).await?;
            }

            maybe_outcome = self.outcome_rx.recv(), if !self.supervisor_done => {
                match maybe_outcome {
                    Some(outcome) => self.handle_fetch_outcome(outcome).await?,
                    None => self.supervisor_done = true,
                }
            }

            _ = self.sweep.tick() => {
                self.on_sweep().await?;
            }
        }

        Ok(self.completion())
    }

    /// Terminal-state check. Completion demands an observed end-of-stream
    /// signal on top of a drained index; a capture source that went away
    /// first leaves the session failed with its partial file retained.
    fn completion(&self) -> Option<FinishKind> {
        if self.mode.is_none() || self.body_active || !self.index.is_drained() {
            return None;
        }
        if self.end_seen {
            return Some(FinishKind::Completed);
        }
        if self.capture_done {
            return Some(FinishKind::Failed(
                "capture stopped before the stream ended".to_string(),
            ));
        }
        None
    }

    async fn handle_exchange(&mut self, exchange: Exchange) -> Result<(), SessionError> {
        match classify(&exchange) {
            Classification::Ignore => {
                trace!(url = %exchange.url, "exchange ignored");
                Ok(())
            }
            Classification::Manifest => self.on_manifest(exchange).await,
            Classification::Segment { sequence_key, .. } => {
                self.on_segment(exchange, sequence_key).await
            }
            Classification::SingleFile { estimated_len, .. } => {
                self.on_single_file(exchange, estimated_len).await
            }
        }
    }

    async fn on_manifest(&mut self, mut exchange: Exchange) -> Result<(), SessionError> {
        let manifest_url = exchange.url.clone();
        let request_headers = exchange.request_headers.clone();
        let body = match exchange.take_body().drain().await {
            Ok(body) => body,
            Err(error) => {
                warn!(url = %manifest_url, error = %error, "failed to read manifest body");
                return Ok(());
            }
        };
        let Some(media) = self
            .resolve_media_manifest(&manifest_url, &body, &request_headers)
            .await
        else {
            return Ok(());
        };
        self.adopt_manifest(&manifest_url, media, request_headers)
            .await
    }

    /// Parse a playlist body down to a media manifest, following one level of
    /// master playlist indirection to its highest-bandwidth variant.
    async fn resolve_media_manifest(
        &self,
        manifest_url: &Url,
        body: &[u8],
        request_headers: &HeaderMap,
    ) -> Option<MediaManifest> {
        match parse_manifest(manifest_url, body) {
            Ok(ParsedManifest::Media(media)) => Some(media),
            Ok(ParsedManifest::Master { variant_url }) => {
                debug!(url = %manifest_url, variant = %variant_url, "master playlist, following best variant");
                let body = self.fetch_manifest(&variant_url, request_headers).await?;
                match parse_manifest(&variant_url, &body) {
                    Ok(ParsedManifest::Media(media)) => Some(media),
                    Ok(ParsedManifest::Master { .. }) => {
                        warn!(url = %variant_url, "nested master playlist, giving up on this manifest");
                        None
                    }
                    Err(error) => {
                        warn!(url = %variant_url, error = %error, "variant playlist did not parse");
                        None
                    }
                }
            }
            Err(error) => {
                warn!(url = %manifest_url, error = %error, "manifest did not parse");
                None
            }
        }
    }

    async fn fetch_manifest(&self, url: &Url, request_headers: &HeaderMap) -> Option<Bytes> {
        let request = self.client.get(url.clone()).headers(request_headers.clone());
        let response = tokio::select! {
            biased;
            _ = self.token.cancelled() => return None,
            result = request.send() => result,
        };
        match response {
            Ok(response) if response.status().is_success() => match response.bytes().await {
                Ok(bytes) => Some(bytes),
                Err(error) => {
                    warn!(url = %url, error = %error, "failed to read variant playlist body");
                    None
                }
            },
            Ok(response) => {
                warn!(url = %url, status = %response.status(), "variant playlist request rejected");
                None
            }
            Err(error) => {
                warn!(url = %url, error = %error, "variant playlist request failed");
                None
            }
        }
    }

    async fn adopt_manifest(
        &mut self,
        manifest_url: &Url,
        media: MediaManifest,
        request_headers: HeaderMap,
    ) -> Result<(), SessionError> {
        let stream = media
            .segments
            .first()
            .map(|segment| stream_id(&segment.url))
            .unwrap_or_else(|| stream_id(manifest_url));

        match (&self.mode, &self.primary_stream) {
            (None, _) => {
                self.mode = Some(StreamMode::Segmented {
                    domain: KeyDomain::Ordinal,
                });
                self.manifest_seen = true;
                self.primary_stream = Some(stream);
                self.last_progress_at = Instant::now();
                info!(url = %manifest_url, segments = media.segments.len(), "adopted manifest-driven stream");
            }
            (Some(_), Some(primary)) if *primary == stream => {
                self.manifest_seen = true;
            }
            (Some(_), _) => {
                if !self.primary_stalled() {
                    debug!(url = %manifest_url, "competing manifest ignored while primary stream is live");
                    return Ok(());
                }
                let first = media.segments.first().map(|s| s.sequence_key).unwrap_or(0);
                warn!(url = %manifest_url, "primary stream stalled, switching to competing manifest");
                self.adopt_new_stream(stream, first);
                self.mode = Some(StreamMode::Segmented {
                    domain: KeyDomain::Ordinal,
                });
                self.manifest_seen = true;
            }
        }

        for segment in &media.segments {
            let Some(key) = self.map_key(segment.sequence_key) else {
                debug!(
                    sequence_key = segment.sequence_key,
                    "segment precedes adopted stream origin"
                );
                continue;
            };
            self.url_to_key.insert(segment.url.as_str().to_string(), key);
            self.index.register(SegmentDescriptor::pending(
                key,
                Some(segment.url.clone()),
                request_headers.clone(),
            ));
        }

        if media.end_of_stream && !self.end_seen {
            self.end_seen = true;
            let total = self.index.max_known_key().map_or(0, |key| key + 1);
            self.index.set_total_count(total);
            let total_count = self.index.total_count();
            self.progress.update(|p| p.segments_total = total_count);
            self.emit(SessionEvent::StreamEnded { total_count });
            info!(total = ?total_count, "stream end declared by manifest");
        }

        self.dispatch_due(self.effective_grace());
        self.drain_ready(false).await
    }

    async fn on_segment(
        &mut self,
        mut exchange: Exchange,
        raw_key: u64,
    ) -> Result<(), SessionError> {
        let url = exchange.url.clone();
        let request_headers = exchange.request_headers.clone();

        let mapped = match self.url_to_key.get(url.as_str()) {
            Some(&key) => key,
            None => {
                if !self.admit_segment_stream(&exchange, raw_key) {
                    return Ok(());
                }
                match self.map_key(raw_key) {
                    Some(key) => key,
                    None => {
                        debug!(url = %url, sequence_key = raw_key, "segment precedes adopted stream origin");
                        return Ok(());
                    }
                }
            }
        };
        self.url_to_key.insert(url.as_str().to_string(), mapped);

        let body = exchange.take_body();
        if body.is_empty() {
            self.index.register(SegmentDescriptor::pending(
                mapped,
                Some(url.clone()),
                request_headers,
            ));
            debug!(sequence_key = mapped, url = %url, "segment observed without payload, queued for fetch");
            return Ok(());
        }

        let payload = match body.drain().await {
            Ok(payload) => payload,
            Err(error) => {
                warn!(sequence_key = mapped, url = %url, error = %error, "segment body lost mid-stream, queued for refetch");
                self.index.register(SegmentDescriptor::pending(
                    mapped,
                    Some(url.clone()),
                    request_headers,
                ));
                return Ok(());
            }
        };

        if self.index.mark_ready(mapped, payload)? {
            self.last_progress_at = Instant::now();
            self.drain_ready(false).await?;
        }
        Ok(())
    }

    /// Decide whether a segment from an unregistered URL belongs to the
    /// primary stream, adopting one when none exists yet and replacing a
    /// stalled one.
    fn admit_segment_stream(&mut self, exchange: &Exchange, raw_key: u64) -> bool {
        let stream = stream_id(&exchange.url);
        let domain = if exchange.content_range().is_some() {
            KeyDomain::ByteOffset
        } else {
            KeyDomain::Ordinal
        };
        match (&self.mode, &self.primary_stream) {
            (None, _) => {
                self.mode = Some(StreamMode::Segmented { domain });
                self.primary_stream = Some(stream);
                self.last_progress_at = Instant::now();
                info!(url = %exchange.url, sequence_key = raw_key, "adopted segmented stream");
                true
            }
            (Some(_), Some(primary)) if *primary == stream => true,
            (Some(_), _) => {
                if !self.primary_stalled() {
                    debug!(url = %exchange.url, "competing segment ignored while primary stream is live");
                    return false;
                }
                warn!(url = %exchange.url, "primary stream stalled, switching to competing segmented stream");
                self.adopt_new_stream(stream, raw_key);
                self.mode = Some(StreamMode::Segmented { domain });
                true
            }
        }
    }

    async fn on_single_file(
        &mut self,
        mut exchange: Exchange,
        estimated_len: Option<u64>,
    ) -> Result<(), SessionError> {
        let url = exchange.url.clone();
        let body = exchange.take_body();
        if body.is_empty() {
            debug!(url = %url, "single-file exchange carried no payload, nothing to record");
            return Ok(());
        }

        let stream = url.as_str().to_string();
        match (&self.mode, &self.primary_stream) {
            (None, _) => {
                self.mode = Some(StreamMode::SingleFile);
                self.primary_stream = Some(stream);
                self.last_progress_at = Instant::now();
                info!(url = %url, size = ?estimated_len, "adopted single-file stream");
            }
            (Some(StreamMode::SingleFile), Some(primary)) if *primary == stream => {
                debug!(url = %url, "single-file payload re-observed, keeping the first copy");
                return Ok(());
            }
            (Some(_), _) => {
                if !self.primary_stalled() {
                    debug!(url = %url, "competing single file ignored while primary stream is live");
                    return Ok(());
                }
                warn!(url = %url, "primary stream stalled, switching to competing single file");
                self.adopt_new_stream(stream, 0);
                self.mode = Some(StreamMode::SingleFile);
            }
        }

        let base = self.index.max_known_key().map_or(0, |key| key + 1);
        match body {
            ExchangeBody::Buffered(payload) => {
                if self.index.mark_ready(base, payload)? {
                    self.index.set_total_count(base + 1);
                    self.end_seen = true;
                    let total_count = self.index.total_count();
                    self.progress.update(|p| p.segments_total = total_count);
                    self.emit(SessionEvent::StreamEnded { total_count });
                    self.last_progress_at = Instant::now();
                    self.drain_ready(false).await?;
                }
            }
            body @ ExchangeBody::Streaming(_) => {
                self.spawn_body_drain(base, body);
            }
        }
        Ok(())
    }

    /// Drain a streaming single-file body off the session loop, feeding each
    /// chunk back as its own consecutive segment so assembly stays
    /// incremental.
    fn spawn_body_drain(&mut self, base_key: u64, body: ExchangeBody) {
        self.generation += 1;
        let generation = self.generation;
        if let Some(task) = self.body_task.take() {
            task.abort();
        }
        self.body_active = true;

        let tx = self.body_tx.clone();
        let token = self.token.clone();
        let mut stream = match body {
            ExchangeBody::Streaming(stream) => stream,
            ExchangeBody::Buffered(payload) => futures::stream::iter([Ok(payload)]).boxed(),
        };
        self.body_task = Some(tokio::spawn(async move {
            let mut key = base_key;
            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    chunk = stream.next() => chunk,
                };
                match chunk {
                    Some(Ok(payload)) => {
                        if payload.is_empty() {
                            continue;
                        }
                        let message = BodyMessage::Chunk {
                            generation,
                            sequence_key: key,
                            payload,
                        };
                        if tx.send(message).await.is_err() {
                            return;
                        }
                        key += 1;
                    }
                    Some(Err(error)) => {
                        let _ = tx.send(BodyMessage::Failed { generation, error }).await;
                        return;
                    }
                    None => {
                        let _ = tx
                            .send(BodyMessage::Ended {
                                generation,
                                next_key: key,
                            })
                            .await;
                        return;
                    }
                }
            }
        }));
    }

    async fn handle_body_message(&mut self, message: BodyMessage) -> Result<(), SessionError> {
        match message {
            BodyMessage::Chunk {
                generation,
                sequence_key,
                payload,
            } => {
                if generation != self.generation {
                    return Ok(());
                }
                if self.index.mark_ready(sequence_key, payload)? {
                    self.last_progress_at = Instant::now();
                    self.drain_ready(false).await?;
                }
                Ok(())
            }
            BodyMessage::Ended {
                generation,
                next_key,
            } => {
                if generation != self.generation {
                    return Ok(());
                }
                self.body_active = false;
                self.end_seen = true;
                self.index.set_total_count(next_key);
                let total_count = self.index.total_count();
                self.progress.update(|p| p.segments_total = total_count);
                self.emit(SessionEvent::StreamEnded { total_count });
                self.drain_ready(false).await
            }
            BodyMessage::Failed { generation, error } => {
                if generation != self.generation {
                    return Ok(());
                }
                self.body_active = false;
                Err(error)
            }
        }
    }

    async fn handle_fetch_outcome(&mut self, outcome: FetchOutcome) -> Result<(), SessionError> {
        match outcome {
            FetchOutcome::Ready {
                sequence_key,
                payload,
            } => {
                if self.index.mark_ready(sequence_key, payload)? {
                    self.last_progress_at = Instant::now();
                    self.drain_ready(false).await?;
                }
                Ok(())
            }
            FetchOutcome::Exhausted {
                sequence_key,
                attempts,
                error,
            } => {
                if matches!(error, SessionError::Cancelled) {
                    return Ok(());
                }
                self.index.mark_failed(sequence_key, attempts);
                if self.index.is_required(sequence_key) {
                    return Err(SessionError::FetchExhausted {
                        sequence_key,
                        attempts,
                        reason: error.to_string(),
                    });
                }
                self.index.skip(sequence_key);
                warn!(sequence_key, attempts, error = %error, "optional trailing segment skipped");
                self.emit(SessionEvent::SegmentSkipped {
                    sequence_key,
                    reason: error.to_string(),
                });
                self.drain_ready(false).await
            }
        }
    }

    async fn on_capture_closed(&mut self) -> Result<(), SessionError> {
        self.capture_done = true;
        if self.mode.is_none() {
            return Err(SessionError::capture_unavailable(
                "capture ended before any media exchange was observed",
            ));
        }
        info!("capture channel closed, assembling what remains");
        self.set_state(SessionState::Assembling);
        self.sync_progress();
        self.emit(SessionEvent::Progress(self.progress.snapshot()));
        self.dispatch_due(Duration::ZERO);
        self.drain_ready(true).await
    }

    async fn on_sweep(&mut self) -> Result<(), SessionError> {
        self.dispatch_due(self.effective_grace());
        let holdback_expired = self.capture_done
            || self.last_arrival_at.elapsed() >= self.config.stall_quiet_period;
        self.drain_ready(holdback_expired).await
    }

    /// Hand due segments to the download pool. A full job queue leaves the
    /// remainder Pending for the next sweep.
    fn dispatch_due(&mut self, grace: Duration) {
        let Some(job_tx) = self.job_tx.clone() else {
            return;
        };
        for sequence_key in self.index.due_for_fetch(grace) {
            let Some((url, headers)) = self.index.begin_fetch(sequence_key) else {
                continue;
            };
            let job = FetchJob {
                sequence_key,
                url,
                headers,
            };
            if let Err(error) = job_tx.try_send(job) {
                self.index.requeue_fetch(sequence_key);
                trace!(sequence_key, error = %error, "fetch queue full, segment stays pending");
                break;
            }
        }
    }

    /// Write every consumable segment to the output file. `force` bypasses
    /// the ordering holdback for streams without positional evidence; gaps in
    /// Ready coverage still block either way.
    async fn drain_ready(&mut self, force: bool) -> Result<(), SessionError> {
        let mut wrote = false;
        loop {
            if !force && !self.can_pop() {
                break;
            }
            let Some(descriptor) = self.index.next_contiguous_ready() else {
                break;
            };
            let payload = descriptor.payload.unwrap_or_default();
            let sequence_key = descriptor.sequence_key;
            let byte_length = payload.len() as u64;
            let assembler = self.ensure_assembler().await?;
            assembler.consume(&payload).await?;
            wrote = true;
            self.last_progress_at = Instant::now();
            self.sync_progress();
            self.emit(SessionEvent::SegmentReady {
                sequence_key,
                byte_length,
            });
        }
        if wrote {
            self.emit(SessionEvent::Progress(self.progress.snapshot()));
        }
        Ok(())
    }

    /// Whether the lowest outstanding key is provably the next piece of the
    /// output. Manifest-driven and single-file streams carry that proof
    /// inherently; passively observed streams need neighbor or continuation
    /// evidence.
    fn can_pop(&self) -> bool {
        if self.manifest_seen {
            return true;
        }
        match self.mode {
            Some(StreamMode::SingleFile) => true,
            Some(StreamMode::Segmented { domain }) => {
                let Some(lowest) = self.index.lowest_outstanding() else {
                    return false;
                };
                match self.index.last_consumed() {
                    Some((key, len)) => match domain {
                        KeyDomain::Ordinal => lowest == key + 1,
                        KeyDomain::ByteOffset => lowest == key + len,
                    },
                    None => match domain {
                        KeyDomain::Ordinal => self.index.status_of(lowest + 1).is_some(),
                        KeyDomain::ByteOffset => lowest == 0,
                    },
                }
            }
            None => false,
        }
    }

    async fn ensure_assembler(&mut self) -> Result<&mut Assembler, SessionError> {
        let assembler = match self.assembler.take() {
            Some(assembler) => assembler,
            None => Assembler::create(self.destination.clone()).await?,
        };
        Ok(self.assembler.insert(assembler))
    }

    /// Abandon the stalled primary stream: unfinished keys are skipped so
    /// they never block contiguity, and the successor's keys are rebased to
    /// continue after everything already written.
    fn adopt_new_stream(&mut self, stream: String, first_raw_key: u64) {
        for sequence_key in self.index.unresolved() {
            if self.index.skip(sequence_key) {
                self.emit(SessionEvent::SegmentSkipped {
                    sequence_key,
                    reason: "stalled stream abandoned".to_string(),
                });
            }
        }
        let to_base = self.index.max_known_key().map_or(0, |key| key + 1);
        self.rebase = Some(Rebase {
            from_first: first_raw_key,
            to_base,
        });
        self.primary_stream = Some(stream);
        self.url_to_key.clear();
        self.manifest_seen = false;
        self.end_seen = false;
        self.last_progress_at = Instant::now();
    }

    fn map_key(&self, raw_key: u64) -> Option<u64> {
        match &self.rebase {
            Some(rebase) => raw_key
                .checked_sub(rebase.from_first)
                .map(|delta| rebase.to_base + delta),
            None => Some(raw_key),
        }
    }

    fn primary_stalled(&self) -> bool {
        self.last_progress_at.elapsed() >= self.config.stall_quiet_period
    }

    fn effective_grace(&self) -> Duration {
        if self.capture_done {
            Duration::ZERO
        } else {
            self.config.supervisor.passive_grace
        }
    }

    fn set_state(&mut self, state: SessionState) {
        self.progress.update(|p| p.state = state);
    }

    fn sync_progress(&self) {
        let bytes_written = self.assembler.as_ref().map_or(0, Assembler::bytes_written);
        let segments_ready = self.index.consumed_count();
        let segments_total = self.index.total_count();
        self.progress.update(|p| {
            p.bytes_written = bytes_written;
            p.segments_ready = segments_ready;
            p.segments_total = segments_total;
        });
    }

    /// Best-effort event notification. A full channel drops the event; a
    /// closed one stops all further emission.
    fn emit(&mut self, event: SessionEvent) {
        if !self.events_open {
            return;
        }
        match self.events_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                trace!(event = ?event, "event channel full, notification dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.events_open = false;
            }
        }
    }

    async fn finish(mut self, kind: FinishKind) -> SessionOutcome {
        self.token.cancel();
        self.job_tx = None;
        self.exchange_rx.close();

        // Late fetch results still extend the contiguous prefix of a partial
        // file; everything else lands on the floor.
        while let Some(outcome) = self.outcome_rx.recv().await {
            if let FetchOutcome::Ready {
                sequence_key,
                payload,
            } = outcome
            {
                if self.index.mark_ready(sequence_key, payload).unwrap_or(false) {
                    let _ = self.drain_ready(false).await;
                }
            }
        }

        if let Some(task) = self.capture_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.supervisor_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.body_task.take() {
            task.abort();
            let _ = task.await;
        }

        let mut kind = kind;
        if let Some(assembler) = self.assembler.as_mut() {
            if let Err(error) = assembler.finalize().await {
                warn!(error = %error, "failed to flush output file");
                if matches!(kind, FinishKind::Completed) {
                    kind = FinishKind::Failed(format!("failed to flush output file: {error}"));
                }
            }
        }

        // A stream that completed with zero payload still leaves a file.
        if matches!(kind, FinishKind::Completed) && self.assembler.is_none() {
            match Assembler::create(self.destination.clone()).await {
                Ok(mut assembler) => {
                    if let Err(error) = assembler.finalize().await {
                        kind = FinishKind::Failed(format!("failed to flush output file: {error}"));
                    }
                    self.assembler = Some(assembler);
                }
                Err(error) => {
                    kind = FinishKind::Failed(format!("failed to create output file: {error}"));
                }
            }
        }

        let partial_path = self
            .assembler
            .as_ref()
            .map(|assembler| assembler.destination().to_path_buf());
        let bytes_written = self
            .assembler
            .as_ref()
            .map_or(0, Assembler::bytes_written);

        let (state, outcome) = match kind {
            FinishKind::Completed => (
                SessionState::Completed,
                SessionOutcome::Completed {
                    path: self.destination.clone(),
                    bytes_written,
                },
            ),
            FinishKind::Failed(reason) => (
                SessionState::Failed,
                SessionOutcome::Failed {
                    reason,
                    partial_path: partial_path.clone(),
                },
            ),
            FinishKind::Cancelled => (
                SessionState::Cancelled,
                SessionOutcome::Cancelled {
                    partial_path: partial_path.clone(),
                },
            ),
        };

        match state {
            SessionState::Completed => remove_sidecar(&self.destination).await,
            _ if self.assembler.is_some() => {
                let marker = SidecarMarker {
                    state,
                    bytes_written,
                    segments_ready: self.index.consumed_count(),
                    total_count: self.index.total_count(),
                    reason: match &outcome {
                        SessionOutcome::Failed { reason, .. } => Some(reason.clone()),
                        _ => None,
                    },
                };
                if let Err(error) = write_sidecar(&self.destination, &marker).await {
                    warn!(error = %error, "failed to write sidecar marker");
                }
            }
            _ => {}
        }

        let segments_ready = self.index.consumed_count();
        let segments_total = self.index.total_count();
        self.progress.update(|p| {
            p.state = state;
            p.bytes_written = bytes_written;
            p.segments_ready = segments_ready;
            p.segments_total = segments_total;
        });
        self.emit(SessionEvent::Finished(outcome.clone()));

        match &outcome {
            SessionOutcome::Completed {
                path,
                bytes_written,
            } => {
                info!(path = %path.display(), bytes = bytes_written, "session completed");
            }
            SessionOutcome::Failed { reason, .. } => {
                error!(reason = %reason, "session failed");
            }
            SessionOutcome::Cancelled { .. } => {
                warn!("session cancelled");
            }
        }

        outcome
    }
}

/// Identity of the stream a URL belongs to. Segment URLs from one rendition
/// share a directory, so the URL resolved against "." is a stable stream key.
fn stream_id(url: &Url) -> String {
    url.join(".")
        .map(|base| base.to_string())
        .unwrap_or_else(|_| url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::net::SocketAddr;

    use reqwest::StatusCode;
    use reqwest::header::{self, HeaderValue};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::assembler::sidecar_path;
    use crate::capture::ChannelTap;

    fn segment_exchange_at(url: &str, fill: u8, len: usize) -> Exchange {
        let mut exchange = Exchange::new("GET", Url::parse(url).unwrap(), StatusCode::OK);
        exchange
            .response_headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp2t"));
        exchange.body = ExchangeBody::buffered(vec![fill; len]);
        exchange
    }

    fn segment_exchange(key: u64, fill: u8, len: usize) -> Exchange {
        segment_exchange_at(&format!("http://cdn.test/live/seg{key}.ts"), fill, len)
    }

    fn manifest_exchange(url: &str, body: Vec<u8>) -> Exchange {
        let mut exchange = Exchange::new("GET", Url::parse(url).unwrap(), StatusCode::OK);
        exchange.response_headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/vnd.apple.mpegurl"),
        );
        exchange.body = ExchangeBody::buffered(body);
        exchange
    }

    /// Minimal HTTP server that answers each path with a fixed status and
    /// body, one connection per request.
    async fn spawn_static_server(routes: HashMap<String, (u16, Vec<u8>)>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let routes = routes.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut read = 0usize;
                    loop {
                        match socket.read(&mut buf[read..]).await {
                            Ok(0) => return,
                            Ok(n) => {
                                read += n;
                                if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                                    break;
                                }
                                if read == buf.len() {
                                    break;
                                }
                            }
                            Err(_) => return,
                        }
                    }
                    let request = String::from_utf8_lossy(&buf[..read]);
                    let path = request
                        .split_whitespace()
                        .nth(1)
                        .unwrap_or("/")
                        .to_string();
                    let (status, body) = routes
                        .get(&path)
                        .cloned()
                        .unwrap_or((404, b"not found".to_vec()));
                    let reason = if status == 200 { "OK" } else { "ERR" };
                    let head = format!(
                        "HTTP/1.1 {status} {reason}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(&body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_out_of_order_passive_segments_assemble_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("stream.ts");
        let mut config = SessionConfig::default();
        config.stall_quiet_period = Duration::from_millis(200);
        config.supervisor.sweep_interval = Duration::from_millis(10);

        let (feed, tap) = ChannelTap::new(8);
        let handle = start_session(&destination, config, Box::new(tap));

        for (key, fill, len) in [(2u64, b'c', 120usize), (0, b'a', 100), (1, b'b', 150)] {
            feed.publish(segment_exchange(key, fill, len)).await.unwrap();
        }
        drop(feed);

        // No end-of-stream marker ever arrives, so the session ends failed
        // but keeps the fully ordered partial file.
        match handle.wait().await {
            SessionOutcome::Failed {
                reason,
                partial_path,
            } => {
                assert!(reason.contains("capture stopped"), "reason: {reason}");
                assert_eq!(partial_path.as_deref(), Some(destination.as_path()));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        let written = std::fs::read(&destination).unwrap();
        assert_eq!(written.len(), 370);
        assert!(written[..100].iter().all(|b| *b == b'a'));
        assert!(written[100..250].iter().all(|b| *b == b'b'));
        assert!(written[250..].iter().all(|b| *b == b'c'));

        let marker: SidecarMarker =
            serde_json::from_slice(&std::fs::read(sidecar_path(&destination)).unwrap()).unwrap();
        assert_eq!(marker.state, SessionState::Failed);
        assert_eq!(marker.segments_ready, 3);
        assert_eq!(marker.bytes_written, 370);
    }

    #[tokio::test]
    async fn test_manifest_driven_session_fetches_and_assembles() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("vod.ts");
        let addr = spawn_static_server(HashMap::from([
            ("/part0.ts".to_string(), (200, b"aaaa".to_vec())),
            ("/part1.ts".to_string(), (200, b"bbbbbb".to_vec())),
            ("/part2.ts".to_string(), (200, b"cc".to_vec())),
        ]))
        .await;

        let mut config = SessionConfig::manifest_driven();
        config.supervisor.sweep_interval = Duration::from_millis(10);

        let (feed, tap) = ChannelTap::new(8);
        let mut handle = start_session(&destination, config, Box::new(tap));
        let mut events = handle.take_events().unwrap();

        let manifest =
            format!("http://{addr}/part0.ts\nhttp://{addr}/part1.ts\nhttp://{addr}/part2.ts\n");
        feed.publish(manifest_exchange(
            &format!("http://{addr}/list.m3u8"),
            manifest.into_bytes(),
        ))
        .await
        .unwrap();
        drop(feed);

        let outcome = handle.wait().await;
        assert_eq!(
            outcome,
            SessionOutcome::Completed {
                path: destination.clone(),
                bytes_written: 12,
            }
        );
        assert_eq!(std::fs::read(&destination).unwrap(), b"aaaabbbbbbcc");

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen.first(), Some(SessionEvent::Started { .. })));
        assert!(seen.iter().any(|event| matches!(
            event,
            SessionEvent::StreamEnded {
                total_count: Some(3)
            }
        )));
        assert!(matches!(
            seen.last(),
            Some(SessionEvent::Finished(SessionOutcome::Completed { .. }))
        ));
    }

    #[tokio::test]
    async fn test_required_fetch_failure_fails_session_and_leaves_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("broken.ts");
        let addr = spawn_static_server(HashMap::from([
            ("/part0.ts".to_string(), (200, vec![b'a'; 100])),
            ("/part1.ts".to_string(), (503, b"busy".to_vec())),
            ("/part2.ts".to_string(), (200, vec![b'c'; 50])),
        ]))
        .await;

        let mut config = SessionConfig::manifest_driven();
        config.supervisor.sweep_interval = Duration::from_millis(10);
        config.supervisor.retry.max_retries = 1;
        config.supervisor.retry.base_delay = Duration::from_millis(50);
        config.supervisor.retry.jitter = false;

        let (feed, tap) = ChannelTap::new(8);
        let handle = start_session(&destination, config, Box::new(tap));

        let manifest =
            format!("http://{addr}/part0.ts\nhttp://{addr}/part1.ts\nhttp://{addr}/part2.ts\n");
        feed.publish(manifest_exchange(
            &format!("http://{addr}/list.m3u8"),
            manifest.into_bytes(),
        ))
        .await
        .unwrap();
        drop(feed);

        match handle.wait().await {
            SessionOutcome::Failed {
                reason,
                partial_path,
            } => {
                assert!(reason.contains("attempts"), "reason: {reason}");
                assert_eq!(partial_path.as_deref(), Some(destination.as_path()));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(std::fs::read(&destination).unwrap().len(), 100);

        let marker: SidecarMarker =
            serde_json::from_slice(&std::fs::read(sidecar_path(&destination)).unwrap()).unwrap();
        assert_eq!(marker.state, SessionState::Failed);
        assert_eq!(marker.total_count, Some(3));
        assert_eq!(marker.segments_ready, 1);
    }

    #[tokio::test]
    async fn test_single_file_download_writes_whole_payload() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("movie.mp4");
        let (feed, tap) = ChannelTap::new(4);
        let handle = start_session(&destination, SessionConfig::default(), Box::new(tap));

        let mut exchange = Exchange::new(
            "GET",
            Url::parse("https://cdn.test/files/movie.mp4").unwrap(),
            StatusCode::OK,
        );
        exchange
            .response_headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
        exchange.body = ExchangeBody::buffered(vec![0x42u8; 500_000]);
        feed.publish(exchange).await.unwrap();
        drop(feed);

        let outcome = handle.wait().await;
        assert_eq!(
            outcome,
            SessionOutcome::Completed {
                path: destination.clone(),
                bytes_written: 500_000,
            }
        );
        assert_eq!(std::fs::read(&destination).unwrap().len(), 500_000);
        assert!(!sidecar_path(&destination).exists());
    }

    #[tokio::test]
    async fn test_streaming_single_file_body_assembles_incrementally() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("live.mp4");
        let (feed, tap) = ChannelTap::new(4);
        let handle = start_session(&destination, SessionConfig::default(), Box::new(tap));

        let (chunks, body) = ExchangeBody::channel(4);
        let mut exchange = Exchange::new(
            "GET",
            Url::parse("https://cdn.test/files/live.mp4").unwrap(),
            StatusCode::OK,
        );
        exchange
            .response_headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
        exchange.body = body;
        feed.publish(exchange).await.unwrap();

        for chunk in [&b"aaaa"[..], b"bbbbbb", b"cc"] {
            chunks
                .send(Ok(Bytes::copy_from_slice(chunk)))
                .await
                .unwrap();
        }
        drop(chunks);
        drop(feed);

        let outcome = handle.wait().await;
        assert_eq!(
            outcome,
            SessionOutcome::Completed {
                path: destination.clone(),
                bytes_written: 12,
            }
        );
        assert_eq!(std::fs::read(&destination).unwrap(), b"aaaabbbbbbcc");
        assert!(!sidecar_path(&destination).exists());
    }

    #[tokio::test]
    async fn test_cancel_retains_partial_output_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("live.ts");
        let mut config = SessionConfig::default();
        config.supervisor.sweep_interval = Duration::from_millis(10);

        let (feed, tap) = ChannelTap::new(8);
        let mut handle = start_session(&destination, config, Box::new(tap));
        let mut events = handle.take_events().unwrap();

        feed.publish(segment_exchange(0, b'a', 100)).await.unwrap();
        feed.publish(segment_exchange(1, b'b', 150)).await.unwrap();

        let mut ready = 0;
        while ready < 2 {
            match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Some(SessionEvent::SegmentReady { .. })) => ready += 1,
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => panic!("segments never became ready"),
            }
        }
        handle.cancel();

        let outcome = handle.wait().await;
        assert_eq!(
            outcome,
            SessionOutcome::Cancelled {
                partial_path: Some(destination.clone()),
            }
        );
        assert_eq!(std::fs::read(&destination).unwrap().len(), 250);

        let marker: SidecarMarker =
            serde_json::from_slice(&std::fs::read(sidecar_path(&destination)).unwrap()).unwrap();
        assert_eq!(marker.state, SessionState::Cancelled);
        assert_eq!(marker.bytes_written, 250);
    }

    #[tokio::test]
    async fn test_stalled_stream_yields_to_competitor() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("switch.ts");
        let mut config = SessionConfig::default();
        config.stall_quiet_period = Duration::from_millis(100);
        config.supervisor.sweep_interval = Duration::from_millis(10);

        let (feed, tap) = ChannelTap::new(8);
        let mut handle = start_session(&destination, config, Box::new(tap));
        let mut events = handle.take_events().unwrap();

        feed.publish(segment_exchange_at("http://a.test/live/seg0.ts", b'a', 100))
            .await
            .unwrap();
        feed.publish(segment_exchange_at("http://a.test/live/seg1.ts", b'b', 150))
            .await
            .unwrap();

        let mut ready = 0;
        while ready < 2 {
            match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Some(SessionEvent::SegmentReady { .. })) => ready += 1,
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => panic!("primary stream never produced output"),
            }
        }

        // Let the primary stream go quiet past the stall threshold, then
        // offer a competitor.
        tokio::time::sleep(Duration::from_millis(150)).await;
        feed.publish(segment_exchange_at("http://b.test/live/seg0.ts", b'c', 80))
            .await
            .unwrap();
        drop(feed);

        // Still no end marker, so the outcome is a failed session whose
        // partial file spans both streams.
        match handle.wait().await {
            SessionOutcome::Failed { partial_path, .. } => {
                assert_eq!(partial_path.as_deref(), Some(destination.as_path()));
            }
            other => panic!("expected failure, got {other:?}"),
        }

        let mut keys = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::SegmentReady { sequence_key, .. } = event {
                keys.push(sequence_key);
            }
        }
        assert_eq!(keys, vec![2]);

        let written = std::fs::read(&destination).unwrap();
        assert_eq!(written.len(), 330);
        assert!(written[250..].iter().all(|b| *b == b'c'));
    }

    #[tokio::test]
    async fn test_capture_without_media_fails() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("nothing.ts");
        let (feed, tap) = ChannelTap::new(4);
        let handle = start_session(&destination, SessionConfig::default(), Box::new(tap));

        let mut exchange = Exchange::new(
            "GET",
            Url::parse("https://site.test/index.html").unwrap(),
            StatusCode::OK,
        );
        exchange
            .response_headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
        exchange.body = ExchangeBody::buffered(&b"<html></html>"[..]);
        feed.publish(exchange).await.unwrap();
        drop(feed);

        match handle.wait().await {
            SessionOutcome::Failed {
                reason,
                partial_path,
            } => {
                assert!(reason.contains("capture ended"), "reason: {reason}");
                assert_eq!(partial_path, None);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(!destination.exists());
    }
}
