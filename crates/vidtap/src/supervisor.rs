// Download supervisor: bounded worker pool for active segment fetches.

use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use reqwest::Client;
use reqwest::header::HeaderMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::SessionError;
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};

/// One fetch request: a segment the passive capture never delivered.
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub sequence_key: u64,
    pub url: Url,
    /// Headers replayed from the original browser request.
    pub headers: HeaderMap,
}

/// Terminal result of one fetch job, after retries.
#[derive(Debug)]
pub enum FetchOutcome {
    Ready {
        sequence_key: u64,
        payload: Bytes,
    },
    Exhausted {
        sequence_key: u64,
        attempts: u32,
        error: SessionError,
    },
}

/// Pulls fetch jobs off a channel and runs up to `concurrency` of them at a
/// time, each with its own retry schedule. Workers never share a sequence
/// key, so outcomes can be reported in completion order.
pub struct DownloadSupervisor {
    client: Client,
    policy: RetryPolicy,
    concurrency: usize,
    job_rx: mpsc::Receiver<FetchJob>,
    outcome_tx: mpsc::Sender<FetchOutcome>,
    token: CancellationToken,
}

impl DownloadSupervisor {
    pub fn new(
        client: Client,
        policy: RetryPolicy,
        concurrency: usize,
        job_rx: mpsc::Receiver<FetchJob>,
        outcome_tx: mpsc::Sender<FetchOutcome>,
        token: CancellationToken,
    ) -> Self {
        Self {
            client,
            policy,
            concurrency: concurrency.max(1),
            job_rx,
            outcome_tx,
            token,
        }
    }

    pub async fn run(mut self) {
        debug!(concurrency = self.concurrency, "download supervisor started");
        let mut futures = FuturesUnordered::new();
        let mut draining = false;

        loop {
            let can_accept_more = futures.len() < self.concurrency;

            tokio::select! {
                biased;

                _ = self.token.cancelled(), if !draining => {
                    debug!("cancellation received, supervisor draining in-flight fetches");
                    draining = true;
                    // Stop taking new jobs while the in-flight ones wind down.
                    self.job_rx.close();
                }

                maybe_job = self.job_rx.recv(), if !draining && can_accept_more => {
                    match maybe_job {
                        Some(job) => {
                            trace!(sequence_key = job.sequence_key, url = %job.url, "fetch dispatched");
                            let client = self.client.clone();
                            let policy = self.policy.clone();
                            let token = self.token.clone();
                            futures.push(Self::fetch_segment(client, policy, token, job));
                        }
                        None => {
                            debug!("job channel closed, draining in-flight fetches");
                            draining = true;
                        }
                    }
                }

                Some(outcome) = futures.next() => {
                    if self.outcome_tx.send(outcome).await.is_err() {
                        debug!("outcome channel closed, supervisor shutting down");
                        break;
                    }
                }

                else => {
                    // Draining and nothing left in flight.
                    break;
                }
            }
        }
        debug!("download supervisor finished");
    }

    /// Fetch one segment with retries. Always resolves to an outcome; the
    /// error path carries how many attempts were burned.
    async fn fetch_segment(
        client: Client,
        policy: RetryPolicy,
        token: CancellationToken,
        job: FetchJob,
    ) -> FetchOutcome {
        let sequence_key = job.sequence_key;
        let attempts_made = AtomicU32::new(0);

        let attempt_loop = retry_with_backoff(&policy, &token, |attempt| {
            attempts_made.store(attempt + 1, Ordering::Relaxed);
            let client = client.clone();
            let job = job.clone();
            async move { Self::fetch_once(client, job).await }
        });
        // Cancellation aborts the in-flight request too, not just the backoff
        // sleeps, so teardown is never stuck behind a slow response.
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(SessionError::Cancelled),
            result = attempt_loop => result,
        };

        match result {
            Ok(payload) => {
                trace!(sequence_key, bytes = payload.len(), "fetch complete");
                FetchOutcome::Ready {
                    sequence_key,
                    payload,
                }
            }
            Err(error) => {
                warn!(sequence_key, %error, "fetch exhausted its retries");
                FetchOutcome::Exhausted {
                    sequence_key,
                    attempts: attempts_made.load(Ordering::Relaxed),
                    error,
                }
            }
        }
    }

    async fn fetch_once(client: Client, job: FetchJob) -> RetryAction<Bytes> {
        let response = match client
            .get(job.url.clone())
            .headers(job.headers.clone())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let error = SessionError::Network(e);
                return if error.is_retryable() {
                    RetryAction::Retry(error)
                } else {
                    RetryAction::Fail(error)
                };
            }
        };

        let status = response.status();
        if !status.is_success() {
            let error = SessionError::HttpStatus {
                status,
                url: job.url.to_string(),
            };
            return if error.is_retryable() {
                RetryAction::Retry(error)
            } else {
                RetryAction::Fail(error)
            };
        }

        let mut stream = response.bytes_stream();
        let mut buffer = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => buffer.extend_from_slice(&bytes),
                // A body cut short is worth another attempt.
                Err(e) => return RetryAction::Retry(SessionError::Network(e)),
            }
        }
        RetryAction::Success(buffer.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use crate::net::create_client;
    use std::collections::{HashMap, VecDeque};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    type Routes = HashMap<String, VecDeque<(u16, Vec<u8>)>>;

    /// Minimal HTTP/1.1 server serving canned responses by path. A path's
    /// queue pops until one response remains, which then repeats.
    async fn spawn_test_server(routes: Routes) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes = Arc::new(tokio::sync::Mutex::new(routes));

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let routes = Arc::clone(&routes);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut read = 0usize;
                    loop {
                        let n = socket.read(&mut buf[read..]).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        read += n;
                        if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                        if read == buf.len() {
                            return;
                        }
                    }
                    let request = String::from_utf8_lossy(&buf[..read]).to_string();
                    let path = request
                        .split_whitespace()
                        .nth(1)
                        .unwrap_or("/")
                        .to_string();

                    let (status, body) = {
                        let mut routes = routes.lock().await;
                        match routes.get_mut(&path) {
                            Some(queue) if queue.len() > 1 => {
                                queue.pop_front().unwrap_or((404, Vec::new()))
                            }
                            Some(queue) => queue.front().cloned().unwrap_or((404, Vec::new())),
                            None => (404, Vec::new()),
                        }
                    };
                    let reason = match status {
                        200 => "OK",
                        404 => "Not Found",
                        503 => "Service Unavailable",
                        _ => "Other",
                    };
                    let header = format!(
                        "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = socket.write_all(header.as_bytes()).await;
                    let _ = socket.write_all(&body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        addr
    }

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: std::time::Duration::from_millis(5),
            max_delay: std::time::Duration::from_millis(20),
            jitter: false,
        }
    }

    fn job(addr: SocketAddr, key: u64, path: &str) -> FetchJob {
        FetchJob {
            sequence_key: key,
            url: Url::parse(&format!("http://{addr}{path}")).unwrap(),
            headers: HeaderMap::new(),
        }
    }

    struct Rig {
        job_tx: mpsc::Sender<FetchJob>,
        outcome_rx: mpsc::Receiver<FetchOutcome>,
        handle: tokio::task::JoinHandle<()>,
        token: CancellationToken,
    }

    fn start_supervisor(concurrency: usize) -> Rig {
        let (job_tx, job_rx) = mpsc::channel(8);
        let (outcome_tx, outcome_rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        let client = create_client(&NetConfig::default()).unwrap();
        let supervisor = DownloadSupervisor::new(
            client,
            quick_policy(),
            concurrency,
            job_rx,
            outcome_tx,
            token.clone(),
        );
        let handle = tokio::spawn(supervisor.run());
        Rig {
            job_tx,
            outcome_rx,
            handle,
            token,
        }
    }

    #[tokio::test]
    async fn test_fetch_succeeds_after_transient_errors() {
        let addr = spawn_test_server(HashMap::from([(
            "/flaky.ts".to_string(),
            VecDeque::from([
                (503, Vec::new()),
                (503, Vec::new()),
                (200, b"segment-payload".to_vec()),
            ]),
        )]))
        .await;

        let mut rig = start_supervisor(2);
        rig.job_tx.send(job(addr, 4, "/flaky.ts")).await.unwrap();
        drop(rig.job_tx);

        match rig.outcome_rx.recv().await.unwrap() {
            FetchOutcome::Ready {
                sequence_key,
                payload,
            } => {
                assert_eq!(sequence_key, 4);
                assert_eq!(&payload[..], b"segment-payload");
            }
            other => panic!("expected Ready, got {other:?}"),
        }
        rig.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_error_fails_without_retries() {
        let addr = spawn_test_server(HashMap::new()).await;

        let mut rig = start_supervisor(1);
        rig.job_tx.send(job(addr, 9, "/gone.ts")).await.unwrap();
        drop(rig.job_tx);

        match rig.outcome_rx.recv().await.unwrap() {
            FetchOutcome::Exhausted {
                sequence_key,
                attempts,
                error,
            } => {
                assert_eq!(sequence_key, 9);
                assert_eq!(attempts, 1);
                assert!(matches!(error, SessionError::HttpStatus { status, .. } if status.as_u16() == 404));
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        rig.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_parallel_jobs_all_complete() {
        let routes: Routes = (0..3)
            .map(|i| {
                (
                    format!("/seg{i}.ts"),
                    VecDeque::from([(200, format!("payload-{i}").into_bytes())]),
                )
            })
            .collect();
        let addr = spawn_test_server(routes).await;

        let mut rig = start_supervisor(2);
        for i in 0..3u64 {
            rig.job_tx
                .send(job(addr, i, &format!("/seg{i}.ts")))
                .await
                .unwrap();
        }
        drop(rig.job_tx);

        let mut seen = Vec::new();
        for _ in 0..3 {
            match rig.outcome_rx.recv().await.unwrap() {
                FetchOutcome::Ready { sequence_key, .. } => seen.push(sequence_key),
                other => panic!("expected Ready, got {other:?}"),
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
        rig.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_shuts_the_pool_down() {
        let rig = start_supervisor(2);
        rig.token.cancel();
        rig.handle.await.unwrap();
    }
}
