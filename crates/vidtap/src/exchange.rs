// Exchange data model: one observed HTTP request/response pair.

use std::fmt;
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use url::Url;

use crate::error::SessionError;

pub type ByteStream = BoxStream<'static, Result<Bytes, SessionError>>;

/// Response body of a captured exchange.
///
/// Passive captures that arrived whole carry `Buffered` payloads; bodies still
/// in flight are exposed as a stream that is drained at most once.
pub enum ExchangeBody {
    Buffered(Bytes),
    Streaming(ByteStream),
}

impl ExchangeBody {
    pub fn empty() -> Self {
        ExchangeBody::Buffered(Bytes::new())
    }

    pub fn buffered(bytes: impl Into<Bytes>) -> Self {
        ExchangeBody::Buffered(bytes.into())
    }

    pub fn streaming(stream: ByteStream) -> Self {
        ExchangeBody::Streaming(stream)
    }

    /// Body delivered chunk-by-chunk over a channel, for taps observing a
    /// response that is still arriving. Dropping the sender ends the body.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Result<Bytes, SessionError>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, ExchangeBody::Streaming(ReceiverStream::new(rx).boxed()))
    }

    /// Byte length when it is already known without draining.
    pub fn len_hint(&self) -> Option<u64> {
        match self {
            ExchangeBody::Buffered(b) => Some(b.len() as u64),
            ExchangeBody::Streaming(_) => None,
        }
    }

    /// Whether the capture delivered no payload at all. A streaming body
    /// counts as payload even before it is drained.
    pub fn is_empty(&self) -> bool {
        match self {
            ExchangeBody::Buffered(b) => b.is_empty(),
            ExchangeBody::Streaming(_) => false,
        }
    }

    /// Drain the body into a single contiguous buffer.
    pub async fn drain(self) -> Result<Bytes, SessionError> {
        match self {
            ExchangeBody::Buffered(bytes) => Ok(bytes),
            ExchangeBody::Streaming(mut stream) => {
                let mut buffer = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buffer.extend_from_slice(&chunk?);
                }
                Ok(buffer.freeze())
            }
        }
    }
}

impl fmt::Debug for ExchangeBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeBody::Buffered(b) => write!(f, "Buffered({} bytes)", b.len()),
            ExchangeBody::Streaming(_) => write!(f, "Streaming"),
        }
    }
}

/// One observed HTTP request/response pair. Immutable once captured; owned
/// exclusively by flow capture until handed to the classifier.
#[derive(Debug)]
pub struct Exchange {
    pub method: String,
    pub url: Url,
    pub request_headers: HeaderMap,
    pub status: StatusCode,
    pub response_headers: HeaderMap,
    pub body: ExchangeBody,
    pub observed_at: SystemTime,
}

impl Exchange {
    pub fn new(method: impl Into<String>, url: Url, status: StatusCode) -> Self {
        Self {
            method: method.into(),
            url,
            request_headers: HeaderMap::new(),
            status,
            response_headers: HeaderMap::new(),
            body: ExchangeBody::empty(),
            observed_at: SystemTime::now(),
        }
    }

    /// Normalized Content-Type: lowercased, parameters stripped.
    pub fn content_type(&self) -> Option<String> {
        let raw = self
            .response_headers
            .get(reqwest::header::CONTENT_TYPE)?
            .to_str()
            .ok()?;
        let mime = raw.split(';').next().unwrap_or(raw).trim();
        if mime.is_empty() {
            return None;
        }
        Some(mime.to_ascii_lowercase())
    }

    /// Raw Content-Range header value, when present.
    pub fn content_range(&self) -> Option<&str> {
        self.response_headers
            .get(reqwest::header::CONTENT_RANGE)?
            .to_str()
            .ok()
    }

    /// Declared Content-Length, when present and parseable.
    pub fn content_length(&self) -> Option<u64> {
        self.response_headers
            .get(reqwest::header::CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .parse()
            .ok()
    }

    /// Take the body out, leaving an empty one behind. Metadata stays intact
    /// so the exchange can still be inspected after the payload moved on.
    pub fn take_body(&mut self) -> ExchangeBody {
        std::mem::replace(&mut self.body, ExchangeBody::empty())
    }
}
