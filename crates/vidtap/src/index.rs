// Segment index: the single ordering authority for one recording session.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::header::HeaderMap;
use tracing::{debug, warn};
use url::Url;

use crate::error::SessionError;

/// Per-segment lifecycle. Ready is terminal; a Ready payload is immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    Pending,
    Fetching,
    Ready,
    Failed,
}

/// One segment's bookkeeping entry. Lives in the arena until consumed by the
/// assembler or skipped.
#[derive(Debug)]
pub struct SegmentDescriptor {
    pub sequence_key: u64,
    /// Where an active fetch can get the payload. Absent for segments only
    /// ever seen passively.
    pub source_url: Option<Url>,
    /// Request headers replayed on active fetches (cookies, referer).
    pub request_headers: HeaderMap,
    pub byte_length: Option<u64>,
    pub status: SegmentStatus,
    pub retry_count: u32,
    pub payload: Option<Bytes>,
    pub registered_at: Instant,
}

impl SegmentDescriptor {
    pub fn pending(
        sequence_key: u64,
        source_url: Option<Url>,
        request_headers: HeaderMap,
    ) -> Self {
        Self {
            sequence_key,
            source_url,
            request_headers,
            byte_length: None,
            status: SegmentStatus::Pending,
            retry_count: 0,
            payload: None,
            registered_at: Instant::now(),
        }
    }
}

/// Arena of segment descriptors keyed by sequence. All ordering decisions go
/// through here; neither the classifier nor the assembler keeps its own copy.
#[derive(Debug, Default)]
pub struct SegmentIndex {
    arena: BTreeMap<u64, SegmentDescriptor>,
    /// Keys handed to the assembler, with the byte length that was written.
    consumed: BTreeMap<u64, u64>,
    /// Keys given up on; arrivals for them are discarded.
    skipped: BTreeSet<u64>,
    total_count: Option<u64>,
}

impl SegmentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor. Idempotent by sequence_key: a key that already
    /// exists (or was already consumed or skipped) is left alone, except that
    /// a registration carrying a source URL fills one in where it was missing
    /// so the supervisor can fetch the segment later.
    pub fn register(&mut self, descriptor: SegmentDescriptor) -> bool {
        let key = descriptor.sequence_key;
        if self.consumed.contains_key(&key) || self.skipped.contains(&key) {
            return false;
        }
        match self.arena.get_mut(&key) {
            Some(existing) => {
                if existing.source_url.is_none() && descriptor.source_url.is_some() {
                    existing.source_url = descriptor.source_url;
                    existing.request_headers = descriptor.request_headers;
                }
                false
            }
            None => {
                self.arena.insert(key, descriptor);
                true
            }
        }
    }

    /// Attach a payload and move the descriptor to Ready. A duplicate arrival
    /// with the same byte length is discarded (`Ok(false)`); one with a
    /// differing length is a conflict and surfaces as an error.
    pub fn mark_ready(&mut self, sequence_key: u64, payload: Bytes) -> Result<bool, SessionError> {
        let incoming_len = payload.len() as u64;

        if self.skipped.contains(&sequence_key) {
            warn!(sequence_key, "payload arrived for a skipped segment, discarding");
            return Ok(false);
        }
        if let Some(&existing_len) = self.consumed.get(&sequence_key) {
            return if existing_len == incoming_len {
                debug!(sequence_key, "duplicate payload for consumed segment, discarding");
                Ok(false)
            } else {
                Err(SessionError::SegmentConflict {
                    sequence_key,
                    existing_len,
                    incoming_len,
                })
            };
        }

        match self.arena.get_mut(&sequence_key) {
            Some(descriptor) => {
                if descriptor.status == SegmentStatus::Ready {
                    let existing_len = descriptor.byte_length.unwrap_or(0);
                    return if existing_len == incoming_len {
                        debug!(sequence_key, "duplicate payload, discarding");
                        Ok(false)
                    } else {
                        Err(SessionError::SegmentConflict {
                            sequence_key,
                            existing_len,
                            incoming_len,
                        })
                    };
                }
                descriptor.byte_length = Some(incoming_len);
                descriptor.payload = Some(payload);
                descriptor.status = SegmentStatus::Ready;
                Ok(true)
            }
            None => {
                // Passive capture can deliver a segment nothing registered.
                let mut descriptor = SegmentDescriptor::pending(sequence_key, None, HeaderMap::new());
                descriptor.byte_length = Some(incoming_len);
                descriptor.payload = Some(payload);
                descriptor.status = SegmentStatus::Ready;
                self.arena.insert(sequence_key, descriptor);
                Ok(true)
            }
        }
    }

    /// Move a Pending descriptor to Fetching and hand back what the fetch
    /// needs. Returns None when the key is not fetchable (wrong state, or no
    /// source URL was ever learned for it).
    pub fn begin_fetch(&mut self, sequence_key: u64) -> Option<(Url, HeaderMap)> {
        let descriptor = self.arena.get_mut(&sequence_key)?;
        if descriptor.status != SegmentStatus::Pending {
            return None;
        }
        let url = descriptor.source_url.clone()?;
        descriptor.status = SegmentStatus::Fetching;
        Some((url, descriptor.request_headers.clone()))
    }

    pub fn mark_failed(&mut self, sequence_key: u64, retry_count: u32) {
        if let Some(descriptor) = self.arena.get_mut(&sequence_key) {
            descriptor.status = SegmentStatus::Failed;
            descriptor.retry_count = retry_count;
        }
    }

    /// Put a Fetching descriptor back to Pending, used when the job queue is
    /// full and dispatch has to be retried on a later sweep.
    pub fn requeue_fetch(&mut self, sequence_key: u64) {
        if let Some(descriptor) = self.arena.get_mut(&sequence_key) {
            if descriptor.status == SegmentStatus::Fetching {
                descriptor.status = SegmentStatus::Pending;
            }
        }
    }

    /// Give up on a key. Its entry leaves the arena so the low-water mark can
    /// move past it; later arrivals for it are discarded.
    pub fn skip(&mut self, sequence_key: u64) -> bool {
        let existed = self.arena.remove(&sequence_key).is_some();
        self.skipped.insert(sequence_key);
        existed
    }

    /// Pop the lowest-keyed descriptor, but only if it is Ready. This is the
    /// sliding low-water mark: a Ready descriptor behind a hole stays put
    /// until everything below it has been consumed or skipped.
    pub fn next_contiguous_ready(&mut self) -> Option<SegmentDescriptor> {
        let (&key, descriptor) = self.arena.first_key_value()?;
        if descriptor.status != SegmentStatus::Ready {
            return None;
        }
        let descriptor = self.arena.remove(&key)?;
        self.consumed
            .insert(key, descriptor.byte_length.unwrap_or(0));
        Some(descriptor)
    }

    /// Keys known but not yet Ready, below the declared total when one is
    /// known.
    pub fn gaps(&self) -> BTreeSet<u64> {
        self.arena
            .iter()
            .filter(|(key, d)| {
                d.status != SegmentStatus::Ready
                    && self.total_count.is_none_or(|total| **key < total)
            })
            .map(|(key, _)| *key)
            .collect()
    }

    /// Every non-Ready key still in the arena, with no total filter. Used when
    /// a stream is abandoned wholesale and its unfinished keys must not block
    /// contiguity.
    pub fn unresolved(&self) -> Vec<u64> {
        self.arena
            .iter()
            .filter(|(_, d)| d.status != SegmentStatus::Ready)
            .map(|(key, _)| *key)
            .collect()
    }

    /// Pending keys whose registration is older than `grace` and that carry a
    /// source URL, i.e. candidates for an active fetch.
    pub fn due_for_fetch(&self, grace: Duration) -> Vec<u64> {
        self.arena
            .iter()
            .filter(|(_, d)| {
                d.status == SegmentStatus::Pending
                    && d.source_url.is_some()
                    && d.registered_at.elapsed() >= grace
            })
            .map(|(key, _)| *key)
            .collect()
    }

    pub fn set_total_count(&mut self, total: u64) {
        self.total_count = Some(self.total_count.map_or(total, |t| t.max(total)));
    }

    pub fn total_count(&self) -> Option<u64> {
        self.total_count
    }

    /// Whether a failure on this key makes a complete file impossible.
    pub fn is_required(&self, sequence_key: u64) -> bool {
        self.total_count.is_none_or(|total| sequence_key < total)
    }

    pub fn lowest_outstanding(&self) -> Option<u64> {
        self.arena.first_key_value().map(|(key, _)| *key)
    }

    pub fn last_consumed(&self) -> Option<(u64, u64)> {
        self.consumed.last_key_value().map(|(k, l)| (*k, *l))
    }

    /// Highest key this session has ever seen, consumed or not.
    pub fn max_known_key(&self) -> Option<u64> {
        let in_arena = self.arena.last_key_value().map(|(k, _)| *k);
        let consumed = self.consumed.last_key_value().map(|(k, _)| *k);
        let skipped = self.skipped.last().copied();
        [in_arena, consumed, skipped].into_iter().flatten().max()
    }

    pub fn status_of(&self, sequence_key: u64) -> Option<SegmentStatus> {
        self.arena.get(&sequence_key).map(|d| d.status)
    }

    pub fn outstanding(&self) -> usize {
        self.arena.len()
    }

    pub fn consumed_count(&self) -> u64 {
        self.consumed.len() as u64
    }

    /// Nothing left in the arena: every known key was consumed or skipped.
    pub fn is_drained(&self) -> bool {
        self.arena.is_empty()
    }
}
