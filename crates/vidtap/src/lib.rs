//! Browser video traffic sniffing and stream reassembly engine
//!
//! This crate turns a feed of observed HTTP exchanges (from a proxy, a
//! browser extension, or a replayed capture log) into a single playable
//! media file on disk. It classifies each exchange, indexes segmented
//! streams by sequence key, actively re-fetches segments whose payloads
//! were never observed, and assembles everything in order.
//!
//! ## Component Overview
//!
//! - `capture`: traffic tap trait, channel-backed tap, scope filtering, and
//!   capture-log replay
//! - `classify`: per-exchange verdicts (single file, segment, manifest)
//! - `manifest`: HLS playlist and plain URL-list parsing
//! - `index`: the segment arena and ordering authority
//! - `supervisor`: bounded-concurrency download pool with retries
//! - `assembler`: sequential output-file writer and sidecar markers
//! - `session`: the orchestration loop tying it all together
//!
//! ## Quick start
//!
//! ```no_run
//! use vidtap_engine::{ChannelTap, SessionConfig, start_session};
//!
//! # async fn demo() {
//! let (feed, tap) = ChannelTap::new(64);
//! let handle = start_session("out.ts", SessionConfig::default(), Box::new(tap));
//! // feed.publish(exchange).await ... from your capture source
//! drop(feed);
//! let outcome = handle.wait().await;
//! # let _ = outcome;
//! # }
//! ```

pub mod assembler;
pub mod capture;
pub mod classify;
pub mod config;
pub mod error;
pub mod events;
pub mod exchange;
pub mod index;
pub mod manifest;
pub mod net;
pub mod progress;
pub mod retry;
pub mod session;
pub mod supervisor;

pub use assembler::{SidecarMarker, sidecar_path};
pub use capture::{CaptureRecord, ChannelTap, ScopeFilter, TapFeed, TrafficTap, replay_capture_log};
pub use classify::{Classification, classify};
pub use config::{CaptureConfig, NetConfig, SessionConfig, SupervisorConfig};
pub use error::SessionError;
pub use events::SessionEvent;
pub use exchange::{ByteStream, Exchange, ExchangeBody};
pub use progress::{ProgressSnapshot, SessionState};
pub use retry::RetryPolicy;
pub use session::{SessionHandle, SessionOutcome, cancel_session, start_session};
