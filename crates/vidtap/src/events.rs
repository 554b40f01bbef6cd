// Events a session pushes to its caller while it runs.

use std::path::PathBuf;

use crate::progress::ProgressSnapshot;
use crate::session::SessionOutcome;

/// Lifecycle notifications, delivered in order on the handle's event channel.
/// `Finished` is always the last event a session emits.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Started {
        destination: PathBuf,
    },
    /// A segment's payload was written to the output file.
    SegmentReady {
        sequence_key: u64,
        byte_length: u64,
    },
    Progress(ProgressSnapshot),
    /// End-of-stream marker observed; the total is known from here on when
    /// the stream declared one.
    StreamEnded {
        total_count: Option<u64>,
    },
    /// An optional trailing segment was given up on without failing the
    /// session.
    SegmentSkipped {
        sequence_key: u64,
        reason: String,
    },
    Finished(SessionOutcome),
}
