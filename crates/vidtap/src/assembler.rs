// Assembler: the single writer producing the output file.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::SessionError;
use crate::progress::SessionState;

/// Owns the output file handle. Payloads land at cumulative offsets in the
/// order they are handed over; bytes already written are never rewritten.
pub struct Assembler {
    destination: PathBuf,
    file: File,
    bytes_written: u64,
    segments_written: u64,
}

impl Assembler {
    pub async fn create(destination: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let destination = destination.into();
        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let file = File::create(&destination).await?;
        debug!(destination = %destination.display(), "output file created");
        Ok(Self {
            destination,
            file,
            bytes_written: 0,
            segments_written: 0,
        })
    }

    /// Append one payload and return the new file length.
    pub async fn consume(&mut self, payload: &Bytes) -> Result<u64, SessionError> {
        self.file.write_all(payload).await?;
        self.bytes_written += payload.len() as u64;
        self.segments_written += 1;
        Ok(self.bytes_written)
    }

    /// Flush buffered writes down to the disk. Called once at teardown no
    /// matter how the session ended, so partial files are intact too.
    pub async fn finalize(&mut self) -> Result<(), SessionError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn segments_written(&self) -> u64 {
        self.segments_written
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }
}

/// Sidecar written next to an output file that is not a complete recording,
/// so a later look at the directory can tell a finished file from a truncated
/// one. Removed when a session completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarMarker {
    pub state: SessionState,
    pub bytes_written: u64,
    pub segments_ready: u64,
    pub total_count: Option<u64>,
    pub reason: Option<String>,
}

pub fn sidecar_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".vidtap.json");
    PathBuf::from(name)
}

pub async fn write_sidecar(destination: &Path, marker: &SidecarMarker) -> Result<(), SessionError> {
    let body = serde_json::to_vec_pretty(marker).map_err(std::io::Error::other)?;
    fs::write(sidecar_path(destination), body).await?;
    Ok(())
}

/// Best-effort removal of a stale marker.
pub async fn remove_sidecar(destination: &Path) {
    let _ = fs::remove_file(sidecar_path(destination)).await;
}
