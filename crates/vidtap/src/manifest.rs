// Manifest parsing: HLS playlists plus a plain URL-list fallback.

use m3u8_rs::{Playlist, parse_playlist_res};
use url::Url;

use crate::error::SessionError;

/// One segment a manifest promises, before any payload exists for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRef {
    pub sequence_key: u64,
    pub url: Url,
}

/// A media playlist reduced to what the session needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaManifest {
    pub segments: Vec<SegmentRef>,
    /// True when the playlist is final (ENDLIST, or a one-shot URL list).
    pub end_of_stream: bool,
}

impl MediaManifest {
    /// Declared segment count. Known only for final playlists; a live
    /// playlist may still grow.
    pub fn total_count(&self) -> Option<u64> {
        if !self.end_of_stream {
            return None;
        }
        Some(
            self.segments
                .iter()
                .map(|s| s.sequence_key + 1)
                .max()
                .unwrap_or(0),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedManifest {
    /// Variant list. Carries the highest-bandwidth variant to fetch next.
    Master { variant_url: Url },
    Media(MediaManifest),
}

/// Parse manifest text fetched from `manifest_url`. Bodies with HLS tags go
/// through the playlist parser; anything else is tried as a bare URL list,
/// one segment URL per line.
pub fn parse_manifest(manifest_url: &Url, bytes: &[u8]) -> Result<ParsedManifest, SessionError> {
    if looks_like_hls(bytes) {
        parse_hls(manifest_url, bytes)
    } else {
        parse_url_list(bytes)
    }
}

fn looks_like_hls(bytes: &[u8]) -> bool {
    bytes
        .split(|b| *b == b'\n')
        .any(|line| line.trim_ascii_start().starts_with(b"#EXT"))
}

fn parse_hls(manifest_url: &Url, bytes: &[u8]) -> Result<ParsedManifest, SessionError> {
    match parse_playlist_res(bytes) {
        Ok(Playlist::MasterPlaylist(master)) => {
            let variant = master
                .variants
                .iter()
                .max_by_key(|v| v.bandwidth)
                .ok_or_else(|| SessionError::invalid_manifest("master playlist has no variants"))?;
            Ok(ParsedManifest::Master {
                variant_url: join(manifest_url, &variant.uri)?,
            })
        }
        Ok(Playlist::MediaPlaylist(playlist)) => {
            let mut segments = Vec::with_capacity(playlist.segments.len());
            for (idx, segment) in playlist.segments.iter().enumerate() {
                segments.push(SegmentRef {
                    sequence_key: playlist.media_sequence + idx as u64,
                    url: join(manifest_url, &segment.uri)?,
                });
            }
            Ok(ParsedManifest::Media(MediaManifest {
                segments,
                end_of_stream: playlist.end_list,
            }))
        }
        Err(e) => Err(SessionError::invalid_manifest(format!(
            "failed to parse playlist: {e}"
        ))),
    }
}

/// Fallback for capture logs and scrapers that hand over a newline-separated
/// list of segment URLs. The list is taken as complete and already ordered.
fn parse_url_list(bytes: &[u8]) -> Result<ParsedManifest, SessionError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| SessionError::invalid_manifest("manifest body is not valid UTF-8"))?;
    let mut segments = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if !(line.starts_with("https://") || line.starts_with("http://")) {
            continue;
        }
        let url = Url::parse(line)
            .map_err(|e| SessionError::invalid_manifest(format!("bad URL in list: {e}")))?;
        segments.push(SegmentRef {
            sequence_key: segments.len() as u64,
            url,
        });
    }
    if segments.is_empty() {
        return Err(SessionError::invalid_manifest(
            "no playlist tags and no segment URLs found",
        ));
    }
    Ok(ParsedManifest::Media(MediaManifest {
        segments,
        end_of_stream: true,
    }))
}

fn join(base: &Url, reference: &str) -> Result<Url, SessionError> {
    base.join(reference)
        .map_err(|e| SessionError::invalid_manifest(format!("cannot resolve {reference}: {e}")))
}
