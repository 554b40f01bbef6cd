// Media classifier: pure decision function over exchange metadata.

use url::Url;

use crate::exchange::Exchange;

/// Known media container extensions seen in sniffed traffic.
const MEDIA_EXTENSIONS: &[&str] = &["mp4", "m4v", "m4s", "ts", "webm", "flv", "mov", "mkv"];

/// Playlist text extensions.
const MANIFEST_EXTENSIONS: &[&str] = &["m3u8", "m3u"];

const MANIFEST_CONTENT_TYPES: &[&str] = &[
    "application/vnd.apple.mpegurl",
    "application/x-mpegurl",
    "application/mpegurl",
    "audio/mpegurl",
    "audio/x-mpegurl",
];

/// Query parameters CDNs use to carry a segment ordinal.
const SEQUENCE_QUERY_KEYS: &[&str] = &["seg", "segment", "index", "num", "sq"];

/// Stem prefixes that anchor a trailing digit run as a segment ordinal.
const SEGMENT_STEM_MARKERS: &[&str] = &["seg", "segment", "chunk", "frag", "fragment", "part", "media"];

/// Verdict for one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Not media traffic, or media we cannot place.
    Ignore,
    /// A whole media file delivered in one exchange.
    SingleFile {
        content_type: Option<String>,
        estimated_len: Option<u64>,
    },
    /// One piece of a segmented stream.
    Segment {
        sequence_key: u64,
        /// Declared by a manifest, never by the exchange itself.
        total_count: Option<u64>,
    },
    /// Playlist text; parsed separately, never written to the output.
    Manifest,
}

/// Classify one exchange. First match wins:
///
/// 1. media content type or container extension, split into Segment vs
///    SingleFile by the presence of a sequence marker
/// 2. explicit byte-range or segment-index marker on an opaque response
/// 3. adaptive-streaming manifest
/// 4. everything else is ignored
pub fn classify(exchange: &Exchange) -> Classification {
    if !exchange.status.is_success() || exchange.method.eq_ignore_ascii_case("HEAD") {
        return Classification::Ignore;
    }

    let content_type = exchange.content_type();
    let extension = path_extension(&exchange.url);

    let manifest = is_manifest(content_type.as_deref(), extension.as_deref(), &exchange.url);

    let media_type = content_type
        .as_deref()
        .is_some_and(is_media_content_type);
    let media_extension = extension
        .as_deref()
        .is_some_and(|ext| MEDIA_EXTENSIONS.contains(&ext));

    if media_type || media_extension {
        if let Some(sequence_key) = sequence_marker(exchange, true) {
            return Classification::Segment {
                sequence_key,
                total_count: None,
            };
        }
        return Classification::SingleFile {
            content_type,
            estimated_len: exchange.content_length().or_else(|| exchange.body.len_hint()),
        };
    }

    // Explicit markers outrank generic detection, but playlist text and
    // textual payloads never count as segment payload no matter how their
    // URLs are numbered.
    if !manifest && !content_type.as_deref().is_some_and(is_textual_content_type) {
        if let Some(sequence_key) = sequence_marker(exchange, false) {
            return Classification::Segment {
                sequence_key,
                total_count: None,
            };
        }
    }

    if manifest {
        return Classification::Manifest;
    }

    Classification::Ignore
}

/// Extract a sequence key from byte-range start, segment query parameter, or
/// (for media URLs only) a trailing ordinal in the path stem.
fn sequence_marker(exchange: &Exchange, allow_path_ordinal: bool) -> Option<u64> {
    if let Some(start) = byte_range_start(exchange) {
        return Some(start);
    }
    if let Some(key) = query_sequence(&exchange.url) {
        return Some(key);
    }
    if allow_path_ordinal {
        return path_ordinal(&exchange.url);
    }
    None
}

fn is_media_content_type(content_type: &str) -> bool {
    content_type.starts_with("video/")
        || content_type.starts_with("audio/")
        || matches!(content_type, "application/mp4" | "application/mp2t")
}

fn is_textual_content_type(content_type: &str) -> bool {
    content_type.starts_with("text/")
        || content_type.ends_with("+xml")
        || content_type.ends_with("+json")
        || matches!(
            content_type,
            "application/json"
                | "application/xml"
                | "application/javascript"
                | "application/x-javascript"
        )
}

fn is_manifest(content_type: Option<&str>, extension: Option<&str>, url: &Url) -> bool {
    if extension.is_some_and(|ext| MANIFEST_EXTENSIONS.contains(&ext)) {
        return true;
    }
    if content_type.is_some_and(|ct| MANIFEST_CONTENT_TYPES.contains(&ct)) {
        return true;
    }
    // Plain-text playlists without a telling extension, e.g. "/chunklist".
    let textual_or_unknown = match content_type {
        Some(ct) => is_textual_content_type(ct),
        None => true,
    };
    textual_or_unknown
        && file_name(url).is_some_and(|name| {
            let lower = name.to_ascii_lowercase();
            lower.contains("playlist") || lower.contains("chunklist")
        })
}

/// Start offset of a `Content-Range: bytes <start>-<end>/<total>` header.
fn byte_range_start(exchange: &Exchange) -> Option<u64> {
    let range = exchange.content_range()?;
    let spec = range.trim().strip_prefix("bytes")?.trim_start();
    let (start, _) = spec.split_once('-')?;
    start.parse().ok()
}

fn query_sequence(url: &Url) -> Option<u64> {
    for (key, value) in url.query_pairs() {
        if SEQUENCE_QUERY_KEYS
            .iter()
            .any(|candidate| key.eq_ignore_ascii_case(candidate))
        {
            if let Ok(parsed) = value.parse() {
                return Some(parsed);
            }
        }
    }
    None
}

fn file_name(url: &Url) -> Option<&str> {
    url.path_segments()?.filter(|s| !s.is_empty()).next_back()
}

fn path_extension(url: &Url) -> Option<String> {
    let name = file_name(url)?;
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() || ext.chars().any(|c| !c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Trailing digit run of the final path stem, accepted only when anchored by
/// a separator or a segment-ish word so "video720.mp4" stays a single file.
fn path_ordinal(url: &Url) -> Option<u64> {
    let name = file_name(url)?;
    let stem = match name.rsplit_once('.') {
        Some((stem, _)) => stem,
        None => name,
    };
    let digits_start = stem
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()?
        .0;
    let digits = &stem[digits_start..];
    let prefix = &stem[..digits_start];
    let anchored = prefix.is_empty()
        || prefix.ends_with(['-', '_'])
        || SEGMENT_STEM_MARKERS
            .iter()
            .any(|marker| prefix.to_ascii_lowercase().ends_with(marker));
    if !anchored {
        return None;
    }
    digits.parse().ok()
}
