use bytes::{Bytes, BytesMut};
use tracing::warn;

/// JPEG Start-Of-Image and End-Of-Image markers.
const SOI: &[u8] = &[0xFF, 0xD8];
const EOI: &[u8] = &[0xFF, 0xD9];

/// Ceiling on the unconsumed accumulator. A stream that grows past this
/// without yielding a frame is treated as stalled or malformed.
const MAX_BUFFER: usize = 1024 * 1024;
/// Most-recent bytes kept when the ceiling is hit.
const KEEP_ON_TRUNCATE: usize = 512 * 1024;

/// Extract the multipart boundary token from a `Content-Type` header value.
///
/// Matches `boundary=<token>` case-insensitively, tolerating optional quotes
/// and trailing parameters. Camera firmware varies here (`--boundary`,
/// `--myboundary`, with or without CRLF conventions), so the token is used
/// only to validate the header; frame extraction keys off the JPEG markers.
pub fn parse_boundary(content_type: &str) -> Option<String> {
    let lower = content_type.to_ascii_lowercase();
    let at = lower.find("boundary=")?;
    let rest = &content_type[at + "boundary=".len()..];
    let token = rest
        .split(|c: char| c == ';' || c.is_whitespace())
        .next()?
        .trim_matches(|c| c == '"' || c == '\'');
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Incremental scanner that turns an accumulating multipart byte stream into
/// complete JPEG payloads.
///
/// Feed chunks with [`extend`](Self::extend), then drain with
/// [`next_frame`](Self::next_frame) in a loop until it returns `None`, so
/// multiple frames arriving in one network read are all emitted before the
/// next read.
#[derive(Debug, Default)]
pub struct FrameExtractor {
    buf: BytesMut,
}

impl FrameExtractor {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256 * 1024),
        }
    }

    /// Append a raw chunk from the network read loop.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Unconsumed bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Scan for the next complete JPEG payload (`SOI .. EOI` inclusive).
    ///
    /// On success the payload and everything before it (part headers,
    /// boundary lines) are consumed. With no complete frame buffered this
    /// returns `None` and leaves the buffer intact, except that past
    /// [`MAX_BUFFER`] the oldest bytes are dropped to bound memory —
    /// sacrificing at most one partial frame of a malformed or stalled
    /// stream.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        if let Some(start) = find_subsequence(&self.buf, SOI) {
            let after_soi = start + SOI.len();
            if let Some(rel) = find_subsequence(&self.buf[after_soi..], EOI) {
                let end = after_soi + rel + EOI.len();
                // Discard boundary and part-header bytes ahead of the SOI.
                let _ = self.buf.split_to(start);
                return Some(self.buf.split_to(end - start).freeze());
            }
        }

        if self.buf.len() > MAX_BUFFER {
            let dropped = self.buf.len() - KEEP_ON_TRUNCATE;
            let _ = self.buf.split_to(dropped);
            warn!(dropped, "accumulator over ceiling without a frame, truncated");
        }
        None
    }
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
