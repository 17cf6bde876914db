//! `Content-Length` framing for LSP streams.
//!
//! The decoder is incremental: bytes arrive in whatever chunks the pipe
//! delivers, and complete frames are pulled out one at a time. Partial
//! frames stay buffered until the next read. Unknown headers are
//! tolerated; a header block without `Content-Length` is skipped so the
//! stream can resync at the next recognizable header.

use std::fmt;

/// Ceiling on a single frame body. A server announcing more than this is
/// treated as unrecoverable by the caller.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Header block was malformed; the offending bytes were discarded and
    /// decoding can continue from the next header.
    Malformed(String),
    /// Announced body size exceeds the ceiling. Fatal for the stream.
    Oversized(usize),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(detail) => write!(f, "malformed frame header: {detail}"),
            Self::Oversized(len) => {
                write!(f, "frame body of {len} bytes exceeds limit of {MAX_FRAME_SIZE}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Incremental decoder holding one stream's partial-frame state.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently buffered (partial frame or not-yet-drained frames).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pull the next complete frame body out of the buffer.
    ///
    /// `Ok(None)` means more bytes are needed. `Err(Malformed)` consumed the
    /// bad header block; keep calling. `Err(Oversized)` leaves the buffer
    /// untouched; the stream cannot be resynced and should be torn down.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let Some(header_end) = find(&self.buf, HEADER_TERMINATOR) else {
            return Ok(None);
        };
        let body_start = header_end + HEADER_TERMINATOR.len();

        let content_length = match parse_content_length(&self.buf[..header_end]) {
            Ok(len) => len,
            Err(detail) => {
                // Resync: drop through the bad header block.
                self.buf.drain(..body_start);
                return Err(FrameError::Malformed(detail));
            }
        };
        if content_length > MAX_FRAME_SIZE {
            return Err(FrameError::Oversized(content_length));
        }
        if self.buf.len() < body_start + content_length {
            return Ok(None);
        }

        let body = self.buf[body_start..body_start + content_length].to_vec();
        self.buf.drain(..body_start + content_length);
        Ok(Some(body))
    }
}

/// Scan a header block for `Content-Length`. Other headers (e.g.
/// `Content-Type`) are ignored.
fn parse_content_length(headers: &[u8]) -> Result<usize, String> {
    let text = std::str::from_utf8(headers).map_err(|_| "non-UTF-8 header block".to_string())?;
    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            return value
                .trim()
                .parse()
                .map_err(|_| format!("bad Content-Length value {:?}", value.trim()));
        }
    }
    Err("missing Content-Length header".to_string())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Frame a message body for the wire.
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 32);
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut decoder = FrameDecoder::new();
        decoder.extend(bytes);
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = decoder.next_frame() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn roundtrip_single_frame() {
        let body = br#"{"jsonrpc":"2.0","id":1,"result":null}"#;
        let frames = decode_all(&encode_frame(body));
        assert_eq!(frames, vec![body.to_vec()]);
    }

    #[test]
    fn roundtrip_preserves_json_value() {
        let value = serde_json::json!({"id": 7, "result": {"nested": [1, 2, 3], "s": "héllo"}});
        let body = serde_json::to_vec(&value).unwrap();
        let frames = decode_all(&encode_frame(&body));
        let decoded: serde_json::Value = serde_json::from_slice(&frames[0]).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn two_frames_in_one_chunk() {
        let mut bytes = encode_frame(b"first");
        bytes.extend_from_slice(&encode_frame(b"second"));
        assert_eq!(decode_all(&bytes), vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn partial_header_then_rest() {
        let full = encode_frame(b"{\"x\":1}");
        let mut decoder = FrameDecoder::new();
        decoder.extend(&full[..5]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.extend(&full[5..]);
        assert_eq!(decoder.next_frame().unwrap(), Some(b"{\"x\":1}".to_vec()));
    }

    #[test]
    fn partial_body_then_rest() {
        let full = encode_frame(b"abcdef");
        let split = full.len() - 3;
        let mut decoder = FrameDecoder::new();
        decoder.extend(&full[..split]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.extend(&full[split..]);
        assert_eq!(decoder.next_frame().unwrap(), Some(b"abcdef".to_vec()));
    }

    #[test]
    fn unknown_headers_tolerated() {
        let bytes = b"Content-Type: application/vscode-jsonrpc\r\nContent-Length: 2\r\n\r\nok";
        assert_eq!(decode_all(bytes), vec![b"ok".to_vec()]);
    }

    #[test]
    fn header_name_case_insensitive() {
        let bytes = b"content-length: 2\r\n\r\nhi";
        assert_eq!(decode_all(bytes), vec![b"hi".to_vec()]);
    }

    #[test]
    fn malformed_header_resyncs_at_next_frame() {
        let mut bytes = b"X-Garbage: nonsense\r\n\r\n".to_vec();
        bytes.extend_from_slice(&encode_frame(b"after"));
        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);
        assert!(matches!(decoder.next_frame(), Err(FrameError::Malformed(_))));
        assert_eq!(decoder.next_frame().unwrap(), Some(b"after".to_vec()));
    }

    #[test]
    fn bad_length_value_is_malformed() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"Content-Length: banana\r\n\r\n");
        assert!(matches!(decoder.next_frame(), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn oversized_length_is_fatal() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(format!("Content-Length: {}\r\n\r\n", MAX_FRAME_SIZE + 1).as_bytes());
        assert_eq!(
            decoder.next_frame(),
            Err(FrameError::Oversized(MAX_FRAME_SIZE + 1))
        );
    }
}
