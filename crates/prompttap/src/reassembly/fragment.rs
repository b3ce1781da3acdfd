//! Streaming body assembly
//!
//! Streaming responses arrive as many small fragments. The assembler joins
//! them in arrival order and recognises the end-of-stream markers of the
//! framings we care about.

use bytes::{Buf, Bytes, BytesMut};
use flate2::read::GzDecoder;
use std::io::Read;

use super::ReassemblyError;
use super::http::MessageHead;

/// Connect envelope flag: payload is compressed
const CONNECT_FLAG_COMPRESSED: u8 = 0x01;
/// Connect envelope flag: end-of-stream message
const CONNECT_FLAG_END_STREAM: u8 = 0x02;
const CONNECT_ENVELOPE_HEADER: usize = 5;

/// Streaming framing of a body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// `text/event-stream`
    EventStream,
    /// `application/connect+*` length-prefixed envelopes
    Connect,
    /// Anything else delimited only by connection close
    UntilClose,
}

impl StreamKind {
    /// Streaming kind signalled by the content type, if any
    pub fn from_head(head: &MessageHead) -> Option<Self> {
        let content_type = head.content_type()?;
        if content_type == "text/event-stream" {
            Some(StreamKind::EventStream)
        } else if content_type.starts_with("application/connect+") {
            Some(StreamKind::Connect)
        } else {
            None
        }
    }
}

/// Joins streaming fragments and detects explicit end markers
#[derive(Debug)]
pub struct FragmentAssembler {
    kind: StreamKind,
    payload: BytesMut,
    pending: BytesMut,
    scanned: usize,
    ended: bool,
}

impl FragmentAssembler {
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            payload: BytesMut::new(),
            pending: BytesMut::new(),
            scanned: 0,
            ended: false,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Bytes held so far
    pub fn len(&self) -> usize {
        self.payload.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a fragment. Returns true once an end marker has been seen;
    /// anything after the marker is ignored.
    pub fn push(&mut self, fragment: &[u8]) -> Result<bool, ReassemblyError> {
        if self.ended {
            return Ok(true);
        }

        match self.kind {
            StreamKind::UntilClose => self.payload.extend_from_slice(fragment),
            StreamKind::EventStream => {
                self.payload.extend_from_slice(fragment);
                self.scan_event_stream();
            }
            StreamKind::Connect => {
                self.pending.extend_from_slice(fragment);
                self.unwrap_envelopes()?;
            }
        }

        Ok(self.ended)
    }

    /// Mark the stream ended without a marker (close or idle timeout)
    pub fn finish(self) -> Bytes {
        self.payload.freeze()
    }

    fn scan_event_stream(&mut self) {
        while let Some(offset) = self.payload[self.scanned..].iter().position(|b| *b == b'\n') {
            let line_end = self.scanned + offset;
            let line = trim_line(&self.payload[self.scanned..line_end]);
            self.scanned = line_end + 1;

            if is_sse_end_marker(line) {
                self.payload.truncate(self.scanned);
                self.ended = true;
                return;
            }
        }
    }

    fn unwrap_envelopes(&mut self) -> Result<(), ReassemblyError> {
        while self.pending.len() >= CONNECT_ENVELOPE_HEADER {
            let flags = self.pending[0];
            let length = u32::from_be_bytes([
                self.pending[1],
                self.pending[2],
                self.pending[3],
                self.pending[4],
            ]) as usize;

            if self.pending.len() < CONNECT_ENVELOPE_HEADER + length {
                return Ok(());
            }

            self.pending.advance(CONNECT_ENVELOPE_HEADER);
            let data = self.pending.split_to(length);

            if flags & CONNECT_FLAG_END_STREAM != 0 {
                self.pending.clear();
                self.ended = true;
                return Ok(());
            }

            if flags & CONNECT_FLAG_COMPRESSED != 0 {
                let mut decoded = Vec::new();
                GzDecoder::new(&data[..])
                    .read_to_end(&mut decoded)
                    .map_err(|e| ReassemblyError::Decompression(format!("connect envelope: {e}")))?;
                self.payload.extend_from_slice(&decoded);
            } else {
                self.payload.extend_from_slice(&data);
            }
        }
        Ok(())
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn is_sse_end_marker(line: &[u8]) -> bool {
    let Some(value) = line
        .strip_prefix(b"data:")
        .or_else(|| line.strip_prefix(b"event:"))
    else {
        return false;
    };
    let value = value.strip_prefix(b" ").unwrap_or(value);
    value == b"[DONE]" || (line.starts_with(b"event:") && value == b"message_stop")
}

/// Frame a payload as a Connect envelope
pub fn connect_envelope(flags: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(CONNECT_ENVELOPE_HEADER + data.len());
    out.push(flags);
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    #[test]
    fn test_connect_fragments_join_until_end_stream() {
        let mut assembler = FragmentAssembler::new(StreamKind::Connect);

        for part in ["Hel", "lo, ", "world"] {
            assert!(!assembler.push(&connect_envelope(0, part.as_bytes())).unwrap());
        }
        assert!(assembler.push(&connect_envelope(CONNECT_FLAG_END_STREAM, b"{}")).unwrap());

        assert_eq!(assembler.finish(), Bytes::from_static(b"Hello, world"));
    }

    #[test]
    fn test_connect_envelope_split_across_pushes() {
        let mut assembler = FragmentAssembler::new(StreamKind::Connect);
        let envelope = connect_envelope(0, b"Hello");

        assert!(!assembler.push(&envelope[..3]).unwrap());
        assert!(!assembler.push(&envelope[3..]).unwrap());
        assert_eq!(assembler.len(), 5);
    }

    #[test]
    fn test_connect_compressed_envelope() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"squeezed").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut assembler = FragmentAssembler::new(StreamKind::Connect);
        assembler
            .push(&connect_envelope(CONNECT_FLAG_COMPRESSED, &compressed))
            .unwrap();
        assert_eq!(assembler.finish(), Bytes::from_static(b"squeezed"));
    }

    #[test]
    fn test_event_stream_done_marker() {
        let mut assembler = FragmentAssembler::new(StreamKind::EventStream);

        assert!(!assembler.push(b"data: {\"a\":1}\n\nda").unwrap());
        assert!(assembler.push(b"ta: [DONE]\n\n").unwrap());
        assert!(assembler.push(b"data: ignored\n\n").unwrap());

        let payload = assembler.finish();
        assert_eq!(&payload[..], b"data: {\"a\":1}\n\ndata: [DONE]\n");
    }

    #[test]
    fn test_event_stream_anthropic_stop() {
        let mut assembler = FragmentAssembler::new(StreamKind::EventStream);
        assert!(
            assembler
                .push(b"event: message_stop\r\ndata: {\"type\":\"message_stop\"}\r\n\r\n")
                .unwrap()
        );
    }

    #[test]
    fn test_until_close_never_ends_by_marker() {
        let mut assembler = FragmentAssembler::new(StreamKind::UntilClose);
        for part in ["Hel", "lo, ", "world"] {
            assert!(!assembler.push(part.as_bytes()).unwrap());
        }
        assert_eq!(assembler.finish(), Bytes::from_static(b"Hello, world"));
    }
}
