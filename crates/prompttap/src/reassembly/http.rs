//! HTTP/1.1 message framing

use bytes::{Buf, BytesMut};

use super::ReassemblyError;

/// Longest accepted chunk-size line
const MAX_CHUNK_LINE: usize = 1024;

const START_TOKENS: &[&[u8]] = &[
    b"HTTP/1.",
    b"GET ",
    b"POST ",
    b"PUT ",
    b"PATCH ",
    b"DELETE ",
    b"HEAD ",
    b"OPTIONS ",
    b"TRACE ",
];

const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0";

/// First line of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request {
        method: String,
        target: String,
        version: String,
    },
    Response {
        version: String,
        status: u16,
        reason: String,
    },
}

/// Parsed start line and headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHead {
    pub start: StartLine,
    pub headers: Vec<(String, String)>,
}

impl MessageHead {
    /// First header with this name, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn method(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn target(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { target, .. } => Some(target),
            StartLine::Response { .. } => None,
        }
    }

    /// Request path without the query string
    pub fn path(&self) -> Option<&str> {
        self.target()
            .map(|t| t.split_once('?').map(|(p, _)| p).unwrap_or(t))
    }

    pub fn status(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { status, .. } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }

    /// Media type without parameters, lowercased
    pub fn content_type(&self) -> Option<String> {
        self.header("content-type").map(|v| {
            v.split(';')
                .next()
                .unwrap_or(v)
                .trim()
                .to_ascii_lowercase()
        })
    }

    pub fn content_encoding(&self) -> Option<String> {
        self.header("content-encoding")
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty() && v != "identity")
    }

    pub fn is_chunked(&self) -> bool {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("transfer-encoding"))
            .flat_map(|(_, v)| v.split(','))
            .last()
            .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
    }

    /// Declared body length; conflicting values are a framing error
    pub fn content_length(&self) -> Result<Option<usize>, ReassemblyError> {
        let mut length = None;
        for (name, value) in &self.headers {
            if !name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            let parsed: usize = value
                .trim()
                .parse()
                .map_err(|_| ReassemblyError::InvalidContentLength(value.clone()))?;
            match length {
                Some(existing) if existing != parsed => {
                    return Err(ReassemblyError::InvalidContentLength(value.clone()));
                }
                _ => length = Some(parsed),
            }
        }
        Ok(length)
    }
}

/// Whether a buffer begins with a message start line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartCheck {
    Valid,
    NeedMore,
    Http2,
    Invalid,
}

pub fn check_start(buf: &[u8]) -> StartCheck {
    if buf.starts_with(HTTP2_PREFACE) {
        return StartCheck::Http2;
    }

    let mut need_more = HTTP2_PREFACE.starts_with(buf);
    for token in START_TOKENS {
        if buf.starts_with(token) {
            return StartCheck::Valid;
        }
        if token.starts_with(buf) {
            need_more = true;
        }
    }

    if need_more {
        StartCheck::NeedMore
    } else {
        StartCheck::Invalid
    }
}

/// Offset of the next line that could start a message
pub fn find_resync_point(buf: &[u8]) -> Option<usize> {
    (1..buf.len())
        .filter(|&i| buf[i - 1] == b'\n')
        .find(|&i| matches!(check_start(&buf[i..]), StartCheck::Valid | StartCheck::NeedMore))
}

/// Offset just past the blank line that ends the head
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
}

pub fn parse_head(bytes: &[u8]) -> Result<MessageHead, ReassemblyError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| ReassemblyError::MalformedHead("head is not valid UTF-8".to_string()))?;
    let mut lines = text.split("\r\n");

    let start_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| ReassemblyError::MalformedHead("empty start line".to_string()))?;
    let start = parse_start_line(start_line)?;

    let mut headers: Vec<(String, String)> = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // obsolete line folding
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
                continue;
            }
            return Err(ReassemblyError::MalformedHead(
                "continuation line without header".to_string(),
            ));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ReassemblyError::MalformedHead(format!("invalid header line: {line}")))?;
        if name.is_empty() || name.contains(' ') {
            return Err(ReassemblyError::MalformedHead(format!(
                "invalid header name: {name}"
            )));
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }

    Ok(MessageHead { start, headers })
}

fn parse_start_line(line: &str) -> Result<StartLine, ReassemblyError> {
    if line.starts_with("HTTP/") {
        let mut parts = line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default().to_string();
        let status = parts
            .next()
            .filter(|s| s.len() == 3)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| ReassemblyError::MalformedHead(format!("invalid status line: {line}")))?;
        let reason = parts.next().unwrap_or_default().to_string();
        return Ok(StartLine::Response {
            version,
            status,
            reason,
        });
    }

    let parts: Vec<&str> = line.split(' ').collect();
    match parts.as_slice() {
        [method, target, version] if version.starts_with("HTTP/1.") => Ok(StartLine::Request {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
        }),
        _ => Err(ReassemblyError::MalformedHead(format!(
            "invalid request line: {line}"
        ))),
    }
}

/// How a message body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Fixed(usize),
    Chunked,
    UntilClose,
}

/// Body framing per RFC 9112 §6.3. `request_method` is the method of the
/// request a response answers, when known.
pub fn body_framing(
    head: &MessageHead,
    request_method: Option<&str>,
) -> Result<BodyFraming, ReassemblyError> {
    if let Some(status) = head.status() {
        if (100..200).contains(&status) || status == 204 || status == 304 {
            return Ok(BodyFraming::Empty);
        }
        if request_method.is_some_and(|m| m.eq_ignore_ascii_case("HEAD")) {
            return Ok(BodyFraming::Empty);
        }
    }

    if head.is_chunked() {
        return Ok(BodyFraming::Chunked);
    }

    match head.content_length()? {
        Some(0) => Ok(BodyFraming::Empty),
        Some(n) => Ok(BodyFraming::Fixed(n)),
        None if head.status().is_some() => Ok(BodyFraming::UntilClose),
        None => Ok(BodyFraming::Empty),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(usize),
    DataEnd,
    Trailers,
    Done,
}

/// Incremental `Transfer-Encoding: chunked` decoder
#[derive(Debug, Clone)]
pub struct ChunkedDecoder {
    state: ChunkState,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Consume as much of `input` as possible, appending chunk data to `out`.
    /// Returns true once the terminating chunk and trailers have been read.
    pub fn feed(&mut self, input: &mut BytesMut, out: &mut BytesMut) -> Result<bool, ReassemblyError> {
        loop {
            match self.state {
                ChunkState::Done => return Ok(true),
                ChunkState::Size => {
                    let Some(line_end) = find_crlf(input) else {
                        if input.len() > MAX_CHUNK_LINE {
                            return Err(ReassemblyError::InvalidChunk(
                                "chunk size line too long".to_string(),
                            ));
                        }
                        return Ok(false);
                    };
                    let line = input.split_to(line_end + 2);
                    let size = parse_chunk_size(&line[..line_end])?;
                    self.state = if size == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    if input.is_empty() {
                        return Ok(false);
                    }
                    let take = remaining.min(input.len());
                    out.extend_from_slice(&input.split_to(take));
                    self.state = if take == remaining {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(remaining - take)
                    };
                }
                ChunkState::DataEnd => {
                    if input.len() < 2 {
                        return Ok(false);
                    }
                    if &input[..2] != b"\r\n" {
                        return Err(ReassemblyError::InvalidChunk(
                            "missing CRLF after chunk data".to_string(),
                        ));
                    }
                    input.advance(2);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailers => {
                    let Some(line_end) = find_crlf(input) else {
                        return Ok(false);
                    };
                    input.advance(line_end + 2);
                    if line_end == 0 {
                        self.state = ChunkState::Done;
                    }
                }
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, ReassemblyError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ReassemblyError::InvalidChunk("chunk size is not ASCII".to_string()))?;
    let digits = text.split(';').next().unwrap_or_default().trim();
    usize::from_str_radix(digits, 16)
        .map_err(|_| ReassemblyError::InvalidChunk(format!("invalid chunk size: {digits}")))
}
