//! Incremental HTTP message reader.
//!
//! # Responsibilities
//! - Consume bytes as they arrive and report `None` until a message is whole
//! - Enforce the header line and body size caps
//! - Parse both requests and (for the WebSocket client) responses
//!
//! # Design Decisions
//! - The head is parsed by `httparse`; a partial head simply waits for more bytes
//! - Pure state machine over a byte buffer, no I/O; `read_message` adds the socket
//! - Consumed bytes are drained, so anything left over belongs to the next
//!   message (or to the WebSocket after an upgrade)
//! - Bodies are delimited by Content-Length only; chunked uploads are refused

use std::time::Duration;

use httparse::Status;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::request::Headers;

/// Largest head (start line plus headers) buffered before giving up.
const MAX_HEAD_BYTES: usize = 64 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Error type for reading messages.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Too many header lines (limit {0})")]
    TooManyHeaders(usize),
    #[error("Body of {0} bytes exceeds limit")]
    BodyTooLarge(u64),
    #[error("Peer disconnected mid-message")]
    Disconnected,
    #[error("Timed out waiting for data")]
    Timeout,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// First line of a message as `httparse` saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request {
        verb: String,
        target: String,
        minor_version: u8,
    },
    Response {
        status: u16,
        minor_version: u8,
    },
}

/// A complete message: start line, headers and body.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub start: StartLine,
    pub headers: Headers,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct ReaderLimits {
    pub max_header_lines: usize,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageKind {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Head,
    Body,
}

#[derive(Debug)]
pub struct HttpReader {
    limits: ReaderLimits,
    kind: MessageKind,
    state: ReadState,
    start: Option<StartLine>,
    headers: Headers,
    content_length: usize,
    body: Vec<u8>,
}

impl HttpReader {
    /// Reader for requests arriving at the server.
    pub fn new(limits: ReaderLimits) -> Self {
        Self::with_kind(limits, MessageKind::Request)
    }

    /// Reader for a server's answer to our own request.
    pub fn responses(limits: ReaderLimits) -> Self {
        Self::with_kind(limits, MessageKind::Response)
    }

    fn with_kind(limits: ReaderLimits, kind: MessageKind) -> Self {
        Self {
            limits,
            kind,
            state: ReadState::Head,
            start: None,
            headers: Headers::new(),
            content_length: 0,
            body: Vec::new(),
        }
    }

    /// True when no part of a message has been consumed yet.
    pub fn is_idle(&self) -> bool {
        self.state == ReadState::Head
    }

    /// Consume what is available in `buffer`.
    ///
    /// Returns `Ok(None)` when more data is needed. On success the reader is
    /// reset and ready for the next message.
    pub fn read(&mut self, buffer: &mut Vec<u8>) -> Result<Option<RawMessage>, ReadError> {
        loop {
            match self.state {
                ReadState::Head => {
                    let Some((len, start, headers)) = self.parse_head(buffer)? else {
                        if buffer.len() > MAX_HEAD_BYTES {
                            return Err(ReadError::Malformed("header section too large".into()));
                        }
                        return Ok(None);
                    };
                    buffer.drain(..len);
                    self.start = Some(start);
                    self.headers = headers;
                    self.begin_body()?;
                }
                ReadState::Body => {
                    let wanted = self.content_length - self.body.len();
                    let take = wanted.min(buffer.len());
                    self.body.extend(buffer.drain(..take));
                    if self.body.len() < self.content_length {
                        return Ok(None);
                    }
                    return self.finish().map(Some);
                }
            }
        }
    }

    /// Run `httparse` over the buffered bytes. `None` means the head is incomplete.
    fn parse_head(&self, buffer: &[u8]) -> Result<Option<(usize, StartLine, Headers)>, ReadError> {
        let cap = self.limits.max_header_lines;
        let mut slots = vec![httparse::EMPTY_HEADER; cap];
        match self.kind {
            MessageKind::Request => {
                let mut req = httparse::Request::new(&mut slots);
                let len = match req.parse(buffer).map_err(|e| parse_error(e, cap))? {
                    Status::Complete(len) => len,
                    Status::Partial => return Ok(None),
                };
                let start = StartLine::Request {
                    verb: req.method.unwrap_or_default().to_string(),
                    target: req.path.unwrap_or_default().to_string(),
                    minor_version: req.version.unwrap_or(1),
                };
                Ok(Some((len, start, collect_headers(req.headers)?)))
            }
            MessageKind::Response => {
                let mut res = httparse::Response::new(&mut slots);
                let len = match res.parse(buffer).map_err(|e| parse_error(e, cap))? {
                    Status::Complete(len) => len,
                    Status::Partial => return Ok(None),
                };
                let start = StartLine::Response {
                    status: res.code.unwrap_or_default(),
                    minor_version: res.version.unwrap_or(1),
                };
                Ok(Some((len, start, collect_headers(res.headers)?)))
            }
        }
    }

    fn begin_body(&mut self) -> Result<(), ReadError> {
        if self.headers.has_token("Transfer-Encoding", "chunked") {
            return Err(ReadError::Malformed("chunked transfer encoding not supported".into()));
        }
        self.content_length = match self.headers.get("Content-Length") {
            Some(v) => v
                .trim()
                .parse::<u64>()
                .map_err(|_| ReadError::Malformed(format!("bad Content-Length '{v}'")))
                .and_then(|len| {
                    if len > self.limits.max_body_bytes as u64 {
                        Err(ReadError::BodyTooLarge(len))
                    } else {
                        Ok(len as usize)
                    }
                })?,
            None => 0,
        };
        self.body.reserve(self.content_length);
        self.state = ReadState::Body;
        Ok(())
    }

    fn finish(&mut self) -> Result<RawMessage, ReadError> {
        self.state = ReadState::Head;
        self.content_length = 0;
        let start = self
            .start
            .take()
            .ok_or_else(|| ReadError::Malformed("body without a start line".into()))?;
        Ok(RawMessage {
            start,
            headers: std::mem::take(&mut self.headers),
            body: std::mem::take(&mut self.body),
        })
    }
}

fn parse_error(error: httparse::Error, cap: usize) -> ReadError {
    match error {
        httparse::Error::TooManyHeaders => ReadError::TooManyHeaders(cap),
        other => ReadError::Malformed(other.to_string()),
    }
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Result<Headers, ReadError> {
    let mut headers = Headers::new();
    for header in parsed {
        let value = std::str::from_utf8(header.value)
            .map_err(|_| ReadError::Malformed(format!("non UTF-8 value for '{}'", header.name)))?;
        headers.insert(header.name, value.trim());
    }
    Ok(headers)
}

/// Read from `stream` until `reader` yields a message.
///
/// `Ok(None)` means the peer closed, or went quiet, between messages.
/// Leftover bytes stay in `buffer`.
pub async fn read_message<S>(
    stream: &mut S,
    reader: &mut HttpReader,
    buffer: &mut Vec<u8>,
    inactivity: Duration,
) -> Result<Option<RawMessage>, ReadError>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some(message) = reader.read(buffer)? {
            return Ok(Some(message));
        }

        let between_messages = reader.is_idle() && buffer.is_empty();
        match tokio::time::timeout(inactivity, stream.read(&mut chunk)).await {
            Err(_) if between_messages => return Ok(None),
            Err(_) => return Err(ReadError::Timeout),
            Ok(Ok(0)) if between_messages => return Ok(None),
            Ok(Ok(0)) => return Err(ReadError::Disconnected),
            Ok(Ok(n)) => buffer.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(ReadError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ReaderLimits {
        ReaderLimits {
            max_header_lines: 200,
            max_body_bytes: 1024,
        }
    }

    #[test]
    fn body_arrives_over_several_reads() {
        let mut reader = HttpReader::new(limits());
        let mut buffer = b"POST /x HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc".to_vec();
        assert!(reader.read(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(b"defg");
        assert!(reader.read(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(b"hij");
        let message = reader.read(&mut buffer).unwrap().unwrap();
        assert_eq!(
            message.start,
            StartLine::Request {
                verb: "POST".into(),
                target: "/x".into(),
                minor_version: 1,
            }
        );
        assert_eq!(message.body, b"abcdefghij");
        assert!(buffer.is_empty());
        assert!(reader.is_idle());
    }

    #[test]
    fn headers_split_across_reads() {
        let mut reader = HttpReader::new(limits());
        let mut buffer = b"GET / HTTP/1.1\r\nHo".to_vec();
        assert!(reader.read(&mut buffer).unwrap().is_none());
        buffer.extend_from_slice(b"st: a\r\n\r\n");
        let message = reader.read(&mut buffer).unwrap().unwrap();
        assert_eq!(message.headers.get("host"), Some("a"));
        assert!(message.body.is_empty());
    }

    #[test]
    fn leftover_bytes_are_kept() {
        let mut reader = HttpReader::new(limits());
        let mut buffer = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n\x81".to_vec();
        let first = reader.read(&mut buffer).unwrap().unwrap();
        assert!(matches!(first.start, StartLine::Request { ref target, .. } if target == "/a"));
        let second = reader.read(&mut buffer).unwrap().unwrap();
        assert!(matches!(second.start, StartLine::Request { ref target, .. } if target == "/b"));
        assert_eq!(buffer, vec![0x81]);
    }

    #[test]
    fn header_line_cap() {
        let mut reader = HttpReader::new(ReaderLimits {
            max_header_lines: 2,
            max_body_bytes: 16,
        });
        let mut buffer = b"GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\nC: 3\r\n\r\n".to_vec();
        assert!(matches!(reader.read(&mut buffer), Err(ReadError::TooManyHeaders(2))));
    }

    #[test]
    fn body_cap() {
        let mut reader = HttpReader::new(limits());
        let mut buffer = b"POST / HTTP/1.1\r\nContent-Length: 4096\r\n\r\n".to_vec();
        assert!(matches!(reader.read(&mut buffer), Err(ReadError::BodyTooLarge(4096))));
    }

    #[test]
    fn bad_content_length() {
        let mut reader = HttpReader::new(limits());
        let mut buffer = b"POST / HTTP/1.1\r\nContent-Length: ten\r\n\r\n".to_vec();
        assert!(matches!(reader.read(&mut buffer), Err(ReadError::Malformed(_))));
    }

    #[test]
    fn garbage_request_line_is_malformed() {
        let mut reader = HttpReader::new(limits());
        let mut buffer = b"NONSENSE\r\n\r\n".to_vec();
        assert!(matches!(reader.read(&mut buffer), Err(ReadError::Malformed(_))));
    }

    #[test]
    fn endless_head_is_refused() {
        let mut reader = HttpReader::new(limits());
        let mut buffer = b"GET / HTTP/1.1\r\nX-Filler: ".to_vec();
        buffer.resize(MAX_HEAD_BYTES + 1, b'a');
        assert!(matches!(reader.read(&mut buffer), Err(ReadError::Malformed(_))));
    }

    #[test]
    fn reads_responses_with_leftover_frames() {
        let mut reader = HttpReader::responses(limits());
        let mut buffer =
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n\x81\x00".to_vec();
        let message = reader.read(&mut buffer).unwrap().unwrap();
        assert_eq!(
            message.start,
            StartLine::Response {
                status: 101,
                minor_version: 1,
            }
        );
        assert_eq!(message.headers.get("upgrade"), Some("websocket"));
        assert_eq!(buffer, vec![0x81, 0x00]);
    }

    #[tokio::test]
    async fn read_message_from_stream() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            client.write_all(b"GET /services/ HTTP/1.1\r\n").await.unwrap();
            client.write_all(b"Host: x\r\n\r\n").await.unwrap();
        });

        let mut reader = HttpReader::new(limits());
        let mut buffer = Vec::new();
        let message = read_message(&mut server, &mut reader, &mut buffer, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.headers.get("Host"), Some("x"));

        // Writer dropped between messages: clean end of stream.
        let next = read_message(&mut server, &mut reader, &mut buffer, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(next.is_none());
    }
}
