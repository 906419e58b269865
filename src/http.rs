//! Server-side HTTP/1.1 wire handling for taken-over connections.
//!
//! Request heads are split off the stream line by line and parsed with
//! `httparse`; response heads are written as plain text. Request bodies are
//! framed by `Content-Length` or chunked transfer coding.

use crate::{Error, Result};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Version};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

/// Upper bound on a request head.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Upper bound on the number of header fields in a request head.
pub const MAX_HEADERS: usize = 64;

const MAX_CHUNK_LINE: usize = 4096;

/// Parsed request line and header fields.
pub type RequestHead = http::request::Parts;

/// Runs `fut`, failing with [`io::ErrorKind::TimedOut`] after `limit`.
pub(crate) async fn with_deadline<T, F>(limit: Duration, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("I/O deadline of {:?} exceeded", limit),
        )),
    }
}

/// Largest slice of a `buf_len`-byte buffer that stays within `left` bytes.
pub(crate) fn clamp_len(buf_len: usize, left: u64) -> usize {
    usize::try_from(left).map_or(buf_len, |left| buf_len.min(left))
}

fn is_blank(line: &[u8]) -> bool {
    line == b"\r\n" || line == b"\n"
}

/// Reads raw head bytes up to and including the blank line.
///
/// Nothing past the head is consumed from `reader`. Returns `None` if the peer
/// closed the connection before sending anything.
async fn read_head_bytes<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut raw = Vec::new();
    let mut line = Vec::new();
    let mut total = 0usize;

    loop {
        line.clear();
        let n = (&mut *reader)
            .take((MAX_HEAD_SIZE - total + 1) as u64)
            .read_until(b'\n', &mut line)
            .await?;

        if n == 0 {
            if total == 0 {
                return Ok(None);
            }
            return Err(Error::Http("connection closed inside message head".into()));
        }

        total += n;
        if total > MAX_HEAD_SIZE {
            return Err(Error::Http("message head too large".into()));
        }
        if line.last() != Some(&b'\n') {
            return Err(Error::Http("connection closed inside message head".into()));
        }

        if is_blank(&line) {
            // Stray CRLF before the start line is allowed.
            if raw.is_empty() {
                continue;
            }
            raw.extend_from_slice(&line);
            return Ok(Some(raw));
        }
        raw.extend_from_slice(&line);
    }
}

/// Reads and parses a request head.
///
/// Returns `Ok(None)` on a clean end-of-stream before the request line, which
/// is how a keep-alive peer ends the connection.
pub async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let Some(raw) = read_head_bytes(reader).await? else {
        return Ok(None);
    };

    let mut fields = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut fields);
    match request.parse(&raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(Error::Http("incomplete request head".into()))
        }
        Err(e) => return Err(Error::Http(format!("malformed request head: {}", e))),
    }

    let (Some(method), Some(target), Some(minor)) =
        (request.method, request.path, request.version)
    else {
        return Err(Error::Http("incomplete request line".into()));
    };

    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| Error::Http(format!("invalid method {:?}", method)))?;
    let version = if minor == 1 {
        Version::HTTP_11
    } else {
        Version::HTTP_10
    };

    let (mut head, ()) = http::Request::builder()
        .method(method)
        .uri(target)
        .version(version)
        .body(())
        .map_err(|e| Error::Http(format!("invalid request target {:?}: {}", target, e)))?
        .into_parts();

    head.headers.reserve(request.headers.len());
    for field in request.headers.iter() {
        let name = HeaderName::from_bytes(field.name.as_bytes())
            .map_err(|e| Error::Http(format!("invalid header name {:?}: {}", field.name, e)))?;
        let value = HeaderValue::from_bytes(field.value)
            .map_err(|e| Error::Http(format!("invalid value for {}: {}", name, e)))?;
        head.headers.append(name, value);
    }

    Ok(Some(head))
}

/// Serializes a response head: status line, one line per header, blank line.
///
/// # Examples
///
/// ```
/// use http::{header, HeaderMap, HeaderValue, StatusCode};
/// use tcpscope::http::encode_response_head;
///
/// let mut headers = HeaderMap::new();
/// headers.insert(header::CONTENT_LENGTH, HeaderValue::from(0));
///
/// let head = encode_response_head(StatusCode::OK, &headers);
/// assert_eq!(head, b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n");
/// ```
pub fn encode_response_head(status: StatusCode, headers: &HeaderMap) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")
    )
    .into_bytes();
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Returns true if the peer asked for the connection to stay open.
pub fn wants_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let connection = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_ascii_lowercase);

    match connection.as_deref() {
        Some(v) if v.split(',').any(|t| t.trim() == "close") => false,
        Some(v) if v.split(',').any(|t| t.trim() == "keep-alive") => true,
        _ => version == Version::HTTP_11,
    }
}

/// Returns true if an HTTP/1.1 client waits for `100 Continue` before sending
/// the request body.
pub fn expects_continue(version: Version, headers: &HeaderMap) -> bool {
    version == Version::HTTP_11
        && headers
            .get(header::EXPECT)
            .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"100-continue"))
}

/// How a request body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// Exactly this many bytes
    Length(u64),
    /// Chunked transfer coding
    Chunked,
}

impl BodyFraming {
    /// Framing of a request body per RFC 9112 section 6.3.
    pub fn for_request(headers: &HeaderMap) -> Result<Self> {
        let chunked = headers
            .get_all(header::TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.to_ascii_lowercase().contains("chunked"));
        if chunked {
            return Ok(BodyFraming::Chunked);
        }

        match headers.get(header::CONTENT_LENGTH) {
            Some(value) => value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(BodyFraming::Length)
                .ok_or_else(|| Error::Http(format!("invalid Content-Length {:?}", value))),
            None => Ok(BodyFraming::Length(0)),
        }
    }

    /// True when the framing says there is nothing to read.
    pub fn is_empty(self) -> bool {
        self == BodyFraming::Length(0)
    }
}

#[derive(Debug)]
enum ChunkState {
    /// Expecting a chunk-size line
    Size,
    /// Inside chunk data
    Data(u64),
    Done,
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Reads one request body according to its framing.
///
/// `read` returns `Ok(0)` once the body is complete. Every read is bounded by
/// the configured deadline.
pub struct BodyReader<R> {
    inner: R,
    framing: BodyFraming,
    remaining: u64,
    chunk: ChunkState,
    read_timeout: Duration,
}

impl<R: AsyncRead + Unpin> BodyReader<R> {
    pub fn new(inner: R, framing: BodyFraming, read_timeout: Duration) -> Self {
        let remaining = match framing {
            BodyFraming::Length(n) => n,
            BodyFraming::Chunked => 0,
        };

        Self {
            inner,
            framing,
            remaining,
            chunk: ChunkState::Size,
            read_timeout,
        }
    }

    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    /// Reads the next piece of the body into `buf`.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        match self.framing {
            BodyFraming::Length(_) => {
                if self.remaining == 0 {
                    return Ok(0);
                }
                let max = clamp_len(buf.len(), self.remaining);
                let n = self.read_raw(&mut buf[..max]).await?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("body ended {} bytes short", self.remaining),
                    ));
                }
                self.remaining -= n as u64;
                Ok(n)
            }
            BodyFraming::Chunked => self.read_chunked(buf).await,
        }
    }

    async fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        with_deadline(self.read_timeout, self.inner.read(buf)).await
    }

    async fn read_chunked(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.chunk {
                ChunkState::Done => return Ok(0),
                ChunkState::Size => {
                    let line = self.read_line().await?;
                    let size = match httparse::parse_chunk_size(&line) {
                        Ok(httparse::Status::Complete((_, size))) => size,
                        _ => {
                            return Err(invalid_data(format!(
                                "invalid chunk size line {:?}",
                                String::from_utf8_lossy(&line)
                            )))
                        }
                    };

                    if size == 0 {
                        // Trailer section ends with an empty line.
                        while !is_blank(&self.read_line().await?) {}
                        self.chunk = ChunkState::Done;
                    } else {
                        self.chunk = ChunkState::Data(size);
                    }
                }
                ChunkState::Data(left) => {
                    let max = clamp_len(buf.len(), left);
                    let n = self.read_raw(&mut buf[..max]).await?;
                    if n == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed inside chunk",
                        ));
                    }

                    let left = left - n as u64;
                    if left == 0 {
                        if !is_blank(&self.read_line().await?) {
                            return Err(invalid_data("missing CRLF after chunk data"));
                        }
                        self.chunk = ChunkState::Size;
                    } else {
                        self.chunk = ChunkState::Data(left);
                    }
                    return Ok(n);
                }
            }
        }
    }

    /// Reads one line of chunk metadata, terminator included.
    async fn read_line(&mut self) -> io::Result<Vec<u8>> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            if self.read_raw(&mut byte).await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside chunk metadata",
                ));
            }
            line.push(byte[0]);
            if byte[0] == b'\n' {
                return Ok(line);
            }
            if line.len() > MAX_CHUNK_LINE {
                return Err(invalid_data("chunk metadata line too long"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn read_all<R: AsyncRead + Unpin>(body: &mut BodyReader<R>) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            let n = body.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_parse_request_head() {
        let raw = b"\r\nGET /api/downloading?size=4 HTTP/1.1\r\nHost: localhost:3000\r\nX-Multi: a\r\nX-Multi: b\r\n\r\nrest";
        let mut reader = BufReader::new(&raw[..]);

        let head = read_request_head(&mut reader).await.unwrap().unwrap();
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.uri.path(), "/api/downloading");
        assert_eq!(head.uri.query(), Some("size=4"));
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.headers[header::HOST], "localhost:3000");
        assert_eq!(head.headers.get_all("x-multi").iter().count(), 2);

        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "rest");
    }

    #[tokio::test]
    async fn test_parse_http10_head() {
        let raw = b"POST /api/uploading HTTP/1.0\r\nContent-Length: 3\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);

        let head = read_request_head(&mut reader).await.unwrap().unwrap();
        assert_eq!(head.method, Method::POST);
        assert_eq!(head.version, Version::HTTP_10);
        assert!(!wants_keep_alive(head.version, &head.headers));
    }

    #[tokio::test]
    async fn test_request_head_clean_eof() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(read_request_head(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_request_head_malformed() {
        for raw in [
            &b"GET /\r\n\r\n"[..],
            &b"GET / HTTP/2.0\r\n\r\n"[..],
            &b"GET / HTTP/1.1\r\nNoColon\r\n\r\n"[..],
            &b"GET / HTTP/1.1\r\nHost: x\r\n"[..],
        ] {
            let mut reader = BufReader::new(raw);
            assert!(
                matches!(read_request_head(&mut reader).await, Err(Error::Http(_))),
                "accepted {:?}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[tokio::test]
    async fn test_request_head_too_many_fields() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..=MAX_HEADERS {
            raw.extend_from_slice(format!("X-Field-{}: {}\r\n", i, i).as_bytes());
        }
        raw.extend_from_slice(b"\r\n");

        let mut reader = BufReader::new(raw.as_slice());
        assert!(matches!(
            read_request_head(&mut reader).await,
            Err(Error::Http(_))
        ));
    }

    #[tokio::test]
    async fn test_request_head_too_large() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_SIZE));
        raw.extend_from_slice(b"\r\n\r\n");

        let mut reader = BufReader::new(raw.as_slice());
        assert!(matches!(
            read_request_head(&mut reader).await,
            Err(Error::Http(_))
        ));
    }

    #[test]
    fn test_framing_rules() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            BodyFraming::for_request(&headers).unwrap(),
            BodyFraming::Length(0)
        );
        assert!(BodyFraming::for_request(&headers).unwrap().is_empty());

        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(10_000));
        assert_eq!(
            BodyFraming::for_request(&headers).unwrap(),
            BodyFraming::Length(10_000)
        );

        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        assert_eq!(
            BodyFraming::for_request(&headers).unwrap(),
            BodyFraming::Chunked
        );

        let mut bad = HeaderMap::new();
        bad.insert(header::CONTENT_LENGTH, HeaderValue::from_static("-3"));
        assert!(BodyFraming::for_request(&bad).is_err());
    }

    #[test]
    fn test_keep_alive_rules() {
        let mut headers = HeaderMap::new();
        assert!(wants_keep_alive(Version::HTTP_11, &headers));
        assert!(!wants_keep_alive(Version::HTTP_10, &headers));

        headers.insert(header::CONNECTION, HeaderValue::from_static("Close"));
        assert!(!wants_keep_alive(Version::HTTP_11, &headers));

        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        assert!(wants_keep_alive(Version::HTTP_10, &headers));
    }

    #[test]
    fn test_expect_continue_rules() {
        let mut headers = HeaderMap::new();
        assert!(!expects_continue(Version::HTTP_11, &headers));

        headers.insert(header::EXPECT, HeaderValue::from_static("100-Continue"));
        assert!(expects_continue(Version::HTTP_11, &headers));
        assert!(!expects_continue(Version::HTTP_10, &headers));
    }

    #[test]
    fn test_clamp_len() {
        assert_eq!(clamp_len(4096, 10), 10);
        assert_eq!(clamp_len(4096, u64::MAX), 4096);
        assert_eq!(clamp_len(0, 7), 0);
    }

    #[tokio::test]
    async fn test_length_body_stops_at_boundary() {
        let raw = b"hello worldNEXT";
        let mut body = BodyReader::new(&raw[..], BodyFraming::Length(11), TIMEOUT);

        assert_eq!(read_all(&mut body).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_length_body_short_is_error() {
        let raw = b"abc";
        let mut body = BodyReader::new(&raw[..], BodyFraming::Length(10), TIMEOUT);

        let err = read_all(&mut body).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_chunked_body() {
        let raw = b"4\r\nWiki\r\n6;ext=1\r\npedia \r\nE\r\nin \r\n\r\nchunks.\r\n0\r\nX-Trailer: 1\r\n\r\nNEXT";
        let mut body = BodyReader::new(&raw[..], BodyFraming::Chunked, TIMEOUT);

        assert_eq!(
            read_all(&mut body).await.unwrap(),
            b"Wikipedia in \r\n\r\nchunks."
        );
    }

    #[tokio::test]
    async fn test_chunked_body_bad_size() {
        let raw = b"zz\r\nabc\r\n0\r\n\r\n";
        let mut body = BodyReader::new(&raw[..], BodyFraming::Chunked, TIMEOUT);

        let err = read_all(&mut body).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_read_deadline() {
        let (client, _server) = tokio::io::duplex(64);
        let mut body = BodyReader::new(client, BodyFraming::Chunked, Duration::from_millis(20));

        let mut buf = [0u8; 16];
        let err = body.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
