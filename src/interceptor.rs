//! Connection takeover for the diagnostic endpoints.
//!
//! Once a request head has been parsed, [`intercept`] detaches the connection
//! from the standard request/response cycle. The handler then gets:
//!
//! - a [`RequestContext`] carrying its own handle to the kernel socket, used
//!   to read TCP telemetry at any point during the exchange
//! - a [`BodyReader`] over whatever request body follows the head
//! - a [`RawResponseWriter`] that serializes the response head itself
//!
//! An intercepted connection is never reused: [`Intercepted::close`] flushes
//! pending output, releases the context and shuts the transport down.

use crate::http::{self, BodyFraming, BodyReader, RequestHead};
use crate::tcp_info::{TelemetryAccessor, TelemetrySnapshot};
use crate::{Error, Result};
use ::http::{HeaderMap, StatusCode};
use log::{debug, warn};
use socket2::{SockRef, Socket};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{
    AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, DuplexStream, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;

/// A byte stream the server can accept requests on.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Returns the kernel TCP socket underneath this transport.
    ///
    /// Transports without one cannot be intercepted.
    fn raw_socket(&self) -> io::Result<SockRef<'_>>;
}

impl Transport for TcpStream {
    fn raw_socket(&self) -> io::Result<SockRef<'_>> {
        Ok(SockRef::from(self))
    }
}

impl Transport for tokio_rustls::server::TlsStream<TcpStream> {
    fn raw_socket(&self) -> io::Result<SockRef<'_>> {
        let (tcp, _) = self.get_ref();
        Ok(SockRef::from(tcp))
    }
}

/// In-memory pipes have no kernel socket.
impl Transport for DuplexStream {
    fn raw_socket(&self) -> io::Result<SockRef<'_>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "in-memory stream has no TCP socket",
        ))
    }
}

/// Per-request state handed to an intercepting handler.
#[derive(Debug)]
pub struct RequestContext {
    peer_addr: SocketAddr,
    head: RequestHead,
    socket: Socket,
}

impl RequestContext {
    /// `socket` must refer to the connection the request arrived on.
    pub fn new(peer_addr: SocketAddr, head: RequestHead, socket: Socket) -> Self {
        Self {
            peer_addr,
            head,
            socket,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    /// Reads kernel TCP statistics for the connection as of now.
    pub fn telemetry(&self) -> Result<TelemetrySnapshot> {
        self.socket.tcp_telemetry()
    }
}

/// Writes a response directly onto a taken-over connection.
///
/// Headers collected through [`headers_mut`](Self::headers_mut) go out with
/// the first call to [`write_header`](Self::write_header) or
/// [`write`](Self::write). Every write is bounded by the write deadline.
pub struct RawResponseWriter<W> {
    inner: BufWriter<W>,
    headers: HeaderMap,
    status: Option<StatusCode>,
    bytes_written: u64,
    write_timeout: Duration,
}

impl<W: AsyncWrite + Unpin> RawResponseWriter<W> {
    pub fn new(inner: W, write_timeout: Duration) -> Self {
        Self {
            inner: BufWriter::new(inner),
            headers: HeaderMap::new(),
            status: None,
            bytes_written: 0,
            write_timeout,
        }
    }

    /// Headers to send with the response head.
    ///
    /// Changes made after the head went out have no effect.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Status sent, if the head has been written.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Sends the response head. Later calls are ignored.
    pub async fn write_header(&mut self, status: StatusCode) -> io::Result<()> {
        if let Some(sent) = self.status {
            warn!(
                "Response head already sent with status {}, ignoring {}",
                sent, status
            );
            return Ok(());
        }

        let head = http::encode_response_head(status, &self.headers);
        http::with_deadline(self.write_timeout, self.inner.write_all(&head)).await?;
        self.status = Some(status);
        Ok(())
    }

    /// Sends the `100 Continue` interim response a client announced with
    /// `Expect: 100-continue`. Does nothing once the final head went out.
    pub async fn write_continue(&mut self) -> io::Result<()> {
        if self.status.is_some() {
            return Ok(());
        }

        let interim = http::encode_response_head(StatusCode::CONTINUE, &HeaderMap::new());
        let inner = &mut self.inner;
        http::with_deadline(self.write_timeout, async move {
            inner.write_all(&interim).await?;
            inner.flush().await
        })
        .await
    }

    /// Writes body bytes, sending a `200 OK` head first if none went out yet.
    pub async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.status.is_none() {
            self.write_header(StatusCode::OK).await?;
        }

        http::with_deadline(self.write_timeout, self.inner.write_all(buf)).await?;
        self.bytes_written += buf.len() as u64;
        Ok(buf.len())
    }

    /// Pushes buffered bytes to the transport.
    pub async fn flush(&mut self) -> io::Result<()> {
        http::with_deadline(self.write_timeout, self.inner.flush()).await
    }

    /// Body bytes written so far, excluding the head.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Returns the underlying writer. Unflushed bytes are discarded.
    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }
}

/// Request body of an intercepted connection.
pub type InterceptedBody<T> = BodyReader<ReadHalf<BufReader<T>>>;

/// Response writer of an intercepted connection.
pub type InterceptedWriter<T> = RawResponseWriter<WriteHalf<BufReader<T>>>;

/// A connection detached from the standard request cycle.
pub struct Intercepted<T> {
    pub ctx: RequestContext,
    pub body: InterceptedBody<T>,
    pub writer: InterceptedWriter<T>,
}

impl<T: Transport> Intercepted<T> {
    /// Flushes the response and closes the connection.
    pub async fn close(self) {
        let Intercepted {
            ctx,
            body,
            mut writer,
        } = self;

        if let Err(e) = writer.flush().await {
            debug!("Flush on close to {} failed: {}", ctx.peer_addr, e);
        }

        let peer = ctx.peer_addr;
        drop(ctx);

        let mut write_half = writer.into_inner();
        if let Err(e) = write_half.shutdown().await {
            debug!("Shutdown of {} failed: {}", peer, e);
        }
        drop(write_half);
        drop(body);
    }
}

/// A connection that could not be intercepted, handed back unchanged.
pub struct Declined<T> {
    pub conn: BufReader<T>,
    pub head: RequestHead,
    pub error: Error,
}

/// Takes over `conn` after `head` has been read from it.
///
/// Bytes already buffered past the head stay available to the body reader.
/// Fails with [`Error::TakeoverUnsupported`] when the transport does not sit on
/// a kernel TCP socket; the connection is then returned for a standard reply.
pub fn intercept<T: Transport>(
    conn: BufReader<T>,
    head: RequestHead,
    peer_addr: SocketAddr,
    read_timeout: Duration,
    write_timeout: Duration,
) -> std::result::Result<Intercepted<T>, Box<Declined<T>>> {
    let socket = match conn.get_ref().raw_socket().and_then(|s| s.try_clone()) {
        Ok(socket) => socket,
        Err(e) => {
            return Err(Box::new(Declined {
                conn,
                head,
                error: Error::TakeoverUnsupported(e.to_string()),
            }))
        }
    };

    let framing = match BodyFraming::for_request(&head.headers) {
        Ok(framing) => framing,
        Err(error) => return Err(Box::new(Declined { conn, head, error })),
    };

    let (read_half, write_half) = tokio::io::split(conn);

    Ok(Intercepted {
        ctx: RequestContext::new(peer_addr, head, socket),
        body: BodyReader::new(read_half, framing, read_timeout),
        writer: RawResponseWriter::new(write_half, write_timeout),
    })
}
