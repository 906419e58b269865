//! Streaming exchange handlers for the intercepted endpoints.
//!
//! Both handlers run on a taken-over connection and read TCP telemetry for
//! that connection after the bulk transfer, so the numbers describe the
//! transfer the client just timed.

use crate::footer::{encode_footer, FOOTER_SIZE};
use crate::http::{self, BodyReader};
use crate::interceptor::{RawResponseWriter, RequestContext};
use crate::payload::PayloadGenerator;
use ::http::{header, HeaderValue, Method, StatusCode};
use log::{debug, info, warn};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// Payload size when the request does not name a usable one.
pub const DEFAULT_DOWNLOAD_MIB: u64 = 16;

const MIB: u64 = 1024 * 1024;

/// Returns the decoded value of the first `name` in a form-encoded query.
pub fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// Payload length in bytes requested by `size=<MiB>`.
///
/// Missing, unparseable or overflowing sizes fall back to
/// [`DEFAULT_DOWNLOAD_MIB`].
pub fn requested_payload_len(query: Option<&str>) -> u64 {
    let Some(raw) = query_param(query, "size") else {
        return DEFAULT_DOWNLOAD_MIB * MIB;
    };

    match raw.trim().parse::<u64>().ok().and_then(|mib| {
        mib.checked_mul(MIB)
            .filter(|len| len.checked_add(FOOTER_SIZE as u64).is_some())
    }) {
        Some(len) => len,
        None => {
            warn!(
                "Invalid download size {:?}, using {} MiB",
                raw, DEFAULT_DOWNLOAD_MIB
            );
            DEFAULT_DOWNLOAD_MIB * MIB
        }
    }
}

fn allow_any_origin<W: AsyncWrite + Unpin>(writer: &mut RawResponseWriter<W>) {
    writer
        .headers_mut()
        .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
}

/// Serves `GET /api/downloading`.
///
/// Streams `size` MiB of random payload followed by a telemetry footer and
/// returns the number of body bytes written.
pub async fn download<W>(
    ctx: &RequestContext,
    writer: &mut RawResponseWriter<W>,
    chunk: &mut [u8],
) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let payload_len = requested_payload_len(ctx.head().uri.query());
    let total = payload_len + FOOTER_SIZE as u64;

    allow_any_origin(writer);
    let headers = writer.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(total));
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    writer.write_header(StatusCode::OK).await?;

    let mut generator = PayloadGenerator::from_entropy();
    generator.stream_to(writer, payload_len, chunk).await?;

    let snapshot = match ctx.telemetry() {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!("No telemetry for {}: {}", ctx.peer_addr(), e);
            None
        }
    };
    writer.write(&encode_footer(snapshot.as_ref())).await?;
    writer.flush().await?;

    info!(
        "Sent {} bytes to {} ({} MiB payload)",
        writer.bytes_written(),
        ctx.peer_addr(),
        payload_len / MIB
    );
    Ok(writer.bytes_written())
}

/// Serves `POST` and `OPTIONS` on `/api/uploading`.
///
/// Sends `100 Continue` when the client waits for it, drains the request
/// body, then answers with the server's telemetry as
/// JSON (`null` when it could not be read). Returns the number of body bytes
/// received.
pub async fn upload<R, W>(
    ctx: &RequestContext,
    body: &mut BodyReader<R>,
    writer: &mut RawResponseWriter<W>,
    chunk: &mut [u8],
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    allow_any_origin(writer);

    if ctx.head().method == Method::OPTIONS {
        let headers = writer.headers_mut();
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("POST"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type"),
        );
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(0));
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        writer.write_header(StatusCode::OK).await?;
        writer.flush().await?;
        return Ok(0);
    }

    let head = ctx.head();
    if http::expects_continue(head.version, &head.headers) && !body.framing().is_empty() {
        writer.write_continue().await?;
    }

    let mut received = 0u64;
    loop {
        match body.read(chunk).await {
            Ok(0) => break,
            Ok(n) => received += n as u64,
            Err(e) => {
                warn!(
                    "Upload from {} failed after {} bytes: {}",
                    ctx.peer_addr(),
                    received,
                    e
                );
                break;
            }
        }
    }
    debug!("Upload from {} ended after {} bytes", ctx.peer_addr(), received);

    let json = match ctx.telemetry() {
        Ok(snapshot) => serde_json::to_vec(&snapshot)?,
        Err(e) => {
            warn!("No telemetry for {}: {}", ctx.peer_addr(), e);
            b"null".to_vec()
        }
    };

    let headers = writer.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(json.len()));
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    writer.write_header(StatusCode::OK).await?;
    writer.write(&json).await?;
    writer.flush().await?;

    info!("Received {} bytes from {}", received, ctx.peer_addr());
    Ok(received)
}
