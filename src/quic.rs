//! HTTP/3 endpoint.
//!
//! Serves the same routes as the TCP listeners over QUIC. Requests are not
//! taken over: a QUIC stream has no kernel TCP socket to read statistics
//! from, so downloads end with an all-zero footer and uploads answer `null`.

use crate::footer::{encode_footer, FOOTER_SIZE};
use crate::handlers::requested_payload_len;
use crate::http::RequestHead;
use crate::payload::PayloadGenerator;
use crate::server::{self, Endpoint, Response, Route, ServerState};
use crate::tcp_info::TelemetrySnapshot;
use crate::{Error, Result};
use ::http::{header, HeaderValue, Method, StatusCode};
use bytes::{Buf, Bytes};
use h3::server::RequestStream;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

type H3Stream = RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>;

/// Binds a QUIC endpoint on `addr`.
pub fn bind(addr: SocketAddr, config: quinn::ServerConfig) -> Result<quinn::Endpoint> {
    Ok(quinn::Endpoint::server(config, addr)?)
}

/// Accepts QUIC connections until the shutdown token is cancelled.
pub async fn accept_quic(
    endpoint: quinn::Endpoint,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) {
    loop {
        let incoming = tokio::select! {
            _ = shutdown.cancelled() => break,
            incoming = endpoint.accept() => incoming,
        };
        let Some(incoming) = incoming else {
            break;
        };

        let peer_addr = incoming.remote_address();
        debug!("New QUIC connection from {}", peer_addr);
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = serve_quic_connection(incoming, peer_addr, state).await {
                debug!("QUIC connection from {} ended: {}", peer_addr, e);
            }
        });
    }

    endpoint.close(0u32.into(), b"server shutting down");
}

async fn serve_quic_connection(
    incoming: quinn::Incoming,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<()> {
    let connection = incoming.await?;
    let mut h3_conn: h3::server::Connection<h3_quinn::Connection, Bytes> =
        h3::server::Connection::new(h3_quinn::Connection::new(connection)).await?;

    while let Some((request, stream)) = h3_conn.accept().await? {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let (head, ()) = request.into_parts();
            debug!("{} {} from {} over HTTP/3", head.method, head.uri, peer_addr);
            if let Err(e) = serve_request(&head, stream, peer_addr, &state).await {
                warn!("HTTP/3 request from {} failed: {}", peer_addr, e);
            }
        });
    }

    Ok(())
}

async fn serve_request(
    head: &RequestHead,
    mut stream: H3Stream,
    peer_addr: SocketAddr,
    state: &ServerState,
) -> Result<()> {
    match server::route(head) {
        Route::Intercept(Endpoint::Download) => {
            download(head, &mut stream, peer_addr, state).await?
        }
        Route::Intercept(Endpoint::Upload) => upload(head, &mut stream, peer_addr).await?,
        Route::Spki => send_response(&mut stream, server::spki_response(state)).await?,
        Route::Static => {
            let mut response = server::static_response(state, head).await;
            response.omit_body = head.method == Method::HEAD;
            send_response(&mut stream, response).await?
        }
        Route::MethodNotAllowed => {
            let response = Response::text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed\n");
            send_response(&mut stream, response).await?
        }
    }

    stream.finish().await?;
    Ok(())
}

async fn send_response(stream: &mut H3Stream, response: Response) -> Result<()> {
    let mut head = ::http::Response::new(());
    *head.status_mut() = response.status;
    *head.headers_mut() = response.headers.clone();
    head.headers_mut()
        .insert(header::CONTENT_LENGTH, response.content_length());
    head.headers_mut().remove(header::CONNECTION);

    stream.send_response(head).await?;
    if !response.omit_body && !response.body.is_empty() {
        stream.send_data(response.body).await?;
    }
    Ok(())
}

fn builder(status: StatusCode) -> ::http::response::Builder {
    ::http::Response::builder()
        .status(status)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"))
}

fn build(builder: ::http::response::Builder) -> Result<::http::Response<()>> {
    builder
        .body(())
        .map_err(|e| Error::Http(format!("building HTTP/3 response: {}", e)))
}

async fn download(
    head: &RequestHead,
    stream: &mut H3Stream,
    peer_addr: SocketAddr,
    state: &ServerState,
) -> Result<()> {
    let payload_len = requested_payload_len(head.uri.query());
    let total = payload_len + FOOTER_SIZE as u64;

    let response = builder(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, total);
    stream.send_response(build(response)?).await?;

    let mut generator = PayloadGenerator::from_entropy();
    let mut chunk = state.chunks.get();
    let mut remaining = payload_len;
    while remaining > 0 {
        let piece = generator.next_piece(&mut chunk, remaining);
        remaining -= piece.len() as u64;
        stream.send_data(Bytes::copy_from_slice(piece)).await?;
    }
    drop(chunk);

    stream
        .send_data(Bytes::from(encode_footer::<TelemetrySnapshot>(None)))
        .await?;

    info!("Sent {} bytes to {} over HTTP/3", total, peer_addr);
    Ok(())
}

async fn upload(head: &RequestHead, stream: &mut H3Stream, peer_addr: SocketAddr) -> Result<()> {
    if head.method == Method::OPTIONS {
        let response = builder(StatusCode::OK)
            .header(header::ACCESS_CONTROL_ALLOW_METHODS, "POST")
            .header(header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type")
            .header(header::CONTENT_LENGTH, 0);
        stream.send_response(build(response)?).await?;
        return Ok(());
    }

    let mut received = 0u64;
    loop {
        match stream.recv_data().await {
            Ok(Some(data)) => received += data.remaining() as u64,
            Ok(None) => break,
            Err(e) => {
                warn!(
                    "HTTP/3 upload from {} failed after {} bytes: {}",
                    peer_addr, received, e
                );
                break;
            }
        }
    }

    let json: &'static [u8] = b"null";
    let response = builder(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, json.len());
    stream.send_response(build(response)?).await?;
    stream.send_data(Bytes::from_static(json)).await?;

    info!("Received {} bytes from {} over HTTP/3", received, peer_addr);
    Ok(())
}
