use crate::buffer_pool::BufferPool;
use crate::config::ServerConfig;
use crate::handlers;
use crate::http::{self, BodyFraming, RequestHead};
use crate::interceptor::{self, Declined, Transport};
use crate::payload::CHUNK_SIZE;
use crate::quic;
use crate::tls;
use crate::{Error, Result};
use ::http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::time;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tower_http::services::ServeDir;

/// Idle chunk buffers kept for reuse across connections.
const POOLED_CHUNKS: usize = 32;

/// Diagnostic HTTP server.
///
/// Serves the throughput endpoints on a plain HTTP listener and, when
/// configured, on a second TLS listener and an HTTP/3 (QUIC) endpoint. Each
/// accepted connection runs in its own task.
///
/// # Examples
///
/// ```no_run
/// use tcpscope::{Server, ServerConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ServerConfig::new(3000)
///     .with_tls_port(3443)
///     .with_generated_cert("./certs");
///
/// let server = Server::new(config);
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: ServerConfig,
    shutdown: CancellationToken,
}

impl Server {
    /// Creates a server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the accept loops when cancelled.
    ///
    /// Exchanges already in progress run to completion.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Binds the listeners and serves until shut down.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the certificate
    /// cannot be loaded or a port cannot be bound.
    pub async fn run(&self) -> Result<()> {
        self.bind().await?.serve().await
    }

    /// Binds the listeners without accepting yet.
    pub async fn bind(&self) -> Result<BoundServer> {
        self.config.validate()?;

        let plain_addr = SocketAddr::new(self.config.bind_ip(), self.config.port);
        let listener = TcpListener::bind(plain_addr).await?;
        info!("HTTP server listening on {}", listener.local_addr()?);

        let material = if self.config.tls_port.is_some() || self.config.quic_port.is_some() {
            let material = match (&self.config.cert_path, &self.config.key_path) {
                (Some(cert), Some(key)) => tls::load_pem(cert, key)?,
                _ => tls::load_or_generate(&self.config.cache_dir)?,
            };
            for pin in &material.spki {
                info!("SPKI pin: {}", pin);
            }
            Some(material)
        } else {
            None
        };

        let tls = match (self.config.tls_port, &material) {
            (Some(port), Some(material)) => {
                let acceptor = tls::acceptor(material)?;
                let tls_listener =
                    TcpListener::bind(SocketAddr::new(self.config.bind_ip(), port)).await?;
                info!("HTTPS server listening on {}", tls_listener.local_addr()?);
                Some((tls_listener, acceptor))
            }
            _ => None,
        };

        let quic = match (self.config.quic_port, &material) {
            (Some(port), Some(material)) => {
                let endpoint = quic::bind(
                    SocketAddr::new(self.config.bind_ip(), port),
                    tls::quic_server_config(material)?,
                )?;
                info!("HTTP/3 server listening on {}", endpoint.local_addr()?);
                Some(endpoint)
            }
            _ => None,
        };

        let spki = material.map(|m| m.spki).unwrap_or_default();
        let tls_active = tls.is_some() || quic.is_some();
        let state = Arc::new(ServerState::new(self.config.clone(), spki, tls_active));

        Ok(BoundServer {
            listener,
            tls,
            quic,
            state,
            shutdown: self.shutdown.clone(),
        })
    }
}

/// A server whose listeners are bound.
pub struct BoundServer {
    listener: TcpListener,
    tls: Option<(TcpListener, TlsAcceptor)>,
    quic: Option<quinn::Endpoint>,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
}

impl BoundServer {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn tls_local_addr(&self) -> Option<SocketAddr> {
        self.tls
            .as_ref()
            .and_then(|(listener, _)| listener.local_addr().ok())
    }

    /// Local UDP address of the HTTP/3 endpoint.
    pub fn quic_local_addr(&self) -> Option<SocketAddr> {
        self.quic
            .as_ref()
            .and_then(|endpoint| endpoint.local_addr().ok())
    }

    /// Accepts connections until the shutdown token is cancelled.
    pub async fn serve(self) -> Result<()> {
        let tls_task = self.tls.map(|(listener, acceptor)| {
            tokio::spawn(accept_tls(
                listener,
                acceptor,
                Arc::clone(&self.state),
                self.shutdown.clone(),
            ))
        });

        let quic_task = self.quic.map(|endpoint| {
            tokio::spawn(quic::accept_quic(
                endpoint,
                Arc::clone(&self.state),
                self.shutdown.clone(),
            ))
        });

        accept_plain(self.listener, self.state, self.shutdown).await;

        if let Some(task) = tls_task {
            if let Err(e) = task.await {
                error!("TLS accept loop failed: {}", e);
            }
        }
        if let Some(task) = quic_task {
            if let Err(e) = task.await {
                error!("QUIC accept loop failed: {}", e);
            }
        }

        info!("Server stopped");
        Ok(())
    }
}

/// State shared by every connection.
#[derive(Debug)]
pub struct ServerState {
    pub(crate) config: ServerConfig,
    spki: Vec<String>,
    tls_active: bool,
    static_files: Option<ServeDir>,
    pub(crate) chunks: Arc<BufferPool>,
}

impl ServerState {
    /// `tls_active` enables `/api/spki`; set it when a TLS or QUIC listener
    /// serves the certificate `spki` was computed from.
    pub fn new(config: ServerConfig, spki: Vec<String>, tls_active: bool) -> Self {
        let static_files = config.static_dir.as_ref().map(ServeDir::new);
        Self {
            config,
            spki,
            tls_active,
            static_files,
            chunks: BufferPool::new(CHUNK_SIZE, POOLED_CHUNKS),
        }
    }
}

async fn accept_plain(listener: TcpListener, state: Arc<ServerState>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                debug!("New connection from {}", addr);
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, addr, state).await {
                        error!("Error handling client {}: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
            }
        }
    }
}

async fn accept_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                debug!("New TLS connection from {}", addr);
                let state = Arc::clone(&state);
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let handshake = time::timeout(state.config.read_timeout, acceptor.accept(stream));
                    let stream = match handshake.await {
                        Ok(Ok(stream)) => stream,
                        Ok(Err(e)) => {
                            debug!("TLS handshake with {} failed: {}", addr, e);
                            return;
                        }
                        Err(_) => {
                            debug!("TLS handshake with {} timed out", addr);
                            return;
                        }
                    };

                    if let Err(e) = serve_connection(stream, addr, state).await {
                        error!("Error handling client {}: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting TLS connection: {}", e);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Endpoint {
    Download,
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    Intercept(Endpoint),
    Spki,
    Static,
    MethodNotAllowed,
}

pub(crate) fn route(head: &RequestHead) -> Route {
    let method = &head.method;

    match head.uri.path() {
        "/api/downloading" if method == Method::GET => Route::Intercept(Endpoint::Download),
        "/api/uploading" if method == Method::POST || method == Method::OPTIONS => {
            Route::Intercept(Endpoint::Upload)
        }
        "/api/spki" if method == Method::GET => Route::Spki,
        "/api/downloading" | "/api/uploading" | "/api/spki" => Route::MethodNotAllowed,
        _ if method == Method::GET || method == Method::HEAD => Route::Static,
        _ => Route::MethodNotAllowed,
    }
}

/// Serves requests on one connection until it closes.
///
/// Standard responses keep the connection open for bodiless requests that
/// ask for it; intercepted exchanges always end it.
pub async fn serve_connection<T: Transport>(
    stream: T,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<()> {
    let config = &state.config;
    let mut conn = BufReader::new(stream);

    loop {
        let head = match time::timeout(config.read_timeout, http::read_request_head(&mut conn)).await
        {
            Ok(Ok(Some(head))) => head,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(Error::Http(reason))) => {
                warn!("Bad request from {}: {}", peer_addr, reason);
                let response = Response::text(StatusCode::BAD_REQUEST, "Bad Request\n");
                write_response(&mut conn, response, false, config.write_timeout).await?;
                let _ = conn.shutdown().await;
                return Ok(());
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!("Connection from {} idle, closing", peer_addr);
                return Ok(());
            }
        };
        debug!("{} {} from {}", head.method, head.uri, peer_addr);

        let endpoint = match route(&head) {
            Route::Intercept(endpoint) => endpoint,
            standard => {
                let keep_alive = http::wants_keep_alive(head.version, &head.headers)
                    && matches!(
                        BodyFraming::for_request(&head.headers),
                        Ok(BodyFraming::Length(0))
                    );

                let mut response = match standard {
                    Route::Spki => spki_response(&state),
                    Route::Static => static_response(&state, &head).await,
                    _ => Response::text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed\n"),
                };
                if head.method == Method::HEAD {
                    response.omit_body = true;
                }

                write_response(&mut conn, response, keep_alive, config.write_timeout).await?;
                if !keep_alive {
                    let _ = conn.shutdown().await;
                    return Ok(());
                }
                continue;
            }
        };

        return serve_intercepted(conn, head, peer_addr, endpoint, &state).await;
    }
}

async fn serve_intercepted<T: Transport>(
    conn: BufReader<T>,
    head: RequestHead,
    peer_addr: SocketAddr,
    endpoint: Endpoint,
    state: &ServerState,
) -> Result<()> {
    let config = &state.config;

    let mut exchange = match interceptor::intercept(
        conn,
        head,
        peer_addr,
        config.read_timeout,
        config.write_timeout,
    ) {
        Ok(exchange) => exchange,
        Err(declined) => {
            let Declined { mut conn, error, .. } = *declined;
            error!("Cannot take over connection from {}: {}", peer_addr, error);
            let response = Response::text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error\n");
            write_response(&mut conn, response, false, config.write_timeout).await?;
            let _ = conn.shutdown().await;
            return Ok(());
        }
    };

    let mut chunk = state.chunks.get();
    let result = match endpoint {
        Endpoint::Download => {
            handlers::download(&exchange.ctx, &mut exchange.writer, &mut chunk).await
        }
        Endpoint::Upload => {
            handlers::upload(
                &exchange.ctx,
                &mut exchange.body,
                &mut exchange.writer,
                &mut chunk,
            )
            .await
        }
    };
    drop(chunk);

    if let Err(e) = result {
        warn!("{:?} exchange with {} ended early: {}", endpoint, peer_addr, e);
    }
    exchange.close().await;
    Ok(())
}

/// A response sent through the standard path.
pub(crate) struct Response {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
    pub(crate) omit_body: bool,
}

impl Response {
    fn new(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        Self {
            status,
            headers,
            body: body.into(),
            omit_body: false,
        }
    }

    pub(crate) fn text(status: StatusCode, body: &'static str) -> Self {
        Self::new(status, "text/plain; charset=utf-8", body)
    }

    /// Content length to announce; a HEAD answer keeps the length of the
    /// body it omits.
    pub(crate) fn content_length(&self) -> HeaderValue {
        self.headers
            .get(header::CONTENT_LENGTH)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from(self.body.len()))
    }

    fn not_found() -> Self {
        Self::text(StatusCode::NOT_FOUND, "Not Found\n")
    }
}

async fn write_response<W>(
    conn: &mut W,
    mut response: Response,
    keep_alive: bool,
    write_timeout: Duration,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let content_length = response.content_length();
    let headers = &mut response.headers;
    headers.insert(header::CONTENT_LENGTH, content_length);
    headers.insert(
        header::CONNECTION,
        HeaderValue::from_static(if keep_alive { "keep-alive" } else { "close" }),
    );

    let mut out = http::encode_response_head(response.status, &response.headers);
    if !response.omit_body {
        out.extend_from_slice(&response.body);
    }

    http::with_deadline(write_timeout, async {
        conn.write_all(&out).await?;
        conn.flush().await
    })
    .await?;
    Ok(())
}

pub(crate) fn spki_response(state: &ServerState) -> Response {
    if !state.tls_active {
        return Response::not_found();
    }

    match serde_json::to_vec_pretty(&state.spki) {
        Ok(body) => {
            let mut response = Response::new(StatusCode::OK, "application/json", body);
            response
                .headers
                .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
            response
        }
        Err(e) => {
            error!("Failed to encode SPKI list: {}", e);
            Response::text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error\n")
        }
    }
}

/// Serves `head` from the static tree through [`ServeDir`].
///
/// The file is read completely before the response goes out.
pub(crate) async fn static_response(state: &ServerState, head: &RequestHead) -> Response {
    let Some(serve_dir) = &state.static_files else {
        return Response::not_found();
    };

    let request = Request::from_parts(head.clone(), Empty::<Bytes>::new());
    let response = match serve_dir.clone().oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };

    let (parts, body) = response.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("Reading static file for {} failed: {}", head.uri.path(), e);
            return Response::text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error\n");
        }
    };
    debug!("Static {} -> {}", head.uri.path(), parts.status);

    Response {
        status: parts.status,
        headers: parts.headers,
        body,
        omit_body: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(method: Method, target: &str) -> RequestHead {
        ::http::Request::builder()
            .method(method)
            .uri(target)
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    #[test]
    fn test_routes() {
        assert_eq!(
            route(&head(Method::GET, "/api/downloading?size=1")),
            Route::Intercept(Endpoint::Download)
        );
        assert_eq!(
            route(&head(Method::POST, "/api/uploading")),
            Route::Intercept(Endpoint::Upload)
        );
        assert_eq!(
            route(&head(Method::OPTIONS, "/api/uploading")),
            Route::Intercept(Endpoint::Upload)
        );
        assert_eq!(route(&head(Method::GET, "/api/spki")), Route::Spki);
        assert_eq!(route(&head(Method::GET, "/index.html")), Route::Static);
        assert_eq!(route(&head(Method::HEAD, "/")), Route::Static);
        assert_eq!(
            route(&head(Method::GET, "/api/uploading")),
            Route::MethodNotAllowed
        );
        assert_eq!(
            route(&head(Method::DELETE, "/index.html")),
            Route::MethodNotAllowed
        );
    }

    fn state_with_static(dir: &std::path::Path) -> ServerState {
        ServerState::new(
            ServerConfig::default().with_static_dir(dir),
            Vec::new(),
            false,
        )
    }

    #[tokio::test]
    async fn test_static_index_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>hi</h1>").unwrap();
        let state = state_with_static(dir.path());

        let response = static_response(&state, &head(Method::GET, "/")).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], b"<h1>hi</h1>");
        assert_eq!(response.headers[header::CONTENT_TYPE], "text/html");

        let response = static_response(&state, &head(Method::GET, "/nope.js")).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);

        let bare = ServerState::new(ServerConfig::default(), Vec::new(), false);
        let response = static_response(&bare, &head(Method::GET, "/")).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_static_rejects_traversal() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("www");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(outer.path().join("secret.txt"), "hidden").unwrap();
        let state = state_with_static(&root);

        for target in ["/../secret.txt", "/a/../../secret.txt", "/%2e%2e/secret.txt"] {
            let response = static_response(&state, &head(Method::GET, target)).await;
            assert_eq!(response.status, StatusCode::NOT_FOUND, "served {}", target);
        }
    }

    #[tokio::test]
    async fn test_static_content_types() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("photo.webp"), [0x52, 0x49, 0x46, 0x46]).unwrap();
        std::fs::write(dir.path().join("app.js"), "export {}").unwrap();
        let state = state_with_static(dir.path());

        let response = static_response(&state, &head(Method::GET, "/photo.webp")).await;
        assert_eq!(response.headers[header::CONTENT_TYPE], "image/webp");

        let response = static_response(&state, &head(Method::GET, "/app.js")).await;
        assert!(response.headers[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .contains("javascript"));
    }

    #[tokio::test]
    async fn test_static_head_keeps_length() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "twelve bytes").unwrap();
        let state = state_with_static(dir.path());

        let mut response = static_response(&state, &head(Method::HEAD, "/a.txt")).await;
        response.omit_body = true;
        let mut out = Vec::new();
        write_response(&mut out, response, false, Duration::from_secs(1))
            .await
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("content-length: 12\r\n"), "{}", text);
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_spki_without_tls() {
        let state = ServerState::new(ServerConfig::default(), Vec::new(), false);
        assert_eq!(spki_response(&state).status, StatusCode::NOT_FOUND);

        let state = ServerState::new(ServerConfig::default(), vec!["pin".into()], true);
        let response = spki_response(&state);
        assert_eq!(response.status, StatusCode::OK);
        let pins: Vec<String> = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(pins, vec!["pin".to_string()]);
    }

    #[tokio::test]
    async fn test_write_response_head_request() {
        let mut out = Vec::new();
        let mut response = Response::text(StatusCode::OK, "hello");
        response.omit_body = true;

        write_response(&mut out, response, true, Duration::from_secs(1))
            .await
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.contains("connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
