use bytes::Buf;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use tcpscope::footer::{FooterDecoder, FOOTER_SIZE};
use tcpscope::{Client, ClientConfig, Server, ServerConfig, TelemetrySnapshot};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

async fn start_server(config: ServerConfig) -> (SocketAddr, Option<SocketAddr>, CancellationToken) {
    let server = Server::new(config.with_bind_addr("127.0.0.1".parse().unwrap()));
    let shutdown = server.shutdown_token();
    let bound = server.bind().await.unwrap();
    let addr = bound.local_addr().unwrap();
    let tls_addr = bound.tls_local_addr();

    tokio::spawn(bound.serve());
    (addr, tls_addr, shutdown)
}

/// Status line and header fields of a response.
struct Head {
    status: StatusCode,
    headers: HeaderMap,
}

/// Reads one response head off `reader`, leaving the body unread.
async fn read_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> Head {
    let mut raw = Vec::new();
    while !raw.ends_with(b"\r\n\r\n") {
        let n = reader.read_until(b'\n', &mut raw).await.unwrap();
        assert!(n > 0, "connection closed inside response head");
    }

    let mut fields = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut fields);
    assert!(response.parse(&raw).unwrap().is_complete());

    let mut headers = HeaderMap::new();
    for field in response.headers.iter() {
        headers.append(
            HeaderName::from_bytes(field.name.as_bytes()).unwrap(),
            HeaderValue::from_bytes(field.value).unwrap(),
        );
    }
    Head {
        status: StatusCode::from_u16(response.code.unwrap()).unwrap(),
        headers,
    }
}

/// Sends a raw request and reads the response until the server closes.
async fn fetch(addr: SocketAddr, request: &[u8]) -> (Head, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();

    let mut reader = BufReader::new(stream);
    let head = read_head(&mut reader).await;
    let mut body = Vec::new();
    reader.read_to_end(&mut body).await.unwrap();
    (head, body)
}

fn content_length(head: &Head) -> usize {
    head.headers["content-length"].to_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn test_download_size_zero_is_footer_only() {
    let (addr, _, shutdown) = start_server(ServerConfig::new(0)).await;

    let (head, body) = fetch(
        addr,
        b"GET /api/downloading?size=0 HTTP/1.1\r\nHost: test\r\n\r\n",
    )
    .await;

    assert_eq!(head.status, 200);
    assert_eq!(content_length(&head), FOOTER_SIZE);
    assert_eq!(head.headers["access-control-allow-origin"], "*");
    assert_eq!(head.headers["content-type"], "application/octet-stream");
    assert_eq!(body.len(), FOOTER_SIZE);
    assert_eq!(body[0], 0);

    shutdown.cancel();
}

#[tokio::test]
async fn test_download_one_mib_with_footer() {
    let (addr, _, shutdown) = start_server(ServerConfig::new(0)).await;

    let (head, body) = fetch(
        addr,
        b"GET /api/downloading?size=1&n=123 HTTP/1.1\r\nHost: test\r\n\r\n",
    )
    .await;

    assert_eq!(content_length(&head), 1_052_672);
    assert_eq!(body.len(), 1_052_672);
    assert!(!body[..1_048_576].contains(&0));

    let mut decoder = FooterDecoder::new();
    for piece in body.chunks(1500) {
        decoder.push(piece);
    }
    let footer = decoder.finish();
    assert_eq!(footer.total_bytes, 1_052_672);

    let snapshot: Option<TelemetrySnapshot> = footer.decode();
    #[cfg(any(target_os = "linux", target_os = "macos", windows))]
    {
        let snapshot = snapshot.expect("server telemetry in footer");
        assert!(snapshot.bytes_sent.unwrap_or(1) > 0);
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    assert!(snapshot.is_none());

    shutdown.cancel();
}

#[tokio::test]
async fn test_download_bad_size_uses_default() {
    let (addr, _, shutdown) = start_server(ServerConfig::new(0)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /api/downloading?size=lots HTTP/1.1\r\nHost: test\r\n\r\n")
        .await
        .unwrap();
    let mut reader = BufReader::new(stream);
    let head = read_head(&mut reader).await;

    assert_eq!(content_length(&head), 16 * 1_048_576 + FOOTER_SIZE);
    shutdown.cancel();
}

#[tokio::test]
async fn test_download_size_percent_encoded() {
    let (addr, _, shutdown) = start_server(ServerConfig::new(0)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /api/downloading?size=%32 HTTP/1.1\r\nHost: test\r\n\r\n")
        .await
        .unwrap();
    let mut reader = BufReader::new(stream);
    let head = read_head(&mut reader).await;

    assert_eq!(content_length(&head), 2 * 1_048_576 + FOOTER_SIZE);
    shutdown.cancel();
}

#[tokio::test]
async fn test_upload_reports_telemetry() {
    let (addr, _, shutdown) = start_server(ServerConfig::new(0)).await;

    let mut request = b"POST /api/uploading HTTP/1.1\r\nHost: test\r\nContent-Type: application/octet-stream\r\nContent-Length: 10000\r\n\r\n".to_vec();
    request.extend(std::iter::repeat(b'x').take(10_000));

    let (head, body) = fetch(addr, &request).await;

    assert_eq!(head.status, 200);
    assert_eq!(head.headers["content-type"], "application/json");
    assert_eq!(content_length(&head), body.len());

    let snapshot: Option<TelemetrySnapshot> = serde_json::from_slice(&body).unwrap();
    #[cfg(any(target_os = "linux", target_os = "macos", windows))]
    assert!(snapshot.unwrap().bytes_received.unwrap_or(10_000) >= 10_000);

    shutdown.cancel();
}

#[tokio::test]
async fn test_upload_chunked_body() {
    let (addr, _, shutdown) = start_server(ServerConfig::new(0)).await;

    let request = b"POST /api/uploading HTTP/1.1\r\nHost: test\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
    let (head, body) = fetch(addr, request).await;

    assert_eq!(head.status, 200);
    assert_eq!(content_length(&head), body.len());
    shutdown.cancel();
}

#[tokio::test]
async fn test_upload_expect_continue() {
    let (addr, _, shutdown) = start_server(ServerConfig::new(0)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"POST /api/uploading HTTP/1.1\r\nHost: test\r\nContent-Length: 5000\r\nExpect: 100-continue\r\n\r\n")
        .await
        .unwrap();
    let mut reader = BufReader::new(stream);

    // Nothing of the body has been sent yet.
    let interim = read_head(&mut reader).await;
    assert_eq!(interim.status, StatusCode::CONTINUE);

    reader.get_mut().write_all(&[b'u'; 5000]).await.unwrap();
    let head = read_head(&mut reader).await;
    assert_eq!(head.status, StatusCode::OK);
    assert_eq!(head.headers["content-type"], "application/json");

    let mut body = Vec::new();
    reader.read_to_end(&mut body).await.unwrap();
    assert_eq!(content_length(&head), body.len());

    shutdown.cancel();
}

#[tokio::test]
async fn test_upload_cors_preflight() {
    let (addr, _, shutdown) = start_server(ServerConfig::new(0)).await;

    let (head, body) = fetch(
        addr,
        b"OPTIONS /api/uploading HTTP/1.1\r\nHost: test\r\nOrigin: http://example.net\r\n\r\n",
    )
    .await;

    assert_eq!(head.status, 200);
    assert_eq!(head.headers["access-control-allow-origin"], "*");
    assert_eq!(head.headers["access-control-allow-methods"], "POST");
    assert_eq!(head.headers["access-control-allow-headers"], "Content-Type");
    assert!(body.is_empty());

    shutdown.cancel();
}

#[tokio::test]
async fn test_spki_not_found_without_tls() {
    let (addr, _, shutdown) = start_server(ServerConfig::new(0)).await;

    let (head, _) = fetch(
        addr,
        b"GET /api/spki HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert_eq!(head.status, 404);
    shutdown.cancel();
}

#[tokio::test]
async fn test_static_keep_alive() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<p>hello</p>").unwrap();
    std::fs::write(dir.path().join("app.js"), "run()").unwrap();

    let (addr, _, shutdown) =
        start_server(ServerConfig::new(0).with_static_dir(dir.path())).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: test\r\n\r\nGET /app.js HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut reader = BufReader::new(stream);

    let first = read_head(&mut reader).await;
    assert_eq!(first.status, 200);
    assert_eq!(first.headers["connection"], "keep-alive");
    assert_eq!(first.headers["content-type"], "text/html");
    let mut body = vec![0u8; content_length(&first)];
    reader.read_exact(&mut body).await.unwrap();
    assert_eq!(body, b"<p>hello</p>");

    let second = read_head(&mut reader).await;
    assert!(second.headers["content-type"]
        .to_str()
        .unwrap()
        .contains("javascript"));
    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, b"run()");

    shutdown.cancel();
}

#[tokio::test]
async fn test_static_traversal_is_404() {
    let outer = tempfile::tempdir().unwrap();
    let root = outer.path().join("public");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(outer.path().join("private.txt"), "secret").unwrap();

    let (addr, _, shutdown) = start_server(ServerConfig::new(0).with_static_dir(&root)).await;

    let (head, body) = fetch(
        addr,
        b"GET /../private.txt HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(head.status, 404);
    assert!(!body.windows(6).any(|w| w == b"secret"));

    shutdown.cancel();
}

#[tokio::test]
async fn test_client_three_iterations() {
    let (addr, _, shutdown) = start_server(ServerConfig::new(0)).await;

    let config = ClientConfig::new(format!("http://{}/api/downloading?size=1", addr))
        .with_iterations(3)
        .with_json(true);
    let client = Client::new(config).unwrap();
    let summary = client.run().await.unwrap();

    assert_eq!(summary.iterations.len(), 3);
    for (i, report) in summary.iterations.iter().enumerate() {
        assert_eq!(report.iteration, i + 1);
        assert_eq!(report.bytes, 1_052_672);
        assert!(report.bits_per_second > 0.0);
        #[cfg(any(target_os = "linux", target_os = "macos", windows))]
        {
            assert!(report.server.is_some());
            assert!(report.client.is_some());
        }
    }

    let mean = summary
        .iterations
        .iter()
        .map(|r| r.bits_per_second)
        .sum::<f64>()
        / 3.0;
    assert_eq!(summary.mean_bits_per_second, mean);
    assert_eq!(client.get_results(), summary);

    shutdown.cancel();
}

#[tokio::test]
async fn test_tls_listener_and_https_client() {
    let cache = tempfile::tempdir().unwrap();
    let config = ServerConfig::new(0)
        .with_tls_port(0)
        .with_generated_cert(cache.path());
    let (addr, tls_addr, shutdown) = start_server(config).await;
    let tls_addr = tls_addr.expect("TLS listener bound");

    let (head, body) = fetch(
        addr,
        b"GET /api/spki HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(head.status, 200);
    let pins: Vec<String> = serde_json::from_slice(&body).unwrap();
    assert_eq!(pins.len(), 1);
    assert_eq!(pins[0].len(), 44);

    let config = ClientConfig::new(format!(
        "https://localhost:{}/api/downloading?size=1",
        tls_addr.port()
    ))
    .with_iterations(1)
    .with_json(true);
    let summary = Client::new(config).unwrap().run().await.unwrap();

    assert_eq!(summary.iterations.len(), 1);
    assert_eq!(summary.iterations[0].bytes, 1_052_672);
    #[cfg(any(target_os = "linux", target_os = "macos", windows))]
    assert!(summary.iterations[0].server.is_some());

    shutdown.cancel();
}

/// HTTP/3 client trusting the generated certificate in `cache`.
fn h3_client_endpoint(cache: &std::path::Path) -> quinn::Endpoint {
    let material = tcpscope::tls::load_or_generate(cache).unwrap();
    let mut roots = rustls::RootCertStore::empty();
    roots.add(material.cert_chain[0].clone()).unwrap();

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut crypto = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    crypto.alpn_protocols = vec![b"h3".to_vec()];

    let quic = quinn::crypto::rustls::QuicClientConfig::try_from(crypto).unwrap();
    let mut endpoint = quinn::Endpoint::client("127.0.0.1:0".parse().unwrap()).unwrap();
    endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(quic)));
    endpoint
}

#[tokio::test]
async fn test_http3_endpoint_serves_routes() {
    let cache = tempfile::tempdir().unwrap();
    let server = Server::new(
        ServerConfig::new(0)
            .with_bind_addr("127.0.0.1".parse().unwrap())
            .with_quic_port(0)
            .with_generated_cert(cache.path()),
    );
    let shutdown = server.shutdown_token();
    let bound = server.bind().await.unwrap();
    let addr = bound.local_addr().unwrap();
    let quic_addr = bound.quic_local_addr().expect("QUIC endpoint bound");
    assert!(bound.tls_local_addr().is_none());
    tokio::spawn(bound.serve());

    // The pins are published as soon as a certificate is served.
    let (head, body) = fetch(
        addr,
        b"GET /api/spki HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(head.status, 200);
    let pins: Vec<String> = serde_json::from_slice(&body).unwrap();
    assert_eq!(pins.len(), 1);

    let endpoint = h3_client_endpoint(cache.path());
    let conn = endpoint.connect(quic_addr, "localhost").unwrap().await.unwrap();
    let (mut driver, mut send_request) =
        h3::client::new(h3_quinn::Connection::new(conn)).await.unwrap();
    tokio::spawn(async move { std::future::poll_fn(|cx| driver.poll_close(cx)).await });

    let request = http::Request::get("https://localhost/api/downloading?size=1")
        .body(())
        .unwrap();
    let mut stream = send_request.send_request(request).await.unwrap();
    stream.finish().await.unwrap();

    let response = stream.recv_response().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-length"], "1052672");

    let mut body = Vec::new();
    while let Some(mut data) = stream.recv_data().await.unwrap() {
        body.extend_from_slice(&data.copy_to_bytes(data.remaining()));
    }
    assert_eq!(body.len(), 1_052_672);
    assert!(!body[..1_048_576].contains(&0));
    assert!(body[1_048_576..].iter().all(|&b| b == 0));

    let request = http::Request::get("https://localhost/api/spki").body(()).unwrap();
    let mut stream = send_request.send_request(request).await.unwrap();
    stream.finish().await.unwrap();
    let response = stream.recv_response().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    shutdown.cancel();
}
