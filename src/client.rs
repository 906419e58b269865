use crate::config::ClientConfig;
use crate::footer::consume_body;
use crate::measurements::{throughput_bps, IterationReport, MeasurementSummary, MeasurementsCollector};
use crate::tcp_info::{TelemetryAccessor, TelemetrySnapshot};
use crate::{Error, Result};
use ::http::{header, HeaderValue, Request, Uri};
use bytes::Bytes;
use http_body_util::Empty;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use log::{debug, info, warn};
use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time;
use tokio_rustls::TlsConnector;

/// Progress event types reported while a run is in progress.
///
/// # Examples
///
/// ```no_run
/// use tcpscope::{Client, ClientConfig, ProgressEvent};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ClientConfig::new("http://127.0.0.1:3000/api/downloading?size=8");
///
/// let client = Client::new(config)?
///     .with_callback(|event: ProgressEvent| match event {
///         ProgressEvent::IterationCompleted { iteration, bits_per_second, .. } => {
///             println!("#{}: {:.2} Mbps", iteration, bits_per_second / 1_000_000.0);
///         }
///         ProgressEvent::Error(msg) => eprintln!("Error: {}", msg),
///         _ => {}
///     });
///
/// client.run().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Run is starting.
    TestStarted { iterations: usize },
    /// A download is about to be dispatched.
    IterationStarted { iteration: usize },
    /// A download finished.
    IterationCompleted {
        iteration: usize,
        bytes: u64,
        duration: Duration,
        bits_per_second: f64,
    },
    /// All downloads finished.
    TestCompleted {
        iterations: usize,
        mean_bits_per_second: f64,
    },
    /// The run stopped on an error.
    Error(String),
}

/// Callback trait for receiving progress updates.
///
/// Implemented for any `Fn(ProgressEvent)` closure.
///
/// ```
/// use tcpscope::{ProgressCallback, ProgressEvent};
///
/// struct Log;
///
/// impl ProgressCallback for Log {
///     fn on_progress(&self, event: ProgressEvent) {
///         eprintln!("{:?}", event);
///     }
/// }
/// ```
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

impl<F> ProgressCallback for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: ProgressEvent) {
        self(event)
    }
}

type CallbackRef = Arc<dyn ProgressCallback>;

/// Where the client downloads from.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    tls: bool,
    host: String,
    port: u16,
    authority: String,
    path_and_query: String,
}

impl Target {
    fn parse(url: &str) -> Result<Self> {
        let uri: Uri = url
            .parse()
            .map_err(|e| Error::Config(format!("invalid URL {:?}: {}", url, e)))?;

        let tls = match uri.scheme_str() {
            Some("http") => false,
            Some("https") => true,
            other => {
                return Err(Error::Config(format!(
                    "unsupported URL scheme {:?}",
                    other.unwrap_or_default()
                )))
            }
        };

        let authority = uri
            .authority()
            .ok_or_else(|| Error::Config(format!("URL {:?} has no host", url)))?;
        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = authority.port_u16().unwrap_or(if tls { 443 } else { 80 });

        Ok(Self {
            tls,
            host,
            port,
            authority: authority.as_str().to_string(),
            path_and_query: uri
                .path_and_query()
                .map(|p| p.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
        })
    }

    /// Request target with a random `n` parameter that defeats caches.
    fn request_target(&self, nonce: u64) -> String {
        let separator = if self.path_and_query.contains('?') { '&' } else { '?' };
        format!("{}{}n={}", self.path_and_query, separator, nonce)
    }
}

/// A TCP stream that captures its own telemetry right before shutdown.
///
/// Reading the statistics while the socket is still open records the
/// client's view of the transfer that just finished.
pub struct MeasuredStream {
    inner: TcpStream,
    captured: Arc<Mutex<Option<TelemetrySnapshot>>>,
    done: bool,
}

impl MeasuredStream {
    pub fn new(inner: TcpStream) -> Self {
        Self {
            inner,
            captured: Arc::new(Mutex::new(None)),
            done: false,
        }
    }

    /// Slot that receives the snapshot once the stream shuts down.
    pub fn telemetry_slot(&self) -> Arc<Mutex<Option<TelemetrySnapshot>>> {
        Arc::clone(&self.captured)
    }

    fn capture(&mut self) {
        if self.done {
            return;
        }
        self.done = true;

        match self.inner.tcp_telemetry() {
            Ok(snapshot) => *self.captured.lock() = Some(snapshot),
            Err(e) => warn!("No client telemetry: {}", e),
        }
    }
}

impl AsyncRead for MeasuredStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MeasuredStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.capture();
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Drop for MeasuredStream {
    fn drop(&mut self) {
        self.capture();
    }
}

trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connection for T {}

/// Accepts any server certificate; the diagnostic servers are self-signed.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn insecure_connector() -> Result<TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut config = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Measuring client.
///
/// Downloads the configured URL a number of times, one connection per
/// download, and reports throughput together with the server's telemetry
/// (decoded from the response footer) and the client's own.
///
/// # Examples
///
/// ```no_run
/// use tcpscope::{Client, ClientConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::new(ClientConfig::default().with_iterations(5))?;
/// let summary = client.run().await?;
///
/// println!("Mean: {:.2} Mbps", summary.mean_bits_per_second / 1_000_000.0);
/// # Ok(())
/// # }
/// ```
pub struct Client {
    config: ClientConfig,
    target: Target,
    tls: Option<TlsConnector>,
    measurements: MeasurementsCollector,
    callback: Option<CallbackRef>,
}

impl Client {
    /// Creates a client for the configured URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the URL is not an
    /// `http`/`https` URL with a host.
    ///
    /// ```
    /// use tcpscope::{Client, ClientConfig};
    ///
    /// assert!(Client::new(ClientConfig::default()).is_ok());
    /// assert!(Client::new(ClientConfig::new("ftp://example.net/")).is_err());
    /// ```
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let target = Target::parse(&config.url)?;
        let tls = if target.tls {
            Some(insecure_connector()?)
        } else {
            None
        };

        Ok(Self {
            config,
            target,
            tls,
            measurements: MeasurementsCollector::new(),
            callback: None,
        })
    }

    /// Attaches a progress callback.
    pub fn with_callback<C: ProgressCallback + 'static>(mut self, callback: C) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    fn notify(&self, event: ProgressEvent) {
        if let Some(callback) = &self.callback {
            callback.on_progress(event);
        }
    }

    /// Runs all iterations in sequence and prints the results.
    ///
    /// Results of earlier runs on the same client are discarded.
    ///
    /// # Errors
    ///
    /// Stops at the first iteration that fails to connect, gets a non-2xx
    /// answer or loses the connection mid-body.
    pub async fn run(&self) -> Result<MeasurementSummary> {
        self.measurements.clear();
        info!(
            "Measuring {} ({} iterations)",
            self.config.url, self.config.iterations
        );
        self.notify(ProgressEvent::TestStarted {
            iterations: self.config.iterations,
        });

        for iteration in 1..=self.config.iterations {
            if iteration > 1 {
                time::sleep(self.config.pause).await;
            }
            self.notify(ProgressEvent::IterationStarted { iteration });

            match self.run_iteration(iteration).await {
                Ok(report) => {
                    if !self.config.json {
                        print_iteration(&report);
                    }
                    self.notify(ProgressEvent::IterationCompleted {
                        iteration,
                        bytes: report.bytes,
                        duration: report.duration,
                        bits_per_second: report.bits_per_second,
                    });
                    self.measurements.record(report);
                }
                Err(e) => {
                    self.notify(ProgressEvent::Error(e.to_string()));
                    return Err(e);
                }
            }
        }

        let summary = self.measurements.get();
        self.notify(ProgressEvent::TestCompleted {
            iterations: summary.iterations.len(),
            mean_bits_per_second: summary.mean_bits_per_second,
        });

        if self.config.json {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        } else {
            print_summary(&summary);
        }
        Ok(summary)
    }

    /// Results recorded so far.
    pub fn get_results(&self) -> MeasurementSummary {
        self.measurements.get()
    }

    async fn connect(&self) -> Result<(Box<dyn Connection>, Arc<Mutex<Option<TelemetrySnapshot>>>)> {
        let address = (self.target.host.as_str(), self.target.port);
        let tcp = time::timeout(self.config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                Error::Client(format!(
                    "connecting to {} timed out",
                    self.target.authority
                ))
            })??;
        tcp.set_nodelay(true)?;
        debug!("Connected to {}", tcp.peer_addr()?);

        let stream = MeasuredStream::new(tcp);
        let slot = stream.telemetry_slot();

        let conn: Box<dyn Connection> = match &self.tls {
            Some(connector) => {
                let name = ServerName::try_from(self.target.host.clone())
                    .map_err(|e| Error::Tls(format!("invalid server name: {}", e)))?;
                let handshake = connector.connect(name, stream);
                let tls = time::timeout(self.config.connect_timeout, handshake)
                    .await
                    .map_err(|_| Error::Client("TLS handshake timed out".into()))??;
                Box::new(tls)
            }
            None => Box::new(stream),
        };

        Ok((conn, slot))
    }

    async fn run_iteration(&self, iteration: usize) -> Result<IterationReport> {
        let (conn, client_telemetry) = self.connect().await?;

        let (mut sender, connection) = http1::handshake(TokioIo::new(conn)).await?;
        let driver = tokio::spawn(connection);

        let request = Request::get(self.target.request_target(rand::random()))
            .header(
                header::HOST,
                HeaderValue::from_str(&self.target.authority)
                    .map_err(|e| Error::Client(format!("invalid host: {}", e)))?,
            )
            .header(
                header::USER_AGENT,
                HeaderValue::from_static(concat!("tcpscope/", env!("CARGO_PKG_VERSION"))),
            )
            .header(header::ACCEPT, HeaderValue::from_static("*/*"))
            .header(header::CONNECTION, HeaderValue::from_static("close"))
            .body(Empty::<Bytes>::new())
            .map_err(|e| Error::Client(format!("invalid request: {}", e)))?;

        let start = Instant::now();
        let response = time::timeout(self.config.read_timeout, sender.send_request(request))
            .await
            .map_err(|_| Error::Client("timed out waiting for response".into()))??;
        if !response.status().is_success() {
            return Err(Error::Client(format!("server answered {}", response.status())));
        }

        let declared = response.headers().get(header::CONTENT_LENGTH).cloned();
        let mut body = response.into_body();
        let (bytes, server) =
            consume_body::<_, TelemetrySnapshot>(&mut body, self.config.read_timeout).await?;
        let duration = start.elapsed();

        if let Some(declared) = declared {
            debug!("Received {} of {:?} declared bytes", bytes, declared);
        }
        if server.is_none() {
            warn!("No server telemetry in response footer");
        }

        drop(body);
        drop(sender);
        match time::timeout(self.config.read_timeout, driver).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => debug!("Connection after iteration {} failed: {}", iteration, e),
            Ok(Err(e)) => debug!("Connection task of iteration {} failed: {}", iteration, e),
            Err(_) => debug!("Connection of iteration {} did not close in time", iteration),
        }
        let client = client_telemetry.lock().take();

        Ok(IterationReport {
            iteration,
            bytes,
            duration,
            bits_per_second: throughput_bps(bytes, duration),
            server,
            client,
        })
    }
}

fn format_bytes(bytes: u64) -> (f64, &'static str) {
    if bytes >= 1_000_000_000 {
        (bytes as f64 / 1_000_000_000.0, "GBytes")
    } else {
        (bytes as f64 / 1_000_000.0, "MBytes")
    }
}

fn format_bitrate(bps: f64) -> (f64, &'static str) {
    if bps >= 1_000_000_000.0 {
        (bps / 1_000_000_000.0, "Gbits/sec")
    } else {
        (bps / 1_000_000.0, "Mbits/sec")
    }
}

fn print_iteration(report: &IterationReport) {
    let (value, unit) = format_bytes(report.bytes);
    let (rate, rate_unit) = format_bitrate(report.bits_per_second);

    println!(
        "[{:3}]  {:6.3} sec  {:6.2} {:>7}  {:8.2} {:>10}",
        report.iteration,
        report.duration.as_secs_f64(),
        value,
        unit,
        rate,
        rate_unit
    );

    match &report.server {
        Some(snapshot) => println!("  Server TCP info:\n{}", snapshot),
        None => println!("  Server TCP info: unavailable"),
    }
    match &report.client {
        Some(snapshot) => println!("  Client TCP info:\n{}", snapshot),
        None => println!("  Client TCP info: unavailable"),
    }
}

fn print_summary(summary: &MeasurementSummary) {
    let (value, unit) = format_bytes(summary.total_bytes());
    let (rate, rate_unit) = format_bitrate(summary.mean_bits_per_second);

    println!("- - - - - - - - - - - - - - - - - - - - - - - - -");
    println!(
        "{} iterations  {:6.2} {:>7}  mean {:8.2} {:>10}",
        summary.iterations.len(),
        value,
        unit,
        rate,
        rate_unit
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_http_target() {
        let target = Target::parse("http://127.0.0.1:3000/api/downloading?size=1").unwrap();
        assert!(!target.tls);
        assert_eq!(target.host, "127.0.0.1");
        assert_eq!(target.port, 3000);
        assert_eq!(target.authority, "127.0.0.1:3000");
        assert_eq!(target.path_and_query, "/api/downloading?size=1");
        assert_eq!(
            target.request_target(42),
            "/api/downloading?size=1&n=42"
        );
    }

    #[test]
    fn test_parse_https_defaults() {
        let target = Target::parse("https://[::1]").unwrap();
        assert!(target.tls);
        assert_eq!(target.host, "::1");
        assert_eq!(target.port, 443);
        assert_eq!(target.path_and_query, "/");
        assert_eq!(target.request_target(7), "/?n=7");
    }

    #[test]
    fn test_parse_rejects() {
        assert!(matches!(Target::parse("ftp://host/"), Err(Error::Config(_))));
        assert!(matches!(Target::parse("/relative"), Err(Error::Config(_))));
        assert!(matches!(Target::parse("http://exa mple"), Err(Error::Config(_))));
    }

    #[test]
    fn test_format_units() {
        assert_eq!(format_bytes(2_000_000), (2.0, "MBytes"));
        assert_eq!(format_bytes(3_000_000_000), (3.0, "GBytes"));
        assert_eq!(format_bitrate(5e8), (500.0, "Mbits/sec"));
        assert_eq!(format_bitrate(2e9), (2.0, "Gbits/sec"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ClientConfig::default().with_iterations(0);
        assert!(matches!(Client::new(config), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_measured_stream_captures_on_shutdown() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let mut stream = MeasuredStream::new(TcpStream::connect(addr).await.unwrap());
        let slot = stream.telemetry_slot();
        let _server = accept.await.unwrap();

        assert!(slot.lock().is_none());
        stream.shutdown().await.unwrap();

        #[cfg(any(target_os = "linux", target_os = "macos", windows))]
        assert!(slot.lock().is_some());
    }
}
