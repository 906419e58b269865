use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Default port of the plain HTTP listener.
pub const DEFAULT_PORT: u16 = 3000;

/// Default target of the measuring client.
pub const DEFAULT_URL: &str = "http://127.0.0.1:3000/api/downloading?size=1";

/// Configuration of the diagnostic server.
///
/// Use the builder methods to customize the defaults.
///
/// # Examples
///
/// ## Plain HTTP only
///
/// ```
/// use tcpscope::ServerConfig;
///
/// let config = ServerConfig::new(8080).with_static_dir("./public");
/// assert!(config.validate().is_ok());
/// ```
///
/// ## With TLS and HTTP/3 listeners using a generated certificate
///
/// ```
/// use tcpscope::ServerConfig;
///
/// let config = ServerConfig::new(3000)
///     .with_tls_port(3443)
///     .with_quic_port(3443)
///     .with_generated_cert("/var/cache/tcpscope");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port of the plain HTTP listener
    pub port: u16,

    /// Address to bind; all IPv4 interfaces when unset
    pub bind_addr: Option<IpAddr>,

    /// Port of the TLS listener, disabled when unset
    pub tls_port: Option<u16>,

    /// UDP port of the HTTP/3 endpoint, disabled when unset
    pub quic_port: Option<u16>,

    /// PEM certificate chain for the TLS and QUIC listeners
    pub cert_path: Option<PathBuf>,

    /// PEM private key for the TLS and QUIC listeners
    pub key_path: Option<PathBuf>,

    /// Generate a self-signed certificate if none is cached
    pub generate_cert: bool,

    /// Where generated certificates are kept
    pub cache_dir: PathBuf,

    /// Root of the static file tree
    pub static_dir: Option<PathBuf>,

    /// Deadline for each read of a request head or body
    pub read_timeout: Duration,

    /// Deadline for each response write
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_addr: None,
            tls_port: None,
            quic_port: None,
            cert_path: None,
            key_path: None,
            generate_cert: false,
            cache_dir: PathBuf::from("."),
            static_dir: None,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Creates a configuration listening on `port`.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Enables the TLS listener on `port`.
    pub fn with_tls_port(mut self, port: u16) -> Self {
        self.tls_port = Some(port);
        self
    }

    /// Enables the HTTP/3 endpoint on UDP `port`.
    pub fn with_quic_port(mut self, port: u16) -> Self {
        self.quic_port = Some(port);
        self
    }

    /// Serves the given PEM certificate chain and key over TLS and QUIC.
    pub fn with_cert_files(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.cert_path = Some(cert.into());
        self.key_path = Some(key.into());
        self
    }

    /// Uses `cert.pem`/`key.pem` in `cache_dir`, generating them if missing.
    pub fn with_generated_cert(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.generate_cert = true;
        self.cache_dir = cache_dir.into();
        self
    }

    pub fn with_static_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.static_dir = Some(dir.into());
        self
    }

    /// Sets the read and write deadlines.
    ///
    /// # Examples
    ///
    /// ```
    /// use tcpscope::ServerConfig;
    /// use std::time::Duration;
    ///
    /// let config = ServerConfig::default()
    ///     .with_timeouts(Duration::from_secs(5), Duration::from_secs(60));
    /// assert_eq!(config.write_timeout, Duration::from_secs(60));
    /// ```
    pub fn with_timeouts(mut self, read: Duration, write: Duration) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    /// Address of the plain listener.
    pub fn bind_ip(&self) -> IpAddr {
        self.bind_addr.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    /// Checks that the settings are consistent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when:
    /// - only one of the certificate and key files is given
    /// - the TLS or QUIC listener has no certificate source
    /// - both listeners ask for the same fixed port
    /// - a deadline is zero
    pub fn validate(&self) -> Result<()> {
        if self.cert_path.is_some() != self.key_path.is_some() {
            return Err(Error::Config(
                "certificate and key files must be given together".into(),
            ));
        }

        let has_cert_source = self.cert_path.is_some() || self.generate_cert;
        if self.quic_port.is_some() && !has_cert_source {
            return Err(Error::Config(
                "QUIC listener needs --cert/--key or --generate-cert".into(),
            ));
        }

        if let Some(tls_port) = self.tls_port {
            if !has_cert_source {
                return Err(Error::Config(
                    "TLS listener needs --cert/--key or --generate-cert".into(),
                ));
            }
            if tls_port != 0 && tls_port == self.port {
                return Err(Error::Config(format!(
                    "TLS port {} is already used by the HTTP listener",
                    tls_port
                )));
            }
        }

        if self.read_timeout.is_zero() || self.write_timeout.is_zero() {
            return Err(Error::Config("timeouts must be non-zero".into()));
        }

        Ok(())
    }
}

/// Configuration of the measuring client.
///
/// # Examples
///
/// ```
/// use tcpscope::ClientConfig;
///
/// let config = ClientConfig::new("http://10.0.0.2:3000/api/downloading?size=64")
///     .with_iterations(5)
///     .with_json(true);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Download URL, `http` or `https`
    pub url: String,

    /// Number of sequential downloads
    pub iterations: usize,

    /// Print results as JSON
    pub json: bool,

    /// Pause between iterations
    pub pause: Duration,

    /// Deadline for establishing each connection
    pub connect_timeout: Duration,

    /// Deadline for each read of the response
    pub read_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            iterations: 3,
            json: false,
            pause: Duration::from_micros(250),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self
    }

    /// Checks that the settings are usable.
    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(Error::Config("at least one iteration is required".into()));
        }
        if self.connect_timeout.is_zero() || self.read_timeout.is_zero() {
            return Err(Error::Config("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}
