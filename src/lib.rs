//! tcpscope - HTTP throughput tester with kernel TCP telemetry
//!
//! This library measures achieved TCP throughput between a client and a
//! server over plain HTTP/1.1 (optionally wrapped in TLS) and captures the
//! kernel's TCP statistics for the same connection on both ends.
//!
//! # Features
//!
//! - Download endpoint streaming incompressible payload with a flush per chunk
//! - Server-side TCP statistics embedded in a fixed-size footer at the end of
//!   the download, recovered by the client without knowing where it starts
//! - Upload endpoint answering with the server's statistics as JSON
//! - Uniform TCP statistics on Linux, macOS and Windows
//! - Optional TLS listener with self-signed certificate generation
//! - Optional HTTP/3 endpoint over QUIC serving the same routes

pub mod buffer_pool;
pub mod client;
pub mod config;
pub mod error;
pub mod footer;
pub mod handlers;
pub mod http;
pub mod interceptor;
pub mod measurements;
pub mod payload;
pub mod quic;
pub mod server;
pub mod tcp_info;
pub mod tls;

pub use client::{Client, MeasuredStream, ProgressCallback, ProgressEvent};
pub use config::{ClientConfig, ServerConfig};
pub use error::{Error, Result};
pub use measurements::{IterationReport, MeasurementSummary};
pub use server::Server;
pub use tcp_info::{TelemetryAccessor, TelemetrySnapshot};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
