//! Fixed-size telemetry footer appended to a streamed payload.
//!
//! The download endpoint declares `payload + FOOTER_SIZE` bytes up front and
//! then sends one undifferentiated stream: the payload (which never contains
//! the [`SENTINEL`] byte) followed by a footer frame:
//!
//! ```text
//! offset 0      : 0x00 (reserved, never '{')
//! offset 1..=N  : compact JSON object (absent when capture failed)
//! offset N+1..  : 0x00 padding up to FOOTER_SIZE
//! ```
//!
//! The receiver does not know where the payload ends. It keeps a sliding
//! window holding only the last `FOOTER_SIZE` bytes and, at end-of-stream,
//! takes the bytes between the first `{` and the next `0x00` as the JSON.
//!
//! This framing assumes the JSON never contains a raw zero byte (serde_json
//! always escapes control characters) and that the stream is at least
//! `FOOTER_SIZE` bytes long. A truncated stream can leave payload bytes in the
//! window, in which case a stray `{` may be picked up and the parse fails.

use crate::{Error, Result};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

/// Size of the footer frame in bytes.
pub const FOOTER_SIZE: usize = 4096;

/// Framing delimiter; excluded from generated payloads.
pub const SENTINEL: u8 = 0;

/// First byte of a JSON object.
pub const JSON_START: u8 = b'{';

/// Builds a footer frame carrying `snapshot`.
///
/// The result is always exactly [`FOOTER_SIZE`] bytes. When there is no
/// snapshot, or it cannot be encoded into the frame, the frame is all zeros so
/// the previously declared content length still holds.
///
/// # Examples
///
/// ```
/// use tcpscope::footer::{encode_footer, FOOTER_SIZE};
///
/// let frame = encode_footer(Some(&serde_json::json!({"rttUs": 120})));
/// assert_eq!(frame.len(), FOOTER_SIZE);
/// assert_eq!(frame[0], 0);
/// assert_eq!(frame[1], b'{');
///
/// let empty = encode_footer::<serde_json::Value>(None);
/// assert!(empty.iter().all(|&b| b == 0));
/// ```
pub fn encode_footer<T: Serialize + ?Sized>(snapshot: Option<&T>) -> Vec<u8> {
    let mut frame = vec![SENTINEL; FOOTER_SIZE];

    let Some(snapshot) = snapshot else {
        return frame;
    };

    match serde_json::to_vec(snapshot) {
        // At least one trailing sentinel must remain to terminate the JSON.
        Ok(json) if json.len() <= FOOTER_SIZE - 2 => {
            frame[1..1 + json.len()].copy_from_slice(&json);
        }
        Ok(json) => {
            warn!(
                "Telemetry JSON is {} bytes, too large for a {} byte footer",
                json.len(),
                FOOTER_SIZE
            );
        }
        Err(e) => {
            warn!("Failed to encode telemetry footer: {}", e);
        }
    }

    frame
}

/// Incremental footer recovery over an arbitrarily chunked byte stream.
///
/// # Examples
///
/// ```
/// use tcpscope::footer::{encode_footer, FooterDecoder};
///
/// let mut stream = vec![7u8; 10_000];
/// stream.extend(encode_footer(Some(&serde_json::json!({"cwnd": 10}))));
///
/// let mut decoder = FooterDecoder::new();
/// for chunk in stream.chunks(1500) {
///     decoder.push(chunk);
/// }
///
/// let footer = decoder.finish();
/// assert_eq!(footer.total_bytes, 14_096);
/// let value: serde_json::Value = footer.decode().unwrap();
/// assert_eq!(value["cwnd"], 10);
/// ```
#[derive(Debug, Default)]
pub struct FooterDecoder {
    window: Vec<u8>,
    total_bytes: u64,
}

impl FooterDecoder {
    pub fn new() -> Self {
        Self {
            window: Vec::with_capacity(FOOTER_SIZE),
            total_bytes: 0,
        }
    }

    /// Feeds the next chunk of the stream.
    pub fn push(&mut self, chunk: &[u8]) {
        self.total_bytes += chunk.len() as u64;

        if chunk.len() >= FOOTER_SIZE {
            self.window.clear();
            self.window
                .extend_from_slice(&chunk[chunk.len() - FOOTER_SIZE..]);
            return;
        }

        let overflow = (self.window.len() + chunk.len()).saturating_sub(FOOTER_SIZE);
        self.window.drain(..overflow);
        self.window.extend_from_slice(chunk);
    }

    /// Ends the stream and locates the JSON candidate in the trailing window.
    pub fn finish(self) -> DecodedFooter {
        let json = locate_json(&self.window).map(<[u8]>::to_vec);
        if json.is_none() {
            debug!(
                "No telemetry footer found in the last {} bytes",
                self.window.len()
            );
        }

        DecodedFooter {
            total_bytes: self.total_bytes,
            json,
        }
    }
}

/// Returns the bytes between the first `{` and the following sentinel.
fn locate_json(window: &[u8]) -> Option<&[u8]> {
    let start = window.iter().position(|&b| b == JSON_START)?;
    let len = window[start..].iter().position(|&b| b == SENTINEL)?;
    Some(&window[start..start + len])
}

/// Outcome of a finished [`FooterDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFooter {
    /// Every byte observed, payload and footer included
    pub total_bytes: u64,
    /// Candidate JSON payload, if the framing was found
    pub json: Option<Vec<u8>>,
}

impl DecodedFooter {
    /// Parses the candidate JSON.
    ///
    /// Returns `None` when no footer was found or when it does not parse as
    /// `T`; parse failures are logged, never raised.
    pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
        let json = self.json.as_deref()?;
        match serde_json::from_slice(json) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Failed to parse telemetry footer: {}", e);
                None
            }
        }
    }
}

/// Reads `body` to its end and decodes the trailing footer.
///
/// Returns the total number of bytes read and the decoded footer, if any.
///
/// # Errors
///
/// Returns an error if the body fails before it is complete or no data
/// arrives for `read_timeout`.
pub async fn consume_body<B, T>(body: &mut B, read_timeout: Duration) -> Result<(u64, Option<T>)>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<Error>,
    T: DeserializeOwned,
{
    let mut decoder = FooterDecoder::new();

    loop {
        let frame = match tokio::time::timeout(read_timeout, body.frame()).await {
            Ok(Some(frame)) => frame.map_err(Into::into)?,
            Ok(None) => break,
            Err(_) => {
                return Err(Error::Client(format!(
                    "no response data for {:?}",
                    read_timeout
                )))
            }
        };

        if let Some(data) = frame.data_ref() {
            decoder.push(data);
        }
    }

    let footer = decoder.finish();
    let decoded = footer.decode();
    Ok((footer.total_bytes, decoded))
}
