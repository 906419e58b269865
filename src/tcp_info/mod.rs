//! Kernel TCP connection statistics.
//!
//! Every supported platform exposes a different structure for per-connection
//! TCP state (`TCP_INFO` on Linux, `TCP_CONNECTION_INFO` on macOS,
//! `SIO_TCP_INFO` on Windows). This module reads whichever one the target
//! provides and folds it into a single [`TelemetrySnapshot`].
//!
//! # Examples
//!
//! ```no_run
//! use tcpscope::tcp_info::TelemetryAccessor;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:3000").await?;
//! let snapshot = stream.tcp_telemetry()?;
//! println!("RTT: {:?} us", snapshot.rtt_us);
//! # Ok(())
//! # }
//! ```

use crate::Result;
use serde::{Deserialize, Serialize};
use socket2::SockRef;
use std::fmt;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
use linux as sys;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
use macos as sys;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use self::windows as sys;

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
mod unsupported;
#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
use unsupported as sys;

/// One capture of kernel statistics for a single TCP connection.
///
/// `state` is always present. Every other metric is optional because the
/// kernels disagree on what they report; absent metrics are left out of the
/// JSON encoding. Units follow the field names. `cwnd` is in segments on
/// Linux and in bytes on macOS and Windows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    /// Connection state as numbered by the reporting kernel
    pub state: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_state: Option<u8>,
    /// Unanswered zero window probes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probes: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<u8>,
    /// Negotiated TCP option bits (timestamps, SACK, window scaling)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<u8>,
    /// Consecutive unrecovered retransmission timeouts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retransmits: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_retrans: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fast_retrans: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtt_us: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtt_var_us: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_rtt_us: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rto_us: Option<u32>,
    /// Delayed ACK timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ato_us: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mss: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rcv_mss: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advmss: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmtu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwnd: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssthresh: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rcv_ssthresh: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snd_wnd: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rcv_wnd: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rcv_buf: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rcv_space: Option<u32>,
    /// Receiver-side RTT estimate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rcv_rtt_us: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unacked: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lost: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sacked: Option<u32>,
    /// Segments currently marked for retransmission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrans: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fackets: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reordering: Option<u32>,
    /// Bytes written by the application but not yet sent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notsent_bytes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_in_flight: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_sent: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_received: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_acked: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_retrans: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_reordered: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reord_seen: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsack_dups: Option<u32>,
    /// Out-of-order packets received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rcv_ooopack: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dup_acks_in: Option<u32>,
    /// Retransmission timeout episodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_episodes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_rto_recoveries: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_rto_time_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rehash: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syn_retrans: Option<u8>,
    /// Bytes per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pacing_rate: Option<u64>,
    /// Bytes per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pacing_rate: Option<u64>,
    /// Bytes per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_rate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segs_out: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segs_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_segs_out: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_segs_in: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered: Option<u32>,
    /// Deliveries carrying an ECN CE mark
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_ce: Option<u32>,
    /// Time spent with unacknowledged data in flight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub busy_time_us: Option<u64>,
    /// Time the sender was stalled by the peer's receive window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rwnd_limited_us: Option<u64>,
    /// Time the sender was stalled by its own send buffer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sndbuf_limited_us: Option<u64>,
    /// Time since the last data segment was sent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_data_sent_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ack_sent_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_data_recv_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ack_recv_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_time_ms: Option<u64>,
}

impl fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn line<T: fmt::Display>(
            f: &mut fmt::Formatter<'_>,
            label: &str,
            value: Option<T>,
            unit: &str,
        ) -> fmt::Result {
            match value {
                Some(v) => writeln!(f, "\t{}: {}{}", label, v, unit),
                None => Ok(()),
            }
        }

        writeln!(f, "\tState: {}", self.state)?;
        line(f, "CA State", self.ca_state, "")?;
        line(f, "MSS", self.mss, "")?;
        line(f, "Connection Time", self.connection_time_ms, " ms")?;
        line(f, "RTT", self.rtt_us, " us")?;
        line(f, "RTT Var", self.rtt_var_us, " us")?;
        line(f, "Min RTT", self.min_rtt_us, " us")?;
        line(f, "RTO", self.rto_us, " us")?;
        line(f, "Bytes In Flight", self.bytes_in_flight, "")?;
        line(f, "Congestion Window (cwnd)", self.cwnd, "")?;
        line(f, "Slow Start Threshold", self.ssthresh, "")?;
        line(f, "Send Window (sndwnd)", self.snd_wnd, "")?;
        line(f, "Receive Window (rcvwnd)", self.rcv_wnd, "")?;
        line(f, "Receive Buffer (rcvbuf)", self.rcv_buf, "")?;
        line(f, "Unacked Segments", self.unacked, "")?;
        line(f, "Lost Segments", self.lost, "")?;
        line(f, "Bytes Sent", self.bytes_sent, "")?;
        line(f, "Bytes Received", self.bytes_received, "")?;
        line(f, "Bytes Acked", self.bytes_acked, "")?;
        line(f, "Bytes Reordered", self.bytes_reordered, "")?;
        line(f, "Bytes Retransmitted", self.bytes_retrans, "")?;
        line(f, "Retransmits", self.retransmits, "")?;
        line(f, "Total Retransmits", self.total_retrans, "")?;
        line(f, "Fast Retransmits", self.fast_retrans, "")?;
        line(f, "Reordering Events", self.reord_seen, "")?;
        line(f, "DSACK Duplicates", self.dsack_dups, "")?;
        line(f, "Duplicate ACKs In", self.dup_acks_in, "")?;
        line(f, "Timeout Episodes", self.timeout_episodes, "")?;
        line(f, "SYN Retransmits", self.syn_retrans, "")?;
        line(f, "Pacing Rate", self.pacing_rate, " B/s")?;
        line(f, "Delivery Rate", self.delivery_rate, " B/s")?;
        line(f, "Segments Out", self.segs_out, "")?;
        line(f, "Segments In", self.segs_in, "")?;
        line(f, "Probes", self.probes, "")?;
        line(f, "Backoff", self.backoff, "")?;
        line(f, "Options", self.options, "")?;
        line(f, "ATO", self.ato_us, " us")?;
        line(f, "Receive MSS", self.rcv_mss, "")?;
        line(f, "Advertised MSS", self.advmss, "")?;
        line(f, "Path MTU", self.pmtu, "")?;
        line(f, "Receive Slow Start Threshold", self.rcv_ssthresh, "")?;
        line(f, "Receive Space", self.rcv_space, "")?;
        line(f, "Receive RTT", self.rcv_rtt_us, " us")?;
        line(f, "SACKed Segments", self.sacked, "")?;
        line(f, "Retransmitting Segments", self.retrans, "")?;
        line(f, "FACKed Segments", self.fackets, "")?;
        line(f, "Reordering Metric", self.reordering, "")?;
        line(f, "Not Sent Bytes", self.notsent_bytes, "")?;
        line(f, "Out-of-order Packets In", self.rcv_ooopack, "")?;
        line(f, "RTO Recoveries", self.total_rto_recoveries, "")?;
        line(f, "RTO Time", self.total_rto_time_ms, " ms")?;
        line(f, "Rehash", self.rehash, "")?;
        line(f, "Max Pacing Rate", self.max_pacing_rate, " B/s")?;
        line(f, "Data Segments Out", self.data_segs_out, "")?;
        line(f, "Data Segments In", self.data_segs_in, "")?;
        line(f, "Delivered", self.delivered, "")?;
        line(f, "Delivered CE", self.delivered_ce, "")?;
        line(f, "Busy Time", self.busy_time_us, " us")?;
        line(f, "Receive Window Limited", self.rwnd_limited_us, " us")?;
        line(f, "Send Buffer Limited", self.sndbuf_limited_us, " us")?;
        line(f, "Last Data Sent", self.last_data_sent_ms, " ms ago")?;
        line(f, "Last ACK Sent", self.last_ack_sent_ms, " ms ago")?;
        line(f, "Last Data Received", self.last_data_recv_ms, " ms ago")?;
        line(f, "Last ACK Received", self.last_ack_recv_ms, " ms ago")
    }
}

/// Capability to read kernel TCP statistics for a connection.
///
/// Exactly one platform backend is compiled into the crate; callers only see
/// this trait.
pub trait TelemetryAccessor {
    /// Captures the current kernel statistics of the connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Telemetry`](crate::Error::Telemetry) when the socket
    /// query fails or the platform has no TCP statistics interface.
    fn tcp_telemetry(&self) -> Result<TelemetrySnapshot>;
}

impl TelemetryAccessor for socket2::Socket {
    fn tcp_telemetry(&self) -> Result<TelemetrySnapshot> {
        sys::capture(SockRef::from(self))
    }
}

impl TelemetryAccessor for tokio::net::TcpStream {
    fn tcp_telemetry(&self) -> Result<TelemetrySnapshot> {
        sys::capture(SockRef::from(self))
    }
}

impl TelemetryAccessor for std::net::TcpStream {
    fn tcp_telemetry(&self) -> Result<TelemetrySnapshot> {
        sys::capture(SockRef::from(self))
    }
}
