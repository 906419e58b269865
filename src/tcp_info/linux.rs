use super::TelemetrySnapshot;
use crate::{Error, Result};
use socket2::SockRef;
use std::mem::{offset_of, size_of, size_of_val};
use std::os::fd::AsRawFd;

/// `struct tcp_info` from `include/uapi/linux/tcp.h`.
///
/// Older kernels return a prefix of this layout; the length written by
/// `getsockopt` decides which of the trailing fields are valid.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct KernelTcpInfo {
    tcpi_state: u8,
    tcpi_ca_state: u8,
    tcpi_retransmits: u8,
    tcpi_probes: u8,
    tcpi_backoff: u8,
    tcpi_options: u8,
    tcpi_snd_rcv_wscale: u8,
    tcpi_rate_flags: u8,

    tcpi_rto: u32,
    tcpi_ato: u32,
    tcpi_snd_mss: u32,
    tcpi_rcv_mss: u32,

    tcpi_unacked: u32,
    tcpi_sacked: u32,
    tcpi_lost: u32,
    tcpi_retrans: u32,
    tcpi_fackets: u32,

    tcpi_last_data_sent: u32,
    tcpi_last_ack_sent: u32,
    tcpi_last_data_recv: u32,
    tcpi_last_ack_recv: u32,

    tcpi_pmtu: u32,
    tcpi_rcv_ssthresh: u32,
    tcpi_rtt: u32,
    tcpi_rttvar: u32,
    tcpi_snd_ssthresh: u32,
    tcpi_snd_cwnd: u32,
    tcpi_advmss: u32,
    tcpi_reordering: u32,

    tcpi_rcv_rtt: u32,
    tcpi_rcv_space: u32,

    tcpi_total_retrans: u32,

    tcpi_pacing_rate: u64,
    tcpi_max_pacing_rate: u64,
    tcpi_bytes_acked: u64,
    tcpi_bytes_received: u64,
    tcpi_segs_out: u32,
    tcpi_segs_in: u32,

    tcpi_notsent_bytes: u32,
    tcpi_min_rtt: u32,
    tcpi_data_segs_in: u32,
    tcpi_data_segs_out: u32,

    tcpi_delivery_rate: u64,

    tcpi_busy_time: u64,
    tcpi_rwnd_limited: u64,
    tcpi_sndbuf_limited: u64,

    tcpi_delivered: u32,
    tcpi_delivered_ce: u32,

    tcpi_bytes_sent: u64,
    tcpi_bytes_retrans: u64,
    tcpi_dsack_dups: u32,
    tcpi_reord_seen: u32,

    tcpi_rcv_ooopack: u32,

    tcpi_snd_wnd: u32,
    tcpi_rcv_wnd: u32,

    tcpi_rehash: u32,

    tcpi_total_rto: u16,
    tcpi_total_rto_recoveries: u16,
    tcpi_total_rto_time: u32,
}

/// Reads a field only if the kernel filled it in.
macro_rules! reported {
    ($info:expr, $len:expr, $field:ident) => {
        if $len >= offset_of!(KernelTcpInfo, $field) + size_of_val(&$info.$field) {
            Some($info.$field)
        } else {
            None
        }
    };
}

impl KernelTcpInfo {
    fn snapshot(&self, len: usize) -> TelemetrySnapshot {
        TelemetrySnapshot {
            state: self.tcpi_state,
            ca_state: Some(self.tcpi_ca_state),
            retransmits: Some(u32::from(self.tcpi_retransmits)),
            total_retrans: Some(u64::from(self.tcpi_total_retrans)),
            fast_retrans: None,
            rtt_us: Some(self.tcpi_rtt),
            rtt_var_us: Some(self.tcpi_rttvar),
            min_rtt_us: reported!(self, len, tcpi_min_rtt),
            rto_us: Some(self.tcpi_rto),
            mss: Some(self.tcpi_snd_mss),
            cwnd: Some(self.tcpi_snd_cwnd),
            ssthresh: Some(self.tcpi_snd_ssthresh),
            snd_wnd: reported!(self, len, tcpi_snd_wnd),
            rcv_wnd: reported!(self, len, tcpi_rcv_wnd),
            rcv_buf: None,
            unacked: Some(self.tcpi_unacked),
            lost: Some(self.tcpi_lost),
            bytes_in_flight: None,
            bytes_sent: reported!(self, len, tcpi_bytes_sent),
            bytes_received: reported!(self, len, tcpi_bytes_received),
            bytes_acked: reported!(self, len, tcpi_bytes_acked),
            bytes_retrans: reported!(self, len, tcpi_bytes_retrans),
            bytes_reordered: None,
            reord_seen: reported!(self, len, tcpi_reord_seen),
            dsack_dups: reported!(self, len, tcpi_dsack_dups),
            dup_acks_in: None,
            timeout_episodes: reported!(self, len, tcpi_total_rto).map(u32::from),
            syn_retrans: None,
            pacing_rate: reported!(self, len, tcpi_pacing_rate),
            delivery_rate: reported!(self, len, tcpi_delivery_rate),
            segs_out: reported!(self, len, tcpi_segs_out).map(u64::from),
            segs_in: reported!(self, len, tcpi_segs_in).map(u64::from),
            connection_time_ms: None,
            probes: Some(self.tcpi_probes),
            backoff: Some(self.tcpi_backoff),
            options: Some(self.tcpi_options),
            ato_us: Some(self.tcpi_ato),
            rcv_mss: Some(self.tcpi_rcv_mss),
            advmss: Some(self.tcpi_advmss),
            pmtu: Some(self.tcpi_pmtu),
            rcv_ssthresh: Some(self.tcpi_rcv_ssthresh),
            rcv_space: Some(self.tcpi_rcv_space),
            rcv_rtt_us: Some(self.tcpi_rcv_rtt),
            sacked: Some(self.tcpi_sacked),
            retrans: Some(self.tcpi_retrans),
            fackets: Some(self.tcpi_fackets),
            reordering: Some(self.tcpi_reordering),
            last_data_sent_ms: Some(self.tcpi_last_data_sent),
            last_ack_sent_ms: Some(self.tcpi_last_ack_sent),
            last_data_recv_ms: Some(self.tcpi_last_data_recv),
            last_ack_recv_ms: Some(self.tcpi_last_ack_recv),
            notsent_bytes: reported!(self, len, tcpi_notsent_bytes),
            rcv_ooopack: reported!(self, len, tcpi_rcv_ooopack),
            total_rto_recoveries: reported!(self, len, tcpi_total_rto_recoveries),
            total_rto_time_ms: reported!(self, len, tcpi_total_rto_time),
            rehash: reported!(self, len, tcpi_rehash),
            max_pacing_rate: reported!(self, len, tcpi_max_pacing_rate),
            data_segs_out: reported!(self, len, tcpi_data_segs_out),
            data_segs_in: reported!(self, len, tcpi_data_segs_in),
            delivered: reported!(self, len, tcpi_delivered),
            delivered_ce: reported!(self, len, tcpi_delivered_ce),
            busy_time_us: reported!(self, len, tcpi_busy_time),
            rwnd_limited_us: reported!(self, len, tcpi_rwnd_limited),
            sndbuf_limited_us: reported!(self, len, tcpi_sndbuf_limited),
        }
    }
}

pub(super) fn capture(sock: SockRef<'_>) -> Result<TelemetrySnapshot> {
    let mut info = KernelTcpInfo::default();
    let mut len = size_of::<KernelTcpInfo>() as libc::socklen_t;

    let ret = unsafe {
        libc::getsockopt(
            sock.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            &mut info as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };

    if ret != 0 {
        return Err(Error::Telemetry(std::io::Error::last_os_error()));
    }

    Ok(info.snapshot(len as usize))
}
