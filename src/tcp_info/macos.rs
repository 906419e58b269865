use super::TelemetrySnapshot;
use crate::{Error, Result};
use socket2::SockRef;
use std::mem::size_of;
use std::os::fd::AsRawFd;

const TCP_CONNECTION_INFO: libc::c_int = 0x106;

/// `struct tcp_connection_info` from xnu `netinet/tcp.h`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct TcpConnectionInfo {
    tcpi_state: u8,
    tcpi_snd_wscale: u8,
    tcpi_rcv_wscale: u8,
    __pad1: u8,
    tcpi_options: u32,
    tcpi_flags: u32,
    tcpi_rto: u32,
    tcpi_maxseg: u32,
    tcpi_snd_ssthresh: u32,
    tcpi_snd_cwnd: u32,
    tcpi_snd_wnd: u32,
    tcpi_snd_sbbytes: u32,
    tcpi_rcv_wnd: u32,
    tcpi_rttcur: u32,
    tcpi_srtt: u32,
    tcpi_rttvar: u32,
    // TFO bitfield word
    tcpi_tfo_flags: u32,
    tcpi_txpackets: u64,
    tcpi_txbytes: u64,
    tcpi_txretransmitbytes: u64,
    tcpi_rxpackets: u64,
    tcpi_rxbytes: u64,
    tcpi_rxoutoforderbytes: u64,
    tcpi_txretransmitpackets: u64,
}

fn ms_to_us(ms: u32) -> u32 {
    ms.saturating_mul(1000)
}

impl TcpConnectionInfo {
    fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            state: self.tcpi_state,
            total_retrans: Some(self.tcpi_txretransmitpackets),
            rtt_us: Some(ms_to_us(self.tcpi_srtt)),
            rtt_var_us: Some(ms_to_us(self.tcpi_rttvar)),
            rto_us: Some(ms_to_us(self.tcpi_rto)),
            mss: Some(self.tcpi_maxseg),
            cwnd: Some(self.tcpi_snd_cwnd),
            ssthresh: Some(self.tcpi_snd_ssthresh),
            snd_wnd: Some(self.tcpi_snd_wnd),
            rcv_wnd: Some(self.tcpi_rcv_wnd),
            bytes_in_flight: Some(self.tcpi_snd_sbbytes),
            bytes_sent: Some(self.tcpi_txbytes),
            bytes_received: Some(self.tcpi_rxbytes),
            bytes_retrans: Some(self.tcpi_txretransmitbytes),
            bytes_reordered: Some(self.tcpi_rxoutoforderbytes),
            segs_out: Some(self.tcpi_txpackets),
            segs_in: Some(self.tcpi_rxpackets),
            ..Default::default()
        }
    }
}

pub(super) fn capture(sock: SockRef<'_>) -> Result<TelemetrySnapshot> {
    let mut info = TcpConnectionInfo::default();
    let mut len = size_of::<TcpConnectionInfo>() as libc::socklen_t;

    let ret = unsafe {
        libc::getsockopt(
            sock.as_raw_fd(),
            libc::IPPROTO_TCP,
            TCP_CONNECTION_INFO,
            &mut info as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };

    if ret != 0 {
        return Err(Error::Telemetry(std::io::Error::last_os_error()));
    }

    Ok(info.snapshot())
}
