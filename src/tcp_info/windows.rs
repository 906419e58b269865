use super::TelemetrySnapshot;
use crate::{Error, Result};
use socket2::SockRef;
use std::mem::size_of;
use std::os::windows::io::AsRawSocket;
use windows_sys::Win32::Networking::WinSock::{WSAIoctl, SOCKET, SOCKET_ERROR};

/// `_WSAIORW(IOC_VENDOR, 39)`
const SIO_TCP_INFO: u32 = 0xD800_0027;

/// `TCP_INFO_v0` from `mstcpip.h`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct TcpInfoV0 {
    state: i32,
    mss: u32,
    connection_time_ms: u64,
    timestamps_enabled: u8,
    rtt_us: u32,
    min_rtt_us: u32,
    bytes_in_flight: u32,
    cwnd: u32,
    snd_wnd: u32,
    rcv_wnd: u32,
    rcv_buf: u32,
    bytes_out: u64,
    bytes_in: u64,
    bytes_reordered: u32,
    bytes_retrans: u32,
    fast_retrans: u32,
    dup_acks_in: u32,
    timeout_episodes: u32,
    syn_retrans: u8,
}

impl TcpInfoV0 {
    fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            state: self.state as u8,
            fast_retrans: Some(self.fast_retrans),
            rtt_us: Some(self.rtt_us),
            min_rtt_us: Some(self.min_rtt_us),
            mss: Some(self.mss),
            cwnd: Some(self.cwnd),
            snd_wnd: Some(self.snd_wnd),
            rcv_wnd: Some(self.rcv_wnd),
            rcv_buf: Some(self.rcv_buf),
            bytes_in_flight: Some(self.bytes_in_flight),
            bytes_sent: Some(self.bytes_out),
            bytes_received: Some(self.bytes_in),
            bytes_retrans: Some(u64::from(self.bytes_retrans)),
            bytes_reordered: Some(u64::from(self.bytes_reordered)),
            dup_acks_in: Some(self.dup_acks_in),
            timeout_episodes: Some(self.timeout_episodes),
            syn_retrans: Some(self.syn_retrans),
            connection_time_ms: Some(self.connection_time_ms),
            ..Default::default()
        }
    }
}

pub(super) fn capture(sock: SockRef<'_>) -> Result<TelemetrySnapshot> {
    let version: u32 = 0;
    let mut info = TcpInfoV0::default();
    let mut returned: u32 = 0;

    let ret = unsafe {
        WSAIoctl(
            sock.as_raw_socket() as SOCKET,
            SIO_TCP_INFO,
            &version as *const u32 as *const _,
            size_of::<u32>() as u32,
            &mut info as *mut TcpInfoV0 as *mut _,
            size_of::<TcpInfoV0>() as u32,
            &mut returned,
            std::ptr::null_mut(),
            None,
        )
    };

    if ret == SOCKET_ERROR {
        return Err(Error::Telemetry(std::io::Error::last_os_error()));
    }

    Ok(info.snapshot())
}
