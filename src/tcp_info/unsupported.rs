use super::TelemetrySnapshot;
use crate::{Error, Result};
use socket2::SockRef;
use std::io;

pub(super) fn capture(_sock: SockRef<'_>) -> Result<TelemetrySnapshot> {
    Err(Error::Telemetry(io::Error::new(
        io::ErrorKind::Unsupported,
        "TCP statistics are not available on this platform",
    )))
}
