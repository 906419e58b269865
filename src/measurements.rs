use crate::tcp_info::TelemetrySnapshot;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Bits per second for `bytes` moved in `elapsed`; zero for a zero duration.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tcpscope::measurements::throughput_bps;
///
/// assert_eq!(throughput_bps(1_000_000, Duration::from_secs(2)), 4_000_000.0);
/// assert_eq!(throughput_bps(1_000_000, Duration::ZERO), 0.0);
/// ```
pub fn throughput_bps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        0.0
    } else {
        bytes as f64 * 8.0 / secs
    }
}

/// Outcome of one download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationReport {
    /// 1-based position in the run
    pub iteration: usize,
    /// Body bytes received, footer included
    pub bytes: u64,
    /// From dispatching the request to consuming the last body byte
    pub duration: Duration,
    pub bits_per_second: f64,
    /// Telemetry the server embedded in the footer
    pub server: Option<TelemetrySnapshot>,
    /// Telemetry of the client socket captured at close
    pub client: Option<TelemetrySnapshot>,
}

/// All iterations of a run and their mean throughput.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementSummary {
    pub iterations: Vec<IterationReport>,
    pub mean_bits_per_second: f64,
}

impl MeasurementSummary {
    pub fn from_reports(iterations: Vec<IterationReport>) -> Self {
        let mean_bits_per_second = if iterations.is_empty() {
            0.0
        } else {
            iterations.iter().map(|r| r.bits_per_second).sum::<f64>() / iterations.len() as f64
        };

        Self {
            iterations,
            mean_bits_per_second,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.iterations.iter().map(|r| r.bytes).sum()
    }
}

/// Thread-safe store of completed iterations.
#[derive(Debug, Clone, Default)]
pub struct MeasurementsCollector {
    inner: Arc<Mutex<Vec<IterationReport>>>,
}

impl MeasurementsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, report: IterationReport) {
        self.inner.lock().push(report);
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Snapshot of everything recorded so far.
    pub fn get(&self) -> MeasurementSummary {
        MeasurementSummary::from_reports(self.inner.lock().clone())
    }
}
