//! Per-tick sample sources.
//!
//! A [`SampleSource`] yields one [`RawSample`] per configured channel every tick. Two
//! variants exist, selected once per cycle:
//!
//! - [`LiveSource`] polls the controllers through the shared field-bus transport.
//! - [`DemoSource`] replays a pre-loaded [`DemoSequence`] one row per tick, for
//!   exercising the workflow without hardware.
//!
//! Sources never fail. A channel that cannot be read this tick is reported as
//! [`RawSample::Failed`] and surfaces as [`FAILED_READING`] after scaling.

use crate::config::ChannelConfig;
use crate::error::{AppResult, DaqError};
use crate::transport::{SharedTransport, TransportLease};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Engineering value reported for channels that are not polled.
///
/// Indistinguishable from a genuine zero reading; consumers must consult the channel
/// configuration rather than the value to know whether a channel is active.
pub const INACTIVE_READING: f64 = 0.0;

/// Engineering value reported for a channel whose read failed this tick.
pub const FAILED_READING: f64 = -1000.0;

/// One channel's reading for one tick, before scaling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawSample {
    /// Channel is not polled.
    Inactive,
    /// The read failed; the channel carries the failure sentinel this tick.
    Failed,
    /// Register words read from the controller.
    Register {
        /// Process value register
        process: u16,
        /// Setpoint register
        setpoint: u16,
    },
    /// Engineering value replayed from a recording; not scaled again.
    Recorded(f64),
}

impl RawSample {
    /// Whether this reading carries the failure sentinel.
    pub fn is_failed(&self) -> bool {
        matches!(self, RawSample::Failed)
    }
}

/// Producer of one raw reading per channel per tick.
pub trait SampleSource: Send {
    /// Readings for every configured channel, in channel order.
    ///
    /// Returns `None` once the source is exhausted; live sources never are.
    fn next_raw_sample(&mut self, channels: &[ChannelConfig]) -> Option<Vec<RawSample>>;

    /// Source name for logs.
    fn name(&self) -> &'static str;

    /// Release whatever the source holds. Called once when its loop exits.
    fn close(&mut self) {}
}

/// Source polling the controllers over the field bus.
///
/// Each active channel costs two transactions per tick: the process register, then the
/// setpoint register. The transport lock is taken per transaction, never per tick.
pub struct LiveSource {
    lease: Option<TransportLease>,
}

impl LiveSource {
    /// Create a source that reads through a lease on the link.
    pub fn new(lease: TransportLease) -> Self {
        Self { lease: Some(lease) }
    }

    fn read_channel(
        transport: &SharedTransport,
        number: usize,
        channel: &ChannelConfig,
    ) -> RawSample {
        let device = channel.device_address;
        let result = transport
            .read_register(device, channel.process_register)
            .and_then(|process| {
                transport
                    .read_register(device, channel.setpoint_register)
                    .map(|setpoint| RawSample::Register { process, setpoint })
            });

        match result {
            Ok(sample) => sample,
            Err(err) => {
                warn!(
                    channel = number,
                    label = %channel.label,
                    device,
                    error = %err,
                    "Failed to read channel, substituting sentinel"
                );
                match transport.reconnect() {
                    Ok(()) => info!(channel = number, "Link reconnected"),
                    Err(err) => error!(channel = number, error = %err, "Reconnect failed"),
                }
                RawSample::Failed
            }
        }
    }
}

impl SampleSource for LiveSource {
    fn next_raw_sample(&mut self, channels: &[ChannelConfig]) -> Option<Vec<RawSample>> {
        let Some(lease) = self.lease.as_ref() else {
            return Some(
                channels
                    .iter()
                    .map(|ch| if ch.active { RawSample::Failed } else { RawSample::Inactive })
                    .collect(),
            );
        };
        let transport = lease.transport();
        let samples = channels
            .iter()
            .enumerate()
            .map(|(i, channel)| {
                if channel.active {
                    Self::read_channel(transport, i + 1, channel)
                } else {
                    RawSample::Inactive
                }
            })
            .collect();
        Some(samples)
    }

    fn name(&self) -> &'static str {
        "live"
    }

    fn close(&mut self) {
        if let Some(lease) = self.lease.take() {
            lease.release();
        }
    }
}

/// Pre-recorded rows of engineering values, one column per channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DemoSequence {
    rows: Vec<Vec<f64>>,
}

impl DemoSequence {
    /// Wrap rows already in memory.
    pub fn new(rows: Vec<Vec<f64>>) -> Self {
        Self { rows }
    }

    /// Load a headerless CSV file.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .from_path(path.as_ref())?;
        Self::from_csv_reader(reader)
    }

    /// Parse a headerless CSV stream.
    pub fn from_reader<R: Read>(input: R) -> AppResult<Self> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .from_reader(input);
        Self::from_csv_reader(reader)
    }

    fn from_csv_reader<R: Read>(mut reader: csv::Reader<R>) -> AppResult<Self> {
        let mut rows = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let row = record
                .iter()
                .map(|field| {
                    field.parse::<f64>().map_err(|_| {
                        DaqError::Demo(format!("line {}: '{field}' is not a number", line + 1))
                    })
                })
                .collect::<AppResult<Vec<f64>>>()?;
            rows.push(row);
        }
        Ok(Self { rows })
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the sequence has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Narrowest row width.
    pub fn width(&self) -> usize {
        self.rows.iter().map(Vec::len).min().unwrap_or(0)
    }

    /// Row at `index`.
    pub fn row(&self, index: usize) -> Option<&[f64]> {
        self.rows.get(index).map(Vec::as_slice)
    }
}

/// Source replaying a [`DemoSequence`].
pub struct DemoSource {
    sequence: Arc<DemoSequence>,
    cursor: usize,
}

impl DemoSource {
    /// Replay `sequence` from its first row.
    pub fn new(sequence: Arc<DemoSequence>) -> Self {
        Self {
            sequence,
            cursor: 0,
        }
    }

    /// Rows not replayed yet.
    pub fn remaining(&self) -> usize {
        self.sequence.len().saturating_sub(self.cursor)
    }
}

impl SampleSource for DemoSource {
    fn next_raw_sample(&mut self, channels: &[ChannelConfig]) -> Option<Vec<RawSample>> {
        let row = self.sequence.row(self.cursor)?;
        self.cursor += 1;
        let samples = channels
            .iter()
            .enumerate()
            .map(|(i, channel)| match (channel.active, row.get(i)) {
                (true, Some(value)) => RawSample::Recorded(*value),
                (true, None) => RawSample::Failed,
                (false, _) => RawSample::Inactive,
            })
            .collect();
        Some(samples)
    }

    fn name(&self) -> &'static str {
        "demo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use tracing_test::traced_test;

    fn channels() -> Vec<ChannelConfig> {
        vec![
            ChannelConfig::new("Core", 1, 0x1000).activated(),
            ChannelConfig::new("Spare", 2, 0x1000),
            ChannelConfig::new("Pressure", 3, 0x1000).activated(),
        ]
    }

    #[test]
    fn live_source_reads_process_and_setpoint() {
        let mock = MockTransport::new()
            .with_register(1, 0x1000, 1234)
            .with_register(1, 0x0500, 1200)
            .with_register(3, 0x1000, 55);
        let shared = SharedTransport::new(Box::new(mock.clone()));
        shared.open().unwrap();

        let mut source = LiveSource::new(shared.lease().unwrap());
        let samples = source.next_raw_sample(&channels()).unwrap();
        assert_eq!(
            samples,
            vec![
                RawSample::Register {
                    process: 1234,
                    setpoint: 1200
                },
                RawSample::Inactive,
                RawSample::Register {
                    process: 55,
                    setpoint: 0
                },
            ]
        );
        assert_eq!(mock.counters().reads, 4);
    }

    #[test]
    #[traced_test]
    fn failed_read_substitutes_sentinel_and_reconnects() {
        let mock = MockTransport::new().with_register(1, 0x1000, 10);
        mock.fail_reads(3, 0x1000);
        let shared = SharedTransport::new(Box::new(mock.clone()));
        shared.open().unwrap();

        let mut source = LiveSource::new(shared.lease().unwrap());
        let samples = source.next_raw_sample(&channels()).unwrap();
        assert!(!samples[0].is_failed());
        assert!(samples[2].is_failed());
        assert_eq!(mock.counters().reconnects, 1);
        assert!(logs_contain("Failed to read channel"));
    }

    #[test]
    fn failed_setpoint_read_also_fails_channel() {
        let mock = MockTransport::new();
        mock.fail_reads(1, 0x0500);
        let shared = SharedTransport::new(Box::new(mock.clone()));
        shared.open().unwrap();

        let mut source = LiveSource::new(shared.lease().unwrap());
        let samples = source.next_raw_sample(&channels()).unwrap();
        assert_eq!(samples[0], RawSample::Failed);
        assert_eq!(samples[2], RawSample::Register { process: 0, setpoint: 0 });
    }

    #[test]
    fn closing_live_source_releases_link() {
        let mock = MockTransport::new();
        let shared = SharedTransport::new(Box::new(mock.clone()));
        shared.open().unwrap();

        let mut source = LiveSource::new(shared.lease().unwrap());
        source.close();
        assert!(!shared.is_open());
        let samples = source.next_raw_sample(&channels()).unwrap();
        assert_eq!(
            samples,
            vec![RawSample::Failed, RawSample::Inactive, RawSample::Failed]
        );
    }

    #[test]
    fn demo_source_replays_then_exhausts() {
        let sequence = Arc::new(DemoSequence::new(vec![
            vec![20.0, 1.0, 100.0],
            vec![21.5, 1.0, 101.0],
        ]));
        let mut source = DemoSource::new(sequence);
        let first = source.next_raw_sample(&channels()).unwrap();
        assert_eq!(
            first,
            vec![
                RawSample::Recorded(20.0),
                RawSample::Inactive,
                RawSample::Recorded(100.0)
            ]
        );
        assert_eq!(source.remaining(), 1);
        assert!(source.next_raw_sample(&channels()).is_some());
        assert!(source.next_raw_sample(&channels()).is_none());
    }

    #[test]
    fn parses_csv_sequence() {
        let csv = "20.0, 0, 100\n21.5, 0, 98.25\n";
        let sequence = DemoSequence::from_reader(csv.as_bytes()).unwrap();
        assert_eq!(sequence.len(), 2);
        assert_eq!(sequence.width(), 3);
        assert_eq!(sequence.row(1), Some(&[21.5, 0.0, 98.25][..]));
    }

    #[test]
    fn rejects_non_numeric_csv() {
        let err = DemoSequence::from_reader("1.0,abc\n".as_bytes()).unwrap_err();
        assert!(matches!(err, DaqError::Demo(_)));
    }
}
