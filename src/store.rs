//! Append-only time-series store for one curing cycle.
//!
//! The store is column oriented: one column of elapsed minutes, one of wall-clock
//! timestamps, one scaled column per channel and one raw column per channel (the
//! register words as read, setpoint included). All columns always have the same
//! length, which is the number of rows recorded so far.
//!
//! There is exactly one writer, the recording loop. [`TimeSeriesStore::new`] hands out
//! a non-cloneable [`StoreWriter`] and a cloneable [`StoreReader`]; consumers hold
//! readers and never observe a partially appended row, because a row is committed
//! under a single write lock.
//!
//! # Example
//!
//! ```rust
//! use autoclave_daq::source::RawSample;
//! use autoclave_daq::store::TimeSeriesStore;
//! use chrono::Local;
//!
//! let (mut writer, reader) = TimeSeriesStore::new(2);
//! let raw = [RawSample::Recorded(20.0), RawSample::Recorded(1.0)];
//! writer.append(0.0, Local::now(), &[20.0, 1.0], &raw).unwrap();
//! assert_eq!(reader.len(), 1);
//! assert_eq!(reader.channel(1), Some(vec![1.0]));
//! ```

use crate::error::{AppResult, DaqError};
use crate::source::RawSample;
use chrono::{DateTime, Local};
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Columns {
    elapsed_minutes: Vec<f64>,
    timestamps: Vec<DateTime<Local>>,
    channels: Vec<Vec<f64>>,
    raw: Vec<Vec<RawSample>>,
}

impl Columns {
    fn len(&self) -> usize {
        self.elapsed_minutes.len()
    }

    fn row(&self, index: usize) -> Option<TimeSeriesRow> {
        let elapsed_minutes = *self.elapsed_minutes.get(index)?;
        let timestamp = *self.timestamps.get(index)?;
        let values = self
            .channels
            .iter()
            .map(|column| column.get(index).copied())
            .collect::<Option<Vec<f64>>>()?;
        Some(TimeSeriesRow {
            index,
            elapsed_minutes,
            timestamp,
            values,
        })
    }
}

/// One recorded row.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesRow {
    /// Zero-based row index
    pub index: usize,
    /// Cycle time in minutes, rounded to two decimals
    pub elapsed_minutes: f64,
    /// Wall-clock time of the tick
    pub timestamp: DateTime<Local>,
    /// Scaled value of every channel, in channel order
    pub values: Vec<f64>,
}

impl TimeSeriesRow {
    /// Value of one channel (zero-based).
    pub fn value(&self, channel: usize) -> Option<f64> {
        self.values.get(channel).copied()
    }
}

/// Constructor namespace for the writer/reader pair.
pub struct TimeSeriesStore;

impl TimeSeriesStore {
    /// Create an empty store for `channel_count` channels.
    pub fn new(channel_count: usize) -> (StoreWriter, StoreReader) {
        let columns = Arc::new(RwLock::new(Columns {
            elapsed_minutes: Vec::new(),
            timestamps: Vec::new(),
            channels: vec![Vec::new(); channel_count],
            raw: vec![Vec::new(); channel_count],
        }));
        (
            StoreWriter {
                columns: Arc::clone(&columns),
                channel_count,
            },
            StoreReader {
                columns,
                channel_count,
            },
        )
    }
}

/// The single appending handle.
#[derive(Debug)]
pub struct StoreWriter {
    columns: Arc<RwLock<Columns>>,
    channel_count: usize,
}

impl StoreWriter {
    /// Append one row and return its index.
    ///
    /// Fails without touching the store when `values` or `raw` does not carry exactly
    /// one entry per channel.
    pub fn append(
        &mut self,
        elapsed_minutes: f64,
        timestamp: DateTime<Local>,
        values: &[f64],
        raw: &[RawSample],
    ) -> AppResult<usize> {
        if values.len() != self.channel_count || raw.len() != self.channel_count {
            return Err(DaqError::InvalidState(format!(
                "row has {} values and {} raw samples, store has {} channels",
                values.len(),
                raw.len(),
                self.channel_count
            )));
        }

        let mut columns = self.columns.write();
        let index = columns.len();
        columns.elapsed_minutes.push(elapsed_minutes);
        columns.timestamps.push(timestamp);
        for (column, value) in columns.channels.iter_mut().zip(values) {
            column.push(*value);
        }
        for (column, sample) in columns.raw.iter_mut().zip(raw) {
            column.push(*sample);
        }
        debug_assert!(columns.channels.iter().all(|c| c.len() == index + 1));
        debug_assert!(columns.raw.iter().all(|c| c.len() == index + 1));
        Ok(index)
    }

    /// Rows recorded so far.
    pub fn len(&self) -> usize {
        self.columns.read().len()
    }

    /// Whether nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The most recently appended row.
    pub fn last(&self) -> Option<TimeSeriesRow> {
        let columns = self.columns.read();
        columns.len().checked_sub(1).and_then(|i| columns.row(i))
    }
}

/// Read-only handle, cheap to clone.
#[derive(Debug, Clone)]
pub struct StoreReader {
    columns: Arc<RwLock<Columns>>,
    channel_count: usize,
}

impl StoreReader {
    /// Rows recorded so far.
    pub fn len(&self) -> usize {
        self.columns.read().len()
    }

    /// Whether nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of channel columns.
    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Copy of one channel column (zero-based).
    pub fn channel(&self, channel: usize) -> Option<Vec<f64>> {
        self.columns.read().channels.get(channel).cloned()
    }

    /// Copy of one channel's raw history (zero-based).
    pub fn raw_channel(&self, channel: usize) -> Option<Vec<RawSample>> {
        self.columns.read().raw.get(channel).cloned()
    }

    /// Setpoint words read for one channel, `None` where no register read succeeded.
    pub fn setpoints(&self, channel: usize) -> Option<Vec<Option<u16>>> {
        let columns = self.columns.read();
        let column = columns.raw.get(channel)?;
        Some(
            column
                .iter()
                .map(|sample| match sample {
                    RawSample::Register { setpoint, .. } => Some(*setpoint),
                    _ => None,
                })
                .collect(),
        )
    }

    /// Copy of the elapsed-minutes column.
    pub fn elapsed_minutes(&self) -> Vec<f64> {
        self.columns.read().elapsed_minutes.clone()
    }

    /// Copy of the timestamp column.
    pub fn timestamps(&self) -> Vec<DateTime<Local>> {
        self.columns.read().timestamps.clone()
    }

    /// One row.
    pub fn row(&self, index: usize) -> Option<TimeSeriesRow> {
        self.columns.read().row(index)
    }

    /// Every row from `start` up to the length observed when the call was made.
    pub fn rows_from(&self, start: usize) -> Vec<TimeSeriesRow> {
        let columns = self.columns.read();
        (start..columns.len())
            .filter_map(|i| columns.row(i))
            .collect()
    }
}
