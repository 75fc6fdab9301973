//! The per-tick acquisition loop.
//!
//! Each loop runs on its own named thread and moves through `Idle → Running → Stopped`.
//! A stopped loop is never restarted; a new cycle builds new loops.
//!
//! Two flavours exist, distinguished by their sink:
//!
//! - **Preview** writes every tick into a [`LatestValues`] buffer that is replaced, not
//!   appended, and drives live displays only.
//! - **Recording** appends to the cycle's [`TimeSeriesStore`](crate::store::TimeSeriesStore)
//!   and runs the [`EventDetector`] after every append.
//!
//! Per tick:
//!
//! ```text
//!   running? ──no──► exit
//!      │
//!   read raw samples (transport locked per register transaction)
//!      │
//!   running? ──no──► discard, exit
//!      │
//!   scale ─► sink (replace latest / append + detect) ─► BatchReady
//!      │
//!   pace in poll-quantum steps until the period has elapsed, re-checking running
//! ```
//!
//! Stopping is cooperative through a shared flag. An in-flight register read is never
//! interrupted; it is bounded by the link timeout and its result is dropped.

use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use crate::events::{EventDetector, SharedEvents};
use crate::notify::Notifier;
use crate::scaling::{round_to, scale_sample};
use crate::source::{RawSample, SampleSource};
use crate::store::{StoreWriter, TimeSeriesRow};
use chrono::{DateTime, Local};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};

/// Which loop a tick came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopKind {
    /// Live panel, transient values only
    Preview,
    /// Durable recording
    Recording,
}

impl LoopKind {
    fn thread_name(self) -> &'static str {
        match self {
            LoopKind::Preview => "acq-preview",
            LoopKind::Recording => "acq-recording",
        }
    }
}

impl fmt::Display for LoopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopKind::Preview => write!(f, "preview"),
            LoopKind::Recording => write!(f, "recording"),
        }
    }
}

/// Lifecycle state of a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Built, not started
    Idle,
    /// Worker thread is ticking
    Running,
    /// Terminal
    Stopped,
}

/// Timing parameters of one loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopOptions {
    /// Minimum wall-clock spacing between tick starts
    pub period: Duration,
    /// Sleep granularity while pacing
    pub poll_quantum: Duration,
    /// Stop on its own after this many ticks
    pub tick_limit: Option<u64>,
}

impl LoopOptions {
    /// Options for an unbounded loop.
    pub fn new(period: Duration, poll_quantum: Duration) -> Self {
        Self {
            period,
            poll_quantum,
            tick_limit: None,
        }
    }

    /// Stop after `ticks` ticks.
    pub fn with_tick_limit(mut self, ticks: u64) -> Self {
        self.tick_limit = Some(ticks);
        self
    }

    /// Recording loop options from the configuration.
    pub fn recording(settings: &Settings) -> Self {
        Self::new(
            settings.acquisition.sample_period(),
            settings.acquisition.poll_quantum(),
        )
    }

    /// Preview loop options from the configuration.
    pub fn preview(settings: &Settings) -> Self {
        Self::new(
            settings.acquisition.panel_period(),
            settings.acquisition.poll_quantum(),
        )
    }
}

/// The values of the most recent preview tick.
#[derive(Debug, Clone, PartialEq)]
pub struct LatestSample {
    /// Wall-clock time of the tick
    pub timestamp: DateTime<Local>,
    /// Scaled value of every channel
    pub values: Vec<f64>,
}

/// Transient per-tick buffer written by the preview loop.
pub type LatestValues = Arc<RwLock<Option<LatestSample>>>;

/// Recording destination: the store writer plus the event detector fed after each append.
pub struct RecordingSink {
    writer: StoreWriter,
    detector: EventDetector,
    events: SharedEvents,
}

impl RecordingSink {
    /// Bundle the recording destination.
    pub fn new(writer: StoreWriter, detector: EventDetector, events: SharedEvents) -> Self {
        Self {
            writer,
            detector,
            events,
        }
    }

    fn record(
        &mut self,
        elapsed_minutes: f64,
        timestamp: DateTime<Local>,
        values: Vec<f64>,
        raw: &[RawSample],
    ) -> usize {
        let previous = self.writer.last();
        let index = match self.writer.append(elapsed_minutes, timestamp, &values, raw) {
            Ok(index) => index,
            Err(err) => {
                error!(error = %err, "Dropping row that does not fit the store");
                return self.writer.len();
            }
        };

        let row = TimeSeriesRow {
            index,
            elapsed_minutes,
            timestamp,
            values,
        };
        let snapshot = self.detector.update(&row, previous.as_ref());
        *self.events.write() = snapshot;
        index + 1
    }
}

/// Where a loop delivers its ticks.
pub enum LoopSink {
    /// Replace the latest values
    Preview(LatestValues),
    /// Append and detect events
    Recording(RecordingSink),
}

/// Summary returned when a loop's thread exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopReport {
    /// Ticks that delivered a sample to the sink
    pub ticks: u64,
    /// Rows appended to the store (zero for preview)
    pub appended: u64,
}

/// One acquisition loop.
pub struct AcquisitionLoop {
    kind: LoopKind,
    settings: Arc<Settings>,
    options: LoopOptions,
    notifier: Notifier,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<LoopState>>,
    ticks: Arc<AtomicU64>,
    pending: Option<(Box<dyn SampleSource>, LoopSink)>,
    handle: Option<JoinHandle<LoopReport>>,
    report: Option<LoopReport>,
}

impl AcquisitionLoop {
    /// Build an idle loop.
    pub fn new(
        kind: LoopKind,
        settings: Arc<Settings>,
        options: LoopOptions,
        source: Box<dyn SampleSource>,
        sink: LoopSink,
        notifier: Notifier,
    ) -> Self {
        Self {
            kind,
            settings,
            options,
            notifier,
            running: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(LoopState::Idle)),
            ticks: Arc::new(AtomicU64::new(0)),
            pending: Some((source, sink)),
            handle: None,
            report: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LoopState {
        *self.state.lock()
    }

    /// Ticks completed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Spawn the worker thread. Only valid from `Idle`.
    pub fn start(&mut self) -> AppResult<()> {
        let state = self.state();
        if state != LoopState::Idle {
            return Err(DaqError::InvalidState(format!(
                "{} loop cannot start from {state:?}",
                self.kind
            )));
        }
        let (source, sink) = self.pending.take().ok_or_else(|| {
            DaqError::InvalidState(format!("{} loop has no source", self.kind))
        })?;

        self.running.store(true, Ordering::SeqCst);
        *self.state.lock() = LoopState::Running;

        let worker = Worker {
            kind: self.kind,
            settings: Arc::clone(&self.settings),
            options: self.options,
            notifier: self.notifier.clone(),
            running: Arc::clone(&self.running),
            state: Arc::clone(&self.state),
            ticks: Arc::clone(&self.ticks),
            source,
            sink,
        };

        // Child of the caller's span, so worker logs keep the caller's context.
        let span = info_span!("acquisition", kind = %self.kind);
        let spawned = thread::Builder::new()
            .name(self.kind.thread_name().to_string())
            .spawn(move || span.in_scope(|| worker.run()));
        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                info!(kind = %self.kind, period = ?self.options.period, "Acquisition loop started");
                Ok(())
            }
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                *self.state.lock() = LoopState::Stopped;
                Err(DaqError::Io(err))
            }
        }
    }

    /// Request a stop and wait for the worker to exit.
    ///
    /// Stopping an idle loop moves it straight to `Stopped` and releases its source.
    pub fn stop(&mut self) -> AppResult<LoopReport> {
        self.running.store(false, Ordering::SeqCst);
        if let Some((mut source, _)) = self.pending.take() {
            source.close();
            *self.state.lock() = LoopState::Stopped;
            return Ok(LoopReport::default());
        }
        self.wait()
    }

    /// Wait for the worker to exit without requesting a stop.
    ///
    /// Returns once the source is exhausted or the tick limit is reached.
    pub fn wait(&mut self) -> AppResult<LoopReport> {
        if let Some(handle) = self.handle.take() {
            let report = handle.join().map_err(|_| {
                *self.state.lock() = LoopState::Stopped;
                DaqError::InvalidState(format!("{} loop thread panicked", self.kind))
            })?;
            self.report = Some(report);
        }
        Ok(self.report.unwrap_or_default())
    }
}

impl Drop for AcquisitionLoop {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(err) = self.stop() {
                warn!(kind = %self.kind, error = %err, "Loop did not stop cleanly");
            }
        }
    }
}

struct Worker {
    kind: LoopKind,
    settings: Arc<Settings>,
    options: LoopOptions,
    notifier: Notifier,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<LoopState>>,
    ticks: Arc<AtomicU64>,
    source: Box<dyn SampleSource>,
    sink: LoopSink,
}

impl Worker {
    fn run(mut self) -> LoopReport {
        let started = Instant::now();
        let mut report = LoopReport::default();
        debug!(kind = %self.kind, source = self.source.name(), "Worker thread running");

        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if self.options.tick_limit.is_some_and(|limit| report.ticks >= limit) {
                debug!(kind = %self.kind, ticks = report.ticks, "Tick limit reached");
                break;
            }

            let tick_start = Instant::now();
            let timestamp = Local::now();
            let elapsed_minutes =
                round_to(tick_start.duration_since(started).as_secs_f64() / 60.0, 2);

            let channels = &self.settings.channels;
            let Some(raw) = self.source.next_raw_sample(channels) else {
                info!(kind = %self.kind, source = self.source.name(), "Sample source exhausted");
                break;
            };
            if !self.running.load(Ordering::SeqCst) {
                debug!(kind = %self.kind, "Stop requested during read, discarding tick");
                break;
            }

            let values: Vec<f64> = raw
                .iter()
                .zip(channels)
                .map(|(sample, channel)| scale_sample(sample, channel))
                .collect();

            let rows = match &mut self.sink {
                LoopSink::Preview(latest) => {
                    *latest.write() = Some(LatestSample { timestamp, values });
                    0
                }
                LoopSink::Recording(recording) => {
                    let rows = recording.record(elapsed_minutes, timestamp, values, &raw);
                    report.appended = rows as u64;
                    rows
                }
            };

            report.ticks += 1;
            self.ticks.store(report.ticks, Ordering::SeqCst);
            self.notifier.batch_ready(self.kind, rows);

            if self.options.tick_limit.is_some_and(|limit| report.ticks >= limit) {
                continue;
            }
            self.pace(tick_start);
        }

        self.source.close();
        self.running.store(false, Ordering::SeqCst);
        *self.state.lock() = LoopState::Stopped;
        info!(
            kind = %self.kind,
            ticks = report.ticks,
            appended = report.appended,
            "Acquisition loop stopped"
        );
        report
    }

    /// Sleep out the rest of the period in small steps so a stop is seen promptly.
    fn pace(&self, tick_start: Instant) {
        let quantum = self.options.poll_quantum.max(Duration::from_millis(1));
        loop {
            let elapsed = tick_start.elapsed();
            if elapsed >= self.options.period || !self.running.load(Ordering::SeqCst) {
                return;
            }
            thread::sleep(quantum.min(self.options.period - elapsed));
        }
    }
}
