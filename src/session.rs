//! One curing cycle, wired end to end.
//!
//! A [`CycleSession`] owns everything that lives for exactly one cycle:
//!
//! - the frozen configuration snapshot,
//! - the sample input (a shared field-bus transport, or a demo sequence),
//! - the preview loop and the recording loop,
//! - the time-series store and the published event snapshot,
//! - the notifier consumers subscribe to.
//!
//! Opening a live session opens the link first. If that fails, a single
//! `FatalAcquisitionError` is published and no session (hence no loop) exists.
//!
//! ## Lifecycle
//!
//! ```text
//!   open ─► start_preview ─► start_recording ─► stop
//!             (optional)       (once per cycle)
//! ```
//!
//! Setpoint writes may be issued at any time; they share the transport lock with the
//! running loops one transaction at a time.

use crate::acquisition::{
    AcquisitionLoop, LatestSample, LatestValues, LoopKind, LoopOptions, LoopReport, LoopSink,
    LoopState, RecordingSink,
};
use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use crate::events::{EventDetector, EventSnapshot, SharedEvents};
use crate::notify::{Notification, Notifier};
use crate::source::{DemoSequence, DemoSource, LiveSource, SampleSource};
use crate::store::{StoreReader, StoreWriter, TimeSeriesStore};
use crate::transport::{RegisterTransport, SharedTransport, TransportError};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Where a cycle's samples come from.
pub enum SourceKind {
    /// Poll the controllers through this transport
    Live(Box<dyn RegisterTransport>),
    /// Replay a recorded sequence
    Demo(DemoSequence),
}

enum CycleInput {
    Live(SharedTransport),
    Demo(Arc<DemoSequence>),
}

/// Loop summaries returned by [`CycleSession::stop`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Preview loop summary, if it was started
    pub preview: Option<LoopReport>,
    /// Recording loop summary, if it was started
    pub recording: Option<LoopReport>,
}

/// State of one curing cycle.
pub struct CycleSession {
    settings: Arc<Settings>,
    notifier: Notifier,
    input: CycleInput,
    preview: Option<AcquisitionLoop>,
    recording: Option<AcquisitionLoop>,
    writer: Option<StoreWriter>,
    store: StoreReader,
    events: SharedEvents,
    latest: LatestValues,
}

impl CycleSession {
    /// Validate the configuration and open the cycle's input.
    pub fn open(
        settings: Arc<Settings>,
        source: SourceKind,
        notifier: Notifier,
    ) -> AppResult<Self> {
        settings.validate()?;

        let input = match source {
            SourceKind::Live(transport) => {
                let shared = SharedTransport::new(transport);
                if let Err(err) = shared.open() {
                    notifier.fatal(format!("Cannot open field-bus link: {err}"));
                    return Err(err.into());
                }
                info!(link = %shared.describe(), "Field-bus link open");
                CycleInput::Live(shared)
            }
            SourceKind::Demo(sequence) => {
                let channels = settings.channels.len();
                if sequence.is_empty() {
                    return Err(DaqError::Demo("sequence has no rows".into()));
                }
                if sequence.width() < channels {
                    return Err(DaqError::Demo(format!(
                        "sequence rows have {} columns, configuration has {channels} channels",
                        sequence.width()
                    )));
                }
                info!(rows = sequence.len(), "Demo sequence loaded");
                CycleInput::Demo(Arc::new(sequence))
            }
        };

        let (writer, store) = TimeSeriesStore::new(settings.channels.len());
        Ok(Self {
            settings,
            notifier,
            input,
            preview: None,
            recording: None,
            writer: Some(writer),
            store,
            events: SharedEvents::default(),
            latest: LatestValues::default(),
        })
    }

    /// The configuration snapshot of this cycle.
    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Whether the cycle replays a demo sequence.
    pub fn is_demo(&self) -> bool {
        matches!(self.input, CycleInput::Demo(_))
    }

    fn sample_source(&self) -> AppResult<Box<dyn SampleSource>> {
        match &self.input {
            CycleInput::Live(shared) => match shared.lease() {
                Ok(lease) => Ok(Box::new(LiveSource::new(lease))),
                Err(err) => {
                    self.notifier
                        .fatal(format!("Cannot open field-bus link: {err}"));
                    Err(err.into())
                }
            },
            CycleInput::Demo(sequence) => Ok(Box::new(DemoSource::new(Arc::clone(sequence)))),
        }
    }

    /// Start the preview loop at the configured panel period.
    pub fn start_preview(&mut self) -> AppResult<()> {
        self.start_preview_with(LoopOptions::preview(&self.settings))
    }

    /// Start the preview loop with explicit timing.
    pub fn start_preview_with(&mut self, options: LoopOptions) -> AppResult<()> {
        if self
            .preview
            .as_ref()
            .is_some_and(|acq| acq.state() == LoopState::Running)
        {
            return Err(DaqError::InvalidState("preview loop already running".into()));
        }

        let source = self.sample_source()?;
        let mut acq = AcquisitionLoop::new(
            LoopKind::Preview,
            Arc::clone(&self.settings),
            options,
            source,
            LoopSink::Preview(Arc::clone(&self.latest)),
            self.notifier.clone(),
        );
        acq.start()?;
        self.preview = Some(acq);
        Ok(())
    }

    /// Start the recording loop at the configured sampling period.
    pub fn start_recording(&mut self) -> AppResult<()> {
        self.start_recording_with(LoopOptions::recording(&self.settings))
    }

    /// Start the recording loop with explicit timing. Allowed once per cycle.
    pub fn start_recording_with(&mut self, options: LoopOptions) -> AppResult<()> {
        if self.writer.is_none() {
            return Err(DaqError::InvalidState(
                "recording already started for this cycle".into(),
            ));
        }

        let source = self.sample_source()?;
        let writer = self.writer.take().ok_or_else(|| {
            DaqError::InvalidState("recording already started for this cycle".into())
        })?;
        let detector = EventDetector::new(
            self.settings.acquisition.core_temp_setpoint,
            self.settings.core_temp_index(),
            self.settings.pressure_index(),
        );
        let sink = LoopSink::Recording(RecordingSink::new(
            writer,
            detector,
            Arc::clone(&self.events),
        ));

        let mut acq = AcquisitionLoop::new(
            LoopKind::Recording,
            Arc::clone(&self.settings),
            options,
            source,
            sink,
            self.notifier.clone(),
        );
        acq.start()?;
        self.recording = Some(acq);
        Ok(())
    }

    /// Stop the preview loop, if running.
    pub fn stop_preview(&mut self) -> AppResult<Option<LoopReport>> {
        self.preview.as_mut().map(AcquisitionLoop::stop).transpose()
    }

    /// Wait for the recording loop to finish on its own (tick limit or exhausted source).
    pub fn wait_recording(&mut self) -> AppResult<Option<LoopReport>> {
        self.recording.as_mut().map(AcquisitionLoop::wait).transpose()
    }

    /// Stop both loops and wait for their threads.
    pub fn stop(&mut self) -> AppResult<CycleReport> {
        let preview = self.stop_preview()?;
        let recording = self.recording.as_mut().map(AcquisitionLoop::stop).transpose()?;
        info!(
            rows = self.store.len(),
            dwell = ?self.events().dwell_minutes,
            "Cycle stopped"
        );
        Ok(CycleReport { preview, recording })
    }

    /// State of the preview loop, `None` if never started.
    pub fn preview_state(&self) -> Option<LoopState> {
        self.preview.as_ref().map(AcquisitionLoop::state)
    }

    /// State of the recording loop, `None` if never started.
    pub fn recording_state(&self) -> Option<LoopState> {
        self.recording.as_ref().map(AcquisitionLoop::state)
    }

    /// Write every active channel's setpoint to its device.
    ///
    /// Opens the link if no loop holds it open, and closes it again afterwards in
    /// that case. Stops at the first failed write. Returns the number of registers
    /// written.
    pub fn write_setpoints(&self) -> Result<usize, TransportError> {
        let shared = match &self.input {
            CycleInput::Live(shared) => shared,
            CycleInput::Demo(_) => {
                info!("Demo cycle, no setpoints written");
                return Ok(0);
            }
        };

        let lease = shared.lease()?;
        debug!(leases = shared.active_leases(), "Writing setpoints");
        let result = self
            .settings
            .channels
            .iter()
            .enumerate()
            .filter(|(_, channel)| channel.active)
            .try_fold(0usize, |written, (i, channel)| {
                shared
                    .write_register(
                        channel.device_address,
                        channel.setpoint_register,
                        channel.setpoint_value,
                    )
                    .map_err(|err| {
                        error!(
                            channel = i + 1,
                            device = channel.device_address,
                            register = channel.setpoint_register,
                            error = %err,
                            "Setpoint write failed"
                        );
                        err
                    })?;
                debug!(
                    channel = i + 1,
                    value = channel.setpoint_value,
                    "Setpoint written"
                );
                Ok(written + 1)
            });

        lease.release();
        if let Ok(written) = result {
            info!(written, "Setpoints written");
        }
        result
    }

    /// Read-only view of the cycle's time series.
    pub fn store(&self) -> StoreReader {
        self.store.clone()
    }

    /// Current event snapshot.
    pub fn events(&self) -> EventSnapshot {
        *self.events.read()
    }

    /// Values of the most recent preview tick.
    pub fn latest(&self) -> Option<LatestSample> {
        self.latest.read().clone()
    }

    /// Subscribe to tick and fatal-error notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }
}
