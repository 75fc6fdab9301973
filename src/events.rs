//! Derived process events.
//!
//! Two stateful accumulators run once per appended row, strictly after the append:
//!
//! - **Dwell time**: minutes the core temperature spent at or above the setpoint. The
//!   total is updated only when the temperature drops back below the setpoint, by the
//!   length of the completed stretch rounded to two decimals. While the temperature
//!   stays above, the total does not move.
//! - **Release temperature**: the core temperature on the row *before* the pressure
//!   first starts to fall. The capture is edge triggered: only the first drop of an
//!   unbroken run of drops is captured, and any flat or rising step re-arms it.
//!
//! Row elapsed minutes serve as the clock, so the detector is a pure function of the
//! recorded rows.

use crate::scaling::round_to;
use crate::store::TimeSeriesRow;
use parking_lot::RwLock;
use std::sync::Arc;

/// Accumulator state. Owned by the recording loop's detector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventState {
    /// Completed dwell minutes
    pub dwell_total_minutes: f64,
    /// Elapsed minutes at which the current above-setpoint stretch started
    pub above_since: Option<f64>,
    /// Most recent captured release temperature
    pub release_temperature: Option<f64>,
    /// Set while the pressure keeps falling after a capture
    pub pressure_dropping: bool,
    /// Rows observed
    pub rows_seen: usize,
}

/// Read-only view of the event state published to consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EventSnapshot {
    /// Completed dwell minutes, or `None` before two rows exist
    pub dwell_minutes: Option<f64>,
    /// Captured release temperature, or `None` if unavailable
    pub release_temperature: Option<f64>,
    /// Whether the core temperature is currently at or above the setpoint
    pub currently_above: bool,
}

/// Event snapshot shared between the recording loop and consumers.
pub type SharedEvents = Arc<RwLock<EventSnapshot>>;

/// Stateful detector for one cycle.
#[derive(Debug, Clone)]
pub struct EventDetector {
    setpoint: f64,
    core_index: usize,
    pressure_index: usize,
    state: EventState,
}

impl EventDetector {
    /// Create a detector. Channel indices are zero-based.
    pub fn new(setpoint: f64, core_index: usize, pressure_index: usize) -> Self {
        Self {
            setpoint,
            core_index,
            pressure_index,
            state: EventState::default(),
        }
    }

    /// Current accumulator state.
    pub fn state(&self) -> &EventState {
        &self.state
    }

    /// Feed the newly appended row together with the one before it.
    pub fn update(
        &mut self,
        current: &TimeSeriesRow,
        previous: Option<&TimeSeriesRow>,
    ) -> EventSnapshot {
        self.state.rows_seen += 1;

        if let Some(core) = current.value(self.core_index) {
            self.track_dwell(core, current.elapsed_minutes);
        }

        if let Some(previous) = previous {
            self.track_pressure(current, previous);
        }

        self.snapshot()
    }

    fn track_dwell(&mut self, core: f64, now: f64) {
        let state = &mut self.state;
        if core >= self.setpoint {
            if state.above_since.is_none() {
                state.above_since = Some(now);
            }
        } else if let Some(entry) = state.above_since.take() {
            state.dwell_total_minutes += round_to(now - entry, 2);
            state.dwell_total_minutes = round_to(state.dwell_total_minutes, 2);
        }
    }

    fn track_pressure(&mut self, current: &TimeSeriesRow, previous: &TimeSeriesRow) {
        let (Some(now), Some(before)) = (
            current.value(self.pressure_index),
            previous.value(self.pressure_index),
        ) else {
            return;
        };

        if before > now {
            if !self.state.pressure_dropping {
                self.state.release_temperature = previous.value(self.core_index);
                self.state.pressure_dropping = true;
            }
        } else {
            self.state.pressure_dropping = false;
        }
    }

    /// Published view of the current state.
    pub fn snapshot(&self) -> EventSnapshot {
        let ready = self.state.rows_seen >= 2;
        EventSnapshot {
            dwell_minutes: ready.then_some(self.state.dwell_total_minutes),
            release_temperature: if ready {
                self.state.release_temperature
            } else {
                None
            },
            currently_above: self.state.above_since.is_some(),
        }
    }
}
