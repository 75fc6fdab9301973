//! # Autoclave DAQ Core Library
//!
//! This crate is the acquisition core of an autoclave curing monitor. It polls a bank of
//! temperature and process controllers over a Modbus RTU field bus at a fixed cadence,
//! converts raw register words into engineering units, records the cycle as a time
//! series, and derives process events (dwell time above a setpoint, the core
//! temperature at which pressure is released). Display, reporting and upload are left
//! to consumers of the library, which see the cycle through a read-only store view,
//! an event snapshot and a notification channel.
//!
//! ## Crate Structure
//!
//! - **`config`**: The `Settings` snapshot for one cycle, loaded from TOML plus
//!   environment overrides and validated once.
//! - **`error`**: The `DaqError` enum used across the library.
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`transport`**: The `RegisterTransport` contract, the shared per-transaction lock,
//!   the Modbus RTU implementation and a scriptable mock.
//! - **`scaling`**: Pure raw-to-engineering conversion.
//! - **`source`**: Per-tick sample sources, live and demo.
//! - **`store`**: The append-only, column-oriented time-series store.
//! - **`events`**: Dwell-time and pressure-drop detection.
//! - **`notify`**: `BatchReady` / `FatalAcquisitionError` signalling.
//! - **`acquisition`**: The per-tick loop state machine running on its own thread.
//! - **`session`**: One cycle wired end to end.
//! - **`validation`**: Small validators used by `config`.

pub mod acquisition;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod notify;
pub mod scaling;
pub mod session;
pub mod source;
pub mod store;
pub mod transport;
pub mod validation;
