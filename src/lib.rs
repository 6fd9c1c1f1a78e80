//! # scope_daq
//!
//! Triggered waveform acquisition from a network oscilloscope, written to one of
//! three output formats.
//!
//! A run negotiates the instrument's sequence mode (several traces per trigger),
//! then triggers repeatedly, reads every enabled channel, splits each payload
//! into traces and hands them to an encoder. Transient instrument failures
//! discard the in-flight trigger and retry it; nothing partial is ever written.
//!
//! ## Crate Structure
//!
//! - **`waveform`**: descriptors, typed raw samples, trace splitting.
//! - **`hardware`**: the `Oscilloscope` driver trait and the simulated `MockScope`.
//! - **`acquisition`**: sequence negotiation, the trigger loop and run orchestration.
//! - **`data`**: the `TraceSink` seam and the tabular, statistics and raw encoders.
//! - **`config`**: layered Figment configuration.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`error`**: the `DaqError` enum and its transient/fatal classification.

pub mod acquisition;
pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod waveform;

pub use error::{AppResult, DaqError};
