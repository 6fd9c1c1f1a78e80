//! Instrument drivers.
//!
//! `capabilities` holds the [`Oscilloscope`] trait the acquisition pipeline is
//! written against; `mock` holds the simulated instrument used by tests and by
//! the CLI's `simulated` driver.

pub mod capabilities;
pub mod mock;

pub use capabilities::{InstrumentSettings, Oscilloscope, SEQUENCE_SETTING};
pub use mock::{FaultKind, MockScope, MockScopeConfig};
