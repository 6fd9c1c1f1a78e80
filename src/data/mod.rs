//! Output encoders and storage backends.
//!
//! - `encoder`: the [`TraceSink`](encoder::TraceSink) seam and the run-time
//!   [`OutputEncoder`](encoder::OutputEncoder) choice
//! - `tabular` / `tabular_store` / `hdf5_store`: growable per-channel datasets
//! - `statistics`: pedestal and signal window summaries
//! - `raw`: headered raw traces

pub mod encoder;
pub mod hdf5_store;
pub mod raw;
pub mod statistics;
pub mod tabular;
pub mod tabular_store;
