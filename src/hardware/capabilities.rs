//! Oscilloscope Capability
//!
//! This module defines the contract the acquisition pipeline expects from a
//! waveform-capturing instrument. The vendor wire protocol lives behind this
//! trait; the pipeline only ever talks to `dyn Oscilloscope`.
//!
//! # Design Philosophy
//!
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Takes `&self`; drivers keep connection state behind interior mutability
//! - Reports failures as [`DaqError`] so the loop can tell transient faults
//!   (`Transport`, `Frame`) from fatal ones
//!
//! # Example
//!
//! ```rust,ignore
//! async fn first_trace(scope: &dyn Oscilloscope) -> AppResult<RawCapture> {
//!     scope.clear().await?;
//!     let channels = scope.list_channels().await?;
//!     scope.trigger().await?;
//!     scope.read_waveform(channels[0]).await
//! }
//! ```

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::AppResult;
use crate::waveform::{ChannelId, RawCapture, WaveDescriptor};

/// Instrument settings keyed by command mnemonic (e.g. `"SEQUENCE" -> "ON,4"`).
pub type InstrumentSettings = BTreeMap<String, String>;

/// Setting key holding the sequence-mode configuration.
pub const SEQUENCE_SETTING: &str = "SEQUENCE";

/// Capability: Triggered Waveform Capture
///
/// # Contract
/// - `connect` must succeed before any other call
/// - `clear` resets error/output state and may be called at any time,
///   including after a transport failure
/// - `trigger` arms and fires one acquisition; `read_waveform` then returns
///   that acquisition's record for one channel
/// - `list_channels` returns the enabled channels in a stable order
#[async_trait]
pub trait Oscilloscope: Send + Sync {
    /// Open the connection to the instrument.
    async fn connect(&self) -> AppResult<()>;

    /// Clear error and output state.
    async fn clear(&self) -> AppResult<()>;

    /// Request `count` traces per trigger. The instrument may not honor it;
    /// read the settings back to learn what it actually did.
    async fn configure_sequence(&self, count: usize) -> AppResult<()>;

    /// Enabled channels, in readout order.
    async fn list_channels(&self) -> AppResult<Vec<ChannelId>>;

    /// Snapshot of the instrument configuration.
    async fn read_settings(&self) -> AppResult<InstrumentSettings>;

    /// Descriptor of the channel's current record, without triggering.
    async fn read_wave_descriptor(&self, channel: ChannelId) -> AppResult<WaveDescriptor>;

    /// Fire one acquisition.
    async fn trigger(&self) -> AppResult<()>;

    /// Read the last acquisition for `channel`.
    async fn read_waveform(&self, channel: ChannelId) -> AppResult<RawCapture>;

    /// Human-readable identification.
    fn identity(&self) -> String {
        "oscilloscope".to_string()
    }
}
