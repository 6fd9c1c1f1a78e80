//! Mock Oscilloscope
//!
//! Provides a simulated oscilloscope for testing without physical hardware.
//! It honors sequence-mode requests up to a configurable limit, synthesizes
//! pulse-on-baseline traces, and can be told to fail in the ways a real
//! network-attached instrument fails:
//!
//! - Queued faults (`inject_fault`, `inject_fault_on`) fire on the next matching
//!   waveform read, for deterministic tests
//! - A random transient-fault rate, for soak runs from the CLI
//! - Scripted captures (`push_capture`) replace the synthetic payload
//! - `set_record_length` changes the record length between triggers
//!
//! All waits use `tokio::time::sleep`, never `std::thread::sleep`.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::time::{sleep, timeout, Duration};
use tracing::debug;

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{InstrumentSettings, Oscilloscope, SEQUENCE_SETTING};
use crate::waveform::{ChannelId, NumericKind, RawCapture, RawSamples, WaveDescriptor};

/// Kind of failure a queued fault produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Connection dropped mid-read.
    Transport,
    /// Response header could not be decoded.
    Frame,
    /// Payload shorter than its descriptor announces.
    Truncated,
}

#[derive(Debug, Clone, Copy)]
struct QueuedFault {
    kind: FaultKind,
    channel: Option<ChannelId>,
}

/// Configuration for the simulated oscilloscope.
#[derive(Debug, Clone, Deserialize)]
pub struct MockScopeConfig {
    /// Enabled channel numbers (default: 1, 2)
    #[serde(default = "default_channels")]
    pub channels: Vec<u8>,
    /// Samples per trace (default: 500)
    #[serde(default = "default_record_length")]
    pub record_length: u32,
    /// Sample representation (default: i16)
    #[serde(default = "default_kind")]
    pub kind: NumericKind,
    /// Largest sequence count the instrument accepts (default: 16)
    #[serde(default = "default_max_sequence")]
    pub max_sequence: usize,
    /// Probability that a waveform read fails with a transport error (default: 0)
    #[serde(default)]
    pub fault_rate: f64,
    /// RNG seed for noise and random faults (default: 7)
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Simulated round-trip latency per call in milliseconds (default: 0)
    #[serde(default)]
    pub latency_ms: u64,
    /// Address reported in the instrument identity (default: 127.0.0.1)
    #[serde(default = "default_address")]
    pub address: String,
    /// Calls slower than this fail with a transport error (default: 5000)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_channels() -> Vec<u8> {
    vec![1, 2]
}
fn default_record_length() -> u32 {
    500
}
fn default_kind() -> NumericKind {
    NumericKind::I16
}
fn default_max_sequence() -> usize {
    16
}
fn default_seed() -> u64 {
    7
}
fn default_address() -> String {
    "127.0.0.1".to_string()
}
fn default_timeout_ms() -> u64 {
    5000
}

impl Default for MockScopeConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            record_length: default_record_length(),
            kind: default_kind(),
            max_sequence: default_max_sequence(),
            fault_rate: 0.0,
            seed: default_seed(),
            latency_ms: 0,
            address: default_address(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

struct MockState {
    connected: bool,
    sequence_count: usize,
    record_length: u32,
    triggers: u64,
    clears: u64,
    faults: VecDeque<QueuedFault>,
    scripted: HashMap<ChannelId, VecDeque<RawCapture>>,
    extra_settings: InstrumentSettings,
    call_log: Vec<String>,
    rng: StdRng,
}

/// Simulated network oscilloscope.
///
/// # Example
///
/// ```rust
/// use scope_daq::hardware::{MockScope, Oscilloscope};
/// use scope_daq::waveform::ChannelId;
///
/// # tokio_test::block_on(async {
/// let scope = MockScope::new();
/// scope.connect().await?;
/// scope.configure_sequence(4).await?;
/// scope.trigger().await?;
/// let capture = scope.read_waveform(ChannelId(1)).await?;
/// assert_eq!(capture.samples.len(), 4 * 500);
/// # Ok::<(), scope_daq::DaqError>(())
/// # }).unwrap();
/// ```
pub struct MockScope {
    config: MockScopeConfig,
    state: Mutex<MockState>,
}

impl MockScope {
    /// Two 500-sample `i16` channels, sequence mode up to 16.
    pub fn new() -> Self {
        Self::with_config(MockScopeConfig::default())
    }

    /// Create a mock from explicit configuration.
    pub fn with_config(config: MockScopeConfig) -> Self {
        let state = MockState {
            connected: false,
            sequence_count: 1,
            record_length: config.record_length,
            triggers: 0,
            clears: 0,
            faults: VecDeque::new(),
            scripted: HashMap::new(),
            extra_settings: InstrumentSettings::new(),
            call_log: Vec::new(),
            rng: StdRng::seed_from_u64(config.seed),
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    /// Add or override an instrument setting reported by `read_settings`.
    pub fn with_setting(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.lock().extra_settings.insert(key.into(), value.into());
        self
    }

    /// Fail the next waveform read, whatever the channel.
    pub fn inject_fault(&self, kind: FaultKind) {
        self.lock().faults.push_back(QueuedFault {
            kind,
            channel: None,
        });
    }

    /// Fail the next waveform read of `channel`.
    pub fn inject_fault_on(&self, channel: ChannelId, kind: FaultKind) {
        self.lock().faults.push_back(QueuedFault {
            kind,
            channel: Some(channel),
        });
    }

    /// Serve `capture` for the next read of `channel` instead of a synthetic trace.
    pub fn push_capture(&self, channel: ChannelId, capture: RawCapture) {
        self.lock()
            .scripted
            .entry(channel)
            .or_default()
            .push_back(capture);
    }

    /// Change the per-trace record length for subsequent acquisitions.
    pub fn set_record_length(&self, samples: u32) {
        self.lock().record_length = samples;
    }

    /// Number of `trigger` calls so far.
    pub fn trigger_count(&self) -> u64 {
        self.lock().triggers
    }

    /// Number of `clear` calls so far.
    pub fn clear_count(&self) -> u64 {
        self.lock().clears
    }

    /// Copy of the call log for verification.
    pub fn call_log(&self) -> Vec<String> {
        self.lock().call_log.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn round_trip(&self) -> AppResult<()> {
        if self.config.latency_ms == 0 {
            return Ok(());
        }
        let limit = Duration::from_millis(self.config.timeout_ms);
        timeout(limit, sleep(Duration::from_millis(self.config.latency_ms)))
            .await
            .map_err(|_| {
                DaqError::Transport(format!(
                    "{} did not answer within {} ms",
                    self.config.address, self.config.timeout_ms
                ))
            })
    }

    fn channel_ids(&self) -> Vec<ChannelId> {
        self.config.channels.iter().copied().map(ChannelId).collect()
    }

    fn check_channel(&self, channel: ChannelId) -> AppResult<()> {
        if self.config.channels.contains(&channel.number()) {
            Ok(())
        } else {
            Err(DaqError::Instrument(format!("{} is not enabled", channel)))
        }
    }

    fn descriptor(&self, channel: ChannelId, state: &MockState) -> WaveDescriptor {
        let kind = self.config.kind;
        let full_scale = match kind {
            NumericKind::I8 => 128.0,
            NumericKind::I16 => 32768.0,
            NumericKind::I32 => 2_147_483_648.0,
            NumericKind::F32 | NumericKind::F64 => 1.0,
        };
        WaveDescriptor {
            num_samples_total: state.record_length * state.sequence_count as u32,
            sample_width_bytes: kind.width(),
            vertical_offset: 0.001 * f64::from(channel.number()),
            vertical_gain: 0.5 / full_scale,
            horizontal_offset: -20e-9,
            horizontal_interval: 0.2e-9,
            element_type: kind,
        }
    }
}

impl Default for MockScope {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_connected(state: &MockState) -> AppResult<()> {
    if state.connected {
        Ok(())
    } else {
        Err(DaqError::Transport("not connected".to_string()))
    }
}

/// Baseline near zero with a negative pulse a fifth of the way into every trace.
fn synthesize(
    kind: NumericKind,
    record_length: usize,
    sequence_count: usize,
    gain: f64,
    rng: &mut StdRng,
) -> RawSamples {
    let peak = 0.15 / gain;
    let noise = 0.002 / gain;
    let centre = record_length as f64 / 5.0;
    let width = (record_length as f64 / 100.0).max(1.0);
    let counts: Vec<f64> = (0..sequence_count)
        .flat_map(|_| 0..record_length)
        .map(|i| {
            let x = (i as f64 - centre) / width;
            let amplitude: f64 = rng.gen_range(0.5..1.0);
            -peak * amplitude * (-0.5 * x * x).exp() + noise * rng.gen_range(-1.0..1.0)
        })
        .collect();
    match kind {
        NumericKind::I8 => RawSamples::I8(counts.iter().map(|&c| c.round().clamp(-128.0, 127.0) as i8).collect()),
        NumericKind::I16 => RawSamples::I16(
            counts
                .iter()
                .map(|&c| c.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16)
                .collect(),
        ),
        NumericKind::I32 => RawSamples::I32(counts.iter().map(|&c| c.round() as i32).collect()),
        NumericKind::F32 => RawSamples::F32(counts.iter().map(|&c| c as f32).collect()),
        NumericKind::F64 => RawSamples::F64(counts),
    }
}

#[async_trait]
impl Oscilloscope for MockScope {
    async fn connect(&self) -> AppResult<()> {
        self.round_trip().await?;
        let mut state = self.lock();
        state.call_log.push("connect".to_string());
        state.connected = true;
        debug!(channels = ?self.config.channels, "MockScope connected");
        Ok(())
    }

    async fn clear(&self) -> AppResult<()> {
        self.round_trip().await?;
        let mut state = self.lock();
        state.call_log.push("clear".to_string());
        ensure_connected(&state)?;
        state.clears += 1;
        Ok(())
    }

    async fn configure_sequence(&self, count: usize) -> AppResult<()> {
        self.round_trip().await?;
        let mut state = self.lock();
        state.call_log.push(format!("configure_sequence {}", count));
        ensure_connected(&state)?;
        state.sequence_count = count.clamp(1, self.config.max_sequence.max(1));
        Ok(())
    }

    async fn list_channels(&self) -> AppResult<Vec<ChannelId>> {
        self.round_trip().await?;
        let mut state = self.lock();
        state.call_log.push("list_channels".to_string());
        ensure_connected(&state)?;
        Ok(self.channel_ids())
    }

    async fn read_settings(&self) -> AppResult<InstrumentSettings> {
        self.round_trip().await?;
        let mut state = self.lock();
        state.call_log.push("read_settings".to_string());
        ensure_connected(&state)?;

        let mut settings = InstrumentSettings::new();
        let sequence = if state.sequence_count > 1 {
            format!("ON,{}", state.sequence_count)
        } else {
            "OFF".to_string()
        };
        settings.insert(SEQUENCE_SETTING.to_string(), sequence);
        settings.insert("TIME_DIV".to_string(), "10E-9 S".to_string());
        settings.insert("TRIG_MODE".to_string(), "NORM".to_string());
        settings.insert(
            "COMM_FORMAT".to_string(),
            format!("DEF9,{},BIN", if self.config.kind.width() == 1 { "BYTE" } else { "WORD" }),
        );
        for (key, value) in &state.extra_settings {
            settings.insert(key.clone(), value.clone());
        }
        Ok(settings)
    }

    async fn read_wave_descriptor(&self, channel: ChannelId) -> AppResult<WaveDescriptor> {
        self.round_trip().await?;
        self.check_channel(channel)?;
        let mut state = self.lock();
        state.call_log.push(format!("read_wave_descriptor {}", channel));
        ensure_connected(&state)?;
        Ok(self.descriptor(channel, &state))
    }

    async fn trigger(&self) -> AppResult<()> {
        self.round_trip().await?;
        let mut state = self.lock();
        state.call_log.push("trigger".to_string());
        ensure_connected(&state)?;
        state.triggers += 1;
        Ok(())
    }

    async fn read_waveform(&self, channel: ChannelId) -> AppResult<RawCapture> {
        self.round_trip().await?;
        self.check_channel(channel)?;
        let mut state = self.lock();
        state.call_log.push(format!("read_waveform {}", channel));
        ensure_connected(&state)?;

        let fault_matches = state
            .faults
            .front()
            .is_some_and(|fault| fault.channel.map_or(true, |c| c == channel));
        let fault = if fault_matches {
            state.faults.pop_front().map(|fault| fault.kind)
        } else if self.config.fault_rate > 0.0 && state.rng.gen_bool(self.config.fault_rate.min(1.0)) {
            Some(FaultKind::Transport)
        } else {
            None
        };

        if let Some(scripted) = state.scripted.get_mut(&channel).and_then(VecDeque::pop_front) {
            return match fault {
                Some(kind) => Err(fault_error(kind, channel)),
                None => Ok(scripted),
            };
        }

        let descriptor = self.descriptor(channel, &state);
        match fault {
            Some(FaultKind::Truncated) => {
                let samples = RawSamples::zeros(
                    descriptor.element_type,
                    (descriptor.num_samples_total as usize).saturating_sub(1),
                );
                Ok(RawCapture {
                    descriptor,
                    samples,
                })
            }
            Some(kind) => Err(fault_error(kind, channel)),
            None => {
                let record_length = state.record_length as usize;
                let sequence_count = state.sequence_count;
                let samples = synthesize(
                    descriptor.element_type,
                    record_length,
                    sequence_count,
                    descriptor.vertical_gain,
                    &mut state.rng,
                );
                Ok(RawCapture {
                    descriptor,
                    samples,
                })
            }
        }
    }

    fn identity(&self) -> String {
        format!(
            "MockScope at {} ({} channels, {} samples/trace)",
            self.config.address,
            self.config.channels.len(),
            self.config.record_length
        )
    }
}

fn fault_error(kind: FaultKind, channel: ChannelId) -> DaqError {
    match kind {
        FaultKind::Transport => DaqError::Transport(format!("connection reset while reading {}", channel)),
        FaultKind::Frame => DaqError::Frame(format!("bad block header for {}", channel)),
        FaultKind::Truncated => {
            DaqError::MalformedCapture(format!("short payload for {}", channel))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn calls_before_connect_fail_as_transport_errors() {
        let scope = MockScope::new();
        let err = scope.trigger().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn slow_answer_times_out_as_transport_error() {
        let scope = MockScope::with_config(MockScopeConfig {
            latency_ms: 50,
            timeout_ms: 5,
            address: "10.0.0.7".to_string(),
            ..Default::default()
        });
        let err = scope.connect().await.unwrap_err();
        assert!(matches!(err, DaqError::Transport(_)));
        assert!(err.to_string().contains("10.0.0.7"));
        assert!(scope.identity().contains("10.0.0.7"));
    }

    #[tokio::test]
    async fn latency_within_timeout_is_tolerated() {
        let scope = MockScope::with_config(MockScopeConfig {
            latency_ms: 1,
            timeout_ms: 1000,
            ..Default::default()
        });
        scope.connect().await.unwrap();
        scope.clear().await.unwrap();
    }

    #[tokio::test]
    async fn sequence_request_is_clamped_to_instrument_limit() {
        let scope = MockScope::with_config(MockScopeConfig {
            max_sequence: 2,
            ..Default::default()
        });
        scope.connect().await.unwrap();
        scope.configure_sequence(4).await.unwrap();
        let settings = scope.read_settings().await.unwrap();
        assert_eq!(settings[SEQUENCE_SETTING], "ON,2");

        scope.configure_sequence(1).await.unwrap();
        let settings = scope.read_settings().await.unwrap();
        assert_eq!(settings[SEQUENCE_SETTING], "OFF");
    }

    #[tokio::test]
    async fn synthetic_payload_matches_descriptor() {
        let scope = MockScope::with_config(MockScopeConfig {
            record_length: 100,
            kind: NumericKind::I8,
            ..Default::default()
        });
        scope.connect().await.unwrap();
        scope.configure_sequence(3).await.unwrap();
        scope.trigger().await.unwrap();
        let capture = scope.read_waveform(ChannelId(2)).await.unwrap();
        assert_eq!(capture.descriptor.num_samples_total, 300);
        assert_eq!(capture.samples.len(), 300);
        assert_eq!(capture.samples.kind(), NumericKind::I8);
        assert_eq!(capture.descriptor.sample_width_bytes, 1);
    }

    #[tokio::test]
    async fn queued_fault_fires_once_on_matching_channel() {
        let scope = MockScope::new();
        scope.connect().await.unwrap();
        scope.inject_fault_on(ChannelId(2), FaultKind::Frame);

        assert!(scope.read_waveform(ChannelId(1)).await.is_ok());
        let err = scope.read_waveform(ChannelId(2)).await.unwrap_err();
        assert!(matches!(err, DaqError::Frame(_)));
        assert!(scope.read_waveform(ChannelId(2)).await.is_ok());
    }

    #[tokio::test]
    async fn truncated_fault_returns_short_payload() {
        let scope = MockScope::new();
        scope.connect().await.unwrap();
        scope.inject_fault(FaultKind::Truncated);
        let capture = scope.read_waveform(ChannelId(1)).await.unwrap();
        assert_eq!(capture.samples.len() + 1, capture.descriptor.num_samples_total as usize);
    }

    #[tokio::test]
    async fn scripted_capture_replaces_synthetic_trace() {
        let scope = MockScope::new();
        scope.connect().await.unwrap();
        let descriptor = scope.read_wave_descriptor(ChannelId(1)).await.unwrap();
        let capture = RawCapture {
            descriptor: descriptor.for_trace(3),
            samples: RawSamples::I16(vec![1, 2, 3]),
        };
        scope.push_capture(ChannelId(1), capture.clone());
        assert_eq!(scope.read_waveform(ChannelId(1)).await.unwrap(), capture);
    }

    #[tokio::test]
    async fn unknown_channel_is_rejected() {
        let scope = MockScope::new();
        scope.connect().await.unwrap();
        assert!(matches!(
            scope.read_waveform(ChannelId(4)).await,
            Err(DaqError::Instrument(_))
        ));
    }
}
