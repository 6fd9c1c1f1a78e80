//! Run orchestration.
//!
//! A session takes a connected-or-not instrument from cold to a finished run:
//!
//! 1. connect and clear
//! 2. negotiate the sequence count
//! 3. list channels, snapshot settings and first descriptors
//! 4. validate run parameters against them and open the encoder
//! 5. run the acquisition loop and time it
//!
//! Every configuration error surfaces before the first trigger.

use crate::acquisition::run_loop::{AcquisitionLoop, AcquisitionReport, ProgressFn};
use crate::acquisition::sequence::{negotiate_sequence, SequenceNegotiation};
use crate::data::encoder::OutputEncoder;
use crate::data::raw::RawEncoder;
use crate::data::statistics::{StatisticsEncoder, StatisticsWindows};
use crate::data::tabular::{event_capacity, TabularEncoder};
use crate::data::tabular_store::TabularStore;
use crate::error::{AppResult, DaqError};
use crate::hardware::{InstrumentSettings, Oscilloscope};
use crate::waveform::{ChannelId, WaveDescriptor};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Run parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    /// Events to acquire.
    pub target_events: u64,
    /// Traces per trigger to ask for.
    pub requested_sequence: usize,
    /// Fail instead of warning when the instrument changes the sequence count.
    pub require_exact_sequence: bool,
    /// Pause before retrying a discarded trigger.
    pub retry_delay: Duration,
}

impl RunPlan {
    /// `target_events` single-trace events, no retry delay.
    pub fn new(target_events: u64, requested_sequence: usize) -> Self {
        Self {
            target_events,
            requested_sequence,
            require_exact_sequence: false,
            retry_delay: Duration::ZERO,
        }
    }

    /// Reject non-positive counts.
    pub fn validate(&self) -> AppResult<()> {
        if self.target_events == 0 {
            return Err(DaqError::Configuration(
                "number of events must be at least 1".to_string(),
            ));
        }
        if self.requested_sequence == 0 {
            return Err(DaqError::Configuration(
                "sequence count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where traces go.
pub enum OutputRequest {
    /// Growable datasets in one store.
    Tabular(Box<dyn TabularStore>),
    /// `<prefix>.ch<N>.crunch` statistics files.
    Statistics {
        /// Output prefix.
        prefix: PathBuf,
        /// Pedestal and signal windows.
        windows: StatisticsWindows,
    },
    /// `<prefix>.ch<N>.traces` raw files.
    Raw {
        /// Output prefix.
        prefix: PathBuf,
    },
}

/// Instrument state captured before the first trigger.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    /// Enabled channels in readout order.
    pub channels: Vec<ChannelId>,
    /// Negotiated sequence count.
    pub sequence: SequenceNegotiation,
    /// Settings snapshot taken after negotiation.
    pub settings: InstrumentSettings,
    /// Descriptor of each channel's current record.
    pub first_descriptors: BTreeMap<ChannelId, WaveDescriptor>,
}

impl PreparedRun {
    /// Per-trace length of `channel` from its first descriptor.
    pub fn trace_length(&self, channel: ChannelId) -> AppResult<usize> {
        let descriptor = self.first_descriptors.get(&channel).ok_or_else(|| {
            DaqError::Configuration(format!("no descriptor for channel {}", channel))
        })?;
        descriptor
            .trace_length(self.sequence.actual)
            .map_err(|e| DaqError::Configuration(format!("channel {}: {}", channel, e)))
    }

    /// Build the encoder for `request`, validating it against this run.
    pub fn open_encoder(&self, request: OutputRequest, target_events: u64) -> AppResult<OutputEncoder> {
        match request {
            OutputRequest::Tabular(store) => {
                let capacity = event_capacity(target_events, self.sequence.actual);
                let capacity = usize::try_from(capacity).map_err(|_| {
                    DaqError::Configuration(format!("{} events cannot be allocated", capacity))
                })?;
                Ok(OutputEncoder::Tabular(TabularEncoder::open(
                    store,
                    capacity,
                    self.sequence.actual,
                    &self.channels,
                    &self.first_descriptors,
                    &self.settings,
                )?))
            }
            OutputRequest::Statistics { prefix, windows } => {
                for &channel in &self.channels {
                    windows
                        .validate(self.trace_length(channel)?)
                        .map_err(|e| DaqError::Configuration(format!("channel {}: {}", channel, e)))?;
                }
                Ok(OutputEncoder::Statistics(StatisticsEncoder::create(
                    &prefix,
                    &self.channels,
                    windows,
                )?))
            }
            OutputRequest::Raw { prefix } => {
                Ok(OutputEncoder::Raw(RawEncoder::create(&prefix, &self.channels)?))
            }
        }
    }
}

/// Outcome of a whole session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionReport {
    /// Loop counters.
    pub acquisition: AcquisitionReport,
    /// Negotiated sequence count.
    pub sequence: SequenceNegotiation,
    /// Time spent in the acquisition loop.
    pub elapsed: Duration,
}

impl SessionReport {
    /// Mean loop time per completed event.
    pub fn seconds_per_acquisition(&self) -> f64 {
        if self.acquisition.events_completed == 0 {
            return 0.0;
        }
        self.elapsed.as_secs_f64() / self.acquisition.events_completed as f64
    }
}

/// Drives one instrument through one run.
pub struct AcquisitionSession<'a> {
    scope: &'a dyn Oscilloscope,
    plan: RunPlan,
    cancel: CancellationToken,
    progress: Option<ProgressFn>,
}

impl<'a> AcquisitionSession<'a> {
    /// Session for `plan` on `scope`.
    pub fn new(scope: &'a dyn Oscilloscope, plan: RunPlan) -> Self {
        Self {
            scope,
            plan,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Cancel the run from outside (e.g. on Ctrl-C).
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Progress callback, see [`AcquisitionLoop::with_progress`].
    pub fn with_progress(mut self, progress: impl FnMut(u64, u64) + Send + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Steps 1 to 3: bring the instrument up and snapshot its state.
    pub async fn prepare(&self) -> AppResult<PreparedRun> {
        self.plan.validate()?;
        self.scope.connect().await?;
        self.scope.clear().await?;
        info!("Connected to {}", self.scope.identity());

        let sequence = negotiate_sequence(
            self.scope,
            self.plan.requested_sequence,
            self.plan.require_exact_sequence,
        )
        .await?;

        let channels = self.scope.list_channels().await?;
        if channels.is_empty() {
            return Err(DaqError::Configuration(
                "instrument reports no enabled channels".to_string(),
            ));
        }
        let settings = self.scope.read_settings().await?;
        let mut first_descriptors = BTreeMap::new();
        for &channel in &channels {
            first_descriptors.insert(channel, self.scope.read_wave_descriptor(channel).await?);
        }

        let prepared = PreparedRun {
            channels,
            sequence,
            settings,
            first_descriptors,
        };
        for &channel in &prepared.channels {
            prepared.trace_length(channel)?;
        }
        Ok(prepared)
    }

    /// Prepare, open the output and acquire.
    pub async fn run(self, output: OutputRequest) -> AppResult<SessionReport> {
        let prepared = self.prepare().await?;
        let mut encoder = match prepared.open_encoder(output, self.plan.target_events) {
            Ok(encoder) => encoder,
            Err(e) => {
                if let Err(ce) = self.scope.clear().await {
                    warn!("Failed to clear instrument after error: {}", ce);
                }
                return Err(e);
            }
        };
        info!(
            "Writing {} output for channels {:?}",
            encoder.name(),
            prepared.channels
        );

        let mut acquisition =
            AcquisitionLoop::new(self.scope, prepared.channels.clone(), prepared.sequence.actual)
                .with_retry_delay(self.plan.retry_delay)
                .with_cancellation(self.cancel);
        if let Some(progress) = self.progress {
            acquisition = acquisition.with_progress(progress);
        }

        let start = Instant::now();
        let report = acquisition
            .run(self.plan.target_events, &mut encoder)
            .await?;
        let session = SessionReport {
            acquisition: report,
            sequence: prepared.sequence,
            elapsed: start.elapsed(),
        };
        info!(
            "Completed {} events in {:.3} seconds",
            report.events_completed,
            session.elapsed.as_secs_f64()
        );
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tabular_store::{AttrValue, MemoryStore};
    use crate::hardware::{MockScope, MockScopeConfig};

    fn scope(record_length: u32) -> MockScope {
        MockScope::with_config(MockScopeConfig {
            record_length,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn prepare_snapshots_instrument_state() {
        let scope = scope(100);
        let session = AcquisitionSession::new(&scope, RunPlan::new(10, 4));
        let prepared = session.prepare().await.unwrap();

        assert_eq!(prepared.channels, vec![ChannelId(1), ChannelId(2)]);
        assert_eq!(prepared.sequence.actual, 4);
        assert_eq!(prepared.settings.get("SEQUENCE").map(String::as_str), Some("ON,4"));
        assert_eq!(prepared.trace_length(ChannelId(2)).unwrap(), 100);
        assert_eq!(scope.trigger_count(), 0);
    }

    #[tokio::test]
    async fn zero_counts_are_rejected_before_connecting() {
        let scope = scope(100);
        for plan in [RunPlan::new(0, 1), RunPlan::new(5, 0)] {
            let err = AcquisitionSession::new(&scope, plan).prepare().await.unwrap_err();
            assert!(matches!(err, DaqError::Configuration(_)));
        }
        assert!(scope.call_log().is_empty());
    }

    #[tokio::test]
    async fn statistics_windows_are_checked_before_first_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let scope = scope(100);
        let session = AcquisitionSession::new(&scope, RunPlan::new(2, 1));
        let err = session
            .run(OutputRequest::Statistics {
                prefix: dir.path().join("run"),
                windows: StatisticsWindows::default(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DaqError::Configuration(_)));
        assert_eq!(scope.trigger_count(), 0);
        assert!(!dir.path().join("run.ch1.crunch").exists());
        assert_eq!(scope.call_log().last().map(String::as_str), Some("clear"));
    }

    #[tokio::test]
    async fn unwritable_output_clears_instrument() {
        let dir = tempfile::tempdir().unwrap();
        let scope = scope(100);
        let err = AcquisitionSession::new(&scope, RunPlan::new(2, 1))
            .run(OutputRequest::Raw {
                prefix: dir.path().join("missing").join("run"),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DaqError::Io(_)));
        assert_eq!(scope.trigger_count(), 0);
        assert_eq!(scope.call_log().last().map(String::as_str), Some("clear"));
    }

    #[tokio::test]
    async fn tabular_run_rounds_capacity_to_sequence() {
        let scope = scope(16);
        let store = MemoryStore::new();
        let session = AcquisitionSession::new(&scope, RunPlan::new(5, 2));
        let report = session
            .run(OutputRequest::Tabular(Box::new(store.clone())))
            .await
            .unwrap();

        assert_eq!(report.acquisition.events_completed, 6);
        assert_eq!(store.shape("c1_samples").map(|s| s.rows), Some(6));
        assert_eq!(store.file_attr("events_written"), Some(AttrValue::Int(6)));
        assert!(store.is_closed());
        assert!(report.seconds_per_acquisition() >= 0.0);
    }
}
