//! Acquisition loop.
//!
//! One trigger in flight at a time. Every channel is read for a trigger before
//! anything is delivered, so a trigger is either delivered whole or discarded
//! whole. Transient failures (see [`DaqError::is_transient`]) discard the
//! trigger, clear the instrument and retry; anything else ends the run.
//!
//! Finalization (sink `finish`, instrument `clear`) runs on every exit path.

use crate::data::encoder::TraceSink;
use crate::error::{AppResult, DaqError};
use crate::hardware::Oscilloscope;
use crate::waveform::{CaptureRecord, ChannelId};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of one trigger attempt.
#[derive(Debug)]
pub enum TriggerOutcome {
    /// Every channel answered; records in channel-then-trace order.
    Success(Vec<CaptureRecord>),
    /// A transient failure; nothing from this trigger may be delivered.
    Retry(DaqError),
}

/// Summary of a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquisitionReport {
    /// Events delivered to the sink. Always a multiple of the sequence count.
    pub events_completed: u64,
    /// Trigger attempts, including retried ones.
    pub triggers: u64,
    /// Triggers discarded after a transient failure.
    pub retries: u64,
    /// Whether the run stopped on cancellation.
    pub cancelled: bool,
}

/// Progress callback receiving `(completed, target)`.
pub type ProgressFn = Box<dyn FnMut(u64, u64) + Send>;

// Split a driver result into fatal errors (outer) and transient ones (inner).
fn transient<T>(result: AppResult<T>) -> AppResult<Result<T, DaqError>> {
    match result {
        Ok(value) => Ok(Ok(value)),
        Err(e) if e.is_transient() => Ok(Err(e)),
        Err(e) => Err(e),
    }
}

/// Triggers the instrument until the target event count is reached.
pub struct AcquisitionLoop<'a> {
    scope: &'a dyn Oscilloscope,
    channels: Vec<ChannelId>,
    sequence_count: usize,
    retry_delay: Duration,
    cancel: CancellationToken,
    progress: Option<ProgressFn>,
}

impl<'a> AcquisitionLoop<'a> {
    /// Loop over `channels`, expecting `sequence_count` traces per trigger.
    pub fn new(scope: &'a dyn Oscilloscope, channels: Vec<ChannelId>, sequence_count: usize) -> Self {
        Self {
            scope,
            channels,
            sequence_count: sequence_count.max(1),
            retry_delay: Duration::ZERO,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Pause between a failed trigger and its retry.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Stop at the next trigger boundary once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Called with `(completed, target)` after every delivered trigger.
    pub fn with_progress(mut self, progress: impl FnMut(u64, u64) + Send + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Token observed by this loop.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fire one trigger and read every channel.
    pub async fn capture_trigger(&self) -> AppResult<TriggerOutcome> {
        if let Err(e) = transient(self.scope.trigger().await)? {
            return Ok(TriggerOutcome::Retry(e));
        }

        let mut records = Vec::with_capacity(self.channels.len() * self.sequence_count);
        for &channel in &self.channels {
            let capture = match transient(self.scope.read_waveform(channel).await)? {
                Ok(capture) => capture,
                Err(e) => return Ok(TriggerOutcome::Retry(e)),
            };
            match transient(capture.split(channel, self.sequence_count))? {
                Ok(traces) => records.extend(traces),
                Err(e) => return Ok(TriggerOutcome::Retry(e)),
            }
        }
        Ok(TriggerOutcome::Success(records))
    }

    /// Acquire until `target` events are delivered or the token is cancelled.
    pub async fn run(&mut self, target: u64, sink: &mut dyn TraceSink) -> AppResult<AcquisitionReport> {
        let mut report = AcquisitionReport::default();
        info!(
            "Acquiring {} events on {} channels, {} per trigger",
            target,
            self.channels.len(),
            self.sequence_count
        );

        let result = self.acquire(target, sink, &mut report).await;
        let finished = sink.finish();
        let cleared = self.scope.clear().await;

        match result {
            Err(e) => {
                if let Err(fe) = finished {
                    warn!("Failed to finish outputs after error: {}", fe);
                }
                if let Err(ce) = cleared {
                    warn!("Failed to clear instrument after error: {}", ce);
                }
                error!(
                    "Acquisition failed after {} events, {} triggers: {}",
                    report.events_completed, report.triggers, e
                );
                Err(DaqError::RunAborted {
                    events_completed: report.events_completed,
                    source: Box::new(e),
                })
            }
            Ok(()) => {
                finished?;
                cleared?;
                info!(
                    "Acquisition finished: {} events, {} triggers, {} retries{}",
                    report.events_completed,
                    report.triggers,
                    report.retries,
                    if report.cancelled { " (cancelled)" } else { "" }
                );
                Ok(report)
            }
        }
    }

    async fn acquire(
        &mut self,
        target: u64,
        sink: &mut dyn TraceSink,
        report: &mut AcquisitionReport,
    ) -> AppResult<()> {
        let step = self.sequence_count as u64;

        while report.events_completed < target {
            if self.cancel.is_cancelled() {
                info!("Acquisition cancelled after {} events", report.events_completed);
                report.cancelled = true;
                return Ok(());
            }

            report.triggers += 1;
            match self.capture_trigger().await? {
                TriggerOutcome::Success(records) => {
                    for record in &records {
                        sink.accept(report.events_completed + record.trace_index as u64, record)?;
                    }
                    report.events_completed += step;
                    debug!("Trigger {} complete: {}/{} events", report.triggers, report.events_completed, target);
                    if let Some(progress) = self.progress.as_mut() {
                        progress(report.events_completed, target);
                    }
                }
                TriggerOutcome::Retry(reason) => {
                    report.retries += 1;
                    warn!("Discarding trigger {}: {}", report.triggers, reason);
                    if let Err(e) = transient(self.scope.clear().await)? {
                        warn!("Clear after failed trigger also failed: {}", e);
                    }
                    if !self.retry_delay.is_zero() {
                        tokio::select! {
                            _ = self.cancel.cancelled() => {}
                            _ = sleep(self.retry_delay) => {}
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{FaultKind, MockScope, MockScopeConfig};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct RecordingSink {
        delivered: Vec<(u64, ChannelId, usize)>,
        finished: u32,
        fail_at: Option<u64>,
    }

    impl TraceSink for RecordingSink {
        fn accept(&mut self, event_index: u64, record: &CaptureRecord) -> AppResult<()> {
            if self.fail_at == Some(event_index) {
                return Err(DaqError::Capacity("full".into()));
            }
            self.delivered
                .push((event_index, record.channel, record.trace_index));
            Ok(())
        }

        fn finish(&mut self) -> AppResult<()> {
            self.finished += 1;
            Ok(())
        }
    }

    async fn scope(record_length: u32, sequence: usize) -> MockScope {
        let scope = MockScope::with_config(MockScopeConfig {
            record_length,
            ..Default::default()
        });
        scope.connect().await.unwrap();
        scope.configure_sequence(sequence).await.unwrap();
        scope
    }

    #[tokio::test]
    async fn delivers_channel_then_trace_order() {
        let scope = scope(8, 2).await;
        let mut sink = RecordingSink::default();
        let mut acq = AcquisitionLoop::new(&scope, vec![ChannelId(1), ChannelId(2)], 2);

        let report = acq.run(4, &mut sink).await.unwrap();

        assert_eq!(report.events_completed, 4);
        assert_eq!(report.triggers, 2);
        assert_eq!(sink.finished, 1);
        assert_eq!(
            &sink.delivered[..4],
            &[
                (0, ChannelId(1), 0),
                (1, ChannelId(1), 1),
                (0, ChannelId(2), 0),
                (1, ChannelId(2), 1),
            ]
        );
        assert_eq!(sink.delivered[4], (2, ChannelId(1), 0));
    }

    #[tokio::test]
    #[traced_test]
    async fn transient_faults_are_retried_without_delivery() {
        let scope = scope(8, 1).await;
        scope.inject_fault(FaultKind::Transport);
        scope.inject_fault(FaultKind::Frame);
        scope.inject_fault(FaultKind::Truncated);
        let clears_before = scope.clear_count();

        let mut sink = RecordingSink::default();
        let mut acq = AcquisitionLoop::new(&scope, vec![ChannelId(1)], 1);
        let report = acq.run(1, &mut sink).await.unwrap();

        assert_eq!(report.events_completed, 1);
        assert_eq!(report.retries, 3);
        assert_eq!(report.triggers, 4);
        assert_eq!(sink.delivered, vec![(0, ChannelId(1), 0)]);
        // one clear per retry plus finalization
        assert_eq!(scope.clear_count() - clears_before, 4);
        assert!(logs_contain("Discarding trigger"));
    }

    #[tokio::test]
    async fn fatal_error_still_finalizes() {
        let scope = scope(8, 1).await;
        let mut sink = RecordingSink::default();
        let mut acq = AcquisitionLoop::new(&scope, vec![ChannelId(1), ChannelId(9)], 1);

        let err = acq.run(3, &mut sink).await.unwrap_err();
        assert!(matches!(err.root(), DaqError::Instrument(_)));
        assert_eq!(err.events_completed(), Some(0));
        assert!(sink.delivered.is_empty());
        assert_eq!(sink.finished, 1);
        assert_eq!(scope.call_log().last().map(String::as_str), Some("clear"));
    }

    #[tokio::test]
    #[traced_test]
    async fn sink_failure_ends_the_run() {
        let scope = scope(8, 1).await;
        let mut sink = RecordingSink {
            fail_at: Some(2),
            ..Default::default()
        };
        let mut acq = AcquisitionLoop::new(&scope, vec![ChannelId(1)], 1);
        let err = acq.run(5, &mut sink).await.unwrap_err();
        assert!(matches!(err.root(), DaqError::Capacity(_)));
        assert_eq!(err.events_completed(), Some(2));
        assert_eq!(sink.delivered.len(), 2);
        assert_eq!(sink.finished, 1);
        assert!(logs_contain("Acquisition failed after 2 events"));
    }

    #[tokio::test]
    async fn cancelled_token_stops_at_trigger_boundary() {
        let scope = scope(8, 2).await;
        let token = CancellationToken::new();
        let stopper = token.clone();
        let calls = Arc::new(AtomicU64::new(0));
        let seen = calls.clone();

        let mut sink = RecordingSink::default();
        let mut acq = AcquisitionLoop::new(&scope, vec![ChannelId(1)], 2)
            .with_cancellation(token)
            .with_progress(move |completed, target| {
                seen.fetch_add(1, Ordering::SeqCst);
                assert_eq!(target, 100);
                if completed >= 4 {
                    stopper.cancel();
                }
            });
        let report = acq.run(100, &mut sink).await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.events_completed, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(sink.finished, 1);
    }

    #[tokio::test]
    async fn capture_trigger_discards_partial_trigger() {
        let scope = scope(8, 1).await;
        scope.inject_fault_on(ChannelId(2), FaultKind::Transport);
        let acq = AcquisitionLoop::new(&scope, vec![ChannelId(1), ChannelId(2)], 1);

        assert!(matches!(
            acq.capture_trigger().await.unwrap(),
            TriggerOutcome::Retry(DaqError::Transport(_))
        ));
        match acq.capture_trigger().await.unwrap() {
            TriggerOutcome::Success(records) => assert_eq!(records.len(), 2),
            TriggerOutcome::Retry(e) => panic!("unexpected retry: {e}"),
        }
    }
}
