//! Acquisition pipeline: sequence negotiation, the trigger loop and run orchestration.

pub mod run_loop;
pub mod sequence;
pub mod session;

pub use run_loop::{AcquisitionLoop, AcquisitionReport, TriggerOutcome};
pub use sequence::{negotiate_sequence, SequenceNegotiation};
pub use session::{AcquisitionSession, OutputRequest, PreparedRun, RunPlan, SessionReport};
