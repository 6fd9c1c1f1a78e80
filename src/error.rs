//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the acquisition
//! pipeline. Using the `thiserror` crate, it provides a centralized and consistent
//! way to handle the different kinds of failures that can occur, from bad run
//! parameters to a dropped instrument connection or a full disk.
//!
//! ## Error Hierarchy
//!
//! `DaqError` is an enum that consolidates various error sources:
//!
//! - **`Config`**: Wraps errors from `figment`, typically related to file parsing
//!   or type mismatches in the configuration layers.
//! - **`Configuration`**: Semantic errors in run parameters (bad window indices,
//!   non-positive counts, a refused sequence setting). Always reported before the
//!   first trigger is issued.
//! - **`Transport`** / **`Frame`** / **`MalformedCapture`**: Transient capture
//!   failures. The acquisition loop discards the in-flight trigger, clears the
//!   instrument and retries. See [`DaqError::is_transient`].
//! - **`Capacity`** / **`Storage`** / **`Io`**: Fatal output failures. The run is
//!   aborted, but everything already flushed stays on disk.
//! - **`Instrument`**: Any other driver failure. Fatal.
//! - **`RunAborted`**: A fatal error raised mid-run, carrying how many events had
//!   already been written.
//! - **`FeatureNotEnabled`**: Functionality (like the HDF5 backend) that was not
//!   compiled in via feature flags.
//!
//! By using `#[from]`, `DaqError` can be seamlessly created from underlying error
//! types, simplifying error handling with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors produced by the acquisition pipeline.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration source could not be loaded or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Run parameters are invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Connection-level failure talking to the instrument.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The instrument answered with a response that could not be decoded.
    #[error("Malformed frame: {0}")]
    Frame(String),

    /// A capture arrived but its sample payload cannot be split into traces.
    #[error("Malformed capture: {0}")]
    MalformedCapture(String),

    /// Output exceeded the space allocated for it.
    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    /// Tabular storage backend failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// File I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Instrument driver failure that is not worth retrying.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// A fatal error ended the acquisition loop after `events_completed` events.
    #[error("Run aborted after {events_completed} events: {source}")]
    RunAborted {
        /// Events fully written before the failure.
        events_completed: u64,
        /// What stopped the run.
        #[source]
        source: Box<DaqError>,
    },

    /// Functionality compiled out.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl DaqError {
    /// Whether the acquisition loop should discard the current trigger and retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DaqError::Transport(_) | DaqError::Frame(_) | DaqError::MalformedCapture(_)
        )
    }

    /// The underlying failure, looking through [`DaqError::RunAborted`].
    pub fn root(&self) -> &DaqError {
        match self {
            DaqError::RunAborted { source, .. } => source.root(),
            other => other,
        }
    }

    /// Events written before the run failed, if this error ended a run.
    pub fn events_completed(&self) -> Option<u64> {
        match self {
            DaqError::RunAborted {
                events_completed, ..
            } => Some(*events_completed),
            _ => None,
        }
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

#[cfg(feature = "storage_hdf5")]
impl From<hdf5::Error> for DaqError {
    fn from(value: hdf5::Error) -> Self {
        DaqError::Storage(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_frame_errors_are_transient() {
        assert!(DaqError::Transport("connection reset".into()).is_transient());
        assert!(DaqError::Frame("short header".into()).is_transient());
        assert!(DaqError::MalformedCapture("odd length".into()).is_transient());
    }

    #[test]
    fn output_and_configuration_errors_are_fatal() {
        assert!(!DaqError::Configuration("ped_end <= ped_start".into()).is_transient());
        assert!(!DaqError::Capacity("row 10 of 10".into()).is_transient());
        assert!(!DaqError::Storage("resize failed".into()).is_transient());
        assert!(!DaqError::Instrument("unsupported command".into()).is_transient());
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert!(!DaqError::from(io).is_transient());
    }

    #[test]
    fn messages_name_the_failure() {
        let err = DaqError::FeatureNotEnabled("storage_hdf5".into());
        assert_eq!(
            err.to_string(),
            "Feature 'storage_hdf5' is not enabled. Please build with --features storage_hdf5"
        );
        let err = DaqError::Capacity("row 12 exceeds 10 event slots".into());
        assert!(err.to_string().starts_with("Capacity exceeded"));
    }

    #[test]
    fn aborted_run_keeps_count_and_cause() {
        let err = DaqError::RunAborted {
            events_completed: 40,
            source: Box::new(DaqError::Storage("disk full".into())),
        };
        assert_eq!(err.events_completed(), Some(40));
        assert!(matches!(err.root(), DaqError::Storage(_)));
        assert!(!err.is_transient());
        assert_eq!(
            err.to_string(),
            "Run aborted after 40 events: Storage error: disk full"
        );
        assert_eq!(DaqError::Instrument("x".into()).events_completed(), None);
    }
}
