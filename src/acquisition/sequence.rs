//! Sequence-mode negotiation.
//!
//! Instruments clamp or ignore sequence requests they cannot honor, so the
//! count actually in effect is always read back from the settings rather than
//! trusted from the request.

use crate::error::{AppResult, DaqError};
use crate::hardware::{InstrumentSettings, Oscilloscope, SEQUENCE_SETTING};
use tracing::{info, warn};

/// Requested versus effective traces per trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceNegotiation {
    /// Count the caller asked for.
    pub requested: usize,
    /// Count the instrument reports.
    pub actual: usize,
}

impl SequenceNegotiation {
    /// Whether the instrument honored the request.
    pub fn is_exact(&self) -> bool {
        self.requested == self.actual
    }
}

/// Parse a `SEQUENCE` value of the form `<ON|OFF>[,<count>]`.
///
/// Anything but `ON` means one trace per trigger.
pub fn parse_sequence_setting(value: &str) -> AppResult<usize> {
    let mut fields = value.split(',').map(str::trim);
    let mode = fields.next().unwrap_or_default();
    if !mode.eq_ignore_ascii_case("ON") {
        return Ok(1);
    }
    let count = fields.next().ok_or_else(|| {
        DaqError::Configuration(format!("sequence setting '{}' has no count", value))
    })?;
    match count.parse::<usize>() {
        Ok(0) | Err(_) => Err(DaqError::Configuration(format!(
            "sequence setting '{}' has an invalid count",
            value
        ))),
        Ok(n) => Ok(n),
    }
}

/// Effective sequence count from a settings snapshot.
pub fn sequence_count(settings: &InstrumentSettings) -> AppResult<usize> {
    settings
        .get(SEQUENCE_SETTING)
        .map_or(Ok(1), |value| parse_sequence_setting(value))
}

/// Ask for `requested` traces per trigger and report what the instrument did.
///
/// A mismatch is a warning unless `require_exact` is set.
pub async fn negotiate_sequence(
    scope: &dyn Oscilloscope,
    requested: usize,
    require_exact: bool,
) -> AppResult<SequenceNegotiation> {
    if requested == 0 {
        return Err(DaqError::Configuration(
            "sequence count must be at least 1".to_string(),
        ));
    }
    scope.configure_sequence(requested).await?;
    let settings = scope.read_settings().await?;
    let negotiation = SequenceNegotiation {
        requested,
        actual: sequence_count(&settings)?,
    };

    if !negotiation.is_exact() {
        if require_exact {
            return Err(DaqError::Configuration(format!(
                "requested {} traces per trigger but the instrument uses {}",
                negotiation.requested, negotiation.actual
            )));
        }
        warn!(
            "Could not configure sequence mode properly: requested {}, instrument uses {}",
            negotiation.requested, negotiation.actual
        );
    }
    if negotiation.actual != 1 {
        info!(
            "Using sequence mode with {} traces per acquisition",
            negotiation.actual
        );
    }
    Ok(negotiation)
}
