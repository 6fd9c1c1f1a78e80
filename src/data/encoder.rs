//! Trace sinks.
//!
//! The acquisition loop hands every fully received trace to a [`TraceSink`].
//! The CLI picks one of the three file encoders at run time through
//! [`OutputEncoder`]; tests plug in their own sinks.

use crate::data::raw::RawEncoder;
use crate::data::statistics::StatisticsEncoder;
use crate::data::tabular::TabularEncoder;
use crate::error::AppResult;
use crate::waveform::{CaptureRecord, ChannelId};
use std::path::{Path, PathBuf};

/// Consumer of delivered traces.
pub trait TraceSink: Send {
    /// Accept one trace. `event_index` counts traces since the start of the run.
    fn accept(&mut self, event_index: u64, record: &CaptureRecord) -> AppResult<()>;

    /// Flush and release every output. Called exactly once per run.
    fn finish(&mut self) -> AppResult<()>;
}

/// Output format selected for a run.
pub enum OutputEncoder {
    /// One HDF5-style file with growable per-channel datasets.
    Tabular(TabularEncoder),
    /// Per-channel files of pedestal/signal statistics.
    Statistics(StatisticsEncoder),
    /// Per-channel files of headered raw traces.
    Raw(RawEncoder),
}

impl OutputEncoder {
    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            OutputEncoder::Tabular(_) => "tabular",
            OutputEncoder::Statistics(_) => "statistics",
            OutputEncoder::Raw(_) => "raw",
        }
    }
}

impl TraceSink for OutputEncoder {
    fn accept(&mut self, event_index: u64, record: &CaptureRecord) -> AppResult<()> {
        match self {
            OutputEncoder::Tabular(encoder) => encoder.accept(event_index, record),
            OutputEncoder::Statistics(encoder) => encoder.accept(event_index, record),
            OutputEncoder::Raw(encoder) => encoder.accept(event_index, record),
        }
    }

    fn finish(&mut self) -> AppResult<()> {
        match self {
            OutputEncoder::Tabular(encoder) => encoder.finish(),
            OutputEncoder::Statistics(encoder) => encoder.finish(),
            OutputEncoder::Raw(encoder) => encoder.finish(),
        }
    }
}

/// `<prefix>.ch<N>.<extension>`
pub fn channel_output_path(prefix: &Path, channel: ChannelId, extension: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(format!(".ch{}.{}", channel.number(), extension));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_paths_append_to_the_prefix() {
        let path = channel_output_path(Path::new("/data/run7"), ChannelId(3), "crunch");
        assert_eq!(path, PathBuf::from("/data/run7.ch3.crunch"));
        let path = channel_output_path(Path::new("cosmics.v2"), ChannelId(1), "traces");
        assert_eq!(path, PathBuf::from("cosmics.v2.ch1.traces"));
    }
}
