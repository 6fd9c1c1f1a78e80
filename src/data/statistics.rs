//! Statistics encoder.
//!
//! Reduces every trace to pedestal and signal window summaries and appends them
//! to `<prefix>.ch<N>.crunch`, one 80-byte record per trace:
//!
//! ```text
//! ped_len*dt  sum(v_ped)*dt/R  min  max  stddev
//! win_len*dt  sum(v_win)*dt/R  min  max  stddev
//! ```
//!
//! Ten little-endian `f64`. Windows are half-open sample slices, while the
//! length field counts `end - start + 1` samples; downstream analysis expects
//! that convention.

use crate::data::encoder::{channel_output_path, TraceSink};
use crate::error::{AppResult, DaqError};
use crate::waveform::{CaptureRecord, ChannelId};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// File extension of statistics outputs.
pub const STATISTICS_EXTENSION: &str = "crunch";

/// Pedestal and signal windows plus the termination load.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatisticsWindows {
    /// First pedestal sample.
    pub ped_start: usize,
    /// One past the last pedestal sample.
    pub ped_end: usize,
    /// First signal sample.
    pub win_start: usize,
    /// One past the last signal sample.
    pub win_end: usize,
    /// Load resistance in ohms.
    pub load_ohms: f64,
}

impl Default for StatisticsWindows {
    fn default() -> Self {
        Self {
            ped_start: 0,
            ped_end: 2500,
            win_start: 2500,
            win_end: 10000,
            load_ohms: 50.0,
        }
    }
}

impl StatisticsWindows {
    /// Check window ordering and the load.
    pub fn validate_shape(&self) -> AppResult<()> {
        if self.ped_end <= self.ped_start {
            return Err(DaqError::Configuration(format!(
                "pedestal window [{}, {}) is empty",
                self.ped_start, self.ped_end
            )));
        }
        if self.win_end <= self.win_start {
            return Err(DaqError::Configuration(format!(
                "signal window [{}, {}) is empty",
                self.win_start, self.win_end
            )));
        }
        if !self.load_ohms.is_finite() || self.load_ohms <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "load must be positive, got {} ohms",
                self.load_ohms
            )));
        }
        Ok(())
    }

    /// Check the windows against a channel's trace length.
    pub fn validate(&self, trace_length: usize) -> AppResult<()> {
        self.validate_shape()?;
        if self.ped_end > trace_length {
            return Err(DaqError::Configuration(format!(
                "pedestal window ends at {} but traces hold {} samples",
                self.ped_end, trace_length
            )));
        }
        if self.win_end > trace_length {
            return Err(DaqError::Configuration(format!(
                "signal window ends at {} but traces hold {} samples",
                self.win_end, trace_length
            )));
        }
        Ok(())
    }
}

/// Summary of one window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    /// `(end - start + 1) * dt`
    pub duration: f64,
    /// Integrated charge estimate.
    pub charge: f64,
    /// Minimum voltage.
    pub min: f64,
    /// Maximum voltage.
    pub max: f64,
    /// Population standard deviation.
    pub stddev: f64,
}

/// One crunch record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatisticsRecord {
    /// Pedestal window.
    pub pedestal: WindowStats,
    /// Signal window.
    pub signal: WindowStats,
}

impl StatisticsRecord {
    /// Encoded size.
    pub const SIZE_BYTES: usize = 80;

    /// Field order on disk.
    pub fn to_fields(&self) -> [f64; 10] {
        let p = &self.pedestal;
        let s = &self.signal;
        [
            p.duration, p.charge, p.min, p.max, p.stddev, s.duration, s.charge, s.min, s.max,
            s.stddev,
        ]
    }

    /// Inverse of [`to_fields`](Self::to_fields).
    pub fn from_fields(f: [f64; 10]) -> Self {
        Self {
            pedestal: WindowStats {
                duration: f[0],
                charge: f[1],
                min: f[2],
                max: f[3],
                stddev: f[4],
            },
            signal: WindowStats {
                duration: f[5],
                charge: f[6],
                min: f[7],
                max: f[8],
                stddev: f[9],
            },
        }
    }

    /// Append the record, little-endian.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.to_fields()
            .iter()
            .try_for_each(|&v| w.write_f64::<LittleEndian>(v))
    }
}

fn clip(channel: ChannelId, name: &str, start: usize, end: usize, len: usize) -> AppResult<Range<usize>> {
    let range = start.min(len)..end.min(len);
    if range.end < end {
        warn!(
            "{}: {} window [{}, {}) clipped to {} samples",
            channel, name, start, end, len
        );
    }
    if range.is_empty() {
        return Err(DaqError::Configuration(format!(
            "{}: {} window [{}, {}) is outside a {}-sample trace",
            channel, name, start, end, len
        )));
    }
    Ok(range)
}

fn window_stats(record: &CaptureRecord, range: Range<usize>, nominal: usize, load: f64) -> WindowStats {
    let d = &record.descriptor;
    let dt = d.horizontal_interval;
    let volts: Vec<f64> = record
        .samples
        .values_f64(range)
        .into_iter()
        .map(|raw| raw * d.vertical_gain - d.vertical_offset)
        .collect();

    let n = volts.len() as f64;
    let sum: f64 = volts.iter().sum();
    let mean = sum / n;
    let variance = volts.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

    WindowStats {
        duration: nominal as f64 * dt,
        charge: sum * dt / load,
        min: volts.iter().copied().fold(f64::INFINITY, f64::min),
        max: volts.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        stddev: variance.sqrt(),
    }
}

/// Compute the pedestal and signal summaries of one trace.
pub fn reduce(record: &CaptureRecord, windows: &StatisticsWindows) -> AppResult<StatisticsRecord> {
    let len = record.trace_length();
    let ped = clip(record.channel, "pedestal", windows.ped_start, windows.ped_end, len)?;
    let win = clip(record.channel, "signal", windows.win_start, windows.win_end, len)?;

    Ok(StatisticsRecord {
        pedestal: window_stats(
            record,
            ped,
            windows.ped_end - windows.ped_start + 1,
            windows.load_ohms,
        ),
        signal: window_stats(
            record,
            win,
            windows.win_end - windows.win_start + 1,
            windows.load_ohms,
        ),
    })
}

/// Appends one statistics record per trace to per-channel files.
pub struct StatisticsEncoder {
    windows: StatisticsWindows,
    outputs: BTreeMap<ChannelId, BufWriter<File>>,
    paths: BTreeMap<ChannelId, PathBuf>,
    records_written: u64,
}

impl StatisticsEncoder {
    /// Create `<prefix>.ch<N>.crunch` for every channel.
    pub fn create(prefix: &Path, channels: &[ChannelId], windows: StatisticsWindows) -> AppResult<Self> {
        windows.validate_shape()?;
        let mut outputs = BTreeMap::new();
        let mut paths = BTreeMap::new();
        for &channel in channels {
            let path = channel_output_path(prefix, channel, STATISTICS_EXTENSION);
            let file = File::create(&path)?;
            info!("Writing {} statistics to {}", channel, path.display());
            outputs.insert(channel, BufWriter::new(file));
            paths.insert(channel, path);
        }
        Ok(Self {
            windows,
            outputs,
            paths,
            records_written: 0,
        })
    }

    /// Output file of `channel`.
    pub fn path(&self, channel: ChannelId) -> Option<&Path> {
        self.paths.get(&channel).map(PathBuf::as_path)
    }

    /// Records appended so far, across channels.
    pub fn records_written(&self) -> u64 {
        self.records_written
    }
}

impl TraceSink for StatisticsEncoder {
    fn accept(&mut self, _event_index: u64, record: &CaptureRecord) -> AppResult<()> {
        let stats = reduce(record, &self.windows)?;
        let output = self.outputs.get_mut(&record.channel).ok_or_else(|| {
            DaqError::Storage(format!("no statistics output for {}", record.channel))
        })?;
        stats.write_to(output)?;
        self.records_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> AppResult<()> {
        let mut first_error = None;
        for (_, mut output) in std::mem::take(&mut self.outputs) {
            if let Err(e) = output.flush() {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

/// Read every record of a crunch file.
pub fn read_statistics(path: &Path) -> AppResult<Vec<StatisticsRecord>> {
    let mut bytes = Vec::new();
    BufReader::new(File::open(path)?).read_to_end(&mut bytes)?;
    if bytes.len() % StatisticsRecord::SIZE_BYTES != 0 {
        return Err(DaqError::Storage(format!(
            "{}: {} bytes is not a whole number of records",
            path.display(),
            bytes.len()
        )));
    }
    let mut records = Vec::with_capacity(bytes.len() / StatisticsRecord::SIZE_BYTES);
    for chunk in bytes.chunks_exact(StatisticsRecord::SIZE_BYTES) {
        let mut fields = [0.0; 10];
        (&chunk[..]).read_f64_into::<LittleEndian>(&mut fields)?;
        records.push(StatisticsRecord::from_fields(fields));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveform::{NumericKind, RawSamples, WaveDescriptor};
    use tempfile::tempdir;
    use tracing_test::traced_test;

    fn unit_record(samples: Vec<i16>) -> CaptureRecord {
        CaptureRecord {
            channel: ChannelId(1),
            trace_index: 0,
            descriptor: WaveDescriptor {
                num_samples_total: samples.len() as u32,
                sample_width_bytes: 2,
                vertical_offset: 0.0,
                vertical_gain: 1.0,
                horizontal_offset: 0.0,
                horizontal_interval: 1.0,
                element_type: NumericKind::I16,
            },
            samples: RawSamples::I16(samples),
        }
    }

    fn windows(ped: (usize, usize), win: (usize, usize), load: f64) -> StatisticsWindows {
        StatisticsWindows {
            ped_start: ped.0,
            ped_end: ped.1,
            win_start: win.0,
            win_end: win.1,
            load_ohms: load,
        }
    }

    #[test]
    fn literal_trace_reduces_to_exact_values() {
        let record = unit_record(vec![10, 20, 30, 40]);
        let stats = reduce(&record, &windows((0, 2), (2, 4), 1.0)).unwrap();

        assert_eq!(
            stats.pedestal,
            WindowStats {
                duration: 3.0,
                charge: 30.0,
                min: 10.0,
                max: 20.0,
                stddev: 5.0,
            }
        );
        assert_eq!(
            stats.signal,
            WindowStats {
                duration: 3.0,
                charge: 70.0,
                min: 30.0,
                max: 40.0,
                stddev: 5.0,
            }
        );
    }

    #[test]
    fn scaling_applies_gain_offset_and_load() {
        let mut record = unit_record(vec![100, 100, 300, 100]);
        record.descriptor.vertical_gain = 0.5;
        record.descriptor.vertical_offset = 50.0;
        record.descriptor.horizontal_interval = 2.0;
        let stats = reduce(&record, &windows((0, 2), (2, 3), 4.0)).unwrap();

        // v = raw * 0.5 - 50
        assert_eq!(stats.pedestal.charge, 0.0);
        assert_eq!(stats.pedestal.duration, 6.0);
        assert_eq!(stats.signal.min, 100.0);
        assert_eq!(stats.signal.charge, 100.0 * 2.0 / 4.0);
        assert_eq!(stats.signal.stddev, 0.0);
    }

    #[test]
    fn validation_rejects_bad_windows() {
        assert!(windows((0, 2), (2, 4), 1.0).validate(4).is_ok());
        for bad in [
            windows((2, 2), (2, 4), 1.0),
            windows((0, 2), (4, 3), 1.0),
            windows((0, 5), (2, 4), 1.0),
            windows((0, 2), (2, 5), 1.0),
            windows((0, 2), (2, 4), 0.0),
            windows((0, 2), (2, 4), f64::NAN),
        ] {
            assert!(matches!(bad.validate(4), Err(DaqError::Configuration(_))));
        }
    }

    #[test]
    #[traced_test]
    fn short_trace_clips_window() {
        let record = unit_record(vec![1, 2, 3]);
        let stats = reduce(&record, &windows((0, 1), (1, 10), 1.0)).unwrap();
        assert_eq!(stats.signal.max, 3.0);
        assert_eq!(stats.signal.duration, 10.0);
        assert!(logs_contain("clipped"));

        let err = reduce(&record, &windows((0, 1), (5, 10), 1.0)).unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[test]
    fn encoder_appends_records_per_channel() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("run");
        let mut encoder =
            StatisticsEncoder::create(&prefix, &[ChannelId(1), ChannelId(2)], windows((0, 2), (2, 4), 1.0))
                .unwrap();

        let first = unit_record(vec![10, 20, 30, 40]);
        let mut second = unit_record(vec![0, 0, 1, 1]);
        second.channel = ChannelId(2);
        encoder.accept(0, &first).unwrap();
        encoder.accept(0, &second).unwrap();
        encoder.accept(1, &first).unwrap();
        encoder.finish().unwrap();
        assert_eq!(encoder.records_written(), 3);

        let ch1 = read_statistics(&dir.path().join("run.ch1.crunch")).unwrap();
        let ch2 = read_statistics(&dir.path().join("run.ch2.crunch")).unwrap();
        assert_eq!(ch1.len(), 2);
        assert_eq!(ch2.len(), 1);
        assert_eq!(ch1[0].to_fields(), [3.0, 30.0, 10.0, 20.0, 5.0, 3.0, 70.0, 30.0, 40.0, 5.0]);
        assert_eq!(ch2[0].signal.charge, 2.0);

        let bytes = std::fs::metadata(dir.path().join("run.ch1.crunch")).unwrap().len();
        assert_eq!(bytes, 2 * StatisticsRecord::SIZE_BYTES as u64);
    }

    #[test]
    fn truncated_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.ch1.crunch");
        std::fs::write(&path, [0u8; 81]).unwrap();
        assert!(matches!(read_statistics(&path), Err(DaqError::Storage(_))));
    }
}
