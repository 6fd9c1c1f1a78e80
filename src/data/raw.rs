//! Raw trace encoder.
//!
//! `<prefix>.ch<N>.traces` is a plain concatenation of traces, each a packed
//! 37-byte header followed by the samples at native width:
//!
//! ```text
//! u32 num_samples | u8 width | f64 v_offset | f64 v_gain | f64 -h_offset | f64 h_interval
//! ```
//!
//! Everything is little-endian. No padding, no file header.

use crate::data::encoder::{channel_output_path, TraceSink};
use crate::error::{AppResult, DaqError};
use crate::waveform::{CaptureRecord, ChannelId, NumericKind, RawSamples, WaveDescriptor};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// File extension of raw trace outputs.
pub const RAW_EXTENSION: &str = "traces";

/// Per-trace header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawTraceHeader {
    /// Samples following the header.
    pub num_samples: u32,
    /// Width of one sample in bytes.
    pub sample_width_bytes: u8,
    /// Vertical offset.
    pub vertical_offset: f64,
    /// Vertical gain.
    pub vertical_gain: f64,
    /// Trigger time offset, already sign-inverted.
    pub horizontal_offset: f64,
    /// Sample interval.
    pub horizontal_interval: f64,
}

impl RawTraceHeader {
    /// Encoded size.
    pub const SIZE_BYTES: usize = 37;

    /// Header for a trace of `num_samples` described by `descriptor`.
    pub fn from_descriptor(descriptor: &WaveDescriptor, num_samples: u32) -> Self {
        Self {
            num_samples,
            sample_width_bytes: descriptor.sample_width_bytes,
            vertical_offset: descriptor.vertical_offset,
            vertical_gain: descriptor.vertical_gain,
            horizontal_offset: descriptor.time_offset(),
            horizontal_interval: descriptor.horizontal_interval,
        }
    }

    /// Encode, little-endian.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.num_samples)?;
        w.write_u8(self.sample_width_bytes)?;
        w.write_f64::<LittleEndian>(self.vertical_offset)?;
        w.write_f64::<LittleEndian>(self.vertical_gain)?;
        w.write_f64::<LittleEndian>(self.horizontal_offset)?;
        w.write_f64::<LittleEndian>(self.horizontal_interval)
    }

    /// Decode the next header. `None` on a clean end of file.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Option<Self>> {
        let mut buf = [0u8; Self::SIZE_BYTES];
        let mut filled = 0;
        while filled < buf.len() {
            let n = r.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("trace header cut short after {} bytes", filled),
            ));
        }

        let mut cursor = &buf[..];
        Ok(Some(Self {
            num_samples: cursor.read_u32::<LittleEndian>()?,
            sample_width_bytes: cursor.read_u8()?,
            vertical_offset: cursor.read_f64::<LittleEndian>()?,
            vertical_gain: cursor.read_f64::<LittleEndian>()?,
            horizontal_offset: cursor.read_f64::<LittleEndian>()?,
            horizontal_interval: cursor.read_f64::<LittleEndian>()?,
        }))
    }
}

/// Header plus samples for one trace.
pub fn write_trace<W: Write>(w: &mut W, record: &CaptureRecord) -> AppResult<()> {
    let num_samples = u32::try_from(record.trace_length()).map_err(|_| {
        DaqError::Capacity(format!(
            "{} samples do not fit a trace header",
            record.trace_length()
        ))
    })?;
    // the payload's own width, so the header always matches the bytes that follow
    let header = RawTraceHeader {
        sample_width_bytes: record.samples.kind().width(),
        ..RawTraceHeader::from_descriptor(&record.descriptor, num_samples)
    };
    header.write_to(w)?;
    record.samples.write_le(w)?;
    Ok(())
}

/// Appends headered traces to per-channel files.
pub struct RawEncoder {
    outputs: BTreeMap<ChannelId, BufWriter<File>>,
    paths: BTreeMap<ChannelId, PathBuf>,
    traces_written: u64,
}

impl RawEncoder {
    /// Create `<prefix>.ch<N>.traces` for every channel.
    pub fn create(prefix: &Path, channels: &[ChannelId]) -> AppResult<Self> {
        let mut outputs = BTreeMap::new();
        let mut paths = BTreeMap::new();
        for &channel in channels {
            let path = channel_output_path(prefix, channel, RAW_EXTENSION);
            let file = File::create(&path)?;
            info!("Writing {} traces to {}", channel, path.display());
            outputs.insert(channel, BufWriter::new(file));
            paths.insert(channel, path);
        }
        Ok(Self {
            outputs,
            paths,
            traces_written: 0,
        })
    }

    /// Output file of `channel`.
    pub fn path(&self, channel: ChannelId) -> Option<&Path> {
        self.paths.get(&channel).map(PathBuf::as_path)
    }

    /// Traces appended so far, across channels.
    pub fn traces_written(&self) -> u64 {
        self.traces_written
    }
}

impl TraceSink for RawEncoder {
    fn accept(&mut self, _event_index: u64, record: &CaptureRecord) -> AppResult<()> {
        let output = self.outputs.get_mut(&record.channel).ok_or_else(|| {
            DaqError::Storage(format!("no trace output for {}", record.channel))
        })?;
        write_trace(output, record)?;
        self.traces_written += 1;
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

/// Iterates the traces of a `.traces` file.
pub struct RawTraceReader<R> {
    reader: R,
    kind: Option<NumericKind>,
}

impl RawTraceReader<BufReader<File>> {
    /// Open a traces file.
    pub fn open(path: &Path) -> AppResult<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: Read> RawTraceReader<R> {
    /// Read from any byte source. Kinds are resolved from the header width.
    pub fn new(reader: R) -> Self {
        Self { reader, kind: None }
    }

    /// Decode samples as `kind` regardless of the header width (e.g. `f32`).
    pub fn with_kind(mut self, kind: NumericKind) -> Self {
        self.kind = Some(kind);
        self
    }

    fn next_trace(&mut self) -> AppResult<Option<(RawTraceHeader, RawSamples)>> {
        let Some(header) = RawTraceHeader::read_from(&mut self.reader)? else {
            return Ok(None);
        };
        let kind = match self.kind {
            Some(kind) => kind,
            None => NumericKind::from_width(header.sample_width_bytes).ok_or_else(|| {
                DaqError::Storage(format!(
                    "unsupported sample width {}",
                    header.sample_width_bytes
                ))
            })?,
        };
        if kind.width() != header.sample_width_bytes {
            return Err(DaqError::Storage(format!(
                "header width {} does not match {}",
                header.sample_width_bytes,
                kind.name()
            )));
        }
        let samples = RawSamples::read_le(kind, header.num_samples as usize, &mut self.reader)?;
        Ok(Some((header, samples)))
    }
}

impl<R: Read> Iterator for RawTraceReader<R> {
    type Item = AppResult<(RawTraceHeader, RawSamples)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_trace().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn record(channel: u8, samples: RawSamples) -> CaptureRecord {
        let kind = samples.kind();
        CaptureRecord {
            channel: ChannelId(channel),
            trace_index: 0,
            descriptor: WaveDescriptor {
                num_samples_total: samples.len() as u32,
                sample_width_bytes: kind.width(),
                vertical_offset: 0.25,
                vertical_gain: 0.004,
                horizontal_offset: -1.5e-8,
                horizontal_interval: 2e-10,
                element_type: kind,
            },
            samples,
        }
    }

    #[test]
    fn header_layout_is_packed_little_endian() {
        let rec = record(1, RawSamples::I8(vec![-1, 2, 3]));
        let mut buf = Vec::new();
        write_trace(&mut buf, &rec).unwrap();

        assert_eq!(buf.len(), RawTraceHeader::SIZE_BYTES + 3);
        assert_eq!(&buf[0..4], &3u32.to_le_bytes());
        assert_eq!(buf[4], 1);
        assert_eq!(&buf[5..13], &0.25f64.to_le_bytes());
        assert_eq!(&buf[21..29], &1.5e-8f64.to_le_bytes());
        assert_eq!(&buf[37..], &[0xff, 2, 3]);
    }

    #[test]
    fn reader_returns_every_trace_in_order() {
        let first = record(1, RawSamples::I16(vec![1, -2, 3]));
        let second = record(1, RawSamples::I16(vec![400, 500]));
        let mut buf = Vec::new();
        write_trace(&mut buf, &first).unwrap();
        write_trace(&mut buf, &second).unwrap();

        let traces: Vec<_> = RawTraceReader::new(Cursor::new(buf))
            .collect::<AppResult<_>>()
            .unwrap();
        assert_eq!(traces.len(), 2);
        assert_eq!(
            traces[0].0,
            RawTraceHeader::from_descriptor(&first.descriptor, 3)
        );
        assert_eq!(traces[0].0.horizontal_offset, 1.5e-8);
        assert_eq!(
            traces[1].0,
            RawTraceHeader::from_descriptor(&second.descriptor, 2)
        );
        assert_eq!(traces[0].1, first.samples);
        assert_eq!(traces[1].1, second.samples);
    }

    #[test]
    fn header_width_follows_payload() {
        let mut rec = record(1, RawSamples::I8(vec![1, 2, 3, 4]));
        rec.descriptor.sample_width_bytes = 2;
        let mut buf = Vec::new();
        write_trace(&mut buf, &rec).unwrap();
        assert_eq!(buf.len(), RawTraceHeader::SIZE_BYTES + 4);

        let (header, samples) = RawTraceReader::new(Cursor::new(buf))
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(header.sample_width_bytes, 1);
        assert_eq!(samples, RawSamples::I8(vec![1, 2, 3, 4]));
    }

    #[test]
    fn float_payload_needs_explicit_kind() {
        let rec = record(1, RawSamples::F32(vec![0.5, -1.25]));
        let mut buf = Vec::new();
        write_trace(&mut buf, &rec).unwrap();

        let (_, samples) = RawTraceReader::new(Cursor::new(buf))
            .with_kind(NumericKind::F32)
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(samples, rec.samples);
    }

    #[test]
    fn cut_short_header_is_an_error() {
        let mut reader = RawTraceReader::new(Cursor::new(vec![0u8; 10]));
        assert!(matches!(reader.next(), Some(Err(DaqError::Io(_)))));
        assert!(RawTraceReader::new(Cursor::new(Vec::new())).next().is_none());
    }

    #[test]
    fn encoder_writes_one_file_per_channel() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("pulses");
        let mut encoder = RawEncoder::create(&prefix, &[ChannelId(1), ChannelId(4)]).unwrap();
        encoder.accept(0, &record(1, RawSamples::I8(vec![1, 2]))).unwrap();
        encoder.accept(0, &record(4, RawSamples::I8(vec![3]))).unwrap();
        encoder.accept(1, &record(1, RawSamples::I8(vec![5]))).unwrap();
        encoder.finish().unwrap();
        assert_eq!(encoder.traces_written(), 3);

        let ch1 = RawTraceReader::open(&dir.path().join("pulses.ch1.traces")).unwrap();
        let lengths: Vec<u32> = ch1.map(|t| t.unwrap().0.num_samples).collect();
        assert_eq!(lengths, vec![2, 1]);
        let path = encoder.path(ChannelId(4)).unwrap().to_path_buf();
        assert_eq!(RawTraceReader::open(&path).unwrap().count(), 1);
    }
}
