//! Waveform data model shared by the driver seam, the acquisition loop and the encoders.
//!
//! An oscilloscope answers every capture request with a [`WaveDescriptor`] (scaling,
//! timing and length metadata) and a typed sample payload ([`RawSamples`]). In
//! sequence mode one payload holds several back-to-back traces; [`RawCapture::split`]
//! turns it into one [`CaptureRecord`] per trace.
//!
//! Samples are kept in the instrument's native integer or float representation until
//! an encoder decides what to do with them. Only the statistics encoder applies
//! `raw * vertical_gain - vertical_offset`.

use crate::error::{AppResult, DaqError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};
use std::ops::Range;

/// Instrument channel number as reported by the oscilloscope (C1, C2, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u8);

impl ChannelId {
    /// Numeric channel index.
    pub fn number(self) -> u8 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// Element type of a raw sample payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumericKind {
    /// Signed byte samples (8-bit ADC readout).
    I8,
    /// Signed 16-bit samples (word readout).
    I16,
    /// Signed 32-bit samples.
    I32,
    /// Single precision float samples.
    F32,
    /// Double precision float samples.
    F64,
}

impl NumericKind {
    /// Size of one sample in bytes.
    pub fn width(self) -> u8 {
        match self {
            NumericKind::I8 => 1,
            NumericKind::I16 => 2,
            NumericKind::I32 | NumericKind::F32 => 4,
            NumericKind::F64 => 8,
        }
    }

    /// Resolve the kind stored in a raw trace header.
    ///
    /// The header only records the width, so 4 bytes is read back as `i32`.
    pub fn from_width(width: u8) -> Option<Self> {
        match width {
            1 => Some(NumericKind::I8),
            2 => Some(NumericKind::I16),
            4 => Some(NumericKind::I32),
            8 => Some(NumericKind::F64),
            _ => None,
        }
    }

    /// Short lowercase name, used for dataset attributes.
    pub fn name(self) -> &'static str {
        match self {
            NumericKind::I8 => "i8",
            NumericKind::I16 => "i16",
            NumericKind::I32 => "i32",
            NumericKind::F32 => "f32",
            NumericKind::F64 => "f64",
        }
    }
}

/// Per-capture metadata needed to interpret raw samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaveDescriptor {
    /// Samples in the payload, before any sequence split.
    pub num_samples_total: u32,
    /// Width of one sample in bytes.
    pub sample_width_bytes: u8,
    /// Vertical offset in volts.
    pub vertical_offset: f64,
    /// Volts per raw count.
    pub vertical_gain: f64,
    /// Horizontal offset in seconds, as reported by the instrument.
    pub horizontal_offset: f64,
    /// Seconds between samples.
    pub horizontal_interval: f64,
    /// Sample element type.
    pub element_type: NumericKind,
}

impl WaveDescriptor {
    /// Length of one trace when the payload carries `sequence_count` traces.
    pub fn trace_length(&self, sequence_count: usize) -> AppResult<usize> {
        if sequence_count == 0 {
            return Err(DaqError::Configuration(
                "sequence count must be at least 1".to_string(),
            ));
        }
        let total = self.num_samples_total as usize;
        if total < sequence_count || total % sequence_count != 0 {
            return Err(DaqError::MalformedCapture(format!(
                "{} samples cannot be split into {} traces",
                total, sequence_count
            )));
        }
        Ok(total / sequence_count)
    }

    /// Copy of this descriptor describing a single trace of `trace_length` samples.
    pub fn for_trace(&self, trace_length: usize) -> WaveDescriptor {
        WaveDescriptor {
            num_samples_total: trace_length as u32,
            ..*self
        }
    }

    /// Trigger time offset with the sign convention used in every output file.
    pub fn time_offset(&self) -> f64 {
        -self.horizontal_offset
    }
}

// Rebuild the same variant from a per-variant expression.
macro_rules! map_samples {
    ($samples:expr, $v:ident => $body:expr) => {
        match $samples {
            RawSamples::I8($v) => RawSamples::I8($body),
            RawSamples::I16($v) => RawSamples::I16($body),
            RawSamples::I32($v) => RawSamples::I32($body),
            RawSamples::F32($v) => RawSamples::F32($body),
            RawSamples::F64($v) => RawSamples::F64($body),
        }
    };
}

/// Typed raw sample payload, exactly as read from the instrument.
#[derive(Debug, Clone, PartialEq)]
pub enum RawSamples {
    /// 8-bit samples.
    I8(Vec<i8>),
    /// 16-bit samples.
    I16(Vec<i16>),
    /// 32-bit integer samples.
    I32(Vec<i32>),
    /// 32-bit float samples.
    F32(Vec<f32>),
    /// 64-bit float samples.
    F64(Vec<f64>),
}

impl RawSamples {
    /// Zero-filled payload of the given kind.
    pub fn zeros(kind: NumericKind, len: usize) -> Self {
        match kind {
            NumericKind::I8 => RawSamples::I8(vec![0; len]),
            NumericKind::I16 => RawSamples::I16(vec![0; len]),
            NumericKind::I32 => RawSamples::I32(vec![0; len]),
            NumericKind::F32 => RawSamples::F32(vec![0.0; len]),
            NumericKind::F64 => RawSamples::F64(vec![0.0; len]),
        }
    }

    /// Element type of this payload.
    pub fn kind(&self) -> NumericKind {
        match self {
            RawSamples::I8(_) => NumericKind::I8,
            RawSamples::I16(_) => NumericKind::I16,
            RawSamples::I32(_) => NumericKind::I32,
            RawSamples::F32(_) => NumericKind::F32,
            RawSamples::F64(_) => NumericKind::F64,
        }
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        match self {
            RawSamples::I8(v) => v.len(),
            RawSamples::I16(v) => v.len(),
            RawSamples::I32(v) => v.len(),
            RawSamples::F32(v) => v.len(),
            RawSamples::F64(v) => v.len(),
        }
    }

    /// True when the payload holds no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw values in `range` widened to `f64`. Every supported kind converts exactly.
    pub fn values_f64(&self, range: Range<usize>) -> Vec<f64> {
        match self {
            RawSamples::I8(v) => v[range].iter().map(|&x| f64::from(x)).collect(),
            RawSamples::I16(v) => v[range].iter().map(|&x| f64::from(x)).collect(),
            RawSamples::I32(v) => v[range].iter().map(|&x| f64::from(x)).collect(),
            RawSamples::F32(v) => v[range].iter().map(|&x| f64::from(x)).collect(),
            RawSamples::F64(v) => v[range].to_vec(),
        }
    }

    /// Copy of the samples in `range`.
    pub fn slice(&self, range: Range<usize>) -> RawSamples {
        map_samples!(self, v => v[range.clone()].to_vec())
    }

    /// Copy left-aligned into `width` samples, zero-filling the tail.
    ///
    /// Payloads already at least `width` long are returned unchanged.
    pub fn zero_padded(&self, width: usize) -> RawSamples {
        map_samples!(self, v => {
            let mut padded = v.clone();
            if padded.len() < width {
                padded.resize(width, Default::default());
            }
            padded
        })
    }

    /// Serialize every sample at native width, little-endian.
    pub fn write_le<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            RawSamples::I8(v) => v.iter().try_for_each(|&x| w.write_i8(x)),
            RawSamples::I16(v) => v.iter().try_for_each(|&x| w.write_i16::<LittleEndian>(x)),
            RawSamples::I32(v) => v.iter().try_for_each(|&x| w.write_i32::<LittleEndian>(x)),
            RawSamples::F32(v) => v.iter().try_for_each(|&x| w.write_f32::<LittleEndian>(x)),
            RawSamples::F64(v) => v.iter().try_for_each(|&x| w.write_f64::<LittleEndian>(x)),
        }
    }

    /// Read `len` little-endian samples of `kind`.
    pub fn read_le<R: Read>(kind: NumericKind, len: usize, r: &mut R) -> io::Result<Self> {
        let mut samples = RawSamples::zeros(kind, len);
        match &mut samples {
            RawSamples::I8(v) => r.read_i8_into(v)?,
            RawSamples::I16(v) => r.read_i16_into::<LittleEndian>(v)?,
            RawSamples::I32(v) => r.read_i32_into::<LittleEndian>(v)?,
            RawSamples::F32(v) => r.read_f32_into::<LittleEndian>(v)?,
            RawSamples::F64(v) => r.read_f64_into::<LittleEndian>(v)?,
        }
        Ok(samples)
    }
}

/// One channel's answer to a trigger: descriptor plus the full payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCapture {
    /// Descriptor reported with the payload.
    pub descriptor: WaveDescriptor,
    /// Payload covering every trace of the trigger.
    pub samples: RawSamples,
}

impl RawCapture {
    /// Split the payload into `sequence_count` equal traces.
    ///
    /// Fails with [`DaqError::MalformedCapture`] if the payload disagrees with its
    /// descriptor or cannot be divided evenly.
    pub fn split(self, channel: ChannelId, sequence_count: usize) -> AppResult<Vec<CaptureRecord>> {
        let expected = self.descriptor.num_samples_total as usize;
        if self.samples.len() != expected {
            return Err(DaqError::MalformedCapture(format!(
                "{}: descriptor announces {} samples but {} arrived",
                channel,
                expected,
                self.samples.len()
            )));
        }
        if self.samples.kind() != self.descriptor.element_type {
            return Err(DaqError::MalformedCapture(format!(
                "{}: descriptor announces {} samples but payload is {}",
                channel,
                self.descriptor.element_type.name(),
                self.samples.kind().name()
            )));
        }
        if self.descriptor.sample_width_bytes != self.descriptor.element_type.width() {
            return Err(DaqError::MalformedCapture(format!(
                "{}: descriptor announces {}-byte samples for {}",
                channel,
                self.descriptor.sample_width_bytes,
                self.descriptor.element_type.name()
            )));
        }
        let trace_length = self.descriptor.trace_length(sequence_count)?;
        let descriptor = self.descriptor.for_trace(trace_length);

        if sequence_count == 1 {
            return Ok(vec![CaptureRecord {
                channel,
                trace_index: 0,
                descriptor,
                samples: self.samples,
            }]);
        }

        Ok((0..sequence_count)
            .map(|trace_index| {
                let start = trace_index * trace_length;
                CaptureRecord {
                    channel,
                    trace_index,
                    descriptor,
                    samples: self.samples.slice(start..start + trace_length),
                }
            })
            .collect())
    }
}

/// One logical trace, ready for exactly one encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRecord {
    /// Channel the trace came from.
    pub channel: ChannelId,
    /// Position of this trace within its trigger.
    pub trace_index: usize,
    /// Descriptor scaled to this trace.
    pub descriptor: WaveDescriptor,
    /// The trace's raw samples.
    pub samples: RawSamples,
}

impl CaptureRecord {
    /// Number of samples in this trace.
    pub fn trace_length(&self) -> usize {
        self.samples.len()
    }
}
