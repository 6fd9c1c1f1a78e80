//! Tabular encoder.
//!
//! Lays a run out as one file with, per channel:
//!
//! | dataset | shape | contents |
//! |---|---|---|
//! | `c<N>_samples` | events x width | raw samples, zero-padded on the right |
//! | `c<N>_vert_offset` | events | vertical offset |
//! | `c<N>_vert_scale` | events | vertical gain |
//! | `c<N>_horiz_offset` | events | trigger time offset (sign-inverted) |
//! | `c<N>_horiz_scale` | events | sample interval |
//! | `c<N>_num_samples` | events | true, unpadded trace length |
//!
//! The samples width starts at the first trace length and only ever grows. When a
//! wider trace arrives every row is widened; rows already written keep their
//! samples and their recorded length.

use crate::data::encoder::TraceSink;
use crate::data::tabular_store::{AttrValue, DatasetShape, TabularStore};
use crate::error::{AppResult, DaqError};
use crate::hardware::InstrumentSettings;
use crate::waveform::{CaptureRecord, ChannelId, NumericKind, WaveDescriptor};
use std::collections::BTreeMap;
use tracing::{debug, info};

const METADATA_SUFFIXES: [&str; 5] = [
    "vert_offset",
    "vert_scale",
    "horiz_offset",
    "horiz_scale",
    "num_samples",
];

/// Dataset name for one channel, e.g. `c2_vert_scale`.
pub fn dataset_name(channel: ChannelId, suffix: &str) -> String {
    format!("c{}_{}", channel.number(), suffix)
}

/// Number of rows to allocate for `target` events in steps of `sequence_count`.
pub fn event_capacity(target: u64, sequence_count: usize) -> u64 {
    let step = sequence_count.max(1) as u64;
    target.div_ceil(step) * step
}

/// Writes traces into growable per-channel datasets.
pub struct TabularEncoder {
    store: Box<dyn TabularStore>,
    event_capacity: usize,
    kinds: BTreeMap<ChannelId, NumericKind>,
    current_dimension: BTreeMap<ChannelId, usize>,
    rows_written: usize,
    finished: bool,
}

impl TabularEncoder {
    /// Create every dataset and record the instrument settings.
    pub fn open(
        mut store: Box<dyn TabularStore>,
        event_capacity: usize,
        sequence_count: usize,
        channels: &[ChannelId],
        first_descriptors: &BTreeMap<ChannelId, WaveDescriptor>,
        settings: &InstrumentSettings,
    ) -> AppResult<Self> {
        for (key, value) in settings {
            if !store.set_file_attr(key, &AttrValue::Text(value.clone()))? {
                debug!("Skipping unrepresentable setting {}", key);
            }
        }

        let mut kinds = BTreeMap::new();
        let mut current_dimension = BTreeMap::new();
        for &channel in channels {
            let descriptor = first_descriptors.get(&channel).ok_or_else(|| {
                DaqError::Configuration(format!("no descriptor for channel {}", channel))
            })?;
            let width = descriptor.trace_length(sequence_count).map_err(|e| {
                DaqError::Configuration(format!("channel {}: {}", channel, e))
            })?;

            let samples = dataset_name(channel, "samples");
            store.create_dataset(
                &samples,
                DatasetShape::matrix(event_capacity, width),
                descriptor.element_type,
            )?;
            for (key, value) in descriptor_attrs(descriptor) {
                if !store.set_dataset_attr(&samples, key, &value)? {
                    debug!("Skipping unrepresentable attribute {} on {}", key, samples);
                }
            }
            for suffix in METADATA_SUFFIXES {
                store.create_dataset(
                    &dataset_name(channel, suffix),
                    DatasetShape::vector(event_capacity),
                    NumericKind::F64,
                )?;
            }

            kinds.insert(channel, descriptor.element_type);
            current_dimension.insert(channel, width);
        }

        info!(
            "Tabular output ready: {} channels, {} event slots",
            channels.len(),
            event_capacity
        );

        Ok(Self {
            store,
            event_capacity,
            kinds,
            current_dimension,
            rows_written: 0,
            finished: false,
        })
    }

    /// Current samples width of `channel`.
    pub fn current_dimension(&self, channel: ChannelId) -> Option<usize> {
        self.current_dimension.get(&channel).copied()
    }

    /// Number of rows allocated per dataset.
    pub fn event_capacity(&self) -> usize {
        self.event_capacity
    }

    /// Widen `channel`'s samples dataset to at least `width` columns.
    ///
    /// Returns whether a resize happened. Never shrinks.
    pub fn grow(&mut self, channel: ChannelId, width: usize) -> AppResult<bool> {
        let current = self.current_dimension(channel).ok_or_else(|| {
            DaqError::Storage(format!("channel {} has no datasets", channel))
        })?;
        if width <= current {
            return Ok(false);
        }
        self.store
            .resize_columns(&dataset_name(channel, "samples"), width)?;
        self.current_dimension.insert(channel, width);
        info!("Widened {} samples from {} to {}", channel, current, width);
        Ok(true)
    }

    /// Store one trace in row `event_index`.
    pub fn write(&mut self, event_index: usize, record: &CaptureRecord) -> AppResult<()> {
        if event_index >= self.event_capacity {
            return Err(DaqError::Capacity(format!(
                "event {} exceeds {} allocated rows",
                event_index, self.event_capacity
            )));
        }
        let channel = record.channel;
        match self.kinds.get(&channel) {
            None => {
                return Err(DaqError::Storage(format!(
                    "channel {} has no datasets",
                    channel
                )))
            }
            Some(&kind) if kind != record.samples.kind() => {
                return Err(DaqError::Storage(format!(
                    "channel {} switched from {} to {} samples",
                    channel,
                    kind.name(),
                    record.samples.kind().name()
                )))
            }
            Some(_) => {}
        }

        let length = record.trace_length();
        self.grow(channel, length)?;
        let width = self.current_dimension(channel).unwrap_or(length);

        self.store.write_row(
            &dataset_name(channel, "samples"),
            event_index,
            &record.samples.zero_padded(width),
        )?;

        let d = &record.descriptor;
        let values = [
            d.vertical_offset,
            d.vertical_gain,
            d.time_offset(),
            d.horizontal_interval,
            length as f64,
        ];
        for (suffix, value) in METADATA_SUFFIXES.iter().zip(values) {
            self.store
                .write_value(&dataset_name(channel, suffix), event_index, value)?;
        }

        self.rows_written = self.rows_written.max(event_index + 1);
        Ok(())
    }

    /// Record the row count and close the store. Safe to call twice.
    pub fn finish(&mut self) -> AppResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.store
            .set_file_attr("events_written", &AttrValue::Int(self.rows_written as i64))?;
        self.store.close()
    }
}

impl TraceSink for TabularEncoder {
    fn accept(&mut self, event_index: u64, record: &CaptureRecord) -> AppResult<()> {
        let row = usize::try_from(event_index).map_err(|_| {
            DaqError::Capacity(format!("event {} is not addressable", event_index))
        })?;
        self.write(row, record)
    }

    fn finish(&mut self) -> AppResult<()> {
        TabularEncoder::finish(self)
    }
}

fn descriptor_attrs(d: &WaveDescriptor) -> [(&'static str, AttrValue); 7] {
    [
        ("vertical_gain", AttrValue::Float(d.vertical_gain)),
        ("vertical_offset", AttrValue::Float(d.vertical_offset)),
        ("horizontal_interval", AttrValue::Float(d.horizontal_interval)),
        ("horizontal_offset", AttrValue::Float(d.horizontal_offset)),
        ("num_samples_total", AttrValue::Int(i64::from(d.num_samples_total))),
        ("sample_width_bytes", AttrValue::Int(i64::from(d.sample_width_bytes))),
        ("element_type", AttrValue::Text(d.element_type.name().to_string())),
    ]
}
