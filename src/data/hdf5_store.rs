//! HDF5 tabular store.
//!
//! Backs [`TabularStore`] with an HDF5 file readable from Python, MATLAB or Igor.
//! Sample datasets are chunked per row, deflate-compressed and unlimited along
//! the column axis so the tabular encoder can widen them mid-run.
//!
//! Compiled only with the `storage_hdf5` feature; without it
//! [`Hdf5Store::create_file`] reports [`DaqError::FeatureNotEnabled`].

use crate::data::tabular_store::{AttrValue, DatasetShape, TabularStore};
use crate::error::{AppResult, DaqError};
use crate::waveform::{NumericKind, RawSamples};
use std::path::Path;

#[cfg(feature = "storage_hdf5")]
use hdf5::types::VarLenUnicode;
#[cfg(feature = "storage_hdf5")]
use hdf5::{File, H5Type, Location};
#[cfg(feature = "storage_hdf5")]
use tracing::info;

/// Tabular store writing one HDF5 file.
#[cfg(feature = "storage_hdf5")]
pub struct Hdf5Store {
    file: Option<File>,
    compression_level: u8,
}

#[cfg(feature = "storage_hdf5")]
impl Hdf5Store {
    /// Create (truncate) `path`.
    pub fn create_file(path: &Path, compression_level: u8) -> AppResult<Self> {
        let file = File::create(path)?;
        info!("Created HDF5 file {}", path.display());
        Ok(Self {
            file: Some(file),
            compression_level: compression_level.min(9),
        })
    }

    fn file(&self) -> AppResult<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| DaqError::Storage("HDF5 file is closed".to_string()))
    }

    fn create_typed<T: H5Type>(&self, name: &str, shape: DatasetShape) -> AppResult<()> {
        let file = self.file()?;
        match shape.columns {
            Some(columns) => {
                let builder = file.new_dataset::<T>().chunk((1, columns.max(1)));
                let builder = if self.compression_level > 0 {
                    builder.deflate(self.compression_level)
                } else {
                    builder
                };
                builder.shape((shape.rows, columns..)).create(name)?;
            }
            None => {
                file.new_dataset::<T>().shape(shape.rows).create(name)?;
            }
        }
        Ok(())
    }
}

#[cfg(feature = "storage_hdf5")]
fn write_attr(location: &Location, key: &str, value: &AttrValue) -> AppResult<bool> {
    match value {
        AttrValue::Text(text) => {
            let Ok(text) = text.parse::<VarLenUnicode>() else {
                return Ok(false);
            };
            location
                .new_attr::<VarLenUnicode>()
                .create(key)?
                .write_scalar(&text)?;
        }
        AttrValue::Int(v) => location.new_attr::<i64>().create(key)?.write_scalar(v)?,
        AttrValue::Float(v) => location.new_attr::<f64>().create(key)?.write_scalar(v)?,
    }
    Ok(true)
}

#[cfg(feature = "storage_hdf5")]
impl TabularStore for Hdf5Store {
    fn set_file_attr(&mut self, key: &str, value: &AttrValue) -> AppResult<bool> {
        write_attr(self.file()?, key, value)
    }

    fn create_dataset(&mut self, name: &str, shape: DatasetShape, kind: NumericKind) -> AppResult<()> {
        match kind {
            NumericKind::I8 => self.create_typed::<i8>(name, shape),
            NumericKind::I16 => self.create_typed::<i16>(name, shape),
            NumericKind::I32 => self.create_typed::<i32>(name, shape),
            NumericKind::F32 => self.create_typed::<f32>(name, shape),
            NumericKind::F64 => self.create_typed::<f64>(name, shape),
        }
    }

    fn set_dataset_attr(&mut self, dataset: &str, key: &str, value: &AttrValue) -> AppResult<bool> {
        let ds = self.file()?.dataset(dataset)?;
        write_attr(&ds, key, value)
    }

    fn resize_columns(&mut self, dataset: &str, columns: usize) -> AppResult<()> {
        let ds = self.file()?.dataset(dataset)?;
        let shape = ds.shape();
        let [rows, _] = shape[..] else {
            return Err(DaqError::Storage(format!("'{}' is not two-dimensional", dataset)));
        };
        ds.resize((rows, columns))?;
        Ok(())
    }

    fn write_row(&mut self, dataset: &str, row: usize, data: &RawSamples) -> AppResult<()> {
        let ds = self.file()?.dataset(dataset)?;
        let len = data.len();
        match data {
            RawSamples::I8(v) => ds.write_slice(v, (row, 0..len))?,
            RawSamples::I16(v) => ds.write_slice(v, (row, 0..len))?,
            RawSamples::I32(v) => ds.write_slice(v, (row, 0..len))?,
            RawSamples::F32(v) => ds.write_slice(v, (row, 0..len))?,
            RawSamples::F64(v) => ds.write_slice(v, (row, 0..len))?,
        }
        Ok(())
    }

    fn write_value(&mut self, dataset: &str, index: usize, value: f64) -> AppResult<()> {
        let ds = self.file()?.dataset(dataset)?;
        let one = [value];
        ds.write_slice(&one[..], index..index + 1)?;
        Ok(())
    }

    fn close(&mut self) -> AppResult<()> {
        if let Some(file) = self.file.take() {
            file.flush()?;
            file.close()?;
        }
        Ok(())
    }
}

/// Placeholder compiled without `storage_hdf5`.
#[cfg(not(feature = "storage_hdf5"))]
pub struct Hdf5Store {
    _private: (),
}

#[cfg(not(feature = "storage_hdf5"))]
fn not_enabled<T>() -> AppResult<T> {
    Err(DaqError::FeatureNotEnabled("storage_hdf5".to_string()))
}

#[cfg(not(feature = "storage_hdf5"))]
impl Hdf5Store {
    /// Always fails: HDF5 support is compiled out.
    pub fn create_file(_path: &Path, _compression_level: u8) -> AppResult<Self> {
        not_enabled()
    }
}

#[cfg(not(feature = "storage_hdf5"))]
impl TabularStore for Hdf5Store {
    fn set_file_attr(&mut self, _key: &str, _value: &AttrValue) -> AppResult<bool> {
        not_enabled()
    }

    fn create_dataset(&mut self, _name: &str, _shape: DatasetShape, _kind: NumericKind) -> AppResult<()> {
        not_enabled()
    }

    fn set_dataset_attr(&mut self, _dataset: &str, _key: &str, _value: &AttrValue) -> AppResult<bool> {
        not_enabled()
    }

    fn resize_columns(&mut self, _dataset: &str, _columns: usize) -> AppResult<()> {
        not_enabled()
    }

    fn write_row(&mut self, _dataset: &str, _row: usize, _data: &RawSamples) -> AppResult<()> {
        not_enabled()
    }

    fn write_value(&mut self, _dataset: &str, _index: usize, _value: f64) -> AppResult<()> {
        not_enabled()
    }

    fn close(&mut self) -> AppResult<()> {
        not_enabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "storage_hdf5"))]
    #[test]
    fn create_reports_missing_feature() {
        let dir = tempfile::tempdir().unwrap();
        let result = Hdf5Store::create_file(&dir.path().join("run.h5"), 4);
        assert!(matches!(result, Err(DaqError::FeatureNotEnabled(_))));
    }

    #[cfg(feature = "storage_hdf5")]
    #[test]
    fn growable_dataset_round_trips_through_hdf5() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.h5");
        let mut store = Hdf5Store::create_file(&path, 4).unwrap();

        store
            .create_dataset("c1_samples", DatasetShape::matrix(2, 2), NumericKind::I16)
            .unwrap();
        store
            .create_dataset("c1_num_samples", DatasetShape::vector(2), NumericKind::F64)
            .unwrap();
        assert!(store
            .set_file_attr("TRIG_MODE", &AttrValue::Text("NORM".into()))
            .unwrap());
        assert!(!store
            .set_file_attr("PANEL", &AttrValue::Text("a\0b".into()))
            .unwrap());
        store
            .write_row("c1_samples", 0, &RawSamples::I16(vec![3, 4]))
            .unwrap();
        store.resize_columns("c1_samples", 3).unwrap();
        store
            .write_row("c1_samples", 1, &RawSamples::I16(vec![5, 6, 7]))
            .unwrap();
        store.write_value("c1_num_samples", 1, 3.0).unwrap();
        store.close().unwrap();

        let file = File::open(&path).unwrap();
        let samples = file.dataset("c1_samples").unwrap();
        assert_eq!(samples.shape(), vec![2, 3]);
        let values: Vec<i16> = samples.read_raw().unwrap();
        assert_eq!(values, vec![3, 4, 0, 5, 6, 7]);
        let lengths: Vec<f64> = file.dataset("c1_num_samples").unwrap().read_raw().unwrap();
        assert_eq!(lengths, vec![0.0, 3.0]);
    }
}
