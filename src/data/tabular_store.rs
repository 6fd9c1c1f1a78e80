//! Tabular storage seam.
//!
//! The tabular encoder writes through [`TabularStore`] so the growable-dataset logic
//! can be exercised without a native HDF5 installation. Two backends exist:
//!
//! - [`MemoryStore`]: always available, inspectable after the run, used by tests
//! - [`Hdf5Store`](crate::data::hdf5_store::Hdf5Store): behind `storage_hdf5`
//!
//! Datasets are either 1-D `f64`-style vectors (`DatasetShape::vector`) or 2-D
//! matrices whose column count may grow (`DatasetShape::matrix`). Rows are fixed at
//! creation.

use crate::error::{AppResult, DaqError};
use crate::waveform::{NumericKind, RawSamples};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Attribute value attached to the file or to a dataset.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// UTF-8 text.
    Text(String),
    /// Signed integer.
    Int(i64),
    /// Double precision float.
    Float(f64),
}

/// Shape of a dataset at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetShape {
    /// Number of rows (event slots).
    pub rows: usize,
    /// Column count for 2-D datasets, `None` for 1-D.
    pub columns: Option<usize>,
}

impl DatasetShape {
    /// 1-D dataset of `rows` values.
    pub fn vector(rows: usize) -> Self {
        Self {
            rows,
            columns: None,
        }
    }

    /// 2-D dataset with a growable column count.
    pub fn matrix(rows: usize, columns: usize) -> Self {
        Self {
            rows,
            columns: Some(columns),
        }
    }
}

/// Storage backend for the tabular encoder.
///
/// Attribute setters return `Ok(false)` when the backend cannot represent the
/// value; callers treat that as a skip, not a failure.
pub trait TabularStore: Send {
    /// Attach a file-level attribute.
    fn set_file_attr(&mut self, key: &str, value: &AttrValue) -> AppResult<bool>;

    /// Create a dataset of `kind` elements.
    fn create_dataset(&mut self, name: &str, shape: DatasetShape, kind: NumericKind) -> AppResult<()>;

    /// Attach an attribute to an existing dataset.
    fn set_dataset_attr(&mut self, dataset: &str, key: &str, value: &AttrValue) -> AppResult<bool>;

    /// Widen a 2-D dataset to `columns`. Existing rows keep their values.
    fn resize_columns(&mut self, dataset: &str, columns: usize) -> AppResult<()>;

    /// Write `data` left-aligned into `row` of a 2-D dataset.
    fn write_row(&mut self, dataset: &str, row: usize, data: &RawSamples) -> AppResult<()>;

    /// Write one element of a 1-D dataset.
    fn write_value(&mut self, dataset: &str, index: usize, value: f64) -> AppResult<()>;

    /// Flush and release the underlying file.
    fn close(&mut self) -> AppResult<()>;
}

#[derive(Debug, Clone)]
struct MemoryDataset {
    kind: NumericKind,
    shape: DatasetShape,
    data: Vec<f64>,
    attrs: BTreeMap<String, AttrValue>,
}

impl MemoryDataset {
    fn width(&self) -> usize {
        self.shape.columns.unwrap_or(1)
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    file_attrs: BTreeMap<String, AttrValue>,
    datasets: BTreeMap<String, MemoryDataset>,
    closed: bool,
}

/// In-memory tabular store.
///
/// Cloning yields another handle to the same contents, so a test can keep one
/// handle while the encoder owns the other.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

fn representable(value: &AttrValue) -> bool {
    match value {
        AttrValue::Text(text) => !text.contains('\0'),
        AttrValue::Int(_) | AttrValue::Float(_) => true,
    }
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open_inner(&self) -> AppResult<MutexGuard<'_, MemoryInner>> {
        let inner = self.lock();
        if inner.closed {
            return Err(DaqError::Storage("store is closed".to_string()));
        }
        Ok(inner)
    }

    /// File attribute by key.
    pub fn file_attr(&self, key: &str) -> Option<AttrValue> {
        self.lock().file_attrs.get(key).cloned()
    }

    /// Dataset attribute by key.
    pub fn dataset_attr(&self, dataset: &str, key: &str) -> Option<AttrValue> {
        self.lock()
            .datasets
            .get(dataset)
            .and_then(|ds| ds.attrs.get(key).cloned())
    }

    /// Current shape of a dataset.
    pub fn shape(&self, dataset: &str) -> Option<DatasetShape> {
        self.lock().datasets.get(dataset).map(|ds| ds.shape)
    }

    /// Element type of a dataset.
    pub fn kind(&self, dataset: &str) -> Option<NumericKind> {
        self.lock().datasets.get(dataset).map(|ds| ds.kind)
    }

    /// Full row of a 2-D dataset, widened to `f64`.
    pub fn row(&self, dataset: &str, row: usize) -> Option<Vec<f64>> {
        let inner = self.lock();
        let ds = inner.datasets.get(dataset)?;
        if row >= ds.shape.rows {
            return None;
        }
        let width = ds.width();
        Some(ds.data[row * width..(row + 1) * width].to_vec())
    }

    /// One element of a 1-D dataset.
    pub fn value(&self, dataset: &str, index: usize) -> Option<f64> {
        let inner = self.lock();
        let ds = inner.datasets.get(dataset)?;
        if ds.shape.columns.is_some() {
            return None;
        }
        ds.data.get(index).copied()
    }

    /// Names of every dataset, sorted.
    pub fn dataset_names(&self) -> Vec<String> {
        self.lock().datasets.keys().cloned().collect()
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

fn dataset_mut<'a>(inner: &'a mut MemoryInner, name: &str) -> AppResult<&'a mut MemoryDataset> {
    inner
        .datasets
        .get_mut(name)
        .ok_or_else(|| DaqError::Storage(format!("no dataset named '{}'", name)))
}

impl TabularStore for MemoryStore {
    fn set_file_attr(&mut self, key: &str, value: &AttrValue) -> AppResult<bool> {
        let mut inner = self.open_inner()?;
        if !representable(value) {
            return Ok(false);
        }
        inner.file_attrs.insert(key.to_string(), value.clone());
        Ok(true)
    }

    fn create_dataset(&mut self, name: &str, shape: DatasetShape, kind: NumericKind) -> AppResult<()> {
        let mut inner = self.open_inner()?;
        if inner.datasets.contains_key(name) {
            return Err(DaqError::Storage(format!("dataset '{}' already exists", name)));
        }
        let len = shape.rows * shape.columns.unwrap_or(1);
        inner.datasets.insert(
            name.to_string(),
            MemoryDataset {
                kind,
                shape,
                data: vec![0.0; len],
                attrs: BTreeMap::new(),
            },
        );
        Ok(())
    }

    fn set_dataset_attr(&mut self, dataset: &str, key: &str, value: &AttrValue) -> AppResult<bool> {
        let mut inner = self.open_inner()?;
        let ds = dataset_mut(&mut inner, dataset)?;
        if !representable(value) {
            return Ok(false);
        }
        ds.attrs.insert(key.to_string(), value.clone());
        Ok(true)
    }

    fn resize_columns(&mut self, dataset: &str, columns: usize) -> AppResult<()> {
        let mut inner = self.open_inner()?;
        let ds = dataset_mut(&mut inner, dataset)?;
        let Some(old_columns) = ds.shape.columns else {
            return Err(DaqError::Storage(format!("'{}' is one-dimensional", dataset)));
        };
        let rows = ds.shape.rows;
        let mut data = vec![0.0; rows * columns];
        let keep = old_columns.min(columns);
        for row in 0..rows {
            data[row * columns..row * columns + keep]
                .copy_from_slice(&ds.data[row * old_columns..row * old_columns + keep]);
        }
        ds.data = data;
        ds.shape.columns = Some(columns);
        Ok(())
    }

    fn write_row(&mut self, dataset: &str, row: usize, data: &RawSamples) -> AppResult<()> {
        let mut inner = self.open_inner()?;
        let ds = dataset_mut(&mut inner, dataset)?;
        let Some(columns) = ds.shape.columns else {
            return Err(DaqError::Storage(format!("'{}' is one-dimensional", dataset)));
        };
        if data.kind() != ds.kind {
            return Err(DaqError::Storage(format!(
                "'{}' holds {} but {} was written",
                dataset,
                ds.kind.name(),
                data.kind().name()
            )));
        }
        if row >= ds.shape.rows {
            return Err(DaqError::Capacity(format!(
                "row {} of '{}' exceeds {} rows",
                row, dataset, ds.shape.rows
            )));
        }
        if data.len() > columns {
            return Err(DaqError::Storage(format!(
                "{} samples do not fit {} columns of '{}'",
                data.len(),
                columns,
                dataset
            )));
        }
        let start = row * columns;
        ds.data[start..start + data.len()].copy_from_slice(&data.values_f64(0..data.len()));
        Ok(())
    }

    fn write_value(&mut self, dataset: &str, index: usize, value: f64) -> AppResult<()> {
        let mut inner = self.open_inner()?;
        let ds = dataset_mut(&mut inner, dataset)?;
        if ds.shape.columns.is_some() {
            return Err(DaqError::Storage(format!("'{}' is two-dimensional", dataset)));
        }
        let rows = ds.shape.rows;
        let slot = ds.data.get_mut(index).ok_or_else(|| {
            DaqError::Capacity(format!("index {} of '{}' exceeds {} rows", index, dataset, rows))
        })?;
        *slot = value;
        Ok(())
    }

    fn close(&mut self) -> AppResult<()> {
        self.lock().closed = true;
        Ok(())
    }
}
