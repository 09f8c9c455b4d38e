//! In-memory implementations of the input and output interfaces.
//!
//! These back the unit tests and can be used to drive the aggregator from data
//! that were produced elsewhere (e.g. by another reader).
use std::{
    collections::{BTreeMap, HashMap},
    ops::Range,
    path::{Path, PathBuf},
};

use error_stack::ResultExt;
use ndarray::{Array1, ArrayD, ArrayViewD, Axis, Slice};

use crate::{
    grid::{AttrValue, GridField, VariableInfo, VariableLookup},
    output::{OutputError, OutputStore, MONTH_DIM},
    source::{ChunkOpener, InputChunk, SourceError, TIME_DIM, XTIME_VAR},
};

/// An input chunk whose variables are held in memory.
#[derive(Debug, Clone)]
pub struct MemoryChunk {
    label: String,
    dims: Vec<(String, usize)>,
    fields: Vec<GridField>,
    attributes: BTreeMap<String, AttrValue>,
    times: Vec<String>,
}

impl MemoryChunk {
    /// Create a chunk with the given record timestamps. The `Time` dimension is
    /// sized from `times`.
    pub fn new<S: ToString>(label: &str, times: &[S]) -> Self {
        let times: Vec<String> = times.iter().map(|t| t.to_string()).collect();
        Self {
            label: label.to_string(),
            dims: vec![(TIME_DIM.to_string(), times.len())],
            fields: vec![],
            attributes: BTreeMap::new(),
            times,
        }
    }

    pub fn with_dimension(mut self, name: &str, len: usize) -> Self {
        self.dims.retain(|(n, _)| n != name);
        self.dims.push((name.to_string(), len));
        self
    }

    /// Add a variable. Its data must include every axis named in its metadata.
    pub fn with_field(mut self, field: GridField) -> Self {
        self.fields.retain(|f| f.name() != field.name());
        self.fields.push(field);
        self
    }

    /// Add an `XTIME` variable with the given minutes since simulation start.
    pub fn with_xtime(self, minutes: &[f64]) -> Self {
        let info = VariableInfo::new(XTIME_VAR, &[TIME_DIM], "minutes", crate::grid::DataType::F32)
            .with_attribute("description", "minutes since simulation start");
        let data = Array1::from(minutes.to_vec()).into_dyn();
        self.with_field(GridField::new(info, data))
    }

    pub fn with_attribute<V: Into<AttrValue>>(mut self, name: &str, value: V) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    fn field(&self, name: &str) -> error_stack::Result<&GridField, SourceError> {
        self.fields
            .iter()
            .find(|f| f.name() == name)
            .ok_or_else(|| {
                SourceError::MissingVariable {
                    chunk: self.label.clone(),
                    var: name.to_string(),
                }
                .into()
            })
    }
}

impl InputChunk for MemoryChunk {
    fn label(&self) -> &str {
        &self.label
    }

    fn dimensions(&self) -> Vec<(String, usize)> {
        self.dims.clone()
    }

    fn time_len(&self) -> usize {
        self.times.len()
    }

    fn variables(&self) -> Vec<VariableInfo> {
        self.fields.iter().map(|f| f.info.clone()).collect()
    }

    fn global_attributes(&self) -> BTreeMap<String, AttrValue> {
        self.attributes.clone()
    }

    fn read(&self, name: &str, time: Range<usize>) -> error_stack::Result<GridField, SourceError> {
        let field = self.field(name)?;
        let tax = field.info.axis_index(TIME_DIM).ok_or_else(|| SourceError::NotTimeDependent {
            chunk: self.label.clone(),
            var: name.to_string(),
        })?;
        let len = field.data.len_of(Axis(tax));
        if time.start > time.end || time.end > len {
            return Err(SourceError::TimeIndex {
                chunk: self.label.clone(),
                start: time.start,
                end: time.end,
                len,
            }
            .into());
        }
        let data = field.data.slice_axis(Axis(tax), Slice::from(time)).to_owned();
        Ok(GridField::new(field.info.clone(), data))
    }

    fn read_static(&self, name: &str) -> error_stack::Result<GridField, SourceError> {
        self.field(name).cloned()
    }

    fn timestamp(&self, index: usize) -> error_stack::Result<String, SourceError> {
        self.times.get(index).cloned().ok_or_else(|| {
            SourceError::TimeIndex {
                chunk: self.label.clone(),
                start: index,
                end: index + 1,
                len: self.times.len(),
            }
            .into()
        })
    }

    fn xtime(&self, index: usize) -> error_stack::Result<Option<f64>, SourceError> {
        if !self.has_variable(XTIME_VAR) {
            return Ok(None);
        }
        let field = self.read(XTIME_VAR, index..index + 1)?;
        Ok(field.data.iter().next().copied())
    }
}

/// Hands out clones of registered [`MemoryChunk`]s by path.
#[derive(Debug, Default, Clone)]
pub struct MemoryOpener {
    chunks: HashMap<PathBuf, MemoryChunk>,
}

impl MemoryOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<P: AsRef<Path>>(&mut self, path: P, chunk: MemoryChunk) {
        self.chunks.insert(path.as_ref().to_path_buf(), chunk);
    }
}

impl ChunkOpener for MemoryOpener {
    type Chunk = MemoryChunk;

    fn open(&self, path: &Path) -> error_stack::Result<Self::Chunk, SourceError> {
        self.chunks
            .get(path)
            .cloned()
            .ok_or_else(|| SourceError::Open(path.to_path_buf()))
            .attach_printable("no in-memory chunk registered for this path")
    }
}

/// An output dataset held in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    dims: BTreeMap<String, usize>,
    variables: BTreeMap<String, VariableInfo>,
    statics: BTreeMap<String, ArrayD<f64>>,
    records: BTreeMap<String, Vec<Option<ArrayD<f64>>>>,
    months: Vec<Option<(i32, String)>>,
    attributes: BTreeMap<String, AttrValue>,
    sync_count: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn variable_info(&self, name: &str) -> Option<&VariableInfo> {
        self.variables.get(name)
    }

    pub fn variable_names(&self) -> impl Iterator<Item = &str> {
        self.variables.keys().map(|k| k.as_str())
    }

    /// Month `index` of variable `name`, if it was written.
    pub fn record(&self, name: &str, index: usize) -> Option<&ArrayD<f64>> {
        self.records.get(name)?.get(index)?.as_ref()
    }

    pub fn static_field(&self, name: &str) -> Option<&ArrayD<f64>> {
        self.statics.get(name)
    }

    /// Month number and first timestamp of month `index`.
    pub fn month(&self, index: usize) -> Option<&(i32, String)> {
        self.months.get(index)?.as_ref()
    }

    pub fn sync_count(&self) -> usize {
        self.sync_count
    }

    fn grow_to(&mut self, index: usize) {
        if self.months.len() <= index {
            self.months.resize(index + 1, None);
        }
    }
}

impl VariableLookup for MemoryStore {
    fn contains_variable(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }
}

impl OutputStore for MemoryStore {
    fn attribute(&self, name: &str) -> Option<String> {
        self.attributes.get(name).and_then(|v| v.as_str()).map(|s| s.to_string())
    }

    fn month_count(&self) -> usize {
        self.months.len()
    }

    fn add_dimension(&mut self, name: &str, len: usize) -> error_stack::Result<(), OutputError> {
        self.dims.insert(name.to_string(), len);
        Ok(())
    }

    fn add_variable(&mut self, info: &VariableInfo) -> error_stack::Result<(), OutputError> {
        for ax in info.axes.iter() {
            if ax != MONTH_DIM && !self.dims.contains_key(ax) {
                return Err(OutputError::Define(info.name.clone()))
                    .attach_printable_lazy(|| format!("dimension '{ax}' is not defined"));
            }
        }
        self.variables.insert(info.name.clone(), info.clone());
        Ok(())
    }

    fn put_static(&mut self, field: &GridField) -> error_stack::Result<(), OutputError> {
        if !self.variables.contains_key(field.name()) {
            self.add_variable(&field.info)?;
        }
        self.statics.insert(field.name().to_string(), field.data.clone());
        Ok(())
    }

    fn put_record(&mut self, name: &str, index: usize, data: ArrayViewD<f64>) -> error_stack::Result<(), OutputError> {
        if !self.variables.contains_key(name) {
            return Err(OutputError::MissingVariable(name.to_string()).into());
        }
        let records = self.records.entry(name.to_string()).or_default();
        if records.len() <= index {
            records.resize(index + 1, None);
        }
        records[index] = Some(data.to_owned());
        self.grow_to(index);
        Ok(())
    }

    fn put_month(&mut self, index: usize, month: i32, timestamp: &str) -> error_stack::Result<(), OutputError> {
        self.grow_to(index);
        self.months[index] = Some((month, timestamp.to_string()));
        Ok(())
    }

    fn set_attribute(&mut self, name: &str, value: AttrValue) -> error_stack::Result<(), OutputError> {
        self.attributes.insert(name.to_string(), value);
        Ok(())
    }

    fn sync(&mut self) -> error_stack::Result<(), OutputError> {
        self.sync_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array2, Array3};

    use super::*;
    use crate::{grid::DataType, source::TimeCoordinate};

    fn chunk() -> MemoryChunk {
        let t2 = Array2::from_shape_vec((3, 2), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        MemoryChunk::new("wrfsrfc_d01", &["1979-01-01_00:00:00", "1979-01-01_06:00:00", "1979-01-01_12:00:00"])
            .with_dimension("west_east", 2)
            .with_field(GridField::new(
                VariableInfo::new("T2", &[TIME_DIM, "west_east"], "K", DataType::F32),
                t2.into_dyn(),
            ))
            .with_field(GridField::new(
                VariableInfo::new("HGT", &["west_east"], "m", DataType::F32),
                Array1::from(vec![10.0, 20.0]).into_dyn(),
            ))
    }

    #[test]
    fn test_read_slices_time() {
        let chunk = chunk();
        let field = chunk.read("T2", 1..3).unwrap();
        assert_eq!(field.data.shape(), &[2, 2]);
        assert_eq!(field.data[[0, 1]], 4.0);

        let record = chunk.read_record("T2", 2).unwrap();
        assert_eq!(record.info.axes, vec!["west_east"]);
        assert_eq!(record.data.as_slice().unwrap(), &[5.0, 6.0]);

        let err = chunk.read("T2", 2..4).unwrap_err();
        assert!(matches!(err.current_context(), SourceError::TimeIndex { len: 3, .. }));
        let err = chunk.read("HGT", 0..1).unwrap_err();
        assert!(matches!(err.current_context(), SourceError::NotTimeDependent { .. }));
    }

    #[test]
    fn test_time_coordinate() {
        let chunk = chunk();
        assert_eq!(chunk.time_coordinate(), TimeCoordinate::Stamps);
        assert_eq!(chunk.xtime(0).unwrap(), None);
        let names: Vec<String> = chunk.time_dependent_variables().into_iter().map(|v| v.name).collect();
        assert_eq!(names, vec!["T2"]);

        let chunk = chunk.with_xtime(&[0.0, 360.0, 720.0]);
        assert_eq!(chunk.time_coordinate(), TimeCoordinate::Minutes);
        assert_eq!(chunk.xtime(1).unwrap(), Some(360.0));
    }

    #[test]
    fn test_opener_unknown_path() {
        let mut opener = MemoryOpener::new();
        opener.insert("a.nc", chunk());
        assert!(opener.open(Path::new("a.nc")).is_ok());
        let err = opener.open(Path::new("b.nc")).unwrap_err();
        assert!(matches!(err.current_context(), SourceError::Open(_)));
    }

    #[test]
    fn test_store_requires_declarations() {
        let mut store = MemoryStore::new();
        let info = VariableInfo::new("T2", &[MONTH_DIM, "west_east"], "K", DataType::F32);
        let err = store.add_variable(&info).unwrap_err();
        assert!(matches!(err.current_context(), OutputError::Define(_)));

        let data = Array3::<f64>::zeros((1, 1, 2)).into_dyn();
        let err = store.put_record("T2", 0, data.view()).unwrap_err();
        assert!(matches!(err.current_context(), OutputError::MissingVariable(_)));

        store.add_dimension("west_east", 2).unwrap();
        store.add_variable(&info).unwrap();
        store.put_record("T2", 1, data.view()).unwrap();
        assert_eq!(store.month_count(), 2);
        assert!(store.record("T2", 0).is_none());
        assert!(store.record("T2", 1).is_some());
    }
}
