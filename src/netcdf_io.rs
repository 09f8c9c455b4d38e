//! netCDF implementations of the input and output interfaces.
//!
//! Values are read through the typed accessors of the `netcdf` crate and
//! converted to `f64`; output records are stored as `f32` unless the variable
//! is declared as `f64`.
use std::{
    collections::BTreeMap,
    ops::Range,
    path::{Path, PathBuf},
};

use error_stack::{Report, ResultExt};
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use netcdf::{
    types::{FloatType, IntType, NcVariableType},
    AttributeValue, Extents,
};

use crate::{
    aggregator::AverageSummary,
    config::AverageConfig,
    derived::ConstantFields,
    grid::{AttrValue, DataType, GridField, VariableInfo, VariableLookup},
    jobs::{average_job, clear_output_for_recompute, load_constants, Job, JobError},
    output::{OutputError, OutputStore, MONTH_DIM},
    source::{ChunkOpener, InputChunk, SourceError, TIMES_VAR, TIME_DIM, XTIME_VAR},
};

fn data_type(var: &netcdf::Variable) -> DataType {
    match var.vartype() {
        NcVariableType::Float(FloatType::F64) => DataType::F64,
        NcVariableType::Float(FloatType::F32) => DataType::F32,
        NcVariableType::Int(IntType::I64) | NcVariableType::Int(IntType::U64) | NcVariableType::Int(IntType::U32) => {
            DataType::F64
        }
        NcVariableType::Int(IntType::I32) | NcVariableType::Int(IntType::U16) => DataType::I32,
        NcVariableType::Int(IntType::I16) => DataType::I16,
        NcVariableType::Int(IntType::I8) | NcVariableType::Int(IntType::U8) => DataType::Char,
        _ => DataType::Char,
    }
}

fn to_attr_value(value: AttributeValue) -> Option<AttrValue> {
    match value {
        AttributeValue::Str(s) => Some(AttrValue::Text(s)),
        AttributeValue::Double(v) => Some(AttrValue::Float(v)),
        AttributeValue::Float(v) => Some(AttrValue::Float(v as f64)),
        AttributeValue::Int(v) => Some(AttrValue::Int(v as i64)),
        AttributeValue::Short(v) => Some(AttrValue::Int(v as i64)),
        AttributeValue::Longlong(v) => Some(AttrValue::Int(v)),
        AttributeValue::Doubles(v) => v.first().map(|x| AttrValue::Float(*x)),
        AttributeValue::Floats(v) => v.first().map(|x| AttrValue::Float(*x as f64)),
        AttributeValue::Ints(v) => v.first().map(|x| AttrValue::Int(*x as i64)),
        _ => None,
    }
}

fn read_as_f64(var: &netcdf::Variable, extents: Vec<Range<usize>>) -> Result<Vec<f64>, netcdf::Error> {
    let values = match data_type(var) {
        DataType::F64 => var.get_values::<f64, _>(extents)?,
        DataType::F32 => var.get_values::<f32, _>(extents)?.into_iter().map(f64::from).collect(),
        DataType::I32 => var.get_values::<i32, _>(extents)?.into_iter().map(f64::from).collect(),
        DataType::I16 | DataType::Char => var.get_values::<i16, _>(extents)?.into_iter().map(f64::from).collect(),
    };
    Ok(values)
}

/// Ranges covering every index of `var`, except along `axis` where only `sel` is taken.
fn slice_along(var: &netcdf::Variable, axis: usize, sel: Range<usize>) -> Vec<Range<usize>> {
    var.dimensions()
        .iter()
        .enumerate()
        .map(|(i, d)| if i == axis { sel.clone() } else { 0..d.len() })
        .collect()
}

/// A WRF output file opened for reading.
pub struct NetcdfChunk {
    label: String,
    file: netcdf::File,
    times: Vec<String>,
}

impl NetcdfChunk {
    pub fn open(path: &Path) -> error_stack::Result<Self, SourceError> {
        let file = netcdf::open(path).change_context_lazy(|| SourceError::Open(path.to_path_buf()))?;
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        let times_var = file.variable(TIMES_VAR).ok_or_else(|| SourceError::MissingVariable {
            chunk: label.clone(),
            var: TIMES_VAR.to_string(),
        })?;
        let width = times_var.dimensions().last().map(|d| d.len()).unwrap_or(0);
        let raw = times_var
            .get_raw_values(Extents::All)
            .change_context_lazy(|| SourceError::Read {
                chunk: label.clone(),
                var: TIMES_VAR.to_string(),
            })?;
        if width == 0 || raw.len() % width != 0 {
            return Err(SourceError::Timestamp { chunk: label, index: 0 }.into());
        }
        let times = raw
            .chunks(width)
            .map(|c| String::from_utf8_lossy(c).trim_end_matches(['\0', ' ']).to_string())
            .collect();
        drop(times_var);

        Ok(Self { label, file, times })
    }

    fn var(&self, name: &str) -> error_stack::Result<netcdf::Variable<'_>, SourceError> {
        self.file.variable(name).ok_or_else(|| {
            SourceError::MissingVariable {
                chunk: self.label.clone(),
                var: name.to_string(),
            }
            .into()
        })
    }

    fn read_error(&self, name: &str) -> SourceError {
        SourceError::Read {
            chunk: self.label.clone(),
            var: name.to_string(),
        }
    }
}

impl InputChunk for NetcdfChunk {
    fn label(&self) -> &str {
        &self.label
    }

    fn dimensions(&self) -> Vec<(String, usize)> {
        self.file.dimensions().map(|d| (d.name(), d.len())).collect()
    }

    fn time_len(&self) -> usize {
        self.times.len()
    }

    fn variables(&self) -> Vec<VariableInfo> {
        self.file
            .variables()
            .map(|var| {
                let axes: Vec<String> = var.dimensions().iter().map(|d| d.name()).collect();
                let mut units = String::new();
                let mut attributes = BTreeMap::new();
                for att in var.attributes() {
                    let Ok(AttributeValue::Str(s)) = att.value() else {
                        continue;
                    };
                    if att.name() == "units" {
                        units = s;
                    } else {
                        attributes.insert(att.name().to_string(), s);
                    }
                }
                let mut info = VariableInfo::new(var.name(), &axes, &units, data_type(&var));
                info.attributes = attributes;
                info
            })
            .collect()
    }

    fn global_attributes(&self) -> BTreeMap<String, AttrValue> {
        self.file
            .attributes()
            .filter_map(|att| {
                let value = att.value().ok().and_then(to_attr_value)?;
                Some((att.name().to_string(), value))
            })
            .collect()
    }

    fn read(&self, name: &str, time: Range<usize>) -> error_stack::Result<GridField, SourceError> {
        let info = self.variable(name).ok_or_else(|| SourceError::MissingVariable {
            chunk: self.label.clone(),
            var: name.to_string(),
        })?;
        let tax = info.axis_index(TIME_DIM).ok_or_else(|| SourceError::NotTimeDependent {
            chunk: self.label.clone(),
            var: name.to_string(),
        })?;
        let var = self.var(name)?;
        let mut shape: Vec<usize> = var.dimensions().iter().map(|d| d.len()).collect();
        if time.start > time.end || time.end > shape[tax] {
            return Err(SourceError::TimeIndex {
                chunk: self.label.clone(),
                start: time.start,
                end: time.end,
                len: shape[tax],
            }
            .into());
        }

        let values = read_as_f64(&var, slice_along(&var, tax, time.clone()))
            .change_context_lazy(|| self.read_error(name))?;
        shape[tax] = time.len();
        let data = ArrayD::from_shape_vec(IxDyn(&shape), values).change_context_lazy(|| self.read_error(name))?;
        Ok(GridField::new(info, data))
    }

    fn read_static(&self, name: &str) -> error_stack::Result<GridField, SourceError> {
        let info = self.variable(name).ok_or_else(|| SourceError::MissingVariable {
            chunk: self.label.clone(),
            var: name.to_string(),
        })?;
        let var = self.var(name)?;
        let shape: Vec<usize> = var.dimensions().iter().map(|d| d.len()).collect();
        let all = shape.iter().map(|&n| 0..n).collect();
        let values = read_as_f64(&var, all).change_context_lazy(|| self.read_error(name))?;
        let data = ArrayD::from_shape_vec(IxDyn(&shape), values).change_context_lazy(|| self.read_error(name))?;
        Ok(GridField::new(info, data))
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
        let Some(var) = self.file.variable(XTIME_VAR) else {
            return Ok(None);
        };
        let values = read_as_f64(&var, slice_along(&var, 0, index..index + 1))
            .change_context_lazy(|| self.read_error(XTIME_VAR))?;
        Ok(values.first().copied())
    }
}

/// Opens WRF output files from disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetcdfOpener;

impl ChunkOpener for NetcdfOpener {
    type Chunk = NetcdfChunk;

    fn open(&self, path: &Path) -> error_stack::Result<Self::Chunk, SourceError> {
        NetcdfChunk::open(path)
    }
}

/// A monthly mean file on disk.
pub struct NetcdfStore {
    path: PathBuf,
    file: Option<netcdf::FileMut>,
}

impl NetcdfStore {
    /// Create a new file with an unlimited month dimension, replacing any
    /// existing file.
    pub fn create(path: &Path) -> error_stack::Result<Self, OutputError> {
        let describe = || OutputError::Create(path.display().to_string());
        let mut file = netcdf::create(path).change_context_lazy(describe)?;
        file.add_unlimited_dimension(MONTH_DIM).change_context_lazy(describe)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    /// Open an existing file to append months to it.
    pub fn open(path: &Path) -> error_stack::Result<Self, OutputError> {
        let file = netcdf::append(path).change_context_lazy(|| OutputError::Open(path.display().to_string()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    pub fn open_or_create(path: &Path) -> error_stack::Result<Self, OutputError> {
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    fn file(&self) -> error_stack::Result<&netcdf::FileMut, OutputError> {
        self.file
            .as_ref()
            .ok_or_else(|| Report::new(OutputError::Open(self.path.display().to_string())))
    }

    fn file_mut(&mut self) -> error_stack::Result<&mut netcdf::FileMut, OutputError> {
        let path = self.path.display().to_string();
        self.file.as_mut().ok_or_else(|| Report::new(OutputError::Open(path)))
    }

    fn define_variable(&mut self, info: &VariableInfo) -> error_stack::Result<(), OutputError> {
        let name = info.name.as_str();
        let axes: Vec<&str> = info.axes.iter().map(|a| a.as_str()).collect();
        let file = self.file_mut()?;
        let mut var = match info.dtype {
            DataType::Char => file.add_string_variable(name, &axes),
            DataType::F64 => file.add_variable::<f64>(name, &axes),
            DataType::I32 if name == MONTH_DIM => file.add_variable::<i32>(name, &axes),
            _ => file.add_variable::<f32>(name, &axes),
        }
        .change_context_lazy(|| OutputError::Define(name.to_string()))?;

        if !info.units.is_empty() {
            var.put_attribute("units", info.units.as_str())
                .change_context_lazy(|| OutputError::Attribute(format!("{name}:units")))?;
        }
        for (key, value) in info.attributes.iter() {
            let result = match (key.as_str(), value.parse::<f64>()) {
                ("missing_value", Ok(v)) if info.dtype == DataType::F64 => var.put_attribute(key, v),
                ("missing_value", Ok(v)) => var.put_attribute(key, v as f32),
                _ => var.put_attribute(key, value.as_str()),
            };
            result.change_context_lazy(|| OutputError::Attribute(format!("{name}:{key}")))?;
        }
        Ok(())
    }
}

impl VariableLookup for NetcdfStore {
    fn contains_variable(&self, name: &str) -> bool {
        self.file
            .as_ref()
            .map(|f| f.variable(name).is_some())
            .unwrap_or(false)
    }
}

impl OutputStore for NetcdfStore {
    fn attribute(&self, name: &str) -> Option<String> {
        let value = self.file.as_ref()?.attribute(name)?.value().ok()?;
        match value {
            AttributeValue::Str(s) => Some(s),
            _ => None,
        }
    }

    fn month_count(&self) -> usize {
        self.file
            .as_ref()
            .and_then(|f| f.dimension(MONTH_DIM).map(|d| d.len()))
            .unwrap_or(0)
    }

    fn add_dimension(&mut self, name: &str, len: usize) -> error_stack::Result<(), OutputError> {
        self.file_mut()?
            .add_dimension(name, len)
            .change_context_lazy(|| OutputError::Define(name.to_string()))?;
        Ok(())
    }

    fn add_variable(&mut self, info: &VariableInfo) -> error_stack::Result<(), OutputError> {
        self.define_variable(info)
    }

    fn put_static(&mut self, field: &GridField) -> error_stack::Result<(), OutputError> {
        let name = field.name();
        if !self.contains_variable(name) {
            self.define_variable(&field.info)?;
        }
        let write_error = || OutputError::Write {
            var: name.to_string(),
            index: 0,
        };
        let mut var = self
            .file_mut()?
            .variable_mut(name)
            .ok_or_else(|| OutputError::MissingVariable(name.to_string()))?;
        match field.info.dtype {
            DataType::F64 => {
                let values: Vec<f64> = field.data.iter().copied().collect();
                var.put_values(&values, Extents::All).change_context_lazy(write_error)?;
            }
            _ => {
                let values: Vec<f32> = field.data.iter().map(|&v| v as f32).collect();
                var.put_values(&values, Extents::All).change_context_lazy(write_error)?;
            }
        }
        Ok(())
    }

    fn put_record(&mut self, name: &str, index: usize, data: ArrayViewD<f64>) -> error_stack::Result<(), OutputError> {
        let write_error = || OutputError::Write {
            var: name.to_string(),
            index,
        };
        let mut var = self
            .file_mut()?
            .variable_mut(name)
            .ok_or_else(|| OutputError::MissingVariable(name.to_string()))?;
        let record_len: usize = var.dimensions().iter().skip(1).map(|d| d.len()).product();
        if record_len != data.len() {
            return Err(Report::new(write_error())).attach_printable(format!(
                "expected {record_len} values per month, got {} (shape {:?})",
                data.len(),
                data.shape()
            ));
        }

        let extents = slice_along(&var, 0, index..index + 1);
        if matches!(var.vartype(), NcVariableType::Float(FloatType::F64)) {
            let values: Vec<f64> = data.iter().copied().collect();
            var.put_values(&values, extents).change_context_lazy(write_error)?;
        } else {
            let values: Vec<f32> = data.iter().map(|&v| v as f32).collect();
            var.put_values(&values, extents).change_context_lazy(write_error)?;
        }
        Ok(())
    }

    fn put_month(&mut self, index: usize, month: i32, timestamp: &str) -> error_stack::Result<(), OutputError> {
        let file = self.file_mut()?;
        let mut time = file
            .variable_mut(MONTH_DIM)
            .ok_or_else(|| OutputError::MissingVariable(MONTH_DIM.to_string()))?;
        time.put_values(&[month], vec![index..index + 1]).change_context_lazy(|| OutputError::Write {
            var: MONTH_DIM.to_string(),
            index,
        })?;
        drop(time);

        if let Some(mut times) = file.variable_mut(TIMES_VAR) {
            times.put_string(timestamp, vec![index..index + 1]).change_context_lazy(|| OutputError::Write {
                var: TIMES_VAR.to_string(),
                index,
            })?;
        }
        Ok(())
    }

    fn set_attribute(&mut self, name: &str, value: AttrValue) -> error_stack::Result<(), OutputError> {
        let file = self.file_mut()?;
        let result = match value {
            AttrValue::Text(s) => file.add_attribute(name, s.as_str()),
            AttrValue::Float(v) => file.add_attribute(name, v),
            AttrValue::Int(v) => file.add_attribute(name, v),
        };
        result.change_context_lazy(|| OutputError::Attribute(name.to_string()))?;
        Ok(())
    }

    fn sync(&mut self) -> error_stack::Result<(), OutputError> {
        // Closing the file flushes it; reopen for the next month.
        drop(self.file.take());
        let file = netcdf::append(&self.path).change_context(OutputError::Sync)?;
        self.file = Some(file);
        Ok(())
    }
}

/// Run one job on netCDF files: load the domain's constants (if configured and
/// present), open or create the output file and average the inputs into it.
pub fn average_netcdf_job(
    config: &AverageConfig,
    job: &Job,
    has_range: bool,
) -> error_stack::Result<AverageSummary, JobError> {
    let label = job.label();
    let constants = match config.constants_path(job.domain) {
        Some(path) if path.exists() => {
            let chunk = NetcdfChunk::open(&path).change_context_lazy(|| JobError::Constants(label.clone()))?;
            load_constants(&chunk).change_context_lazy(|| JobError::Constants(label.clone()))?
        }
        Some(path) => {
            log::debug!("[{label}] no constants file at {}", path.display());
            ConstantFields::default()
        }
        None => ConstantFields::default(),
    };

    let output = job.output_path(config);
    clear_output_for_recompute(&output, config, has_range)?;
    let mut store = NetcdfStore::open_or_create(&output).change_context_lazy(|| JobError::Average(label.clone()))?;
    average_job(config, job, &NetcdfOpener, &mut store, constants)
}

#[cfg(test)]
mod tests {
    use ndarray::Array3;

    use super::*;
    use crate::output::BEGIN_DATE_ATTR;

    fn write_input(path: &Path, times: &[String]) {
        let mut file = netcdf::create(path).unwrap();
        file.add_unlimited_dimension(TIME_DIM).unwrap();
        file.add_dimension("DateStrLen", 19).unwrap();
        file.add_dimension("south_north", 1).unwrap();
        file.add_dimension("west_east", 2).unwrap();
        file.add_attribute("TITLE", "OUTPUT FROM WRF").unwrap();

        let mut var = file.add_variable::<u8>(TIMES_VAR, &[TIME_DIM, "DateStrLen"]).unwrap();
        let bytes: Vec<u8> = times.iter().flat_map(|t| t.bytes()).collect();
        var.put_values(&bytes, vec![0..times.len(), 0..19]).unwrap();

        let n = times.len();
        let t2 = Array3::from_shape_fn((n, 1, 2), |(t, _, x)| 270.0 + t as f32 + x as f32);
        let mut var = file
            .add_variable::<f32>("T2", &[TIME_DIM, "south_north", "west_east"])
            .unwrap();
        var.put_attribute("units", "K").unwrap();
        var.put_values(t2.as_slice().unwrap(), vec![0..n, 0..1, 0..2]).unwrap();
    }

    #[test]
    fn test_wide_integers_read_as_f64() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ints.nc");
        let mut file = netcdf::create(&path).unwrap();
        file.add_dimension("n", 2).unwrap();
        let mut var = file.add_variable::<i64>("BIG", &["n"]).unwrap();
        var.put_values(&[70_000i64, -5_000_000_000], vec![0..2]).unwrap();
        let mut var = file.add_variable::<u16>("CAT", &["n"]).unwrap();
        var.put_values(&[40_000u16, 1], vec![0..2]).unwrap();
        drop(file);

        let file = netcdf::open(&path).unwrap();
        let big = file.variable("BIG").unwrap();
        assert_eq!(data_type(&big), DataType::F64);
        assert_eq!(read_as_f64(&big, vec![0..2]).unwrap(), vec![70_000.0, -5.0e9]);
        let cat = file.variable("CAT").unwrap();
        assert_eq!(data_type(&cat), DataType::I32);
        assert_eq!(read_as_f64(&cat, vec![0..2]).unwrap(), vec![40_000.0, 1.0]);
    }

    #[test]
    fn test_netcdf_round_month() {
        let dir = tempfile::tempdir().unwrap();
        let times: Vec<String> = (1..=31)
            .map(|d| format!("1979-01-{d:02}_00:00:00"))
            .chain(std::iter::once("1979-02-01_00:00:00".to_string()))
            .collect();
        let input = dir.path().join("wrfsrfc_d01_1979-01-01_00:00:00.nc");
        write_input(&input, &times);

        let chunk = NetcdfChunk::open(&input).unwrap();
        assert_eq!(chunk.time_len(), 32);
        assert_eq!(chunk.timestamp(31).unwrap(), "1979-02-01_00:00:00");
        assert_eq!(chunk.variable("T2").unwrap().units, "K");
        let record = chunk.read("T2", 2..4).unwrap();
        assert_eq!(record.data.shape(), &[2, 1, 2]);
        assert_eq!(record.data[[1, 0, 1]], 274.0);

        let config = AverageConfig {
            input_dir: dir.path().to_path_buf(),
            output_dir: dir.path().to_path_buf(),
            file_types: vec!["srfc".to_string()],
            constants_file: None,
            derived: [("srfc".to_string(), vec![])].into_iter().collect(),
            ..Default::default()
        };
        let job = Job {
            file_type: "srfc".to_string(),
            domain: 1,
            files: vec![input],
        };
        let summary = average_netcdf_job(&config, &job, false).unwrap();
        assert_eq!(summary.committed.len(), 1);

        let store = NetcdfStore::open(&job.output_path(&config)).unwrap();
        assert_eq!(store.month_count(), 1);
        assert_eq!(store.attribute(BEGIN_DATE_ATTR).as_deref(), Some("1979-01-01"));
        let file = netcdf::open(job.output_path(&config)).unwrap();
        let t2: Vec<f32> = file.variable("T2").unwrap().get_values(..).unwrap();
        approx::assert_abs_diff_eq!(t2[0], 285.0, epsilon = 1e-4);
        approx::assert_abs_diff_eq!(t2[1], 286.0, epsilon = 1e-4);
    }
}
