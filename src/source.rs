//! Read access to WRF output files ("chunks").
//!
//! A single WRF run writes its output as a sequence of files, each holding a few
//! days to a few months of records along the `Time` dimension. The aggregator only
//! needs a handful of operations on them, collected in [`InputChunk`]; how a chunk
//! is opened is abstracted by [`ChunkOpener`] so that the averaging logic can be
//! exercised on in-memory data.
use std::{collections::BTreeMap, ops::Range, path::{Path, PathBuf}};

use error_stack::ResultExt;

use crate::grid::{AttrValue, DataType, GridField, VariableInfo};

/// Name of the record dimension in WRF output.
pub const TIME_DIM: &str = "Time";
/// Minutes since simulation start.
pub const XTIME_VAR: &str = "XTIME";
/// Character timestamps, `YYYY-MM-DD_HH:MM:SS`.
pub const TIMES_VAR: &str = "Times";
pub const DATE_STR_DIM: &str = "DateStrLen";

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Could not open input file {}", .0.display())]
    Open(PathBuf),
    #[error("Input '{chunk}' has no variable '{var}'")]
    MissingVariable { chunk: String, var: String },
    #[error("Variable '{var}' in '{chunk}' is not defined along the {TIME_DIM} dimension")]
    NotTimeDependent { chunk: String, var: String },
    #[error("Record range {start}..{end} is outside input '{chunk}' (length {len})")]
    TimeIndex {
        chunk: String,
        start: usize,
        end: usize,
        len: usize,
    },
    #[error("Could not read '{var}' from '{chunk}'")]
    Read { chunk: String, var: String },
    #[error("Input '{chunk}' has an invalid timestamp at record {index}")]
    Timestamp { chunk: String, index: usize },
}

/// How a chunk encodes the time of its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeCoordinate {
    /// `XTIME`, minutes since the start of the simulation.
    Minutes,
    /// Only the `Times` character timestamps are available.
    Stamps,
}

/// One WRF output file.
pub trait InputChunk {
    /// A short label for log and error messages, usually the file name.
    fn label(&self) -> &str;

    /// Dimension names and lengths.
    fn dimensions(&self) -> Vec<(String, usize)>;

    /// Number of records along the [`TIME_DIM`] dimension.
    fn time_len(&self) -> usize;

    /// Metadata of all data variables. The character timestamp variable is not
    /// included.
    fn variables(&self) -> Vec<VariableInfo>;

    fn global_attributes(&self) -> BTreeMap<String, AttrValue>;

    /// Read records `time` of a time-dependent variable. The returned field keeps
    /// the time axis.
    fn read(&self, name: &str, time: Range<usize>) -> error_stack::Result<GridField, SourceError>;

    /// Read a whole variable, whether or not it depends on time.
    fn read_static(&self, name: &str) -> error_stack::Result<GridField, SourceError>;

    /// The `YYYY-MM-DD_HH:MM:SS` timestamp of record `index`.
    fn timestamp(&self, index: usize) -> error_stack::Result<String, SourceError>;

    /// `XTIME` of record `index` in minutes, or `None` if this chunk has no
    /// `XTIME` variable.
    fn xtime(&self, index: usize) -> error_stack::Result<Option<f64>, SourceError>;

    fn variable(&self, name: &str) -> Option<VariableInfo> {
        self.variables().into_iter().find(|v| v.name == name)
    }

    fn has_variable(&self, name: &str) -> bool {
        self.variable(name).is_some()
    }

    fn global_f64(&self, name: &str) -> Option<f64> {
        self.global_attributes().get(name).and_then(|v| v.as_f64())
    }

    fn time_coordinate(&self) -> TimeCoordinate {
        if self.has_variable(XTIME_VAR) {
            TimeCoordinate::Minutes
        } else {
            TimeCoordinate::Stamps
        }
    }

    /// Time-dependent numeric variables, in file order.
    fn time_dependent_variables(&self) -> Vec<VariableInfo> {
        self.variables()
            .into_iter()
            .filter(|v| v.dtype.is_numeric() && v.has_axis(TIME_DIM))
            .collect()
    }

    /// Timestamps of records `range`.
    fn timestamps(&self, range: Range<usize>) -> error_stack::Result<Vec<String>, SourceError> {
        range.map(|i| self.timestamp(i)).collect()
    }

    /// Read a single record of a time-dependent variable, dropping the time axis.
    fn read_record(&self, name: &str, index: usize) -> error_stack::Result<GridField, SourceError> {
        let field = self.read(name, index..index + 1)?;
        let tax = field.info.axis_index(TIME_DIM).ok_or_else(|| SourceError::NotTimeDependent {
            chunk: self.label().to_string(),
            var: name.to_string(),
        })?;
        let mut info = field.info.clone();
        info.axes.remove(tax);
        let data = field.data.index_axis_move(ndarray::Axis(tax), 0);
        Ok(GridField::new(info, data))
    }
}

/// Opens input chunks from paths.
pub trait ChunkOpener {
    type Chunk: InputChunk;

    fn open(&self, path: &Path) -> error_stack::Result<Self::Chunk, SourceError>;
}

/// Read every numeric variable of a chunk as a static field. Variables with a
/// length-one time axis (as in WRF constant files) have that axis removed.
pub fn read_static_fields<C: InputChunk>(chunk: &C) -> error_stack::Result<Vec<GridField>, SourceError> {
    let mut fields = vec![];
    for info in chunk.variables() {
        if info.dtype == DataType::Char {
            continue;
        }
        let field = match info.axis_index(TIME_DIM) {
            Some(_) if chunk.time_len() > 0 => chunk.read_record(&info.name, 0),
            Some(_) => continue,
            None => chunk.read_static(&info.name),
        }
        .attach_printable_lazy(|| format!("while loading constant fields from {}", chunk.label()))?;
        fields.push(field);
    }
    Ok(fields)
}
