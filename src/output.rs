//! Write access to the monthly output dataset.
use ndarray::ArrayViewD;

use crate::grid::{AttrValue, GridField, VariableInfo, VariableLookup};

/// Record dimension of the monthly output: one entry per month.
pub const MONTH_DIM: &str = "time";
/// Global attribute holding the first month covered by the dataset, `YYYY-MM-DD`.
pub const BEGIN_DATE_ATTR: &str = "begin_date";
/// Global attribute holding the last month committed to the dataset, `YYYY-MM-DD`.
pub const END_DATE_ATTR: &str = "end_date";

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("Could not create output dataset {0}")]
    Create(String),
    #[error("Could not open existing output dataset {0}")]
    Open(String),
    #[error("Output dataset has no variable '{0}'")]
    MissingVariable(String),
    #[error("Could not define '{0}' in the output dataset")]
    Define(String),
    #[error("Could not write month {index} of '{var}'")]
    Write { var: String, index: usize },
    #[error("Could not set attribute '{0}'")]
    Attribute(String),
    #[error("Could not flush the output dataset to disk")]
    Sync,
}

/// The monthly output dataset of one job.
///
/// The dataset has an unlimited [`MONTH_DIM`] dimension; month `i` (0-based) is
/// stored at index `i` and carries the month number `i + 1` counted from
/// [`BEGIN_DATE_ATTR`].
pub trait OutputStore: VariableLookup {
    /// A text global attribute.
    fn attribute(&self, name: &str) -> Option<String>;

    /// Number of months currently stored.
    fn month_count(&self) -> usize;

    fn add_dimension(&mut self, name: &str, len: usize) -> error_stack::Result<(), OutputError>;

    /// Define a new variable. Variables whose axes include [`MONTH_DIM`] receive
    /// one record per month through [`OutputStore::put_record`].
    fn add_variable(&mut self, info: &VariableInfo) -> error_stack::Result<(), OutputError>;

    /// Write a variable that does not depend on time, defining it if necessary.
    fn put_static(&mut self, field: &GridField) -> error_stack::Result<(), OutputError>;

    /// Write month `index` of a time-dependent variable. `data` excludes the
    /// month axis.
    fn put_record(&mut self, name: &str, index: usize, data: ArrayViewD<f64>)
        -> error_stack::Result<(), OutputError>;

    /// Write the month number and the timestamp of the first record averaged
    /// into month `index`.
    fn put_month(&mut self, index: usize, month: i32, timestamp: &str) -> error_stack::Result<(), OutputError>;

    fn set_attribute(&mut self, name: &str, value: AttrValue) -> error_stack::Result<(), OutputError>;

    /// Flush everything written so far to durable storage.
    fn sync(&mut self) -> error_stack::Result<(), OutputError>;

    fn begin_date(&self) -> Option<String> {
        self.attribute(BEGIN_DATE_ATTR)
    }

    fn end_date(&self) -> Option<String> {
        self.attribute(END_DATE_ATTR)
    }
}
