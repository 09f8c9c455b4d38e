//! In-memory representation of gridded model fields and their metadata.
use std::collections::{BTreeMap, BTreeSet, HashSet};

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

/// Storage type of a variable. All computations are done in `f64`; this only
/// determines how values are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    I16,
    I32,
    F32,
    F64,
    Char,
}

impl DataType {
    pub fn is_numeric(&self) -> bool {
        !matches!(self, Self::Char)
    }
}

/// An attribute value, either on a variable or on a whole file.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Text(String),
    Float(f64),
    Int(i64),
}

impl AttrValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Text(s) => s.trim().parse().ok(),
            AttrValue::Float(v) => Some(*v),
            AttrValue::Int(v) => Some(*v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// Metadata describing one variable: its name, the dimensions it is defined
/// on (outermost first), its units, storage type and string attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableInfo {
    pub name: String,
    pub axes: Vec<String>,
    pub units: String,
    pub dtype: DataType,
    pub attributes: BTreeMap<String, String>,
}

impl VariableInfo {
    pub fn new<N: ToString, A: ToString>(name: N, axes: &[A], units: &str, dtype: DataType) -> Self {
        Self {
            name: name.to_string(),
            axes: axes.iter().map(|a| a.to_string()).collect(),
            units: units.to_string(),
            dtype,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute<V: ToString>(mut self, key: &str, value: V) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }

    /// Position of `dim` in this variable's axes, if present.
    pub fn axis_index(&self, dim: &str) -> Option<usize> {
        self.axes.iter().position(|a| a == dim)
    }

    pub fn has_axis(&self, dim: &str) -> bool {
        self.axis_index(dim).is_some()
    }

    /// A copy of this metadata with dimension `from` renamed to `to`.
    pub fn rename_axis(&self, from: &str, to: &str) -> Self {
        let mut info = self.clone();
        for ax in info.axes.iter_mut() {
            if ax == from {
                *ax = to.to_string();
            }
        }
        info
    }
}

/// A named field of values together with its metadata. Missing values are NaN.
#[derive(Debug, Clone, PartialEq)]
pub struct GridField {
    pub info: VariableInfo,
    pub data: ArrayD<f64>,
}

impl GridField {
    pub fn new(info: VariableInfo, data: ArrayD<f64>) -> Self {
        Self { info, data }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }
}

/// Anything that can answer "do you have a variable called X?". Used to check
/// derived-variable prerequisites against an output dataset or a set of
/// constant fields.
pub trait VariableLookup {
    fn contains_variable(&self, name: &str) -> bool;
}

impl VariableLookup for HashSet<String> {
    fn contains_variable(&self, name: &str) -> bool {
        self.contains(name)
    }
}

impl VariableLookup for BTreeSet<String> {
    fn contains_variable(&self, name: &str) -> bool {
        self.contains(name)
    }
}

impl<V> VariableLookup for BTreeMap<String, V> {
    fn contains_variable(&self, name: &str) -> bool {
        self.contains_key(name)
    }
}

impl VariableLookup for [&str] {
    fn contains_variable(&self, name: &str) -> bool {
        self.contains(&name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rename_axis() {
        let info = VariableInfo::new("T2", &["Time", "south_north", "west_east"], "K", DataType::F32);
        let renamed = info.rename_axis("Time", "time");
        assert_eq!(renamed.axes, vec!["time", "south_north", "west_east"]);
        assert_eq!(renamed.axis_index("west_east"), Some(2));
        assert!(!renamed.has_axis("Time"));
    }

    #[test]
    fn test_attr_value() {
        assert_eq!(AttrValue::from("1.0E20").as_f64(), Some(1e20));
        assert_eq!(AttrValue::Int(-999).as_f64(), Some(-999.0));
        assert_eq!(AttrValue::Float(1.0).as_str(), None);
    }
}
