//! State shared by the derived variables of one job: per-variable carry
//! slots and the constant fields.
use std::collections::HashMap;

use ndarray::ArrayD;

use super::{DerivedVariableError, DerivedGraph};
use crate::{grid::VariableLookup, numerics::centered_difference};

/// Index of a derived variable's carry slot within a [`CarryState`]. Slots are
/// assigned by [`DerivedGraph`] in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey(pub usize);

/// State one derived variable keeps between evaluations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CarrySlot {
    /// Sampling interval of the first evaluation, for variables that require
    /// it to stay constant.
    pub sampling_interval: Option<f64>,
    /// Per-cell count of consecutive exceedances.
    pub run_length: Option<ArrayD<i16>>,
    /// Samples not yet forming a complete averaging interval (time on axis 0).
    pub pending: Option<ArrayD<f64>>,
}

impl CarrySlot {
    /// Record the sampling interval on first use, and fail if it changes later.
    pub(crate) fn check_constant_interval(&mut self, var: &str, interval: f64) -> Result<(), DerivedVariableError> {
        match self.sampling_interval {
            Some(expected) if expected != interval => Err(DerivedVariableError::NonConstantInterval {
                var: var.to_string(),
                expected,
                found: interval,
            }),
            Some(_) => Ok(()),
            None => {
                self.sampling_interval = Some(interval);
                Ok(())
            }
        }
    }
}

/// Carry slots of all derived variables of one job.
#[derive(Debug, Clone, Default)]
pub struct CarryState {
    slots: Vec<CarrySlot>,
}

impl CarryState {
    pub fn new(n: usize) -> Self {
        Self { slots: vec![CarrySlot::default(); n] }
    }

    pub fn slot(&self, key: SlotKey) -> Option<&CarrySlot> {
        self.slots.get(key.0)
    }

    /// The slot for `key`, growing the state if necessary.
    pub fn slot_mut(&mut self, key: SlotKey) -> &mut CarrySlot {
        if self.slots.len() <= key.0 {
            self.slots.resize(key.0 + 1, CarrySlot::default());
        }
        &mut self.slots[key.0]
    }

    /// Clear the slots of every variable that does not carry state across
    /// month boundaries.
    pub fn reset_month(&mut self, graph: &DerivedGraph) {
        for (key, var) in graph.iter_with_keys() {
            if !var.carries_over() {
                *self.slot_mut(key) = CarrySlot::default();
            }
        }
    }
}

/// Horizontal gradients of the terrain height, in m/m.
#[derive(Debug, Clone, PartialEq)]
pub struct TopographyGradient {
    pub south_north: ArrayD<f64>,
    pub west_east: ArrayD<f64>,
}

/// Time-invariant fields (terrain height, grid spacing) loaded once per job,
/// plus quantities derived from them on first use.
#[derive(Debug, Clone, Default)]
pub struct ConstantFields {
    fields: HashMap<String, ArrayD<f64>>,
    gradient: Option<TopographyGradient>,
}

impl ConstantFields {
    pub fn insert(&mut self, name: &str, data: ArrayD<f64>) {
        self.fields.insert(name.to_string(), data);
        if matches!(name, "HGT" | "DX" | "DY") {
            self.gradient = None;
        }
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f64>> {
        self.fields.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn require(&self, var: &str, name: &str) -> Result<&ArrayD<f64>, DerivedVariableError> {
        self.fields.get(name).ok_or_else(|| DerivedVariableError::MissingConstant {
            var: var.to_string(),
            constant: name.to_string(),
        })
    }

    fn require_scalar(&self, var: &str, name: &str) -> Result<f64, DerivedVariableError> {
        let arr = self.require(var, name)?;
        arr.iter().next().copied().ok_or_else(|| DerivedVariableError::MissingConstant {
            var: var.to_string(),
            constant: name.to_string(),
        })
    }

    /// Gradients of `HGT` along the south-north (`DY`) and west-east (`DX`)
    /// directions, computed on first call and cached for the rest of the job.
    pub fn topography_gradient(&mut self, var: &str) -> Result<&TopographyGradient, DerivedVariableError> {
        if self.gradient.is_none() {
            let hgt = self.require(var, "HGT")?;
            let dx = self.require_scalar(var, "DX")?;
            let dy = self.require_scalar(var, "DY")?;

            // Constant files keep a length-one Time axis; only the last two
            // axes are horizontal.
            let ndim = hgt.ndim();
            if ndim < 2 || hgt.shape()[..ndim - 2].iter().any(|&n| n != 1) {
                return Err(DerivedVariableError::ShapeMismatch {
                    var: var.to_string(),
                    detail: format!("HGT must be a single 2D field, got shape {:?}", hgt.shape()),
                });
            }
            let (ny, nx) = (hgt.shape()[ndim - 2], hgt.shape()[ndim - 1]);
            let hgt2d = hgt
                .to_shape((ny, nx))
                .map_err(|_| DerivedVariableError::Numerics(var.to_string()))?
                .into_owned()
                .into_dyn();

            let south_north = centered_difference(&hgt2d.view(), 0, dy)
                .map_err(|e| DerivedVariableError::numerics(var, e))?;
            let west_east = centered_difference(&hgt2d.view(), 1, dx)
                .map_err(|e| DerivedVariableError::numerics(var, e))?;
            log::debug!("computed topography gradient on a {ny}x{nx} grid for '{var}'");
            self.gradient = Some(TopographyGradient { south_north, west_east });
        }

        self.gradient
            .as_ref()
            .ok_or_else(|| DerivedVariableError::Numerics(var.to_string()))
    }
}

impl VariableLookup for ConstantFields {
    fn contains_variable(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }
}

/// Everything one job's derived variables share across steps, chunks and months.
#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub carry: CarryState,
    pub constants: ConstantFields,
}

impl JobContext {
    pub fn new(n_slots: usize) -> Self {
        Self {
            carry: CarryState::new(n_slots),
            constants: ConstantFields::default(),
        }
    }

    pub fn with_constants(mut self, constants: ConstantFields) -> Self {
        self.constants = constants;
        self
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{arr0, array};

    use super::*;

    #[test]
    fn test_gradient_from_3d_hgt() {
        let mut consts = ConstantFields::default();
        consts.insert("HGT", array![[[0.0, 10.0, 30.0], [100.0, 110.0, 130.0]]].into_dyn());
        consts.insert("DX", arr0(10.0).into_dyn());
        consts.insert("DY", arr0(100.0).into_dyn());
        let grad = consts.topography_gradient("OrographicIndex").unwrap();
        assert_eq!(grad.west_east, array![[1.0, 1.5, 2.0], [1.0, 1.5, 2.0]].into_dyn());
        assert_eq!(grad.south_north, array![[1.0, 1.0, 1.0], [1.0, 1.0, 1.0]].into_dyn());
    }

    #[test]
    fn test_gradient_needs_constants() {
        let mut consts = ConstantFields::default();
        consts.insert("HGT", array![[0.0, 1.0], [2.0, 3.0]].into_dyn());
        let err = consts.topography_gradient("OrographicIndex").unwrap_err();
        assert!(matches!(err, DerivedVariableError::MissingConstant { .. }));
    }

    #[test]
    fn test_reset_month_keeps_carryover_slots() {
        use crate::{
            derived::{consecutive_extremum, named_variable, ThresholdDirection},
            grid::{DataType, VariableInfo},
        };

        let x = VariableInfo::new("X", &["Time", "west_east"], "", DataType::F32);
        let graph = DerivedGraph::build(vec![
            named_variable("WetDays").unwrap(),
            consecutive_extremum(&x, ThresholdDirection::Above, 0.5, Some("ConX"), None),
        ])
        .unwrap();
        let key = |name: &str| graph.iter_with_keys().find(|(_, v)| v.name() == name).unwrap().0;

        let mut carry = CarryState::new(graph.len());
        for name in ["WetDays", "ConX"] {
            let slot = carry.slot_mut(key(name));
            slot.sampling_interval = Some(86400.0);
            slot.run_length = Some(ArrayD::from_elem(vec![2], 4));
        }
        carry.reset_month(&graph);

        assert_eq!(carry.slot(key("WetDays")), Some(&CarrySlot::default()));
        let kept = carry.slot(key("ConX")).unwrap();
        assert_eq!(kept.sampling_interval, Some(86400.0));
        assert_eq!(kept.run_length.as_ref().unwrap()[[1]], 4);
    }

    #[test]
    fn test_constant_interval() {
        let mut slot = CarrySlot::default();
        slot.check_constant_interval("WetDays", 3600.0).unwrap();
        slot.check_constant_interval("WetDays", 3600.0).unwrap();
        assert!(slot.check_constant_interval("WetDays", 7200.0).is_err());
    }
}
