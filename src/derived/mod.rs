//! Derived variables: quantities that are not in the model output but can be
//! computed from it while averaging.
//!
//! Each [`DerivedVariable`] is a descriptor (name, units, prerequisites, output
//! axes) plus one [`Computation`]. Linear computations commute with time
//! averaging and are evaluated once per month from the monthly means. Everything
//! else is evaluated on every time step from instantaneous values and summed (or
//! reduced to an extremum) over the month.
//!
//! Prerequisites must be checked with [`DerivedVariable::check_prerequisites`]
//! before a variable can be written or computed. Ordering between derived
//! variables is handled by [`DerivedGraph`], and all state that has to survive
//! from one time step, chunk or month to the next lives in a [`JobContext`].
use std::collections::{BTreeMap, HashMap};

use error_stack::ResultExt;
use ndarray::{ArrayD, Axis, Zip};

use crate::{
    grid::{DataType, VariableInfo, VariableLookup},
    numerics::NumericsError,
    output::{OutputStore, MONTH_DIM},
};

mod catalog;
mod context;
mod extrema;
mod formulas;
mod graph;

pub use catalog::{
    consecutive_extremum, default_derived_names, interval_extremum, named_variable, running_extremum,
    KNOWN_DERIVED_NAMES,
};
pub use context::{CarrySlot, CarryState, ConstantFields, JobContext, SlotKey, TopographyGradient};
pub use extrema::{
    ExtremumMode, IntervalMeanExtremum, RunLengthCounter, RunningExtremum, Sampling, ThresholdCount,
    ThresholdDirection,
};
pub use formulas::{LinearCombination, PhysicalFormula, PrecipPhase};
pub use graph::{DerivedGraph, GraphError};

/// Storage type of derived floating-point variables.
pub const DERIVED_DTYPE: DataType = DataType::F32;

/// Named arrays passed into [`DerivedVariable::compute_values`]: instantaneous
/// values (time on axis 0) during streaming, or monthly means for linear
/// variables.
pub type FieldMap = HashMap<String, ArrayD<f64>>;

#[derive(Debug, thiserror::Error)]
pub enum DerivedVariableError {
    #[error("Prerequisites for variable '{0}' are not satisfied.")]
    PrerequisitesNotSatisfied(String),
    #[error("The variable '{var}' requires the constant field '{constant}', which was not loaded")]
    MissingConstant { var: String, constant: String },
    #[error("The input '{input}' needed by '{var}' was not provided")]
    MissingInput { var: String, input: String },
    #[error("'{0}' needs the sampling interval, which cannot be determined from a single time step")]
    ZeroInterval(String),
    #[error("'{var}' requires a constant output interval of {expected} s, got {found} s")]
    NonConstantInterval { var: String, expected: f64, found: f64 },
    #[error("'{var}' can only aggregate along axis 0 (requested axis {axis})")]
    AggregationAxis { var: String, axis: usize },
    #[error("The pressure axis for '{0}' must decrease monotonically")]
    NonMonotonicAxis(String),
    #[error("Inputs to '{var}' have incompatible shapes: {detail}")]
    ShapeMismatch { var: String, detail: String },
    #[error("A numerical operation failed while computing '{0}'")]
    Numerics(String),
    #[error("Could not declare '{0}' in the output dataset")]
    Output(String),
}

impl DerivedVariableError {
    /// Errors that indicate an operation the computation does not support for
    /// this kind of input, rather than bad input data.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            Self::NonConstantInterval { .. } | Self::AggregationAxis { .. } | Self::ZeroInterval(_)
        )
    }

    pub(crate) fn numerics(var: &str, err: NumericsError) -> Self {
        match err {
            NumericsError::Broadcast { from, to } => Self::ShapeMismatch {
                var: var.to_string(),
                detail: format!("{from:?} vs. {to:?}"),
            },
            other => {
                log::debug!("numerics error in '{var}': {other}");
                Self::Numerics(var.to_string())
            }
        }
    }
}

/// Look up `name` in `inputs` on behalf of variable `var`.
pub(crate) fn input<'a>(var: &str, inputs: &'a FieldMap, name: &str) -> Result<&'a ArrayD<f64>, DerivedVariableError> {
    inputs.get(name).ok_or_else(|| DerivedVariableError::MissingInput {
        var: var.to_string(),
        input: name.to_string(),
    })
}

/// The closed set of ways a derived variable can be computed.
#[derive(Debug, Clone, PartialEq)]
pub enum Computation {
    /// A weighted sum of inputs; commutes with averaging.
    Linear(LinearCombination),
    /// 1 where an input exceeds a threshold, else 0; the monthly mean is the
    /// fraction of exceeding samples.
    Threshold(ThresholdCount),
    /// Running maximum or minimum of an input.
    Extremum(RunningExtremum),
    /// Longest run of consecutive threshold exceedances, in days.
    RunLength(RunLengthCounter),
    /// Extremum of fixed-length interval means.
    IntervalMean(IntervalMeanExtremum),
    /// A non-linear physical formula.
    Formula(PhysicalFormula),
}

impl Computation {
    fn inputs(&self) -> Vec<String> {
        match self {
            Computation::Linear(c) => c.inputs(),
            Computation::Threshold(c) => vec![c.variable.clone()],
            Computation::Extremum(c) => vec![c.variable.clone()],
            Computation::RunLength(c) => vec![c.variable.clone()],
            Computation::IntervalMean(c) => vec![c.variable.clone()],
            Computation::Formula(f) => f.inputs(),
        }
    }

    fn constants(&self) -> Vec<String> {
        match self {
            Computation::Formula(f) => f.constants(),
            _ => vec![],
        }
    }

    /// Whether the per-step output has the time axis removed (extremum family).
    fn reduces_time(&self) -> bool {
        matches!(
            self,
            Computation::Extremum(_) | Computation::RunLength(_) | Computation::IntervalMean(_)
        )
    }

    fn extremum_mode(&self) -> Option<ExtremumMode> {
        match self {
            Computation::Extremum(c) => Some(c.mode),
            Computation::RunLength(_) => Some(ExtremumMode::Max),
            Computation::IntervalMean(c) => Some(c.mode),
            _ => None,
        }
    }

    fn carries_over(&self) -> bool {
        matches!(self, Computation::RunLength(_) | Computation::IntervalMean(_))
    }
}

/// A derived variable: output metadata plus the computation that produces it.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedVariable {
    name: String,
    units: String,
    prerequisites: Vec<String>,
    constants: Vec<String>,
    axes: Vec<String>,
    dtype: DataType,
    attributes: BTreeMap<String, String>,
    linear: bool,
    normalize: bool,
    carryover: bool,
    computation: Computation,
    checked: bool,
}

impl DerivedVariable {
    pub fn new<A: AsRef<str>>(name: &str, units: &str, axes: &[A], computation: Computation) -> Self {
        let linear = matches!(computation, Computation::Linear(_));
        Self {
            name: name.to_string(),
            units: units.to_string(),
            prerequisites: computation.inputs(),
            constants: computation.constants(),
            axes: axes.iter().map(|a| a.as_ref().to_string()).collect(),
            dtype: DERIVED_DTYPE,
            attributes: BTreeMap::new(),
            linear,
            normalize: !computation.reduces_time(),
            carryover: computation.carries_over(),
            computation,
            checked: false,
        }
    }

    pub fn with_attribute<V: ToString>(mut self, key: &str, value: V) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_dtype(mut self, dtype: DataType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn units(&self) -> &str {
        &self.units
    }

    pub fn prerequisites(&self) -> &[String] {
        &self.prerequisites
    }

    pub fn constants(&self) -> &[String] {
        &self.constants
    }

    pub fn axes(&self) -> &[String] {
        &self.axes
    }

    pub fn computation(&self) -> &Computation {
        &self.computation
    }

    /// Linear variables are computed from monthly means instead of per step.
    pub fn is_linear(&self) -> bool {
        self.linear
    }

    /// Whether the monthly sum is divided by the number of steps.
    pub fn normalizes(&self) -> bool {
        self.normalize
    }

    /// Whether carry state survives the month boundary.
    pub fn carries_over(&self) -> bool {
        self.carryover
    }

    /// Whether each evaluation already reduces the time axis (extremum family).
    pub fn reduces_time(&self) -> bool {
        self.computation.reduces_time()
    }

    pub fn is_checked(&self) -> bool {
        self.checked
    }

    /// Output metadata of this variable.
    pub fn info(&self) -> VariableInfo {
        let mut info = VariableInfo::new(&self.name, &self.axes, &self.units, self.dtype);
        info.attributes = self.attributes.clone();
        info
    }

    /// Check that every prerequisite is available in `target` and, if this
    /// variable needs constant fields, that they are available in `constants`.
    /// Must succeed before the variable can be declared or computed.
    pub fn check_prerequisites(
        &mut self,
        target: &dyn VariableLookup,
        constants: Option<&dyn VariableLookup>,
    ) -> bool {
        let mut ok = true;
        for p in self.prerequisites.iter() {
            if !target.contains_variable(p) {
                log::debug!("'{}' is missing prerequisite '{p}'", self.name);
                ok = false;
            }
        }
        if !self.constants.is_empty() {
            match constants {
                Some(lookup) => {
                    for c in self.constants.iter() {
                        if !lookup.contains_variable(c) {
                            log::debug!("'{}' is missing constant field '{c}'", self.name);
                            ok = false;
                        }
                    }
                }
                None => ok = false,
            }
        }
        self.checked = ok;
        ok
    }

    /// Declare this variable in the output dataset.
    pub fn create_output_slot<S: OutputStore + ?Sized>(
        &self,
        store: &mut S,
    ) -> error_stack::Result<(), DerivedVariableError> {
        if !self.checked {
            return Err(DerivedVariableError::PrerequisitesNotSatisfied(self.name.clone()).into());
        }
        store
            .add_variable(&self.info())
            .change_context_lazy(|| DerivedVariableError::Output(self.name.clone()))
    }

    /// Compute this variable from `inputs`.
    ///
    /// `axis` is the time axis of the inputs and `interval` the sampling interval
    /// in seconds (`None` when computing from monthly means). Returns `None` when
    /// the computation has nothing to contribute yet (an interval mean that has
    /// not filled a whole interval).
    pub fn compute_values(
        &self,
        inputs: &FieldMap,
        axis: usize,
        interval: Option<f64>,
        constants: &mut ConstantFields,
        carry: &mut CarrySlot,
    ) -> Result<Option<ArrayD<f64>>, DerivedVariableError> {
        if !self.checked {
            return Err(DerivedVariableError::PrerequisitesNotSatisfied(self.name.clone()));
        }
        let name = self.name.as_str();
        match &self.computation {
            Computation::Linear(c) => c.evaluate(name, inputs, interval).map(Some),
            Computation::Threshold(c) => c.evaluate(name, inputs, interval, carry).map(Some),
            Computation::Extremum(c) => c.evaluate(name, inputs, axis).map(Some),
            Computation::RunLength(c) => c.evaluate(name, inputs, axis, interval, carry).map(Some),
            Computation::IntervalMean(c) => c.evaluate(name, inputs, axis, interval, carry),
            Computation::Formula(f) => f.evaluate(name, inputs, constants).map(Some),
        }
    }

    /// Fold a new contribution into the running monthly aggregate.
    ///
    /// Summing variables add `new` summed over `axis`; the extremum family takes
    /// the elementwise maximum or minimum (NaN wins). A `None` contribution leaves
    /// the aggregate unchanged.
    pub fn aggregate_values(
        &self,
        running: Option<ArrayD<f64>>,
        new: Option<&ArrayD<f64>>,
        axis: usize,
    ) -> Result<Option<ArrayD<f64>>, DerivedVariableError> {
        let Some(new) = new else {
            return Ok(running);
        };

        let contribution = match self.computation.extremum_mode() {
            Some(_) => new.clone(),
            None => {
                if axis >= new.ndim() {
                    return Err(DerivedVariableError::AggregationAxis {
                        var: self.name.clone(),
                        axis,
                    });
                }
                new.sum_axis(Axis(axis))
            }
        };

        let Some(mut running) = running else {
            return Ok(Some(contribution));
        };
        if running.shape() != contribution.shape() {
            return Err(DerivedVariableError::ShapeMismatch {
                var: self.name.clone(),
                detail: format!(
                    "running aggregate {:?} vs. new contribution {:?}",
                    running.shape(),
                    contribution.shape()
                ),
            });
        }

        match self.computation.extremum_mode() {
            Some(mode) => Zip::from(&mut running)
                .and(&contribution)
                .for_each(|r, &c| *r = mode.combine(*r, c)),
            None => running += &contribution,
        }
        Ok(Some(running))
    }

    /// Axes of the output record for one month, i.e. without the month axis.
    pub(crate) fn record_axes(&self) -> impl Iterator<Item = &str> {
        self.axes.iter().map(|a| a.as_str()).filter(|a| *a != MONTH_DIM)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use ndarray::array;

    use super::*;
    use crate::memory::MemoryStore;

    fn rain() -> DerivedVariable {
        named_variable("RAIN").unwrap()
    }

    #[test]
    fn test_unchecked_variable_fails() {
        let var = rain();
        let mut ctx = JobContext::new(1);
        let inputs = FieldMap::new();
        let res = var.compute_values(&inputs, 0, None, &mut ctx.constants, ctx.carry.slot_mut(SlotKey(0)));
        assert!(matches!(res, Err(DerivedVariableError::PrerequisitesNotSatisfied(_))));

        let mut store = MemoryStore::new();
        assert!(var.create_output_slot(&mut store).is_err());
    }

    #[test]
    fn test_check_prerequisites() {
        let mut var = rain();
        let schema: HashSet<String> = ["RAINNC".to_string()].into_iter().collect();
        assert!(!var.check_prerequisites(&schema, None));
        let schema: HashSet<String> = ["RAINNC".to_string(), "RAINC".to_string()].into_iter().collect();
        assert!(var.check_prerequisites(&schema, None));
        assert!(var.is_checked());
    }

    #[test]
    fn test_constants_required() {
        let mut var = named_variable("OrographicIndex").unwrap();
        let schema: HashSet<String> = ["U10".to_string(), "V10".to_string()].into_iter().collect();
        assert!(!var.check_prerequisites(&schema, None));
        let mut consts = ConstantFields::default();
        consts.insert("HGT", array![[0.0, 1.0], [2.0, 3.0]].into_dyn());
        consts.insert("DX", ndarray::arr0(1.0).into_dyn());
        consts.insert("DY", ndarray::arr0(1.0).into_dyn());
        assert!(var.check_prerequisites(&schema, Some(&consts)));
    }

    #[test]
    fn test_sum_aggregation() {
        let var = rain();
        let a = array![[1.0, 2.0], [3.0, 4.0]].into_dyn();
        let agg = var.aggregate_values(None, Some(&a), 0).unwrap();
        let agg = var.aggregate_values(agg, Some(&a), 0).unwrap().unwrap();
        assert_eq!(agg, array![8.0, 12.0].into_dyn());
        let unchanged = var.aggregate_values(Some(agg.clone()), None, 0).unwrap().unwrap();
        assert_eq!(unchanged, agg);
    }

    #[test]
    fn test_extrema_aggregation() {
        let info = VariableInfo::new("T2", &["Time", "south_north"], "K", DataType::F32);
        let max = running_extremum(&info, ExtremumMode::Max);
        let min = running_extremum(&info, ExtremumMode::Min);

        let first = array![5.0, 3.0].into_dyn();
        let second = array![7.0, 1.0].into_dyn();
        let agg = max.aggregate_values(None, Some(&first), 0).unwrap();
        let agg = max.aggregate_values(agg, Some(&second), 0).unwrap().unwrap();
        assert_eq!(agg, array![7.0, 3.0].into_dyn());

        let agg = min.aggregate_values(None, Some(&first), 0).unwrap();
        let agg = min.aggregate_values(agg, Some(&second), 0).unwrap().unwrap();
        assert_eq!(agg, array![5.0, 1.0].into_dyn());
    }

    #[test]
    fn test_create_output_slot() {
        let mut var = rain();
        let schema: HashSet<String> = ["RAINNC".to_string(), "RAINC".to_string()].into_iter().collect();
        assert!(var.check_prerequisites(&schema, None));
        let mut store = MemoryStore::new();
        store.add_dimension("south_north", 2).unwrap();
        store.add_dimension("west_east", 2).unwrap();
        var.create_output_slot(&mut store).unwrap();
        let info = store.variable_info("RAIN").unwrap();
        assert_eq!(info.units, "kg/m^2/s");
        assert_eq!(info.axes, vec!["time", "south_north", "west_east"]);
    }
}
