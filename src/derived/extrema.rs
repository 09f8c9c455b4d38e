//! Threshold counts and the extremum family: running extrema, longest runs of
//! threshold exceedance and extrema of interval means.
use ndarray::{concatenate, ArrayD, Axis, Slice, Zip};
use serde::{Deserialize, Serialize};

use super::{input, CarrySlot, DerivedVariableError, FieldMap};
use crate::{
    calendar::SECONDS_PER_DAY,
    numerics::{nan_max, nan_min},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtremumMode {
    Max,
    Min,
}

impl ExtremumMode {
    pub fn combine(&self, a: f64, b: f64) -> f64 {
        match self {
            ExtremumMode::Max => nan_max(a, b),
            ExtremumMode::Min => nan_min(a, b),
        }
    }

    /// Identity element of [`ExtremumMode::combine`].
    fn identity(&self) -> f64 {
        match self {
            ExtremumMode::Max => f64::NEG_INFINITY,
            ExtremumMode::Min => f64::INFINITY,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            ExtremumMode::Max => "Max",
            ExtremumMode::Min => "Min",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ExtremumMode::Max => "Monthly Maximum",
            ExtremumMode::Min => "Monthly Minimum",
        }
    }

    /// Reduce `data` along `axis`. NaNs propagate.
    fn reduce(&self, data: &ArrayD<f64>, axis: usize) -> ArrayD<f64> {
        let mode = *self;
        data.fold_axis(Axis(axis), mode.identity(), |&acc, &x| mode.combine(acc, x))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdDirection {
    Above,
    Below,
}

impl ThresholdDirection {
    pub fn exceeds(&self, value: f64, threshold: f64) -> bool {
        match self {
            ThresholdDirection::Above => value > threshold,
            ThresholdDirection::Below => value < threshold,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            ThresholdDirection::Above => ">",
            ThresholdDirection::Below => "<",
        }
    }
}

/// Sampling requirement of a threshold count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sampling {
    /// Any interval, as long as it does not change during the job.
    Constant,
    /// Exactly one sample per day.
    Daily,
}

/// Fraction of samples exceeding a threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdCount {
    pub variable: String,
    pub threshold: f64,
    pub direction: ThresholdDirection,
    pub sampling: Sampling,
}

impl ThresholdCount {
    /// 1 where the input exceeds the threshold, 0 where it does not and NaN
    /// where the input is missing.
    pub(crate) fn evaluate(
        &self,
        var: &str,
        inputs: &FieldMap,
        interval: Option<f64>,
        carry: &mut CarrySlot,
    ) -> Result<ArrayD<f64>, DerivedVariableError> {
        if let Some(dt) = interval {
            match self.sampling {
                Sampling::Constant => carry.check_constant_interval(var, dt)?,
                Sampling::Daily if dt != SECONDS_PER_DAY => {
                    return Err(DerivedVariableError::NonConstantInterval {
                        var: var.to_string(),
                        expected: SECONDS_PER_DAY,
                        found: dt,
                    })
                }
                Sampling::Daily => (),
            }
        }
        let data = input(var, inputs, &self.variable)?;
        let (thr, dir) = (self.threshold, self.direction);
        Ok(data.mapv(|v| {
            if v.is_nan() {
                f64::NAN
            } else if dir.exceeds(v, thr) {
                1.0
            } else {
                0.0
            }
        }))
    }
}

/// Monthly maximum or minimum of a variable.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningExtremum {
    pub variable: String,
    pub mode: ExtremumMode,
}

impl RunningExtremum {
    pub(crate) fn evaluate(&self, var: &str, inputs: &FieldMap, axis: usize) -> Result<ArrayD<f64>, DerivedVariableError> {
        let data = input(var, inputs, &self.variable)?;
        check_axis(var, data, axis)?;
        Ok(self.mode.reduce(data, axis))
    }
}

/// Longest run of consecutive samples above or below a threshold, in days.
///
/// A run is only recorded once it ends; the per-cell counters persist across
/// chunk and month boundaries so that runs spanning them are measured in full.
#[derive(Debug, Clone, PartialEq)]
pub struct RunLengthCounter {
    pub variable: String,
    pub threshold: f64,
    pub direction: ThresholdDirection,
}

impl RunLengthCounter {
    pub(crate) fn evaluate(
        &self,
        var: &str,
        inputs: &FieldMap,
        axis: usize,
        interval: Option<f64>,
        carry: &mut CarrySlot,
    ) -> Result<ArrayD<f64>, DerivedVariableError> {
        // A run of a single record has no interval of its own.
        let delta = interval
            .or(carry.sampling_interval)
            .ok_or_else(|| DerivedVariableError::ZeroInterval(var.to_string()))?;
        carry.check_constant_interval(var, delta)?;
        let data = input(var, inputs, &self.variable)?;
        check_axis(var, data, axis)?;

        let cell_shape = data.index_axis(Axis(axis), 0).raw_dim();
        let mut counter = match carry.run_length.take() {
            Some(c) if c.raw_dim() == cell_shape => c,
            Some(c) => {
                return Err(DerivedVariableError::ShapeMismatch {
                    var: var.to_string(),
                    detail: format!("carried counter {:?} vs. input {:?}", c.shape(), data.shape()),
                })
            }
            None => ArrayD::<i16>::zeros(cell_shape.clone()),
        };
        let mut longest = ArrayD::<f64>::zeros(cell_shape);

        let (thr, dir) = (self.threshold, self.direction);
        let days_per_step = delta / SECONDS_PER_DAY;
        for step in data.axis_iter(Axis(axis)) {
            Zip::from(&mut counter)
                .and(&mut longest)
                .and(&step)
                .for_each(|count, best, &x| {
                    if dir.exceeds(x, thr) {
                        *count = count.saturating_add(1);
                    } else {
                        *best = best.max(*count as f64 * days_per_step);
                        *count = 0;
                    }
                });
        }

        carry.run_length = Some(counter);
        Ok(longest)
    }
}

/// Extremum of means over consecutive fixed-length intervals (e.g. the
/// warmest week). Samples that do not fill a whole interval are carried
/// forward to the next evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalMeanExtremum {
    pub variable: String,
    pub mode: ExtremumMode,
    pub interval_days: u32,
}

impl IntervalMeanExtremum {
    pub(crate) fn evaluate(
        &self,
        var: &str,
        inputs: &FieldMap,
        axis: usize,
        interval: Option<f64>,
        carry: &mut CarrySlot,
    ) -> Result<Option<ArrayD<f64>>, DerivedVariableError> {
        if axis != 0 {
            return Err(DerivedVariableError::AggregationAxis {
                var: var.to_string(),
                axis,
            });
        }
        let delta = match interval.or(carry.sampling_interval) {
            Some(dt) if dt > 0.0 => dt,
            _ => return Err(DerivedVariableError::ZeroInterval(var.to_string())),
        };
        carry.check_constant_interval(var, delta)?;
        let new = input(var, inputs, &self.variable)?;

        let data = match carry.pending.take() {
            Some(pending) => concatenate(Axis(0), &[pending.view(), new.view()]).map_err(|_| {
                DerivedVariableError::ShapeMismatch {
                    var: var.to_string(),
                    detail: format!("carried samples {:?} vs. new samples {:?}", pending.shape(), new.shape()),
                }
            })?,
            None => new.clone(),
        };

        let available = data.len_of(Axis(0));
        let steps_per_interval = ((self.interval_days as f64 * SECONDS_PER_DAY / delta).round() as usize).max(1);
        let n_intervals = available / steps_per_interval;
        if n_intervals == 0 {
            carry.pending = Some(data);
            return Ok(None);
        }

        let used = n_intervals * steps_per_interval;
        let mut result: Option<ArrayD<f64>> = None;
        for i in 0..n_intervals {
            let block = data.slice_axis(
                Axis(0),
                Slice::from(i * steps_per_interval..(i + 1) * steps_per_interval),
            );
            let mean = block
                .mean_axis(Axis(0))
                .ok_or_else(|| DerivedVariableError::Numerics(var.to_string()))?;
            result = Some(match result {
                None => mean,
                Some(mut acc) => {
                    Zip::from(&mut acc).and(&mean).for_each(|a, &m| *a = self.mode.combine(*a, m));
                    acc
                }
            });
        }

        carry.pending = if used < available {
            Some(data.slice_axis(Axis(0), Slice::from(used..)).to_owned())
        } else {
            None
        };
        Ok(result)
    }
}

fn check_axis(var: &str, data: &ArrayD<f64>, axis: usize) -> Result<(), DerivedVariableError> {
    if axis < data.ndim() {
        Ok(())
    } else {
        Err(DerivedVariableError::AggregationAxis {
            var: var.to_string(),
            axis,
        })
    }
}
