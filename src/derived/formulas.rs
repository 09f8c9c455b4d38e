//! Linear combinations and non-linear physical formulas.
use ndarray::{ArrayD, Axis, Slice};

use super::{input, ConstantFields, DerivedVariableError, FieldMap};
use crate::numerics::{broadcast_binary, simpson};

/// Molecular mass ratio of dry air to water vapour.
const M_AIR_OVER_M_WATER: f64 = 28.96 / 18.02;
/// Molar mass of water over the universal gas constant, kg K / J.
const M_WATER_OVER_R: f64 = 0.01802 / 8.3144621;
/// R / (M_water g), with g at 45 degrees latitude.
const R_OVER_M_G: f64 = 8.3144621 / (0.01802 * 9.80616);
/// Lower (surface) boundary of the pressure integration, Pa.
const SURFACE_PRESSURE_BOUND: f64 = 1.0e5;

/// A weighted sum of input fields.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearCombination {
    pub terms: Vec<(String, f64)>,
    /// Inputs are accumulated quantities turned into rates, which cannot be
    /// evaluated from a single time step.
    pub from_accumulated: bool,
}

impl LinearCombination {
    pub fn new(terms: &[(&str, f64)]) -> Self {
        Self {
            terms: terms.iter().map(|(n, c)| (n.to_string(), *c)).collect(),
            from_accumulated: false,
        }
    }

    pub fn sum(names: &[&str]) -> Self {
        let terms: Vec<(&str, f64)> = names.iter().map(|n| (*n, 1.0)).collect();
        Self::new(&terms)
    }

    pub fn from_accumulated(mut self) -> Self {
        self.from_accumulated = true;
        self
    }

    pub(crate) fn inputs(&self) -> Vec<String> {
        self.terms.iter().map(|(n, _)| n.clone()).collect()
    }

    pub(crate) fn evaluate(
        &self,
        var: &str,
        inputs: &FieldMap,
        interval: Option<f64>,
    ) -> Result<ArrayD<f64>, DerivedVariableError> {
        if self.from_accumulated && interval == Some(0.0) {
            return Err(DerivedVariableError::ZeroInterval(var.to_string()));
        }
        let mut terms = self.terms.iter();
        let (first, coef) = terms.next().ok_or_else(|| DerivedVariableError::MissingInput {
            var: var.to_string(),
            input: "<any>".to_string(),
        })?;
        let coef = *coef;
        let mut out = input(var, inputs, first)?.mapv(|v| coef * v);
        for (name, coef) in terms {
            let coef = *coef;
            out = broadcast_binary(&out, input(var, inputs, name)?, |a, b| a + coef * b)
                .map_err(|e| DerivedVariableError::numerics(var, e))?;
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecipPhase {
    Liquid,
    Solid,
}

/// Formulas that do not commute with time averaging.
#[derive(Debug, Clone, PartialEq)]
pub enum PhysicalFormula {
    /// Split precipitation into liquid and solid parts with the snow ratio.
    /// The ratio is either 0-1 or 0-2; the scale is detected from its maximum.
    SnowRatioPartition {
        precip: String,
        ratio: String,
        phase: PrecipPhase,
    },
    /// Partial pressure of water vapour from mixing ratio and pressure.
    VaporPartialPressure { humidity: String, pressure: String },
    /// Projection of the horizontal wind onto the terrain gradient.
    OrographicIndex { u: String, v: String },
    /// Elementwise product of two fields.
    Product { first: String, second: String },
    /// Water vapour density from dew point and temperature (Magnus formula).
    VaporDensity { dewpoint: String, temperature: String },
    /// Vertically integrated water vapour transport on pressure levels.
    ColumnTransport {
        flux: String,
        temperature: String,
        pressure: String,
    },
}

impl PhysicalFormula {
    pub(crate) fn inputs(&self) -> Vec<String> {
        match self {
            Self::SnowRatioPartition { precip, ratio, .. } => vec![precip.clone(), ratio.clone()],
            Self::VaporPartialPressure { humidity, pressure } => vec![humidity.clone(), pressure.clone()],
            Self::OrographicIndex { u, v } => vec![u.clone(), v.clone()],
            Self::Product { first, second } => vec![first.clone(), second.clone()],
            Self::VaporDensity { dewpoint, temperature } => vec![dewpoint.clone(), temperature.clone()],
            Self::ColumnTransport {
                flux,
                temperature,
                pressure,
            } => vec![temperature.clone(), pressure.clone(), flux.clone()],
        }
    }

    pub(crate) fn constants(&self) -> Vec<String> {
        match self {
            Self::OrographicIndex { .. } => vec!["HGT".to_string(), "DY".to_string(), "DX".to_string()],
            _ => vec![],
        }
    }

    pub(crate) fn evaluate(
        &self,
        var: &str,
        inputs: &FieldMap,
        constants: &mut ConstantFields,
    ) -> Result<ArrayD<f64>, DerivedVariableError> {
        let num_err = |e| DerivedVariableError::numerics(var, e);
        match self {
            Self::SnowRatioPartition { precip, ratio, phase } => {
                let precip = input(var, inputs, precip)?;
                let ratio = input(var, inputs, ratio)?;
                let two_scale = ratio.iter().any(|&r| r > 1.0);
                let phase = *phase;
                broadcast_binary(precip, ratio, move |p, sr| {
                    let solid_fraction = if two_scale { sr / 2.0 } else { sr };
                    match phase {
                        PrecipPhase::Liquid => p * (1.0 - solid_fraction),
                        PrecipPhase::Solid => p * solid_fraction,
                    }
                })
                .map_err(num_err)
            }
            Self::VaporPartialPressure { humidity, pressure } => {
                let q = input(var, inputs, humidity)?;
                let p = input(var, inputs, pressure)?;
                broadcast_binary(q, p, |q, p| M_AIR_OVER_M_WATER * q * p).map_err(num_err)
            }
            Self::OrographicIndex { u, v } => {
                let u = input(var, inputs, u)?;
                let v = input(var, inputs, v)?;
                let grad = constants.topography_gradient(var)?;
                let along_x = broadcast_binary(u, &grad.west_east, |a, b| a * b).map_err(num_err)?;
                let along_y = broadcast_binary(v, &grad.south_north, |a, b| a * b).map_err(num_err)?;
                broadcast_binary(&along_x, &along_y, |a, b| a + b).map_err(num_err)
            }
            Self::Product { first, second } => {
                let a = input(var, inputs, first)?;
                let b = input(var, inputs, second)?;
                broadcast_binary(a, b, |a, b| a * b).map_err(num_err)
            }
            Self::VaporDensity { dewpoint, temperature } => {
                let td = input(var, inputs, dewpoint)?;
                let t = input(var, inputs, temperature)?;
                broadcast_binary(td, t, |td, t| {
                    M_WATER_OVER_R * 6.1094 * (17.625 * (td - 273.15) / (td - 30.11)).exp() / t
                })
                .map_err(num_err)
            }
            Self::ColumnTransport {
                flux,
                temperature,
                pressure,
            } => column_transport(
                var,
                input(var, inputs, flux)?,
                input(var, inputs, temperature)?,
                input(var, inputs, pressure)?,
            ),
        }
    }
}

/// `R/(M g) * integral(flux * T / p dp)` over pressure levels.
///
/// `temperature` and `flux` are `(time, level, south_north, west_east)`,
/// `pressure` is `(time, level)`. The pressure axis is taken from the first
/// record and must decrease strictly. It is extended with a surface bound of
/// 1e5 Pa and a top bound of 0 Pa where the integrand is zero.
fn column_transport(
    var: &str,
    flux: &ArrayD<f64>,
    temperature: &ArrayD<f64>,
    pressure: &ArrayD<f64>,
) -> Result<ArrayD<f64>, DerivedVariableError> {
    let shape_err = |detail: String| DerivedVariableError::ShapeMismatch {
        var: var.to_string(),
        detail,
    };
    if temperature.ndim() != 4 || pressure.ndim() != 2 {
        return Err(shape_err(format!(
            "expected 4D temperature and 2D pressure, got {:?} and {:?}",
            temperature.shape(),
            pressure.shape()
        )));
    }
    if temperature.shape()[..2] != *pressure.shape() || flux.shape() != temperature.shape() {
        return Err(shape_err(format!(
            "temperature {:?}, pressure {:?}, flux {:?}",
            temperature.shape(),
            pressure.shape(),
            flux.shape()
        )));
    }

    let levels: Vec<f64> = pressure.index_axis(Axis(0), 0).iter().copied().collect();
    let decreasing = levels.windows(2).all(|w| w[1] < w[0]);
    let below_surface_bound = levels.first().map(|&p| p < SURFACE_PRESSURE_BOUND).unwrap_or(false);
    let above_top_bound = levels.last().map(|&p| p > 0.0).unwrap_or(false);
    if !(decreasing && below_surface_bound && above_top_bound) {
        return Err(DerivedVariableError::NonMonotonicAxis(var.to_string()));
    }

    let mut pax = Vec::with_capacity(levels.len() + 2);
    pax.push(-SURFACE_PRESSURE_BOUND);
    pax.extend(levels.iter().map(|p| -p));
    pax.push(0.0);

    let nlev = levels.len();
    let mut ext_shape = temperature.shape().to_vec();
    ext_shape[1] += 2;
    let mut integrand = ArrayD::<f64>::zeros(ext_shape);
    {
        let mut interior = integrand.slice_axis_mut(Axis(1), Slice::from(1..nlev + 1));
        let p4 = pressure
            .to_shape((pressure.shape()[0], nlev, 1, 1))
            .map_err(|_| DerivedVariableError::Numerics(var.to_string()))?
            .into_owned()
            .into_dyn();
        let weighted = broadcast_binary(flux, temperature, |f, t| R_OVER_M_G * f * t)
            .and_then(|ft| broadcast_binary(&ft, &p4, |ft, p| ft / p))
            .map_err(|e| DerivedVariableError::numerics(var, e))?;
        interior.assign(&weighted);
    }

    simpson(&integrand.view(), &pax, 1).map_err(|e| DerivedVariableError::numerics(var, e))
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::{arr0, array, Array4};

    use super::*;

    fn fields(items: &[(&str, ArrayD<f64>)]) -> FieldMap {
        items.iter().map(|(n, a)| (n.to_string(), a.clone())).collect()
    }

    #[test]
    fn test_linear_combination() {
        let lc = LinearCombination::new(&[("LiquidPrecip", 1.0), ("SFCEVP", -1.0), ("ACSNOM", 1.0)]);
        let inputs = fields(&[
            ("LiquidPrecip", array![3.0, 4.0].into_dyn()),
            ("SFCEVP", array![1.0, 1.0].into_dyn()),
            ("ACSNOM", array![0.5, 0.0].into_dyn()),
        ]);
        let out = lc.evaluate("NetWaterFlux", &inputs, None).unwrap();
        assert_eq!(out, array![2.5, 3.0].into_dyn());

        let acc = LinearCombination::sum(&["RAINNC", "RAINC"]).from_accumulated();
        let inputs = fields(&[("RAINNC", array![1.0].into_dyn()), ("RAINC", array![2.0].into_dyn())]);
        assert!(matches!(
            acc.evaluate("RAIN", &inputs, Some(0.0)),
            Err(DerivedVariableError::ZeroInterval(_))
        ));
        assert_eq!(acc.evaluate("RAIN", &inputs, None).unwrap(), array![3.0].into_dyn());
    }

    #[test]
    fn test_snow_ratio_scales() {
        let liquid = PhysicalFormula::SnowRatioPartition {
            precip: "RAIN".to_string(),
            ratio: "SR".to_string(),
            phase: PrecipPhase::Liquid,
        };
        let solid = PhysicalFormula::SnowRatioPartition {
            precip: "RAIN".to_string(),
            ratio: "SR".to_string(),
            phase: PrecipPhase::Solid,
        };
        let mut consts = ConstantFields::default();

        let inputs = fields(&[("RAIN", array![4.0, 4.0].into_dyn()), ("SR", array![0.25, 1.0].into_dyn())]);
        assert_eq!(liquid.evaluate("L", &inputs, &mut consts).unwrap(), array![3.0, 0.0].into_dyn());
        assert_eq!(solid.evaluate("S", &inputs, &mut consts).unwrap(), array![1.0, 4.0].into_dyn());

        let inputs = fields(&[("RAIN", array![4.0, 4.0].into_dyn()), ("SR", array![0.5, 2.0].into_dyn())]);
        assert_eq!(liquid.evaluate("L", &inputs, &mut consts).unwrap(), array![3.0, 0.0].into_dyn());
        assert_eq!(solid.evaluate("S", &inputs, &mut consts).unwrap(), array![1.0, 4.0].into_dyn());
    }

    #[test]
    fn test_vapor_pressure() {
        let f = PhysicalFormula::VaporPartialPressure {
            humidity: "Q2".to_string(),
            pressure: "PSFC".to_string(),
        };
        let inputs = fields(&[("Q2", array![0.01].into_dyn()), ("PSFC", array![1.0e5].into_dyn())]);
        let out = f.evaluate("WaterVapor", &inputs, &mut ConstantFields::default()).unwrap();
        assert_relative_eq!(out[[0]], 28.96 / 18.02 * 1000.0, max_relative = 1e-12);
    }

    #[test]
    fn test_orographic_index() {
        let f = PhysicalFormula::OrographicIndex {
            u: "U10".to_string(),
            v: "V10".to_string(),
        };
        let mut consts = ConstantFields::default();
        // terrain rising by 1 m per grid cell eastwards and 2 m per cell northwards
        consts.insert("HGT", array![[[0.0, 1.0], [2.0, 3.0]]].into_dyn());
        consts.insert("DX", arr0(1.0).into_dyn());
        consts.insert("DY", arr0(1.0).into_dyn());
        let u = ArrayD::from_elem(vec![3, 2, 2], 2.0);
        let v = ArrayD::from_elem(vec![3, 2, 2], -1.0);
        let inputs = fields(&[("U10", u), ("V10", v)]);
        let out = f.evaluate("OrographicIndex", &inputs, &mut consts).unwrap();
        assert_eq!(out.shape(), &[3, 2, 2]);
        assert!(out.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_vapor_density_at_freezing() {
        let f = PhysicalFormula::VaporDensity {
            dewpoint: "TD_PL".to_string(),
            temperature: "T_PL".to_string(),
        };
        let inputs = fields(&[("TD_PL", array![273.15].into_dyn()), ("T_PL", array![273.15].into_dyn())]);
        let out = f.evaluate("WaterDensity", &inputs, &mut ConstantFields::default()).unwrap();
        assert_relative_eq!(out[[0]], M_WATER_OVER_R * 6.1094 / 273.15, max_relative = 1e-12);
    }

    #[test]
    fn test_column_transport_three_levels() {
        // constant flux * T / p profile on three evenly spaced levels
        let levels = [75000.0, 50000.0, 25000.0];
        let c = 2.0;
        let temperature = Array4::from_elem((1, 3, 1, 1), 250.0).into_dyn();
        let mut pressure = ArrayD::zeros(vec![1, 3]);
        let mut flux = ArrayD::zeros(vec![1, 3, 1, 1]);
        for (k, &p) in levels.iter().enumerate() {
            pressure[[0, k]] = p;
            flux[[0, k, 0, 0]] = c * p / 250.0;
        }
        let inputs = fields(&[("WaterFlux_U", flux), ("T_PL", temperature), ("P_PL", pressure)]);
        let f = PhysicalFormula::ColumnTransport {
            flux: "WaterFlux_U".to_string(),
            temperature: "T_PL".to_string(),
            pressure: "P_PL".to_string(),
        };
        let out = f.evaluate("WaterTransport_U", &inputs, &mut ConstantFields::default()).unwrap();
        assert_eq!(out.shape(), &[1, 1, 1]);

        // integrand is zero at the bounds and R/(Mg) * c inside, with h = 25000 Pa
        let a = R_OVER_M_G * c;
        let expected = 25000.0 / 3.0 * (0.0 + 4.0 * a + 2.0 * a + 4.0 * a + 0.0);
        assert_relative_eq!(out[[0, 0, 0]], expected, max_relative = 1e-10);
    }

    #[test]
    fn test_column_transport_rejects_increasing_pressure() {
        let temperature = ArrayD::from_elem(vec![1, 2, 1, 1], 250.0);
        let flux = ArrayD::from_elem(vec![1, 2, 1, 1], 1.0);
        let pressure = array![[50000.0, 70000.0]].into_dyn();
        let inputs = fields(&[("F", flux), ("T", temperature), ("P", pressure)]);
        let f = PhysicalFormula::ColumnTransport {
            flux: "F".to_string(),
            temperature: "T".to_string(),
            pressure: "P".to_string(),
        };
        let res = f.evaluate("WaterTransport_U", &inputs, &mut ConstantFields::default());
        assert!(matches!(res, Err(DerivedVariableError::NonMonotonicAxis(_))));
    }
}
