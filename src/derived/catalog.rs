//! Named derived variables that can be requested in the configuration, and
//! builders for the extremum family.
use super::{
    Computation, DerivedVariable, ExtremumMode, IntervalMeanExtremum, LinearCombination, PhysicalFormula,
    PrecipPhase, RunLengthCounter, RunningExtremum, Sampling, ThresholdCount, ThresholdDirection,
};
use crate::{
    grid::{DataType, VariableInfo},
    output::MONTH_DIM,
    source::TIME_DIM,
};

const RATE_UNITS: &str = "kg/m^2/s";
const SURFACE_AXES: [&str; 3] = [MONTH_DIM, "south_north", "west_east"];
const PLEV_AXES: [&str; 4] = [MONTH_DIM, "num_press_levels_stag", "south_north", "west_east"];
/// Precipitation rate above which a day counts as wet (0.02 mm/day).
const WET_DAY_THRESHOLD: f64 = 2.3e-7;
const FREEZING_POINT: f64 = 273.15;

/// Every name accepted by [`named_variable`].
pub const KNOWN_DERIVED_NAMES: &[&str] = &[
    "RAIN",
    "RAINMEAN",
    "LiquidPrecip",
    "SolidPrecip",
    "LiquidPrecip_SR",
    "SolidPrecip_SR",
    "NetPrecip",
    "NetPrecip_Srfc",
    "NetWaterFlux",
    "Runoff",
    "WaterVapor",
    "WetDays",
    "WetDaysMean",
    "FrostDays",
    "OrographicIndex",
    "OrographicIndexPlev",
    "OIPX",
    "WaterDensity",
    "WaterFlux_U",
    "WaterFlux_V",
    "WaterTransport_U",
    "WaterTransport_V",
];

fn linear(name: &str, terms: &[(&str, f64)]) -> DerivedVariable {
    DerivedVariable::new(name, RATE_UNITS, &SURFACE_AXES, Computation::Linear(LinearCombination::new(terms)))
}

fn formula(name: &str, units: &str, axes: &[&str], f: PhysicalFormula) -> DerivedVariable {
    DerivedVariable::new(name, units, axes, Computation::Formula(f))
}

fn threshold(name: &str, variable: &str, threshold: f64, direction: ThresholdDirection, sampling: Sampling) -> DerivedVariable {
    DerivedVariable::new(
        name,
        "",
        &SURFACE_AXES,
        Computation::Threshold(ThresholdCount {
            variable: variable.to_string(),
            threshold,
            direction,
            sampling,
        }),
    )
    .with_attribute("long_name", format!("fraction of samples with {variable} {} {threshold}", direction.symbol()))
}

fn snow_ratio(name: &str, phase: PrecipPhase) -> DerivedVariable {
    formula(
        name,
        RATE_UNITS,
        &SURFACE_AXES,
        PhysicalFormula::SnowRatioPartition {
            precip: "RAIN".to_string(),
            ratio: "SR".to_string(),
            phase,
        },
    )
}

fn product(name: &str, units: &str, axes: &[&str], first: &str, second: &str) -> DerivedVariable {
    formula(
        name,
        units,
        axes,
        PhysicalFormula::Product {
            first: first.to_string(),
            second: second.to_string(),
        },
    )
}

fn transport(name: &str, flux: &str) -> DerivedVariable {
    formula(
        name,
        "kg/m/s",
        &SURFACE_AXES,
        PhysicalFormula::ColumnTransport {
            flux: flux.to_string(),
            temperature: "T_PL".to_string(),
            pressure: "P_PL".to_string(),
        },
    )
}

fn orographic(u: &str, v: &str, axes: &[&str]) -> DerivedVariable {
    formula(
        "OrographicIndex",
        "",
        axes,
        PhysicalFormula::OrographicIndex {
            u: u.to_string(),
            v: v.to_string(),
        },
    )
}

/// Build the derived variable registered under `name`, if any.
///
/// Some entries are alternatives computing the same output from different
/// inputs (e.g. `NetPrecip_Srfc` produces `NetPrecip` from surface files).
pub fn named_variable(name: &str) -> Option<DerivedVariable> {
    let var = match name {
        "RAIN" => DerivedVariable::new(
            "RAIN",
            RATE_UNITS,
            &SURFACE_AXES,
            Computation::Linear(LinearCombination::sum(&["RAINNC", "RAINC"]).from_accumulated()),
        ),
        "RAINMEAN" => linear("RAINMEAN", &[("RAINNCVMEAN", 1.0), ("RAINCVMEAN", 1.0)]),
        "LiquidPrecip" => linear("LiquidPrecip", &[("RAINNC", 1.0), ("RAINC", 1.0), ("ACSNOW", -1.0)]),
        "SolidPrecip" => linear("SolidPrecip", &[("ACSNOW", 1.0)]),
        "LiquidPrecip_SR" => snow_ratio("LiquidPrecip_SR", PrecipPhase::Liquid),
        "SolidPrecip_SR" => snow_ratio("SolidPrecip_SR", PrecipPhase::Solid),
        "NetPrecip" => linear("NetPrecip", &[("RAIN", 1.0), ("SFCEVP", -1.0)]),
        "NetPrecip_Srfc" => linear("NetPrecip", &[("RAIN", 1.0), ("QFX", -1.0)]),
        "NetWaterFlux" => linear("NetWaterFlux", &[("LiquidPrecip", 1.0), ("SFCEVP", -1.0), ("ACSNOM", 1.0)]),
        "Runoff" => linear("Runoff", &[("SFROFF", 1.0), ("UDROFF", 1.0)]),
        "WaterVapor" => formula(
            "WaterVapor",
            "Pa",
            &SURFACE_AXES,
            PhysicalFormula::VaporPartialPressure {
                humidity: "Q2".to_string(),
                pressure: "PSFC".to_string(),
            },
        ),
        "WetDays" => threshold("WetDays", "RAIN", WET_DAY_THRESHOLD, ThresholdDirection::Above, Sampling::Constant),
        "WetDaysMean" => threshold("WetDays", "RAINMEAN", WET_DAY_THRESHOLD, ThresholdDirection::Above, Sampling::Daily),
        "FrostDays" => threshold("FrostDays", "T2MIN", FREEZING_POINT, ThresholdDirection::Below, Sampling::Daily),
        "OrographicIndex" => orographic("U10", "V10", &SURFACE_AXES),
        "OrographicIndexPlev" => orographic("U_PL", "V_PL", &PLEV_AXES),
        "OIPX" => product("OIPX", "", &SURFACE_AXES, "OrographicIndex", "RAIN"),
        "WaterDensity" => formula(
            "WaterDensity",
            "kg/m^3",
            &PLEV_AXES,
            PhysicalFormula::VaporDensity {
                dewpoint: "TD_PL".to_string(),
                temperature: "T_PL".to_string(),
            },
        ),
        "WaterFlux_U" => product("WaterFlux_U", RATE_UNITS, &PLEV_AXES, "U_PL", "WaterDensity"),
        "WaterFlux_V" => product("WaterFlux_V", RATE_UNITS, &PLEV_AXES, "V_PL", "WaterDensity"),
        "WaterTransport_U" => transport("WaterTransport_U", "WaterFlux_U"),
        "WaterTransport_V" => transport("WaterTransport_V", "WaterFlux_V"),
        _ => return None,
    };
    Some(var)
}

/// Derived variables computed by default for a given file type.
pub fn default_derived_names(file_type: &str) -> &'static [&'static str] {
    match file_type {
        "srfc" => &["RAIN", "LiquidPrecip", "SolidPrecip"],
        "hydro" => &["RAIN", "NetPrecip", "LiquidPrecip", "SolidPrecip", "NetWaterFlux"],
        _ => &[],
    }
}

fn capitalized(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Output axes for a variable that wraps `source`: the input record
/// dimension is renamed to the monthly one.
fn wrapped_axes(source: &VariableInfo) -> Vec<String> {
    source.rename_axis(TIME_DIM, MONTH_DIM).axes
}

/// Monthly maximum or minimum of `source`, named e.g. `MaxT2`.
pub fn running_extremum(source: &VariableInfo, mode: ExtremumMode) -> DerivedVariable {
    let name = format!("{}{}", mode.prefix(), capitalized(&source.name));
    let mut var = DerivedVariable::new(
        &name,
        &source.units,
        &wrapped_axes(source),
        Computation::Extremum(RunningExtremum {
            variable: source.name.clone(),
            mode,
        }),
    )
    .with_dtype(source.dtype);
    for (k, v) in source.attributes.iter() {
        var = var.with_attribute(k, v);
    }
    var.with_attribute("Aggregation", mode.description())
}

/// Longest monthly run of `source` above or below `threshold`, in days.
/// Without an explicit `name`, the name is e.g. `ConBeT2min`.
pub fn consecutive_extremum(
    source: &VariableInfo,
    direction: ThresholdDirection,
    threshold: f64,
    name: Option<&str>,
    long_name: Option<&str>,
) -> DerivedVariable {
    let (prefix, aggregation) = match direction {
        ThresholdDirection::Above => ("ConAb", "Maximum Monthly Consecutive Days Above Threshold"),
        ThresholdDirection::Below => ("ConBe", "Maximum Monthly Consecutive Days Below Threshold"),
    };
    let name = match name {
        Some(n) => n.to_string(),
        None => format!("{prefix}{}", capitalized(&source.name)),
    };
    let var = DerivedVariable::new(
        &name,
        "days",
        &wrapped_axes(source),
        Computation::RunLength(RunLengthCounter {
            variable: source.name.clone(),
            threshold,
            direction,
        }),
    )
    .with_dtype(DataType::F32)
    .with_attribute("Aggregation", aggregation)
    .with_attribute(
        "Variable",
        format!("{} {} {} {}", source.name, direction.symbol(), threshold, source.units),
    )
    .with_attribute("ThresholdValue", threshold)
    .with_attribute("ThresholdVariable", &source.name);
    match long_name {
        Some(ln) => var.with_attribute("long_name", ln),
        None => var,
    }
}

/// Extremum of `interval_days`-day means of `source`, named e.g. `MaxT2_7d`.
pub fn interval_extremum(source: &VariableInfo, mode: ExtremumMode, interval_days: u32) -> DerivedVariable {
    let name = format!("{}{}_{}d", mode.prefix(), capitalized(&source.name), interval_days);
    let mut var = DerivedVariable::new(
        &name,
        &source.units,
        &wrapped_axes(source),
        Computation::IntervalMean(IntervalMeanExtremum {
            variable: source.name.clone(),
            mode,
            interval_days,
        }),
    )
    .with_dtype(source.dtype);
    for (k, v) in source.attributes.iter() {
        var = var.with_attribute(k, v);
    }
    var.with_attribute("Aggregation", format!("Averaged {}", mode.description()))
        .with_attribute("AverageInterval", format!("{interval_days} days"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_known_name_resolves() {
        for name in KNOWN_DERIVED_NAMES {
            assert!(named_variable(name).is_some(), "{name} did not resolve");
        }
        assert!(named_variable("NotAVariable").is_none());
    }

    #[test]
    fn test_linearity_flags() {
        assert!(named_variable("RAIN").unwrap().is_linear());
        assert!(named_variable("NetWaterFlux").unwrap().is_linear());
        assert!(!named_variable("WaterVapor").unwrap().is_linear());
        assert!(!named_variable("WetDays").unwrap().is_linear());
        assert_eq!(named_variable("NetPrecip_Srfc").unwrap().name(), "NetPrecip");
        assert_eq!(named_variable("WaterTransport_V").unwrap().prerequisites(), &["T_PL", "P_PL", "WaterFlux_V"]);
    }

    #[test]
    fn test_extremum_naming() {
        let t2 = VariableInfo::new("T2", &["Time", "south_north", "west_east"], "K", DataType::F32);
        let max = running_extremum(&t2, ExtremumMode::Max);
        assert_eq!(max.name(), "MaxT2");
        assert_eq!(max.axes(), &["time", "south_north", "west_east"]);
        assert!(!max.normalizes());
        assert_eq!(max.info().attributes["Aggregation"], "Monthly Maximum");

        let weekly = interval_extremum(&t2, ExtremumMode::Min, 7);
        assert_eq!(weekly.name(), "MinT2_7d");
        assert!(weekly.carries_over());

        let t2min = VariableInfo::new("T2MIN", &["Time", "south_north", "west_east"], "K", DataType::F32);
        let frost = consecutive_extremum(&t2min, ThresholdDirection::Below, 273.15, None, None);
        assert_eq!(frost.name(), "ConBeT2MIN");
        assert_eq!(frost.units(), "days");
        assert!(frost.carries_over());
        let atts = frost.info().attributes;
        assert_eq!(atts["ThresholdVariable"], "T2MIN");
        assert_eq!(atts["Variable"], "T2MIN < 273.15 K");
    }

    #[test]
    fn test_default_lists() {
        assert_eq!(default_derived_names("srfc"), &["RAIN", "LiquidPrecip", "SolidPrecip"]);
        assert!(default_derived_names("xtrm").is_empty());
        for ft in ["srfc", "hydro"] {
            for name in default_derived_names(ft) {
                assert!(KNOWN_DERIVED_NAMES.contains(name));
            }
        }
    }
}
