use std::{collections::BTreeMap, fmt::Display, path::{Path, PathBuf}, str::FromStr};

use clap::Args;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    aggregator::AverageSettings,
    derived::{
        consecutive_extremum, default_derived_names, interval_extremum, named_variable, running_extremum,
        DerivedVariable, ExtremumMode, ThresholdDirection,
    },
    grid::VariableInfo,
};

static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}$").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Error converting value: {0}")]
    CannotConvert(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("Invalid argument: {0}")]
    ArgumentError(String),
    #[error("Unknown derived variable '{0}'")]
    UnknownDerived(String),
}

/// Settings that can be given on the command line or through environment
/// variables. Anything given here overrides the configuration file.
#[derive(Debug, Default, Args)]
pub struct ConfigArgs {
    /// A TOML file with the averaging configuration (optional). A file ending
    /// in ".json" is read as JSON instead. Settings not in the file keep their
    /// defaults.
    #[clap(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Directory containing the WRF output files to average.
    #[clap(short = 'i', long)]
    pub input_dir: Option<PathBuf>,

    /// Directory to write the monthly mean files to.
    #[clap(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// Experiment name to record in the output files.
    #[clap(short = 'e', long)]
    pub experiment: Option<String>,

    /// Number of jobs to run at once. 1 runs everything serially; the default
    /// is one per core.
    #[clap(short = 'n', long, env = "WRFAVG_THREADS")]
    pub threads: Option<usize>,

    /// "OVERWRITE" recomputes months that are already in the output; any other
    /// value appends only new months.
    #[clap(long, env = "WRFAVG_OVERWRITE")]
    pub write_mode: Option<WriteMode>,

    /// File types to process, separated by semicolons (e.g. "srfc;hydro").
    #[clap(short = 't', long, env = "WRFAVG_FILETYPES", value_delimiter = ';')]
    pub file_types: Option<Vec<String>>,
}

/// Whether months that already exist in the output are recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    #[default]
    Append,
    Overwrite,
}

impl FromStr for WriteMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "OVERWRITE" {
            Ok(Self::Overwrite)
        } else {
            Ok(Self::Append)
        }
    }
}

impl Display for WriteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteMode::Append => write!(f, "append"),
            WriteMode::Overwrite => write!(f, "overwrite"),
        }
    }
}

/// An extremum-type derived variable requested in the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtremumRequest {
    /// Monthly maximum or minimum, e.g. `MaxT2`.
    Running {
        file_type: String,
        variable: String,
        mode: ExtremumMode,
    },
    /// Longest run of days above or below a threshold.
    Consecutive {
        file_type: String,
        variable: String,
        direction: ThresholdDirection,
        threshold: f64,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        long_name: Option<String>,
    },
    /// Extremum of means over `days`-day intervals, e.g. `MaxT2_7d`.
    Interval {
        file_type: String,
        variable: String,
        mode: ExtremumMode,
        days: u32,
    },
}

impl ExtremumRequest {
    fn file_type(&self) -> &str {
        match self {
            ExtremumRequest::Running { file_type, .. } => file_type,
            ExtremumRequest::Consecutive { file_type, .. } => file_type,
            ExtremumRequest::Interval { file_type, .. } => file_type,
        }
    }

    fn variable(&self) -> &str {
        match self {
            ExtremumRequest::Running { variable, .. } => variable,
            ExtremumRequest::Consecutive { variable, .. } => variable,
            ExtremumRequest::Interval { variable, .. } => variable,
        }
    }

    fn build(&self, source: &VariableInfo) -> DerivedVariable {
        match self {
            ExtremumRequest::Running { mode, .. } => running_extremum(source, *mode),
            ExtremumRequest::Consecutive {
                direction,
                threshold,
                name,
                long_name,
                ..
            } => consecutive_extremum(source, *direction, *threshold, name.as_deref(), long_name.as_deref()),
            ExtremumRequest::Interval { mode, days, .. } => interval_extremum(source, *mode, *days),
        }
    }
}

/// The complete configuration of one `wrfavg` run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AverageConfig {
    /// Directory containing the `wrf{TYPE}_d{DD}_{DATE}_{TIME}.nc` input files.
    pub input_dir: PathBuf,

    /// Directory the `wrf{TYPE}_d{DD}_monthly.nc` files are written to.
    pub output_dir: PathBuf,

    pub experiment: Option<String>,

    pub file_types: Vec<String>,

    /// Number of jobs to run at once; `None` uses one per core.
    pub threads: Option<usize>,

    pub overwrite: bool,

    /// The first record of each input file repeats the last record of the
    /// previous file.
    pub restart_duplicated: bool,

    /// Accumulated variables and their bucket size (0 for no bucket).
    pub accumulated: BTreeMap<String, f64>,

    pub bucket_prefix: String,

    pub missing_value_attribute: String,

    /// File with constant fields (e.g. terrain height) for each domain,
    /// relative to `input_dir`. `{DOMAIN}` is replaced by the domain number and
    /// `{DOMAIN:02}` by the zero-padded domain number.
    pub constants_file: Option<String>,

    /// Names of the derived variables to compute, by file type. File types
    /// not listed here use the built-in defaults.
    pub derived: BTreeMap<String, Vec<String>>,

    pub extremes: Vec<ExtremumRequest>,
}

impl Default for AverageConfig {
    fn default() -> Self {
        let accumulated = [
            ("RAINNC", 100.0),
            ("RAINC", 100.0),
            ("RAINSH", 0.0),
            ("SNOWNC", 0.0),
            ("GRAUPELNC", 0.0),
            ("SFCEVP", 0.0),
            ("POTEVP", 0.0),
            ("ACSNOM", 0.0),
            ("ACSNOW", 0.0),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            input_dir: PathBuf::from("."),
            output_dir: PathBuf::from("."),
            experiment: None,
            file_types: ["srfc", "plev3d", "xtrm", "hydro"].into_iter().map(|s| s.to_string()).collect(),
            threads: None,
            overwrite: false,
            restart_duplicated: true,
            accumulated,
            bucket_prefix: "I_".to_string(),
            missing_value_attribute: "P_LEV_MISSING".to_string(),
            constants_file: Some("wrfconst_d{DOMAIN:02}.nc".to_string()),
            derived: BTreeMap::new(),
            extremes: vec![],
        }
    }
}

impl AverageConfig {
    /// Read a configuration file. Files ending in ".json" are parsed as JSON,
    /// everything else as TOML.
    pub fn read_from_path<P: AsRef<Path>>(p: P) -> Result<Self, ConfigError> {
        let p = p.as_ref();
        let text = std::fs::read_to_string(p)
            .map_err(|e| ConfigError::IoError(format!("could not read config file {}: {e}", p.display())))?;

        let is_json = p.extension().map(|ext| ext == "json").unwrap_or(false);
        let value: AverageConfig = if is_json {
            serde_json::from_str(&text)
                .map_err(|e| ConfigError::IoError(format!("the JSON file {} is not correct: {e}", p.display())))?
        } else {
            toml::from_str(&text)
                .map_err(|e| ConfigError::IoError(format!("the TOML file {} is not correct: {e}", p.display())))?
        };
        Ok(value)
    }

    /// Build the configuration from the defaults, the optional config file
    /// and the command line/environment, in increasing precedence.
    pub fn load(args: &ConfigArgs) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(p) => {
                let mut config = Self::read_from_path(p)?;
                config.input_dir = path_relative_to_config(p, std::mem::take(&mut config.input_dir));
                config.output_dir = path_relative_to_config(p, std::mem::take(&mut config.output_dir));
                config
            }
            None => Self::default(),
        };
        config.apply_args(args);
        Ok(config)
    }

    pub fn apply_args(&mut self, args: &ConfigArgs) {
        if let Some(dir) = &args.input_dir {
            self.input_dir = dir.clone();
        }
        if let Some(dir) = &args.output_dir {
            self.output_dir = dir.clone();
        }
        if let Some(exp) = &args.experiment {
            self.experiment = Some(exp.clone());
        }
        if let Some(n) = args.threads {
            self.threads = Some(n);
        }
        if let Some(mode) = args.write_mode {
            self.overwrite = mode == WriteMode::Overwrite;
        }
        if let Some(types) = &args.file_types {
            self.file_types = types.iter().filter(|t| !t.is_empty()).cloned().collect();
        }
    }

    /// Path of the constant-fields file for `domain`, if one is configured.
    pub fn constants_path(&self, domain: u32) -> Option<PathBuf> {
        let pattern = self.constants_file.as_ref()?;
        let name = pattern
            .replace("{DOMAIN:02}", &format!("{domain:02}"))
            .replace("{DOMAIN}", &domain.to_string());
        Some(self.input_dir.join(name))
    }

    /// Aggregator settings for one job.
    pub fn settings_for(&self, label: &str) -> AverageSettings {
        AverageSettings {
            label: label.to_string(),
            experiment: self.experiment.clone(),
            accumulated: self.accumulated.clone(),
            bucket_prefix: self.bucket_prefix.clone(),
            missing_value_attribute: self.missing_value_attribute.clone(),
            restart_duplicated: self.restart_duplicated,
            overwrite: self.overwrite,
        }
    }

    /// The derived variables to compute for `file_type`, given the variables
    /// found in its input. Extremum requests whose source variable is neither
    /// in the input nor a requested derived variable are skipped.
    pub fn derived_for(&self, file_type: &str, inputs: &[VariableInfo]) -> Result<Vec<DerivedVariable>, ConfigError> {
        let names: Vec<String> = match self.derived.get(file_type) {
            Some(names) => names.clone(),
            None => default_derived_names(file_type).iter().map(|s| s.to_string()).collect(),
        };

        let mut derived = vec![];
        for name in names {
            let var = named_variable(&name).ok_or_else(|| ConfigError::UnknownDerived(name.clone()))?;
            derived.push(var);
        }

        for request in self.extremes.iter().filter(|r| r.file_type() == file_type) {
            let source = inputs
                .iter()
                .find(|v| v.name == request.variable())
                .cloned()
                .or_else(|| derived.iter().find(|d| d.name() == request.variable()).map(|d| d.info()));
            match source {
                Some(source) => derived.push(request.build(&source)),
                None => log::warn!(
                    "Skipping extremum of '{}' for wrf{file_type}: the variable is not available",
                    request.variable()
                ),
            }
        }
        Ok(derived)
    }
}

/// If `p` is already an absolute path, return it unchanged. Otherwise, make it relative to
/// the parent directory of `config_file`.
fn path_relative_to_config(config_file: &Path, p: PathBuf) -> PathBuf {
    match config_file.parent() {
        Some(parent_dir) if p.is_relative() => parent_dir.join(p),
        _ => p,
    }
}

/// The dates to process, given on the command line as `YYYY`, `YYYY-MM`,
/// `YYYY-MM-DD` or a year range `YYYY-YYYY`.
///
/// Each component is a regular expression fragment, so month patterns such as
/// `1979-0[1-6]` also work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateRange {
    year: String,
    month: String,
    day: String,
}

impl Default for DateRange {
    fn default() -> Self {
        Self {
            year: r"\d\d\d\d".to_string(),
            month: r"\d\d".to_string(),
            day: r"\d\d".to_string(),
        }
    }
}

impl DateRange {
    /// Regular expression (without anchors) matching the `YYYY-MM-DD` part of
    /// an input file name.
    pub fn date_pattern(&self) -> String {
        format!("{}-{}-{}", self.year, self.month, self.day)
    }

    /// Build the alternation of every year from `first` to `last`.
    fn year_alternation(first: &str, last: &str) -> Result<String, ConfigError> {
        let (a, b) = match (first.parse::<u32>(), last.parse::<u32>()) {
            (Ok(a), Ok(b)) if YEAR_RE.is_match(first) && a <= b => (a, b),
            _ => {
                return Err(ConfigError::ArgumentError(format!(
                    "'{first}-{last}' is not a valid range of years"
                )))
            }
        };
        let years: Vec<String> = (a..=b).map(|y| format!("{y:04}")).collect();
        Ok(format!("({})", years.join("|")))
    }
}

impl FromStr for DateRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() > 3 || parts[0].len() < 4 {
            return Err(ConfigError::ArgumentError(format!(
                "'{s}' is not a date range; expected YYYY, YYYY-MM, YYYY-MM-DD or YYYY-YYYY"
            )));
        }

        let mut range = DateRange {
            year: parts[0].to_string(),
            ..Default::default()
        };
        if let Some(second) = parts.get(1) {
            if YEAR_RE.is_match(second) {
                if parts.len() > 2 {
                    return Err(ConfigError::ArgumentError(format!("'{s}' mixes a year range with a day")));
                }
                range.year = Self::year_alternation(parts[0], second)?;
            } else if (2..=4).contains(&second.len()) {
                range.month = second.to_string();
            } else {
                return Err(ConfigError::ArgumentError(format!("'{second}' is not a valid month in '{s}'")));
            }
        }
        if let Some(third) = parts.get(2) {
            if third.len() != 2 {
                return Err(ConfigError::ArgumentError(format!("'{third}' is not a valid day in '{s}'")));
            }
            range.day = third.to_string();
        }

        Regex::new(&range.date_pattern())
            .map_err(|e| ConfigError::ArgumentError(format!("'{s}' is not a valid date pattern: {e}")))?;
        Ok(range)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::grid::DataType;

    fn matches(range: &str, date: &str) -> bool {
        let range = DateRange::from_str(range).unwrap();
        Regex::new(&format!("^{}$", range.date_pattern())).unwrap().is_match(date)
    }

    #[test]
    fn test_date_ranges() {
        assert!(matches("1979", "1979-06-01"));
        assert!(!matches("1979", "1980-01-01"));
        assert!(matches("1979-02", "1979-02-15"));
        assert!(!matches("1979-02", "1979-03-01"));
        assert!(matches("1979-02-03", "1979-02-03"));
        assert!(matches("1979-0[1-6]", "1979-04-01"));
        assert!(!matches("1979-0[1-6]", "1979-07-01"));
        assert!(matches("1979-1981", "1980-12-01"));
        assert!(!matches("1979-1981", "1982-01-01"));
        assert!(matches("2045-2054", "2050-01-01"));
    }

    #[test]
    fn test_bad_date_ranges() {
        for arg in ["79", "1979-1", "1979-02-3", "1981-1979", "1979-02-03-04", "1979-1980-01", "1979-[0"] {
            assert!(
                matches!(DateRange::from_str(arg), Err(ConfigError::ArgumentError(_))),
                "'{arg}' should be rejected"
            );
        }
    }

    #[test]
    fn test_write_mode() {
        assert_eq!(WriteMode::from_str("OVERWRITE").unwrap(), WriteMode::Overwrite);
        assert_eq!(WriteMode::from_str("overwrite").unwrap(), WriteMode::Append);
        assert_eq!(WriteMode::from_str("").unwrap(), WriteMode::Append);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let mut f = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            f,
            r#"
input_dir = "/data/wrfout"
file_types = ["srfc"]
threads = 4

[accumulated]
RAINNC = 50.0

[derived]
srfc = ["RAIN"]

[[extremes]]
kind = "running"
file_type = "srfc"
variable = "T2"
mode = "max"

[[extremes]]
kind = "consecutive"
file_type = "srfc"
variable = "RAIN"
direction = "below"
threshold = 2.3e-7
name = "CDD"
"#
        )
        .unwrap();

        let config = AverageConfig::read_from_path(f.path()).unwrap();
        assert_eq!(config.input_dir, PathBuf::from("/data/wrfout"));
        assert_eq!(config.output_dir, PathBuf::from("."));
        assert_eq!(config.threads, Some(4));
        assert_eq!(config.accumulated.get("RAINNC"), Some(&50.0));
        assert!(config.restart_duplicated);
        assert_eq!(config.extremes.len(), 2);

        let inputs = vec![VariableInfo::new("T2", &["Time", "south_north", "west_east"], "K", DataType::F32)];
        let derived = config.derived_for("srfc", &inputs).unwrap();
        let names: Vec<&str> = derived.iter().map(|d| d.name()).collect();
        assert_eq!(names, vec!["RAIN", "MaxT2", "CDD"]);
    }

    #[test]
    fn test_command_line_wins() {
        let args = ConfigArgs {
            threads: Some(1),
            write_mode: Some(WriteMode::Overwrite),
            file_types: Some(vec!["hydro".to_string(), String::new()]),
            ..Default::default()
        };
        let config = AverageConfig::load(&args).unwrap();
        assert_eq!(config.threads, Some(1));
        assert!(config.overwrite);
        assert_eq!(config.file_types, vec!["hydro"]);
        assert_eq!(
            config.constants_path(2),
            Some(PathBuf::from(".").join("wrfconst_d02.nc"))
        );
    }

    #[test]
    fn test_paths_relative_to_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_file = dir.path().join("wrfavg.toml");
        std::fs::write(&config_file, "input_dir = \"wrfout\"\noutput_dir = \"/scratch/means\"\n").unwrap();
        let args = ConfigArgs {
            config: Some(config_file),
            ..Default::default()
        };
        let config = AverageConfig::load(&args).unwrap();
        assert_eq!(config.input_dir, dir.path().join("wrfout"));
        assert_eq!(config.output_dir, PathBuf::from("/scratch/means"));
    }

    #[test]
    fn test_unknown_derived_name() {
        let mut config = AverageConfig::default();
        config.derived.insert("srfc".to_string(), vec!["Nonsense".to_string()]);
        assert!(matches!(config.derived_for("srfc", &[]), Err(ConfigError::UnknownDerived(_))));
        assert!(AverageConfig::default().derived_for("xtrm", &[]).unwrap().is_empty());
    }
}
