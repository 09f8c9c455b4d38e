//! Finding the averaging jobs in an input directory and running them.
//!
//! A job is one file type on one domain, e.g. all `wrfsrfc_d01_*.nc` files.
//! Jobs are independent of each other: each reads its own inputs and writes
//! its own output file, so they can run on a worker pool.
use std::path::{Path, PathBuf};

use error_stack::ResultExt;
use itertools::Itertools;
use ndarray::arr0;
use rayon::prelude::*;
use regex::Regex;

use crate::{
    aggregator::{AverageSummary, MonthlyAggregator},
    config::{AverageConfig, DateRange},
    derived::{ConstantFields, DerivedGraph},
    grid::{GridField, VariableLookup},
    output::OutputStore,
    source::{read_static_fields, ChunkOpener, InputChunk, SourceError},
};

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("No input files for the requested file types and dates were found in {}", .0.display())]
    NoInputFiles(PathBuf),
    #[error("Invalid derived variable configuration for {0}")]
    Config(String),
    #[error("Could not load constant fields for {0}")]
    Constants(String),
    #[error("Averaging {0} failed")]
    Average(String),
    #[error("Could not start the worker pool")]
    Pool,
}

/// The input files of one file type and domain, in chronological order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub file_type: String,
    pub domain: u32,
    pub files: Vec<PathBuf>,
}

impl Job {
    /// e.g. `wrfsrfc_d01`
    pub fn label(&self) -> String {
        format!("wrf{}_d{:02}", self.file_type, self.domain)
    }

    pub fn output_name(&self) -> String {
        format!("{}_monthly.nc", self.label())
    }

    pub fn output_path(&self, config: &AverageConfig) -> PathBuf {
        config.output_dir.join(self.output_name())
    }
}

/// Find the input files of every configured file type, grouped by domain.
///
/// Domains are counted up from 1 until one has no matching files. Only files
/// whose date matches `range` are included.
pub fn discover_jobs(config: &AverageConfig, range: &DateRange) -> error_stack::Result<Vec<Job>, JobError> {
    let mut jobs = vec![];
    for file_type in config.file_types.iter() {
        for domain in 1.. {
            let files = find_input_files(&config.input_dir, file_type, domain, range)?;
            if files.is_empty() {
                break;
            }
            log::debug!("Found {} wrf{file_type} files for domain {domain}", files.len());
            jobs.push(Job {
                file_type: file_type.clone(),
                domain,
                files,
            });
        }
    }

    if jobs.is_empty() {
        return Err(JobError::NoInputFiles(config.input_dir.clone()).into());
    }
    Ok(jobs)
}

fn find_input_files(
    dir: &Path,
    file_type: &str,
    domain: u32,
    range: &DateRange,
) -> error_stack::Result<Vec<PathBuf>, JobError> {
    let name_re = Regex::new(&format!(
        r"^wrf{}_d{domain:02}_{}_\d\d:\d\d:\d\d\.nc$",
        regex::escape(file_type),
        range.date_pattern()
    ))
    .map_err(|e| JobError::IoError(format!("invalid file name pattern for wrf{file_type}: {e}")))?;

    let glob_pattern = dir.join(format!("wrf{file_type}_d{domain:02}_*.nc"));
    let glob_pattern = glob_pattern.to_string_lossy();
    let entries = glob::glob(&glob_pattern)
        .map_err(|e| JobError::IoError(format!("invalid glob pattern {glob_pattern}: {e}")))?;

    let mut files = vec![];
    for entry in entries {
        let path = entry.map_err(|e| JobError::IoError(format!("could not read {}: {e}", dir.display())))?;
        let matches = path
            .file_name()
            .map(|name| name_re.is_match(&name.to_string_lossy()))
            .unwrap_or(false);
        if matches {
            files.push(path);
        }
    }
    Ok(files.into_iter().sorted().collect())
}

/// Remove an existing output file so that it is recomputed from scratch.
/// This applies only when overwriting without a date range. With a range, the
/// selected months are recomputed in place.
pub fn clear_output_for_recompute(path: &Path, config: &AverageConfig, has_range: bool) -> error_stack::Result<bool, JobError> {
    if !config.overwrite || has_range || !path.exists() {
        return Ok(false);
    }
    std::fs::remove_file(path)
        .map_err(|e| JobError::IoError(format!("could not remove {}: {e}", path.display())))?;
    log::info!("Removed {} to recompute it", path.display());
    Ok(true)
}

/// Load the time-invariant fields of a constants file. Grid spacings stored
/// as global attributes (`DX`, `DY`) are added as scalar fields.
pub fn load_constants<C: InputChunk>(chunk: &C) -> error_stack::Result<ConstantFields, SourceError> {
    let mut constants = ConstantFields::default();
    for GridField { info, data } in read_static_fields(chunk)? {
        constants.insert(&info.name, data);
    }
    for name in ["DX", "DY"] {
        if constants.contains_variable(name) {
            continue;
        }
        if let Some(value) = chunk.global_f64(name) {
            constants.insert(name, arr0(value).into_dyn());
        }
    }
    Ok(constants)
}

/// Average the files of one job into `store`.
pub fn average_job<O: ChunkOpener, S: OutputStore>(
    config: &AverageConfig,
    job: &Job,
    opener: &O,
    store: &mut S,
    constants: ConstantFields,
) -> error_stack::Result<AverageSummary, JobError> {
    let label = job.label();
    let first_path = job
        .files
        .first()
        .ok_or_else(|| JobError::NoInputFiles(config.input_dir.clone()))?;
    let first = opener
        .open(first_path)
        .change_context_lazy(|| JobError::Average(label.clone()))?;
    let derived = config
        .derived_for(&job.file_type, &first.time_dependent_variables())
        .change_context_lazy(|| JobError::Config(label.clone()))?;
    drop(first);

    let graph = DerivedGraph::build(derived).change_context_lazy(|| JobError::Config(label.clone()))?;
    let settings = config.settings_for(&label);
    MonthlyAggregator::new(&settings, opener, &job.files, store, graph, constants)
        .run()
        .change_context_lazy(|| JobError::Average(label.clone()))
}

/// Run `work` on every job, serially if `threads` is 1 and on a worker pool
/// otherwise (`None` uses one worker per core). Results are in job order.
pub fn run_jobs<T, F>(
    jobs: &[Job],
    threads: Option<usize>,
    work: F,
) -> error_stack::Result<Vec<error_stack::Result<T, JobError>>, JobError>
where
    T: Send,
    F: Fn(&Job) -> error_stack::Result<T, JobError> + Sync,
{
    if threads == Some(1) || jobs.len() <= 1 {
        log::debug!("Running {} jobs serially", jobs.len());
        return Ok(jobs.iter().map(&work).collect());
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.unwrap_or(0))
        .build()
        .change_context(JobError::Pool)?;
    log::debug!("Running {} jobs on {} workers", jobs.len(), pool.current_num_threads());
    Ok(pool.install(|| jobs.par_iter().map(&work).collect()))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use ndarray::{Array2, Array3};

    use super::*;
    use crate::{
        grid::{DataType, VariableInfo},
        memory::{MemoryChunk, MemoryOpener, MemoryStore},
        source::TIME_DIM,
    };

    fn touch(dir: &Path, names: &[&str]) {
        for name in names {
            std::fs::write(dir.join(name), b"").unwrap();
        }
    }

    fn config_for(dir: &Path) -> AverageConfig {
        AverageConfig {
            input_dir: dir.to_path_buf(),
            output_dir: dir.to_path_buf(),
            file_types: vec!["srfc".to_string(), "hydro".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_discover_jobs() {
        let dir = tempfile::tempdir().unwrap();
        touch(
            dir.path(),
            &[
                "wrfsrfc_d01_1979-02-01_00:00:00.nc",
                "wrfsrfc_d01_1979-01-01_00:00:00.nc",
                "wrfsrfc_d01_1980-01-01_00:00:00.nc",
                "wrfsrfc_d02_1979-01-01_00:00:00.nc",
                "wrfsrfc_d04_1979-01-01_00:00:00.nc",
                "wrfsrfc_d01_monthly.nc",
                "wrfhydro_d01_1979-01-01_00:00:00.nc",
                "wrfxtrm_d01_1979-01-01_00:00:00.nc",
            ],
        );
        let config = config_for(dir.path());
        let range = DateRange::from_str("1979").unwrap();
        let jobs = discover_jobs(&config, &range).unwrap();
        let labels: Vec<String> = jobs.iter().map(|j| j.label()).collect();
        // d04 is not reached because d03 has no files.
        assert_eq!(labels, vec!["wrfsrfc_d01", "wrfsrfc_d02", "wrfhydro_d01"]);
        let names: Vec<String> = jobs[0]
            .files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["wrfsrfc_d01_1979-01-01_00:00:00.nc", "wrfsrfc_d01_1979-02-01_00:00:00.nc"]
        );
        assert_eq!(jobs[0].output_name(), "wrfsrfc_d01_monthly.nc");

        let all = discover_jobs(&config, &DateRange::default()).unwrap();
        assert_eq!(all[0].files.len(), 3);
    }

    #[test]
    fn test_no_input_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = discover_jobs(&config_for(dir.path()), &DateRange::default()).unwrap_err();
        assert!(matches!(err.current_context(), JobError::NoInputFiles(_)));
    }

    #[test]
    fn test_clear_output_only_without_range() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &["wrfsrfc_d01_monthly.nc"]);
        let path = dir.path().join("wrfsrfc_d01_monthly.nc");
        let mut config = config_for(dir.path());

        assert!(!clear_output_for_recompute(&path, &config, false).unwrap());
        config.overwrite = true;
        assert!(!clear_output_for_recompute(&path, &config, true).unwrap());
        assert!(path.exists());
        assert!(clear_output_for_recompute(&path, &config, false).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_run_jobs_keeps_order() {
        let jobs: Vec<Job> = (1..=5)
            .map(|domain| Job {
                file_type: "srfc".to_string(),
                domain,
                files: vec![],
            })
            .collect();
        for threads in [Some(1), Some(3), None] {
            let results = run_jobs(&jobs, threads, |job| {
                if job.domain == 4 {
                    Err(JobError::Average(job.label()).into())
                } else {
                    Ok(job.domain * 10)
                }
            })
            .unwrap();
            assert_eq!(results.len(), 5);
            assert_eq!(results[0].as_ref().ok(), Some(&10));
            assert!(results[3].is_err());
            assert_eq!(results[4].as_ref().ok(), Some(&50));
        }
    }

    #[test]
    fn test_load_constants() {
        let hgt = VariableInfo::new("HGT", &[TIME_DIM, "south_north"], "m", DataType::F32);
        let chunk = MemoryChunk::new("wrfconst_d01.nc", &["1979-01-01_00:00:00"])
            .with_dimension("south_north", 2)
            .with_field(GridField::new(
                hgt,
                Array2::from_shape_vec((1, 2), vec![10.0, 20.0]).unwrap().into_dyn(),
            ))
            .with_attribute("DX", 30000.0);
        let constants = load_constants(&chunk).unwrap();
        assert_eq!(constants.get("HGT").unwrap().shape(), &[2]);
        assert_eq!(constants.get("DX").unwrap().iter().next(), Some(&30000.0));
        assert!(constants.get("DY").is_none());
    }

    #[test]
    fn test_average_job_with_defaults() {
        let times: Vec<String> = (1..=31)
            .map(|d| format!("1979-01-{d:02}_00:00:00"))
            .chain(std::iter::once("1979-02-01_00:00:00".to_string()))
            .collect();
        let n = times.len();
        let axes = [TIME_DIM, "south_north", "west_east"];
        let field = |name: &str, values: Vec<f64>| {
            GridField::new(
                VariableInfo::new(name, &axes, "", DataType::F32),
                Array3::from_shape_vec((n, 1, 1), values).unwrap().into_dyn(),
            )
        };
        let accumulated: Vec<f64> = (0..n).map(|i| i as f64 * 8.64).collect();
        let chunk = MemoryChunk::new("jan", &times)
            .with_dimension("south_north", 1)
            .with_dimension("west_east", 1)
            .with_field(field("RAINNC", accumulated.clone()))
            .with_field(field("I_RAINNC", vec![0.0; n]))
            .with_field(field("RAINC", accumulated))
            .with_field(field("I_RAINC", vec![0.0; n]))
            .with_field(field("T2", vec![280.0; n]));

        let mut opener = MemoryOpener::new();
        let path = PathBuf::from("wrfsrfc_d01_1979-01-01_00:00:00.nc");
        opener.insert(&path, chunk);
        let job = Job {
            file_type: "srfc".to_string(),
            domain: 1,
            files: vec![path],
        };
        let mut config = AverageConfig::default();
        config.derived.insert("srfc".to_string(), vec!["RAIN".to_string()]);
        let mut store = MemoryStore::new();

        let summary = average_job(&config, &job, &opener, &mut store, ConstantFields::default()).unwrap();
        assert_eq!(summary.committed.len(), 1);
        let rain = store.record("RAIN", 0).unwrap();
        approx::assert_relative_eq!(rain.iter().next().copied().unwrap(), 2.0e-4, max_relative = 1e-12);
        assert_eq!(store.attribute("description").as_deref(), Some("wrfsrfc_d01 monthly means"));
    }
}
