//! Compute monthly means of WRF output files.
//!
//! Every file type listed in the configuration is averaged separately for each
//! domain found in the input directory, e.g. all `wrfsrfc_d01_*.nc` files go
//! into `wrfsrfc_d01_monthly.nc`. Existing output files are extended with the
//! months they do not have yet, unless the write mode is "OVERWRITE".
use std::process::ExitCode;

use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use colored::Colorize;
use error_stack::ResultExt;
use wrfavg::{
    aggregator::AverageSummary,
    config::{AverageConfig, ConfigArgs, DateRange},
    jobs::{discover_jobs, run_jobs, JobError},
    netcdf_io::average_netcdf_job,
};

fn main() -> ExitCode {
    let clargs = Cli::parse();

    env_logger::Builder::new()
        .filter_level(clargs.verbose.log_level_filter())
        .init();

    match driver(clargs) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("An error occurred:\n{e:?}");
            ExitCode::FAILURE
        }
    }
}

/// Average WRF output files into monthly means
#[derive(Debug, Parser)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    /// Restrict the input files to these dates: YYYY, YYYY-MM, YYYY-MM-DD or
    /// a range of years, YYYY-YYYY. All dates are used if omitted.
    dates: Option<DateRange>,

    #[command(flatten)]
    verbose: Verbosity<WarnLevel>,
}

fn driver(clargs: Cli) -> error_stack::Result<bool, JobError> {
    let config = AverageConfig::load(&clargs.config).change_context(JobError::IoError("could not load the configuration".to_string()))?;
    let has_range = clargs.dates.is_some();
    let range = clargs.dates.unwrap_or_default();

    std::fs::create_dir_all(&config.output_dir)
        .change_context_lazy(|| JobError::IoError(format!("could not create {}", config.output_dir.display())))?;

    let jobs = discover_jobs(&config, &range)?;
    log::info!("Found {} jobs in {}", jobs.len(), config.input_dir.display());

    let results = run_jobs(&jobs, config.threads, |job| average_netcdf_job(&config, job, has_range))?;

    println!("\nSummary:");
    let mut n_failed = 0;
    for (job, res) in jobs.iter().zip(results) {
        let label = job.label();
        match res {
            Ok(summary) => print_summary(&label, &summary),
            Err(e) => {
                n_failed += 1;
                println!("{:^8} {label}", "FAILED".on_red().black().bold());
                log::error!("{e:?}");
            }
        }
    }

    if n_failed > 0 {
        println!("\n{n_failed} of {} jobs failed, rerun with -v for details.", jobs.len());
    }
    Ok(n_failed == 0)
}

fn print_summary(label: &str, summary: &AverageSummary) {
    let status = if summary.committed.is_empty() {
        "SKIPPED".on_yellow().black().bold()
    } else {
        "OK".on_green().black().bold()
    };
    let months = match (summary.committed.first(), summary.committed.last()) {
        (Some(first), Some(last)) if first == last => format!("wrote {first}"),
        (Some(first), Some(last)) => format!("wrote {first} to {last}"),
        _ => "no new months".to_string(),
    };
    let mut notes = vec![months];
    if !summary.skipped.is_empty() {
        notes.push(format!("{} months already present", summary.skipped.len()));
    }
    if let Some(month) = summary.incomplete {
        notes.push(format!("{month} incomplete"));
    }
    println!("{status:^8} {label}: {}", notes.join(", "));
}
