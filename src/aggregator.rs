//! The monthly aggregation engine.
//!
//! A [`MonthlyAggregator`] walks the input chunks of one job (one file type and
//! domain) in order, finds where each calendar month begins and ends, and
//! commits one record per complete month to the output store. Plain variables
//! are summed over every record of the month and divided by the number of
//! records. Accumulated variables (running totals since the start of the
//! simulation) are differenced between the first record of the month and the
//! first record of the next one, then divided by the elapsed time.
//!
//! Derived variables that commute with averaging are computed from the monthly
//! means at commit time; all others are evaluated on every run of records from
//! instantaneous values (rates of accumulated variables are reconstructed by
//! centered differences) and summed or reduced over the month.
use std::{
    collections::{BTreeMap, HashMap},
    fmt::Display,
    ops::Range,
    path::PathBuf,
};

use error_stack::{Report, ResultExt};
use ndarray::{ArrayD, Axis, IxDyn, Slice};

use crate::{
    calendar::{calc_time_delta, month_elapsed_seconds, parse_date, MonthStamp},
    derived::{ConstantFields, DerivedGraph, DerivedVariable, DerivedVariableError, FieldMap, JobContext},
    grid::{AttrValue, DataType, VariableInfo},
    numerics::{centered_difference, fill_nan, mask_sentinel},
    output::{OutputStore, BEGIN_DATE_ATTR, END_DATE_ATTR, MONTH_DIM},
    source::{ChunkOpener, InputChunk, TimeCoordinate, TIMES_VAR, TIME_DIM},
};

#[derive(Debug, thiserror::Error)]
pub enum AverageError {
    #[error("Input dates are inconsistent: {0}")]
    DateConsistency(String),
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("Prerequisites of derived variables are not satisfied")]
    Prerequisites,
    #[error("Could not read the input files")]
    Input,
    #[error("Could not write the output dataset")]
    Output,
    #[error("Could not compute derived variable '{0}'")]
    Derived(String),
}

/// Per-job settings of the aggregator.
#[derive(Debug, Clone)]
pub struct AverageSettings {
    /// Label used in log messages, e.g. `wrfsrfc_d01`.
    pub label: String,
    pub experiment: Option<String>,
    /// Accumulated variables and their bucket size; a size of 0 means the
    /// variable has no bucket companion.
    pub accumulated: BTreeMap<String, f64>,
    /// Prefix of the bucket companion of an accumulated variable.
    pub bucket_prefix: String,
    /// Global attribute holding the missing-value sentinel, if present.
    pub missing_value_attribute: String,
    /// The first record of every chunk repeats the last record of the
    /// previous one (WRF restarts).
    pub restart_duplicated: bool,
    /// Recompute months that already exist in the output.
    pub overwrite: bool,
}

impl Default for AverageSettings {
    fn default() -> Self {
        Self {
            label: String::from("wrfavg"),
            experiment: None,
            accumulated: BTreeMap::new(),
            bucket_prefix: String::from("I_"),
            missing_value_attribute: String::from("P_LEV_MISSING"),
            restart_duplicated: true,
            overwrite: false,
        }
    }
}

impl AverageSettings {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            ..Default::default()
        }
    }
}

/// What happens to a month that the input covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonthAction {
    /// Write at the next free index.
    Append,
    /// Recompute a month that already exists.
    Overwrite,
    /// The month exists and overwriting is disabled; it is only scanned to
    /// validate the timing.
    Skip,
}

impl Display for MonthAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonthAction::Append => write!(f, "append"),
            MonthAction::Overwrite => write!(f, "overwrite"),
            MonthAction::Skip => write!(f, "skip"),
        }
    }
}

/// Outcome of one job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AverageSummary {
    pub committed: Vec<MonthStamp>,
    pub skipped: Vec<MonthStamp>,
    /// The month the input ended in, if it ended before that month was complete.
    pub incomplete: Option<MonthStamp>,
    /// Number of months whose elapsed time was shortened by the missing leap day.
    pub leap_corrections: usize,
}

/// A time-dependent input variable and how it is averaged.
#[derive(Debug, Clone)]
struct RawVariable {
    info: VariableInfo,
    time_axis: usize,
    /// Bucket size if this is an accumulated variable (0 for no bucket).
    accumulated: Option<f64>,
    /// Whether per-step derived variables need its instantaneous values.
    prerequisite: bool,
}

/// Position in the input sequence.
struct Cursor<C> {
    file: usize,
    chunk: C,
    start: usize,
}

/// Reference point of the elapsed-time measurement of a month.
#[derive(Debug, Clone)]
enum TimeOrigin {
    Minutes(f64),
    Stamp,
}

/// Running sums of the month being processed.
struct MonthState {
    month: MonthStamp,
    index: usize,
    action: MonthAction,
    ntime: usize,
    sums: HashMap<String, ArrayD<f64>>,
    derived: Vec<Option<ArrayD<f64>>>,
    first_timestamp: String,
    last_timestamp: String,
    origin: TimeOrigin,
    elapsed: Option<f64>,
}

pub struct MonthlyAggregator<'a, O: ChunkOpener, S: OutputStore> {
    settings: &'a AverageSettings,
    opener: &'a O,
    files: &'a [PathBuf],
    store: &'a mut S,
    graph: DerivedGraph,
    context: JobContext,
    raw: Vec<RawVariable>,
    dims: HashMap<String, usize>,
    missing_value: Option<f64>,
    /// Sampling interval of the most recent run that had one.
    last_interval: Option<f64>,
}

impl<'a, O: ChunkOpener, S: OutputStore> MonthlyAggregator<'a, O, S> {
    /// Set up an aggregator over `files` (in chronological order) writing to
    /// `store`. `constants` holds the time-invariant fields some derived
    /// variables need.
    pub fn new(
        settings: &'a AverageSettings,
        opener: &'a O,
        files: &'a [PathBuf],
        store: &'a mut S,
        graph: DerivedGraph,
        constants: ConstantFields,
    ) -> Self {
        let context = JobContext::new(graph.len()).with_constants(constants);
        Self {
            settings,
            opener,
            files,
            store,
            graph,
            context,
            raw: vec![],
            dims: HashMap::new(),
            missing_value: None,
            last_interval: None,
        }
    }

    fn open(&self, file: usize) -> error_stack::Result<O::Chunk, AverageError> {
        let path = self.files.get(file).ok_or_else(|| {
            Report::new(AverageError::Input).attach_printable(format!("no input file with index {file}"))
        })?;
        self.opener
            .open(path)
            .change_context(AverageError::Input)
            .attach_printable_lazy(|| format!("while processing {}", self.settings.label))
    }

    /// Process every month covered by the input and commit the complete ones.
    pub fn run(mut self) -> error_stack::Result<AverageSummary, AverageError> {
        if self.files.is_empty() {
            return Err(Report::new(AverageError::Input).attach_printable("no input files were given"));
        }
        let label = self.settings.label.clone();
        let first = self.open(0)?;
        let begin_ts = first.timestamp(0).change_context(AverageError::Input)?;
        let begin_date = parse_date(&begin_ts).change_context_lazy(|| {
            AverageError::DateConsistency(format!("invalid first timestamp '{begin_ts}'"))
        })?;
        let begin = MonthStamp::from_date(begin_date);
        if !begin.is_month_start(&begin_ts) {
            return Err(Report::new(AverageError::DateConsistency(format!(
                "the input must begin on the first of a month, but begins at {begin_ts}"
            ))));
        }
        let begin_day = begin_date.format("%Y-%m-%d").to_string();

        let last = self.open(self.files.len() - 1)?;
        let end_ts = last.timestamp(0).change_context(AverageError::Input)?;
        let end = MonthStamp::from_timestamp(&end_ts).change_context_lazy(|| {
            AverageError::DateConsistency(format!("invalid timestamp '{end_ts}' in the last input file"))
        })?;
        drop(last);
        if end < begin {
            return Err(Report::new(AverageError::DateConsistency(format!(
                "end date {end} is before begin date {begin}"
            ))));
        }

        self.classify_variables(&first)?;
        log::info!(
            "[{label}] monthly means from {begin} to {end}, incl.\n  variables: {}\n  derived variables: {}",
            self.raw.iter().map(|r| r.info.name.as_str()).collect::<Vec<_>>().join(", "),
            self.graph.names().join(", ")
        );

        let t0 = self.prepare_output(&first, &begin_day, begin)?;
        let coordinate = first.time_coordinate();

        let mut summary = AverageSummary::default();
        let mut cursor = Cursor {
            file: 0,
            chunk: first,
            start: 0,
        };

        for n in 0..=end.months_since(begin) {
            let month = begin.offset(n);
            let index = t0 + n as usize;
            let count = self.store.month_count();
            let action = if index >= count {
                MonthAction::Append
            } else if self.settings.overwrite {
                MonthAction::Overwrite
            } else {
                MonthAction::Skip
            };

            let first_timestamp = cursor.chunk.timestamp(cursor.start).change_context(AverageError::Input)?;
            if !month.is_month_start(&first_timestamp) {
                return Err(Report::new(AverageError::DateConsistency(format!(
                    "did not find the first day of {month} in {} (found {first_timestamp})",
                    cursor.chunk.label()
                ))));
            }
            let origin = match coordinate {
                TimeCoordinate::Minutes => TimeOrigin::Minutes(self.xtime(&cursor.chunk, cursor.start)?),
                TimeCoordinate::Stamps => TimeOrigin::Stamp,
            };
            self.context.carry.reset_month(&self.graph);
            let mut state = MonthState {
                month,
                index,
                action,
                ntime: 0,
                sums: HashMap::new(),
                derived: vec![None; self.graph.len()],
                last_timestamp: first_timestamp.clone(),
                first_timestamp,
                origin,
                elapsed: None,
            };
            log::debug!("[{label}] {month}: {action} at index {index}");

            let complete = loop {
                let len = cursor.chunk.time_len();
                let mut end_idx = len;
                while end_idx > cursor.start {
                    let ts = cursor.chunk.timestamp(end_idx - 1).change_context(AverageError::Input)?;
                    if !month.is_before(&ts) {
                        break;
                    }
                    end_idx -= 1;
                }
                if end_idx <= cursor.start {
                    return Err(Report::new(AverageError::DateConsistency(format!(
                        "{} has no records in {month} after index {}",
                        cursor.chunk.label(),
                        cursor.start
                    ))));
                }
                let complete = end_idx < len;

                if action != MonthAction::Skip {
                    self.accumulate_run(&cursor, end_idx, complete, &mut state)?;
                }
                state.ntime += end_idx - cursor.start;

                if complete {
                    if action != MonthAction::Skip {
                        self.finish_month(&cursor.chunk, end_idx, &mut state, &mut summary)?;
                    }
                    if self.settings.restart_duplicated && end_idx == len - 1 {
                        if cursor.file + 1 < self.files.len() {
                            cursor.file += 1;
                            cursor.chunk = self.open(cursor.file)?;
                            self.check_missing_value(&cursor.chunk)?;
                            cursor.start = 0;
                        } else {
                            cursor.start = end_idx;
                        }
                    } else {
                        cursor.start = end_idx;
                    }
                    break true;
                }

                if cursor.file + 1 >= self.files.len() {
                    break false;
                }
                cursor.file += 1;
                cursor.chunk = self.open(cursor.file)?;
                self.check_missing_value(&cursor.chunk)?;
                cursor.start = if self.settings.restart_duplicated { 1 } else { 0 };
            };

            if !complete {
                log::warn!(
                    "[{label}] input ends inside {month} after {} records; the month was not committed",
                    state.ntime
                );
                summary.incomplete = Some(month);
                break;
            }

            match action {
                MonthAction::Skip => {
                    log::debug!("[{label}] skipped {month}, it is already in the output");
                    summary.skipped.push(month);
                }
                _ => {
                    self.commit(state)?;
                    log::info!("[{label}] committed {month}");
                    summary.committed.push(month);
                }
            }
        }

        Ok(summary)
    }

    /// Sort the time-dependent variables of `chunk` into plain and accumulated
    /// ones and record the dimensions and missing-value sentinel.
    fn classify_variables(&mut self, chunk: &O::Chunk) -> error_stack::Result<(), AverageError> {
        let prerequisites = self.graph.instantaneous_prerequisites();
        self.missing_value = chunk.global_f64(&self.settings.missing_value_attribute);
        self.dims = chunk.dimensions().into_iter().collect();

        let mut raw = vec![];
        for info in chunk.time_dependent_variables() {
            if info.name.starts_with(&self.settings.bucket_prefix) {
                continue;
            }
            let Some(time_axis) = info.axis_index(TIME_DIM) else {
                continue;
            };
            let accumulated = self.settings.accumulated.get(&info.name).copied();
            let prerequisite = prerequisites.contains(&info.name);
            if accumulated.is_some() && self.missing_value.is_some() {
                return Err(Report::new(AverageError::UnsupportedOperation(format!(
                    "accumulated variable '{}' in an input with missing values",
                    info.name
                ))));
            }
            if prerequisite && time_axis != 0 {
                return Err(Report::new(AverageError::UnsupportedOperation(format!(
                    "instantaneous values of '{}' are needed, but its time axis is not the first one",
                    info.name
                ))));
            }
            raw.push(RawVariable {
                info,
                time_axis,
                accumulated,
                prerequisite,
            });
        }
        self.raw = raw;
        Ok(())
    }

    fn check_missing_value(&self, chunk: &O::Chunk) -> error_stack::Result<(), AverageError> {
        let found = chunk.global_f64(&self.settings.missing_value_attribute);
        if found != self.missing_value {
            return Err(Report::new(AverageError::Input)).attach_printable(format!(
                "{} has missing value {found:?}, expected {:?}",
                chunk.label(),
                self.missing_value
            ));
        }
        Ok(())
    }

    /// Create the output layout or validate the existing one. Returns the
    /// 0-based month index the input begins at.
    fn prepare_output(
        &mut self,
        chunk: &O::Chunk,
        begin_date: &str,
        begin: MonthStamp,
    ) -> error_stack::Result<usize, AverageError> {
        match self.store.begin_date() {
            Some(out_begin) => self.validate_append(&out_begin, begin_date, begin),
            None => {
                self.create_output(chunk, begin_date)?;
                Ok(0)
            }
        }
    }

    fn validate_append(
        &mut self,
        out_begin: &str,
        begin_date: &str,
        begin: MonthStamp,
    ) -> error_stack::Result<usize, AverageError> {
        let date = parse_date(out_begin).change_context_lazy(|| {
            AverageError::DateConsistency(format!("invalid {BEGIN_DATE_ATTR} '{out_begin}' in the output"))
        })?;
        let out_month = MonthStamp::from_date(date);
        if !out_begin.starts_with(&format!("{}-01", out_month.prefix())) {
            return Err(Report::new(AverageError::DateConsistency(format!(
                "output {BEGIN_DATE_ATTR} {out_begin} is not the first of a month"
            ))));
        }

        let t0 = begin.months_since(out_month) + 1;
        let count = self.store.month_count() as i32;
        let ends_before = self
            .store
            .end_date()
            .map(|e| e.as_str() < begin_date)
            .unwrap_or(true);
        let valid = t0 >= 1 && if ends_before { t0 == count + 1 } else { t0 <= count + 1 };
        if !valid {
            return Err(Report::new(AverageError::DateConsistency(format!(
                "input beginning {begin_date} (month {t0}) does not continue the output's {count} months"
            ))));
        }

        for var in self.graph.iter() {
            if !self.store.contains_variable(var.name()) {
                return Err(Report::new(AverageError::Prerequisites)).attach_printable(format!(
                    "derived variable '{}' is not in the existing output",
                    var.name()
                ));
            }
        }
        self.graph
            .check_prerequisites(&*self.store, Some(&self.context.constants))
            .change_context(AverageError::Prerequisites)?;
        log::debug!("[{}] appending from month {t0}", self.settings.label);
        Ok((t0 - 1) as usize)
    }

    fn create_output(&mut self, chunk: &O::Chunk, begin_date: &str) -> error_stack::Result<(), AverageError> {
        for (name, len) in chunk.dimensions() {
            if name != TIME_DIM {
                self.store.add_dimension(&name, len).change_context(AverageError::Output)?;
            }
        }
        let month_units = format!("month since {begin_date}");
        self.store
            .add_variable(&VariableInfo::new(MONTH_DIM, &[MONTH_DIM], &month_units, DataType::I32))
            .change_context(AverageError::Output)?;
        self.store
            .add_variable(&VariableInfo::new(TIMES_VAR, &[MONTH_DIM], "", DataType::Char))
            .change_context(AverageError::Output)?;

        for info in chunk.variables() {
            if info.has_axis(TIME_DIM) || !info.dtype.is_numeric() {
                continue;
            }
            let field = chunk.read_static(&info.name).change_context(AverageError::Input)?;
            self.store.put_static(&field).change_context(AverageError::Output)?;
        }

        for raw in self.raw.iter() {
            let mut info = raw.info.rename_axis(TIME_DIM, MONTH_DIM);
            if raw.accumulated.is_some() {
                info.units = format!("{}/s", info.units);
            }
            if let Some(mv) = self.missing_value {
                info = info.with_attribute("missing_value", mv);
            }
            self.store.add_variable(&info).change_context(AverageError::Output)?;
        }

        self.graph
            .check_and_declare(&mut *self.store, Some(&self.context.constants))
            .change_context(AverageError::Prerequisites)?;

        for (name, value) in chunk.global_attributes() {
            self.store.set_attribute(&name, value).change_context(AverageError::Output)?;
        }
        let attributes = [
            ("description", Some(format!("{} monthly means", self.settings.label))),
            (BEGIN_DATE_ATTR, Some(begin_date.to_string())),
            ("experiment", self.settings.experiment.clone()),
        ];
        for (name, value) in attributes {
            if let Some(value) = value {
                self.store
                    .set_attribute(name, AttrValue::from(value))
                    .change_context(AverageError::Output)?;
            }
        }
        self.store.sync().change_context(AverageError::Output)?;
        log::debug!("[{}] created output dataset", self.settings.label);
        Ok(())
    }

    fn xtime(&self, chunk: &O::Chunk, index: usize) -> error_stack::Result<f64, AverageError> {
        chunk
            .xtime(index)
            .change_context(AverageError::Input)?
            .ok_or_else(|| Report::new(AverageError::Input))
            .attach_printable_lazy(|| format!("{} has no XTIME variable", chunk.label()))
    }

    /// Add records `cursor.start..end` to the running sums and evaluate the
    /// per-step derived variables on them.
    fn accumulate_run(
        &mut self,
        cursor: &Cursor<O::Chunk>,
        end: usize,
        complete: bool,
        state: &mut MonthState,
    ) -> error_stack::Result<(), AverageError> {
        let chunk = &cursor.chunk;
        let start = cursor.start;
        let interval = if self.graph.per_step_keys().is_empty() {
            None
        } else {
            self.run_interval(chunk, start, end, state.month)?.or(self.last_interval)
        };
        if interval.is_some() {
            self.last_interval = interval;
        }
        // A run that ends the input inside a month is never committed, and may
        // be a lone record with nothing to difference against.
        let evaluate_per_step = complete || cursor.file + 1 < self.files.len();

        let mut instantaneous = FieldMap::new();
        for raw in self.raw.iter() {
            let name = raw.info.name.as_str();
            match raw.accumulated {
                Some(bucket) => {
                    if state.ntime == 0 {
                        let first = self.accumulated_values(chunk, raw, bucket, start..start + 1)?;
                        state.sums.insert(name.to_string(), -first.index_axis_move(Axis(raw.time_axis), 0));
                    }
                    if complete {
                        let last = self.accumulated_values(chunk, raw, bucket, end..end + 1)?;
                        add_into(&mut state.sums, name, last.index_axis_move(Axis(raw.time_axis), 0))?;
                    }
                    if raw.prerequisite && evaluate_per_step {
                        let rate = self.instantaneous_rate(chunk, raw, bucket, start, end, interval)?;
                        instantaneous.insert(name.to_string(), rate);
                    }
                }
                None => {
                    let mut data = chunk
                        .read(name, start..end)
                        .change_context(AverageError::Input)?
                        .data;
                    if let Some(mv) = self.missing_value {
                        mask_sentinel(&mut data, mv);
                    }
                    add_into(&mut state.sums, name, data.sum_axis(Axis(raw.time_axis)))?;
                    if raw.prerequisite {
                        instantaneous.insert(name.to_string(), data);
                    }
                }
            }
        }

        if !evaluate_per_step {
            log::debug!(
                "[{}] skipping per-step derived variables for the trailing records of {}",
                self.settings.label,
                chunk.label()
            );
            return Ok(());
        }
        for key in self.graph.per_step_keys() {
            let Some(var) = self.graph.get(key) else {
                continue;
            };
            let result = var
                .compute_values(
                    &instantaneous,
                    0,
                    interval,
                    &mut self.context.constants,
                    self.context.carry.slot_mut(key),
                )
                .map_err(|e| derived_report(var, e))?;
            if !var.is_linear() {
                let running = state.derived[key.0].take();
                state.derived[key.0] = var
                    .aggregate_values(running, result.as_ref(), 0)
                    .map_err(|e| derived_report(var, e))?;
            }
            if self.graph.feeds_forward(key) {
                if let Some(result) = result {
                    instantaneous.insert(var.name().to_string(), result);
                }
            }
        }
        Ok(())
    }

    /// Seconds between consecutive records of the run `start..end`. Runs of a
    /// single record use the neighbouring record of the same chunk.
    fn run_interval(
        &self,
        chunk: &O::Chunk,
        start: usize,
        end: usize,
        month: MonthStamp,
    ) -> error_stack::Result<Option<f64>, AverageError> {
        let len = chunk.time_len();
        let (a, b, in_month) = if end - start >= 2 {
            (start, end - 1, true)
        } else if end < len {
            (start, end, true)
        } else if start > 0 {
            (start - 1, start, false)
        } else {
            return Ok(None);
        };
        let steps = (b - a) as f64;

        let x0 = chunk.xtime(a).change_context(AverageError::Input)?;
        let x1 = chunk.xtime(b).change_context(AverageError::Input)?;
        if let (Some(x0), Some(x1)) = (x0, x1) {
            return Ok(Some((x1 - x0) * 60.0 / steps));
        }

        let stamps = chunk.timestamps(a..b + 1).change_context(AverageError::Input)?;
        let (year, mon) = if in_month {
            (Some(month.year), Some(month.month))
        } else {
            (None, None)
        };
        let delta = calc_time_delta(&stamps, year, mon).change_context_lazy(|| {
            AverageError::DateConsistency(format!("records {a}..={b} of {}", chunk.label()))
        })?;
        Ok(Some(delta / steps))
    }

    /// Values of an accumulated variable over `range`, bucket level included.
    fn accumulated_values(
        &self,
        chunk: &O::Chunk,
        raw: &RawVariable,
        bucket: f64,
        range: Range<usize>,
    ) -> error_stack::Result<ArrayD<f64>, AverageError> {
        let name = &raw.info.name;
        let mut data = chunk
            .read(name, range.clone())
            .change_context(AverageError::Input)?
            .data;
        if bucket > 0.0 {
            let bucket_name = format!("{}{name}", self.settings.bucket_prefix);
            let level = chunk
                .read(&bucket_name, range)
                .change_context(AverageError::Input)
                .attach_printable_lazy(|| format!("bucket companion of accumulated variable '{name}'"))?
                .data;
            if level.shape() != data.shape() {
                return Err(Report::new(AverageError::Input)).attach_printable(format!(
                    "'{bucket_name}' has shape {:?}, but '{name}' has shape {:?}",
                    level.shape(),
                    data.shape()
                ));
            }
            data.zip_mut_with(&level, |v, &l| *v += l * bucket);
        }
        Ok(data)
    }

    /// Instantaneous rates of an accumulated variable over `start..end`,
    /// reconstructed by centered differences.
    fn instantaneous_rate(
        &self,
        chunk: &O::Chunk,
        raw: &RawVariable,
        bucket: f64,
        start: usize,
        end: usize,
        interval: Option<f64>,
    ) -> error_stack::Result<ArrayD<f64>, AverageError> {
        let name = raw.info.name.as_str();
        let len = chunk.time_len();
        let (window, offset) = if end - start >= 2 {
            (start..end, None)
        } else if end < len {
            (start..start + 2, Some(0))
        } else if start > 0 {
            (start - 1..start + 1, Some(1))
        } else {
            return Err(Report::new(AverageError::UnsupportedOperation(format!(
                "cannot reconstruct instantaneous rates of '{name}' from a single record"
            ))));
        };
        let delta = interval.filter(|d| *d > 0.0).ok_or_else(|| {
            Report::new(AverageError::UnsupportedOperation(format!(
                "no positive sampling interval to compute rates of '{name}'"
            )))
        })?;

        let values = self.accumulated_values(chunk, raw, bucket, window)?;
        let rate = centered_difference(&values.view(), raw.time_axis, delta)
            .change_context_lazy(|| AverageError::Derived(name.to_string()))?;
        Ok(match offset {
            None => rate,
            Some(i) => rate.slice_axis(Axis(raw.time_axis), Slice::from(i..i + 1)).to_owned(),
        })
    }

    /// Record the elapsed time of a month whose next month begins at `end`.
    fn finish_month(
        &self,
        chunk: &O::Chunk,
        end: usize,
        state: &mut MonthState,
        summary: &mut AverageSummary,
    ) -> error_stack::Result<(), AverageError> {
        let last_in_month = chunk.timestamp(end - 1).change_context(AverageError::Input)?;
        let elapsed = match state.origin {
            TimeOrigin::Minutes(x0) => (self.xtime(chunk, end)? - x0) * 60.0,
            TimeOrigin::Stamp => {
                let next = chunk.timestamp(end).change_context(AverageError::Input)?;
                let (elapsed, corrected) =
                    month_elapsed_seconds(&state.first_timestamp, &next, &last_in_month, state.month)
                        .change_context_lazy(|| {
                            AverageError::DateConsistency(format!("end of {} in {}", state.month, chunk.label()))
                        })?;
                if corrected {
                    log::warn!(
                        "[{}] correcting the length of {}: the model calendar has no leap days",
                        self.settings.label,
                        state.month
                    );
                    summary.leap_corrections += 1;
                }
                elapsed
            }
        };
        state.elapsed = Some(elapsed);
        state.last_timestamp = last_in_month;
        Ok(())
    }

    /// Normalize the sums of a complete month and write them.
    fn commit(&mut self, mut state: MonthState) -> error_stack::Result<(), AverageError> {
        let ntime = state.ntime as f64;
        let index = state.index;
        let missing = self.missing_value;
        let mut means = FieldMap::new();

        for raw in self.raw.iter() {
            let name = raw.info.name.as_str();
            let sum = state.sums.remove(name).ok_or_else(|| {
                Report::new(AverageError::Input).attach_printable(format!("no records of '{name}' in {}", state.month))
            })?;
            let mean = match raw.accumulated {
                Some(_) => {
                    let elapsed = state.elapsed.ok_or_else(|| {
                        Report::new(AverageError::DateConsistency(format!(
                            "elapsed time of {} is unknown",
                            state.month
                        )))
                    })?;
                    sum / elapsed
                }
                None => sum / ntime,
            };
            put_filled(&mut *self.store, name, index, &mean, missing)?;
            means.insert(name.to_string(), mean);
        }

        for (key, var) in self.graph.iter_with_keys() {
            let values = if var.is_linear() {
                var.compute_values(
                    &means,
                    0,
                    None,
                    &mut self.context.constants,
                    self.context.carry.slot_mut(key),
                )
                .map_err(|e| derived_report(var, e))?
            } else {
                state.derived[key.0]
                    .take()
                    .map(|sum| if var.normalizes() { sum / ntime } else { sum })
            };
            let values = match values {
                Some(v) => v,
                None => missing_record(var, &self.dims)?,
            };
            put_filled(&mut *self.store, var.name(), index, &values, missing)?;
            if var.is_linear() {
                means.insert(var.name().to_string(), values);
            }
        }

        let month_number = i32::try_from(index + 1).change_context(AverageError::Output)?;
        self.store
            .put_month(index, month_number, &state.first_timestamp)
            .change_context(AverageError::Output)?;
        let end_date = state.last_timestamp.get(..10).unwrap_or(&state.last_timestamp).to_string();
        self.store
            .set_attribute(END_DATE_ATTR, AttrValue::from(end_date))
            .change_context(AverageError::Output)?;
        self.store.sync().change_context(AverageError::Output)?;
        Ok(())
    }
}

fn derived_report(var: &DerivedVariable, err: DerivedVariableError) -> Report<AverageError> {
    let context = match &err {
        DerivedVariableError::PrerequisitesNotSatisfied(_) => AverageError::Prerequisites,
        e if e.is_unsupported() => AverageError::UnsupportedOperation(e.to_string()),
        _ => AverageError::Derived(var.name().to_string()),
    };
    Report::new(err).change_context(context)
}

/// Add `value` to the running sum of `name`, starting the sum if needed.
fn add_into(
    sums: &mut HashMap<String, ArrayD<f64>>,
    name: &str,
    value: ArrayD<f64>,
) -> error_stack::Result<(), AverageError> {
    match sums.get_mut(name) {
        Some(sum) if sum.shape() == value.shape() => {
            *sum += &value;
            Ok(())
        }
        Some(sum) => Err(Report::new(AverageError::Input)).attach_printable(format!(
            "'{name}' changed shape from {:?} to {:?} between records",
            sum.shape(),
            value.shape()
        )),
        None => {
            sums.insert(name.to_string(), value);
            Ok(())
        }
    }
}

/// An all-missing record of `var`.
fn missing_record(var: &DerivedVariable, dims: &HashMap<String, usize>) -> error_stack::Result<ArrayD<f64>, AverageError> {
    let mut shape = vec![];
    for ax in var.record_axes() {
        let len = dims.get(ax).ok_or_else(|| {
            Report::new(AverageError::Output).attach_printable(format!(
                "dimension '{ax}' of '{}' is not in the input",
                var.name()
            ))
        })?;
        shape.push(*len);
    }
    Ok(ArrayD::from_elem(IxDyn(&shape), f64::NAN))
}

fn put_filled<S: OutputStore>(
    store: &mut S,
    name: &str,
    index: usize,
    data: &ArrayD<f64>,
    missing: Option<f64>,
) -> error_stack::Result<(), AverageError> {
    let result = match missing {
        Some(mv) => store.put_record(name, index, fill_nan(&data.view(), mv).view()),
        None => store.put_record(name, index, data.view()),
    };
    result.change_context(AverageError::Output)
}
