//! Monthly climatological means of WRF model output.
//!
//! The [`aggregator::MonthlyAggregator`] reads a chronological sequence of
//! input chunks, averages every time-dependent variable over each calendar
//! month and appends the result to an [`output::OutputStore`]. Variables that
//! are not in the input can be computed along the way from a
//! [`derived::DerivedGraph`].
pub mod aggregator;
pub mod calendar;
pub mod config;
pub mod derived;
pub mod grid;
pub mod jobs;
pub mod memory;
pub mod numerics;
pub mod output;
pub mod source;

#[cfg(feature = "netcdf")]
pub mod netcdf_io;
