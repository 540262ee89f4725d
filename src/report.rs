//! Sweep result rendering.
//!
//! CSV is the historical layout consumed by plotting scripts:
//!
//! ```text
//! BW Threads, Bandwidth (GB/s), Latency (ns)
//! 0, 1.234567, 89.012345
//! ```
//!
//! JSON carries the same rows plus the run settings, the failures and the
//! abort flag.

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use serde::Serialize;

use crate::orchestrator::{SweepResult, SweepRow, SweepSettings};

pub const CSV_HEADER: &str = "BW Threads, Bandwidth (GB/s), Latency (ns)";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Csv,
    Json,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Csv => "csv",
            Self::Json => "json",
        })
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown format '{}'; expected 'csv' or 'json'", other)),
        }
    }
}

/// Writes `result` in `format`.
pub fn write_report<W: Write>(result: &SweepResult, format: OutputFormat, out: W) -> io::Result<()> {
    match format {
        OutputFormat::Csv => write_csv(result, out),
        OutputFormat::Json => write_json(result, out),
    }
}

pub fn write_csv<W: Write>(result: &SweepResult, mut out: W) -> io::Result<()> {
    writeln!(out, "{}", CSV_HEADER)?;
    for row in &result.rows {
        writeln!(
            out,
            "{}, {:.6}, {:.6}",
            row.bandwidth_threads, row.bandwidth_gbs, row.latency_ns
        )?;
    }
    out.flush()
}

#[derive(Serialize)]
struct JsonFailure {
    bandwidth_threads: usize,
    error: String,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    settings: &'a SweepSettings,
    rows: &'a [SweepRow],
    failures: Vec<JsonFailure>,
    aborted: bool,
}

pub fn write_json<W: Write>(result: &SweepResult, mut out: W) -> io::Result<()> {
    let report = JsonReport {
        settings: &result.settings,
        rows: &result.rows,
        failures: result
            .failures
            .iter()
            .map(|f| JsonFailure {
                bandwidth_threads: f.bandwidth_threads,
                error: f.error.to_string(),
            })
            .collect(),
        aborted: result.aborted,
    };
    serde_json::to_writer_pretty(&mut out, &report).map_err(io::Error::from)?;
    writeln!(out)?;
    out.flush()
}
