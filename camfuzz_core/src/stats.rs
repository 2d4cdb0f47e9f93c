use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const REPORT_FILE_NAME: &str = "fuzzing_report.json";

/// Campaign counters. Only ever incremented.
#[derive(Serialize, Debug, Clone)]
pub struct Statistics {
    pub start_time: DateTime<Utc>,
    pub total_executions: u64,
    pub crashes: u64,
    pub timeouts: u64,
    pub interesting_inputs: u64,
    pub coverage_increase: u64,
    pub worker_errors: u64,
    #[serde(skip)]
    started: Instant,
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            start_time: Utc::now(),
            total_executions: 0,
            crashes: 0,
            timeouts: 0,
            interesting_inputs: 0,
            coverage_increase: 0,
            worker_errors: 0,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn execs_per_sec(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.total_executions as f64 / secs
        } else {
            0.0
        }
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "execs: {} ({:.1}/s) | crashes: {} | timeouts: {} | interesting: {} | new coverage: {} | worker errors: {}",
            self.total_executions,
            self.execs_per_sec(),
            self.crashes,
            self.timeouts,
            self.interesting_inputs,
            self.coverage_increase,
            self.worker_errors,
        )
    }
}

/// Summary written at the end of a campaign.
#[derive(Serialize, Debug, Clone)]
pub struct FuzzReport {
    pub timestamp: String,
    pub duration_secs: f64,
    pub statistics: Statistics,
    pub unique_crashes: usize,
    pub crash_ids: Vec<String>,
    pub coverage_signatures: usize,
    pub corpus_size: usize,
    /// Whether the campaign was cut short by an interrupt.
    pub interrupted: bool,
}

impl FuzzReport {
    /// Writes the report as pretty JSON to `<dir>/fuzzing_report.json`.
    pub fn write_to_dir(&self, dir: &Path) -> io::Result<PathBuf> {
        let path = dir.join(REPORT_FILE_NAME);
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        fs::write(&path, json)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn report_is_written_as_json() {
        let tmp = tempdir().unwrap();
        let mut statistics = Statistics::new();
        statistics.total_executions = 50;
        statistics.crashes = 50;
        let report = FuzzReport {
            timestamp: Utc::now().to_rfc3339(),
            duration_secs: 1.5,
            statistics,
            unique_crashes: 1,
            crash_ids: vec!["0123456789abcdef".into()],
            coverage_signatures: 0,
            corpus_size: 14,
            interrupted: false,
        };

        let path = report.write_to_dir(tmp.path()).unwrap();
        assert_eq!(path, tmp.path().join(REPORT_FILE_NAME));

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["statistics"]["total_executions"], 50);
        assert_eq!(value["statistics"]["crashes"], 50);
        assert!(value["statistics"].get("started").is_none());
        assert!(value["statistics"]["start_time"].is_string());
        assert_eq!(value["crash_ids"][0], "0123456789abcdef");
        assert_eq!(value["interrupted"], false);
    }

    #[test]
    fn display_summarises_counters() {
        let mut statistics = Statistics::default();
        statistics.timeouts = 3;
        let line = statistics.to_string();
        assert!(line.contains("timeouts: 3"));
        assert!(line.starts_with("execs: 0"));
    }
}
