use crate::executor::ProcessOutput;

/// Line prefix a target uses to report the code locations it exercised.
pub const COVERAGE_MARKER: &str = "COV:";

/// An `Observer` inspects the captured output of one target execution and
/// extracts data the oracle later consumes.
///
/// The executor calls `reset` before spawning the target and `post_exec` once
/// the process has finished (or was killed).
pub trait Observer: Send {
    fn name(&self) -> &'static str;
    fn reset(&mut self);
    fn post_exec(&mut self, output: &ProcessOutput);
}

/// Collects the integers a target prints on `COV:<int>,<int>,...` lines.
///
/// Tokens that are not integers are skipped; a run that reports no integers
/// at all has no coverage.
#[derive(Default, Debug, Clone)]
pub struct CoverageObserver {
    coverage: Vec<i64>,
}

impl CoverageObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn coverage(&self) -> Option<&[i64]> {
        if self.coverage.is_empty() {
            None
        } else {
            Some(&self.coverage)
        }
    }

    pub fn take_coverage(&mut self) -> Option<Vec<i64>> {
        if self.coverage.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.coverage))
        }
    }
}

/// Parses every coverage line in `stdout`, in order of appearance.
pub fn parse_coverage(stdout: &str) -> Vec<i64> {
    stdout
        .lines()
        .filter_map(|line| line.strip_prefix(COVERAGE_MARKER))
        .flat_map(|rest| rest.trim().split(','))
        .filter_map(|token| token.trim().parse::<i64>().ok())
        .collect()
}

impl Observer for CoverageObserver {
    fn name(&self) -> &'static str {
        "CoverageObserver"
    }

    fn reset(&mut self) {
        self.coverage.clear();
    }

    fn post_exec(&mut self, output: &ProcessOutput) {
        self.coverage = parse_coverage(&output.stdout);
    }
}
