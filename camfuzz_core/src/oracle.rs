use crate::config::OracleSettings;
use crate::executor::ExecutionResult;
use crate::feedback::CoverageMap;
use rand::Rng;
use rand_core::RngCore;
use std::fmt;

/// Why an execution was kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Crash,
    /// A timeout that won the sampling draw.
    Timeout,
    NewCoverage,
    /// Ran longer than the slow threshold without timing out.
    Slow,
    /// Wrote more to stderr than the configured threshold.
    NoisyStderr,
}

impl fmt::Display for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Interest::Crash => "crash",
            Interest::Timeout => "timeout",
            Interest::NewCoverage => "new-coverage",
            Interest::Slow => "slow",
            Interest::NoisyStderr => "noisy-stderr",
        };
        f.write_str(name)
    }
}

/// An `Oracle` decides whether an execution result is worth keeping.
///
/// Oracles may be stateful: a coverage-based oracle remembers what it has
/// already seen, so asking twice about the same result can give different
/// answers.
pub trait Oracle: Send {
    /// Classifies one execution result.
    ///
    /// # Arguments
    /// * `result`: The outcome of running the target on a mutated input.
    /// * `rng`: Used for any sampled decisions.
    ///
    /// # Returns
    /// The first reason the result is interesting, or `None` if it should be
    /// discarded.
    fn examine(&mut self, result: &ExecutionResult, rng: &mut dyn RngCore) -> Option<Interest>;

    fn is_interesting(&mut self, result: &ExecutionResult, rng: &mut dyn RngCore) -> bool {
        self.examine(result, rng).is_some()
    }
}

/// Crash, sampled timeout, new coverage, slow run, noisy stderr; first match wins.
///
/// A timeout is decided entirely by the sampling draw: losing it does not let
/// the run through on its (necessarily long) duration.
#[derive(Debug, Default)]
pub struct InterestOracle {
    settings: OracleSettings,
    coverage_map: CoverageMap,
}

impl InterestOracle {
    pub fn new(settings: OracleSettings) -> Self {
        Self {
            settings,
            coverage_map: CoverageMap::new(),
        }
    }

    pub fn coverage_map(&self) -> &CoverageMap {
        &self.coverage_map
    }
}

impl Oracle for InterestOracle {
    fn examine(&mut self, result: &ExecutionResult, rng: &mut dyn RngCore) -> Option<Interest> {
        if result.crashed {
            return Some(Interest::Crash);
        }
        if result.timed_out {
            return rng
                .random_bool(self.settings.timeout_sample_probability)
                .then_some(Interest::Timeout);
        }
        if let Some(coverage) = &result.coverage {
            if self.coverage_map.observe(coverage) {
                return Some(Interest::NewCoverage);
            }
        }
        if result.duration > self.settings.slow_threshold() {
            return Some(Interest::Slow);
        }
        if result.stderr.chars().count() > self.settings.stderr_threshold {
            return Some(Interest::NoisyStderr);
        }
        None
    }
}
