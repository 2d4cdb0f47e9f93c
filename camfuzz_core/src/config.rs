use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder in [`ExecutorSettings::args`] replaced by the input file path.
pub const INPUT_PLACEHOLDER: &str = "{input}";
/// Placeholder in [`ExecutorSettings::args`] replaced by the soft timeout in milliseconds.
pub const TIMEOUT_PLACEHOLDER: &str = "{timeout_ms}";

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Stop submitting iterations after this many, even if time remains.
    #[serde(default)]
    pub max_executions: Option<u64>,
}

pub fn default_duration_secs() -> u64 {
    3600
}
pub fn default_workers() -> usize {
    4
}
fn default_progress_interval() -> u64 {
    1000
}
fn default_poll_interval_ms() -> u64 {
    100
}

impl FuzzerSettings {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    /// Bounded so interrupts and budget expiry are noticed within a second.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.clamp(1, 1000))
    }
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            duration_secs: default_duration_secs(),
            workers: default_workers(),
            seed: None,
            progress_interval: default_progress_interval(),
            poll_interval_ms: default_poll_interval_ms(),
            max_executions: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExecutorSettings {
    #[serde(default)]
    pub target: PathBuf,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_hard_timeout_multiplier")]
    pub hard_timeout_multiplier: u32,
    #[serde(default = "default_capture_limit")]
    pub capture_limit: usize,
    pub working_dir: Option<PathBuf>,
}

fn default_args() -> Vec<String> {
    vec![
        "--fuzz-input".to_string(),
        INPUT_PLACEHOLDER.to_string(),
        "--timeout".to_string(),
        TIMEOUT_PLACEHOLDER.to_string(),
    ]
}

pub fn default_timeout_ms() -> u64 {
    1000
}

fn default_hard_timeout_multiplier() -> u32 {
    2
}

fn default_capture_limit() -> usize {
    64 * 1024
}

impl ExecutorSettings {
    pub fn soft_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Soft timeout times the multiplier, saturating at `Duration::MAX`.
    pub fn hard_timeout(&self) -> Duration {
        self.soft_timeout()
            .checked_mul(self.hard_timeout_multiplier.max(1))
            .unwrap_or(Duration::MAX)
    }

    /// Target arguments with placeholders filled in.
    pub fn render_args(&self, input_path: &str) -> Vec<String> {
        let timeout = self.timeout_ms.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace(INPUT_PLACEHOLDER, input_path)
                    .replace(TIMEOUT_PLACEHOLDER, &timeout)
            })
            .collect()
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            target: PathBuf::new(),
            args: default_args(),
            timeout_ms: default_timeout_ms(),
            hard_timeout_multiplier: default_hard_timeout_multiplier(),
            capture_limit: default_capture_limit(),
            working_dir: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusSettings {
    #[serde(default = "default_corpus_dir")]
    pub corpus_dir: PathBuf,
    #[serde(default = "default_crash_dir")]
    pub crash_dir: PathBuf,
}

pub fn default_corpus_dir() -> PathBuf {
    PathBuf::from("fuzz_corpus")
}

pub fn default_crash_dir() -> PathBuf {
    PathBuf::from("crashes")
}

impl Default for CorpusSettings {
    fn default() -> Self {
        Self {
            corpus_dir: default_corpus_dir(),
            crash_dir: default_crash_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MutatorSettings {
    /// Chance of stacking 2-5 extra strategies after the first.
    #[serde(default = "default_stack_probability")]
    pub stack_probability: f64,
    /// Per-field chance that `InterestingValues` replaces a component.
    #[serde(default = "default_interesting_value_probability")]
    pub interesting_value_probability: f64,
}

fn default_stack_probability() -> f64 {
    0.1
}

fn default_interesting_value_probability() -> f64 {
    0.3
}

impl Default for MutatorSettings {
    fn default() -> Self {
        Self {
            stack_probability: default_stack_probability(),
            interesting_value_probability: default_interesting_value_probability(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OracleSettings {
    /// Fraction of timeouts kept, so hangs cannot flood the corpus.
    #[serde(default = "default_timeout_sample_probability")]
    pub timeout_sample_probability: f64,
    #[serde(default = "default_slow_threshold_ms")]
    pub slow_threshold_ms: u64,
    /// Stderr length in characters above which an execution is kept.
    #[serde(default = "default_stderr_threshold")]
    pub stderr_threshold: usize,
}

fn default_timeout_sample_probability() -> f64 {
    0.1
}

fn default_slow_threshold_ms() -> u64 {
    500
}

fn default_stderr_threshold() -> usize {
    1000
}

impl OracleSettings {
    pub fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_threshold_ms)
    }
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            timeout_sample_probability: default_timeout_sample_probability(),
            slow_threshold_ms: default_slow_threshold_ms(),
            stderr_threshold: default_stderr_threshold(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub corpus: CorpusSettings,
    #[serde(default)]
    pub mutator: MutatorSettings,
    #[serde(default)]
    pub oracle: OracleSettings,
}

impl FuzzerConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: FuzzerConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let probabilities = [
            ("mutator.stack-probability", self.mutator.stack_probability),
            (
                "mutator.interesting-value-probability",
                self.mutator.interesting_value_probability,
            ),
            (
                "oracle.timeout-sample-probability",
                self.oracle.timeout_sample_probability,
            ),
        ];
        for (name, value) in probabilities {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{name} must be within [0, 1], got {value}");
            }
        }
        if self.fuzzer.workers == 0 {
            anyhow::bail!("fuzzer.workers must be at least 1");
        }
        if self.executor.timeout_ms == 0 {
            anyhow::bail!("executor.timeout-ms must be positive");
        }
        Ok(())
    }
}
