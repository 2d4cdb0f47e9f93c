use camfuzz_core::config::FuzzerConfig;
use camfuzz_core::coordinator::Coordinator;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Coverage-guided fuzzer for camera-state inputs.
///
/// Options left unset fall back to the config file, then to built-in defaults.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Target binary to fuzz.
    target: PathBuf,
    /// Corpus directory [default: fuzz_corpus]
    #[clap(long)]
    corpus: Option<PathBuf>,
    /// Crash output directory [default: crashes]
    #[clap(long)]
    crashes: Option<PathBuf>,
    /// Campaign length in seconds [default: 3600]
    #[clap(short, long)]
    duration: Option<u64>,
    /// Number of parallel workers [default: 4]
    #[clap(short, long)]
    jobs: Option<usize>,
    /// Soft timeout passed to the target, in milliseconds [default: 1000]
    #[clap(long)]
    timeout_ms: Option<u64>,
    /// Stop after this many executions.
    #[clap(long)]
    max_execs: Option<u64>,
    /// TOML configuration file.
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,
    /// Seed for the campaign RNG.
    #[clap(long)]
    seed: Option<u64>,
    /// Log filter, overridden by RUST_LOG.
    #[clap(long, default_value = "info")]
    log: String,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<FuzzerConfig, anyhow::Error> {
    let mut config = match &cli.config {
        Some(config_path) => {
            info!("Loading configuration from {config_path:?}");
            FuzzerConfig::load_from_file(config_path)?
        }
        None => FuzzerConfig::default(),
    };

    config.executor.target = cli.target.clone();
    if let Some(corpus) = &cli.corpus {
        config.corpus.corpus_dir = corpus.clone();
    }
    if let Some(crashes) = &cli.crashes {
        config.corpus.crash_dir = crashes.clone();
    }
    if let Some(duration) = cli.duration {
        config.fuzzer.duration_secs = duration;
    }
    if let Some(jobs) = cli.jobs {
        config.fuzzer.workers = jobs;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.executor.timeout_ms = timeout_ms;
    }
    if let Some(max_execs) = cli.max_execs {
        config.fuzzer.max_executions = Some(max_execs);
    }
    if let Some(seed) = cli.seed {
        config.fuzzer.seed = Some(seed);
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_tracing(&cli.log);

    let config = load_config(&cli)?;
    tracing::debug!("Effective configuration: {config:#?}");

    let coordinator = Coordinator::with_command_executor(config)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        warn!("Failed to install interrupt handler, Ctrl-C will abort without a report: {e}");
    }

    let report = coordinator.run(shutdown)?;

    println!("\nFuzzing finished in {:.1}s.", report.duration_secs);
    println!("  {}", report.statistics);
    println!(
        "  Unique crashes: {}, coverage signatures: {}, corpus size: {}",
        report.unique_crashes, report.coverage_signatures, report.corpus_size
    );
    for id in &report.crash_ids {
        println!("    {id}");
    }
    if report.interrupted {
        println!("  (interrupted)");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "camfuzz",
            "/bin/true",
            "--jobs",
            "2",
            "--timeout-ms",
            "250",
            "--seed",
            "9",
        ]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.executor.target, PathBuf::from("/bin/true"));
        assert_eq!(config.fuzzer.workers, 2);
        assert_eq!(config.executor.timeout_ms, 250);
        assert_eq!(config.fuzzer.seed, Some(9));
        assert_eq!(config.fuzzer.duration_secs, 3600);
        assert_eq!(config.corpus.corpus_dir, PathBuf::from("fuzz_corpus"));
        assert_eq!(cli.log, "info");
    }

    #[test]
    fn zero_jobs_is_rejected() {
        let cli = Cli::parse_from(["camfuzz", "/bin/true", "--jobs", "0"]);
        assert!(load_config(&cli).is_err());
    }

    #[test]
    fn target_is_required() {
        assert!(Cli::try_parse_from(["camfuzz"]).is_err());
    }
}
