use crate::config::FuzzerConfig;
use crate::corpus::{Corpus, CorpusError, OnDiskCorpus};
use crate::crashes::{CrashStore, CrashStoreError};
use crate::executor::{CommandExecutor, ExecutionResult, Executor, ExecutorError};
use crate::input::CameraInput;
use crate::mutator::{CameraMutator, MutationStrategy};
use crate::oracle::{Interest, InterestOracle, Oracle};
use crate::scheduler::{RandomScheduler, Scheduler, SchedulerError};
use crate::stats::{FuzzReport, Statistics};
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Extra time allowed on top of the hard timeout for an in-flight result while draining.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum FuzzError {
    #[error("Target binary {0:?} does not exist")]
    TargetMissing(PathBuf),
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error(transparent)]
    CrashStore(#[from] CrashStoreError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("Failed to start worker thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}

/// A failed iteration. The iteration is discarded; the campaign goes on.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("Worker panicked: {0}")]
    Panic(String),
}

/// Lifecycle of a campaign. An interrupt moves `Init` or `Running` to `Draining`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuzzState {
    Init,
    Running,
    Draining,
    Done,
}

/// One unit of work handed to a worker.
#[derive(Debug)]
struct Job {
    seed_id: usize,
    seed: CameraInput,
    rng_seed: u64,
}

/// A mutated input and what happened when the target ran it.
#[derive(Debug)]
pub struct Execution {
    pub input: CameraInput,
    pub strategies: Vec<MutationStrategy>,
    pub result: ExecutionResult,
}

#[derive(Debug)]
pub struct IterationOutcome {
    pub seed_id: usize,
    pub rng_seed: u64,
    pub execution: Result<Execution, WorkerError>,
}

pub fn ensure_target_exists(target: &Path) -> Result<(), FuzzError> {
    if target.exists() {
        Ok(())
    } else {
        Err(FuzzError::TargetMissing(target.to_path_buf()))
    }
}

/// Runs a bounded fuzzing campaign over a pool of worker threads.
///
/// The coordinator alone owns the corpus, crash store, coverage map and
/// statistics. Workers only mutate and execute; every result comes back over
/// a single channel and is classified and persisted here.
pub struct Coordinator<E> {
    config: FuzzerConfig,
    executor: E,
}

impl Coordinator<CommandExecutor> {
    /// Fails with `TargetMissing` before anything is written to disk.
    pub fn with_command_executor(config: FuzzerConfig) -> Result<Self, FuzzError> {
        ensure_target_exists(&config.executor.target)?;
        let executor = CommandExecutor::new(config.executor.clone());
        Ok(Self::new(config, executor))
    }
}

impl<E> Coordinator<E>
where
    E: Executor<CameraInput> + Clone + 'static,
{
    /// Every worker gets its own clone of `executor`.
    pub fn new(config: FuzzerConfig, executor: E) -> Self {
        Self { config, executor }
    }

    pub fn config(&self) -> &FuzzerConfig {
        &self.config
    }

    /// Runs until the time budget or execution cap is spent, or `shutdown` is set.
    /// Returns the report that was also written to the crash directory.
    pub fn run(self, shutdown: Arc<AtomicBool>) -> Result<FuzzReport, FuzzError> {
        let mut state = FuzzState::Init;
        debug!(?state, "Starting campaign");

        let master_seed = self.config.fuzzer.seed.unwrap_or_else(rand::random);
        info!(seed = master_seed, "Campaign RNG seed");
        let mut rng = ChaCha8Rng::seed_from_u64(master_seed);

        let mut corpus = OnDiskCorpus::new(self.config.corpus.corpus_dir.clone())?;
        corpus.load()?;
        corpus.seed_if_empty(&mut rng)?;
        let crashes = CrashStore::open(
            self.config.corpus.crash_dir.clone(),
            self.config.executor.clone(),
        )?;

        let mut session = Session {
            corpus,
            crashes,
            oracle: InterestOracle::new(self.config.oracle.clone()),
            scheduler: Box::new(RandomScheduler::new()),
            stats: Statistics::new(),
            rng,
            progress_interval: self.config.fuzzer.progress_interval,
        };

        let workers = self.config.fuzzer.workers.max(1);
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (result_tx, result_rx) = mpsc::channel::<IterationOutcome>();
        let handles = spawn_workers(
            workers,
            &self.executor,
            CameraMutator::new(self.config.mutator.clone()),
            Arc::new(Mutex::new(job_rx)),
            result_tx,
        )?;
        info!(
            workers,
            corpus = session.corpus.len(),
            known_crashes = session.crashes.unique_crashes(),
            budget_secs = self.config.fuzzer.duration_secs,
            "Fuzzing started"
        );

        // A budget too large to represent is no budget at all.
        let deadline = Instant::now().checked_add(self.config.fuzzer.duration());
        let poll = self.config.fuzzer.poll_interval();
        let max_executions = self.config.fuzzer.max_executions;
        let mut submitted = 0u64;
        let mut in_flight = 0usize;
        let mut interrupted = false;

        state = FuzzState::Running;
        debug!(?state, "Campaign running");
        let cap_reached = |submitted: u64| max_executions.is_some_and(|max| submitted >= max);
        while state == FuzzState::Running {
            if shutdown.load(Ordering::SeqCst) {
                info!("Interrupt received, draining in-flight iterations");
                interrupted = true;
                state = FuzzState::Draining;
                continue;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) || cap_reached(submitted) {
                state = FuzzState::Draining;
                continue;
            }

            while in_flight < workers && !cap_reached(submitted) {
                if job_tx.send(session.next_job()?).is_err() {
                    warn!("All workers have exited, stopping");
                    state = FuzzState::Draining;
                    break;
                }
                in_flight += 1;
                submitted += 1;
            }

            match result_rx.recv_timeout(poll) {
                Ok(outcome) => {
                    in_flight -= 1;
                    session.process(outcome);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Result channel closed, stopping");
                    in_flight = 0;
                    state = FuzzState::Draining;
                }
            }
        }

        debug!(?state, in_flight, "Draining");
        let drain_timeout = self.config.executor.hard_timeout().saturating_add(DRAIN_GRACE);
        while in_flight > 0 {
            match result_rx.recv_timeout(drain_timeout) {
                Ok(outcome) => {
                    in_flight -= 1;
                    session.process(outcome);
                }
                Err(e) => {
                    warn!(in_flight, error = %e, "Abandoning in-flight iterations");
                    break;
                }
            }
        }
        drop(job_tx);
        for handle in handles {
            if handle.join().is_err() {
                error!("Worker thread terminated abnormally");
            }
        }

        state = FuzzState::Done;
        debug!(?state, "Campaign finished");
        Ok(session.finish(interrupted))
    }
}

struct Session {
    corpus: OnDiskCorpus<CameraInput>,
    crashes: CrashStore,
    oracle: InterestOracle,
    scheduler: Box<dyn Scheduler<CameraInput>>,
    stats: Statistics,
    rng: ChaCha8Rng,
    progress_interval: u64,
}

impl Session {
    fn next_job(&mut self) -> Result<Job, FuzzError> {
        let seed_id = self.scheduler.next(&self.corpus, &mut self.rng)?;
        let seed = self
            .corpus
            .get(seed_id)
            .map(|entry| entry.input.clone())
            .ok_or(SchedulerError::CorpusEmpty)?;
        Ok(Job {
            seed_id,
            seed,
            rng_seed: self.rng.next_u64(),
        })
    }

    fn process(&mut self, outcome: IterationOutcome) {
        let execution = match outcome.execution {
            Ok(execution) => execution,
            Err(e) => {
                self.stats.worker_errors += 1;
                error!(
                    seed_id = outcome.seed_id,
                    rng_seed = outcome.rng_seed,
                    error = %e,
                    "Iteration failed"
                );
                return;
            }
        };
        let Execution {
            input,
            strategies,
            result,
        } = execution;

        self.stats.total_executions += 1;
        if result.crashed {
            self.stats.crashes += 1;
        }
        if result.timed_out {
            self.stats.timeouts += 1;
        }

        if let Some(interest) = self.oracle.examine(&result, &mut self.rng) {
            self.keep(&input, &result, interest);
            debug!(
                %interest,
                status = ?result.status(),
                seed_id = outcome.seed_id,
                strategies = ?strategies.iter().map(MutationStrategy::name).collect::<Vec<_>>(),
                "Interesting input"
            );
        }

        if self.progress_interval > 0 && self.stats.total_executions % self.progress_interval == 0 {
            info!(
                corpus = self.corpus.len(),
                unique_crashes = self.crashes.unique_crashes(),
                "{}",
                self.stats
            );
        }
    }

    fn keep(&mut self, input: &CameraInput, result: &ExecutionResult, interest: Interest) {
        self.stats.interesting_inputs += 1;
        if interest == Interest::NewCoverage {
            self.stats.coverage_increase += 1;
        }
        if result.crashed {
            if let Err(e) = self.crashes.save_crash(input, result) {
                error!(error = %e, "Failed to save crash");
            }
        }
        if let Err(e) = self.corpus.save_interesting(input, result, interest) {
            error!(error = %e, "Failed to save interesting input");
        }
    }

    fn finish(self, interrupted: bool) -> FuzzReport {
        info!("Final statistics: {}", self.stats);
        let report = FuzzReport {
            timestamp: chrono::Utc::now().to_rfc3339(),
            duration_secs: self.stats.elapsed().as_secs_f64(),
            unique_crashes: self.crashes.unique_crashes(),
            crash_ids: self.crashes.signatures(),
            coverage_signatures: self.oracle.coverage_map().len(),
            corpus_size: self.corpus.len(),
            interrupted,
            statistics: self.stats,
        };
        match report.write_to_dir(self.crashes.dir()) {
            Ok(path) => info!(path = %path.display(), "Report written"),
            Err(e) => error!(error = %e, "Failed to write report"),
        }
        report
    }
}

fn spawn_workers<E>(
    count: usize,
    executor: &E,
    mutator: CameraMutator,
    jobs: Arc<Mutex<Receiver<Job>>>,
    results: Sender<IterationOutcome>,
) -> Result<Vec<JoinHandle<()>>, FuzzError>
where
    E: Executor<CameraInput> + Clone + 'static,
{
    (0..count)
        .map(|i| {
            let mut executor = executor.clone();
            let mutator = mutator.clone();
            let jobs = Arc::clone(&jobs);
            let results = results.clone();
            thread::Builder::new()
                .name(format!("camfuzz-worker-{i}"))
                .spawn(move || worker_loop(&mut executor, &mutator, &jobs, &results))
                .map_err(FuzzError::WorkerSpawn)
        })
        .collect()
}

fn worker_loop<E: Executor<CameraInput>>(
    executor: &mut E,
    mutator: &CameraMutator,
    jobs: &Mutex<Receiver<Job>>,
    results: &Sender<IterationOutcome>,
) {
    loop {
        let job = {
            let receiver = match jobs.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            receiver.recv()
        };
        let Ok(job) = job else { break };

        let execution = panic::catch_unwind(AssertUnwindSafe(|| {
            run_iteration(executor, mutator, &job)
        }))
        .unwrap_or_else(|payload| Err(WorkerError::Panic(panic_message(payload.as_ref()))));

        let outcome = IterationOutcome {
            seed_id: job.seed_id,
            rng_seed: job.rng_seed,
            execution,
        };
        if results.send(outcome).is_err() {
            break;
        }
    }
}

fn run_iteration<E: Executor<CameraInput>>(
    executor: &mut E,
    mutator: &CameraMutator,
    job: &Job,
) -> Result<Execution, WorkerError> {
    let mut rng = ChaCha8Rng::seed_from_u64(job.rng_seed);
    let (input, strategies) = mutator.mutate_traced(&job.seed, &mut rng);
    let result = executor.execute(&input)?;
    Ok(Execution {
        input,
        strategies,
        result,
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
