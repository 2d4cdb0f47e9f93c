pub mod config;
pub mod coordinator;
pub mod corpus;
pub mod crashes;
pub mod executor;
pub mod feedback;
pub mod input;
pub mod mutator;
pub mod observer;
pub mod oracle;
pub mod scheduler;
pub mod stats;

pub use config::FuzzerConfig;
pub use coordinator::{Coordinator, FuzzError, FuzzState, WorkerError};
pub use corpus::{Corpus, CorpusEntry, CorpusError, InMemoryCorpus, OnDiskCorpus, Provenance};
pub use crashes::{CrashStore, CrashStoreError};
pub use executor::{CommandExecutor, ExecutionResult, ExecutionStatus, Executor, ExecutorError};
pub use feedback::CoverageMap;
pub use input::{CameraInput, Input};
pub use mutator::{CameraMutator, MutationStrategy, Mutator};
pub use observer::{CoverageObserver, Observer};
pub use oracle::{Interest, InterestOracle, Oracle};
pub use scheduler::{RandomScheduler, Scheduler, SchedulerError};
pub use stats::{FuzzReport, Statistics};
