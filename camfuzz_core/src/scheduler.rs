use crate::corpus::Corpus;
use crate::input::Input;
use rand_core::RngCore;
use thiserror::Error;

/// Errors that can occur during scheduler operations.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Indicates that the corpus is empty, and therefore no input can be scheduled.
    #[error("Corpus is empty, cannot schedule next input")]
    CorpusEmpty,
}

/// A `Scheduler` picks which corpus entry the next iteration mutates.
///
/// The coordinator asks for one seed per submitted job. Schedulers see the
/// corpus read-only and may keep their own state between calls, e.g. to weight
/// entries by how productive they have been.
pub trait Scheduler<I: Input>: Send {
    /// Chooses the seed for the next iteration.
    ///
    /// # Arguments
    /// * `corpus`: The pool to choose from. Entries added since the previous
    ///   call are eligible.
    /// * `rng`: The campaign RNG, so that a fixed seed gives a fixed schedule.
    ///
    /// # Returns
    /// The id of a corpus entry, or `SchedulerError::CorpusEmpty` if there is
    /// nothing to choose from.
    fn next(&mut self, corpus: &dyn Corpus<I>, rng: &mut dyn RngCore)
    -> Result<usize, SchedulerError>;
}

/// Uniform selection over the whole corpus. Newly added entries are
/// eligible from the next call on.
#[derive(Default, Debug)]
pub struct RandomScheduler;

impl RandomScheduler {
    pub fn new() -> Self {
        RandomScheduler
    }
}

impl<I: Input> Scheduler<I> for RandomScheduler {
    fn next(
        &mut self,
        corpus: &dyn Corpus<I>,
        rng: &mut dyn RngCore,
    ) -> Result<usize, SchedulerError> {
        corpus
            .random_select(rng)
            .map(|(id, _entry)| id)
            .ok_or(SchedulerError::CorpusEmpty)
    }
}
