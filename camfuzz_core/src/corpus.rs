use crate::executor::ExecutionResult;
use crate::input::{CameraInput, Input, InputError};
use crate::oracle::Interest;
use rand::Rng;
use rand_core::RngCore;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Number of randomized valid states written when a corpus starts out empty.
pub const RANDOM_SEED_COUNT: usize = 10;
const INPUT_FILE_EXTENSION: &str = "bin";

/// Defines errors that can arise during corpus operations.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// An I/O error occurred while reading or writing the corpus directory.
    #[error("Corpus I/O error: {0}")]
    Io(String),

    /// An input could not be encoded to its on-disk form.
    #[error("Corpus serialization error: {0}")]
    Serialization(String),
}

impl From<io::Error> for CorpusError {
    fn from(err: io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}

impl From<InputError> for CorpusError {
    fn from(err: InputError) -> Self {
        CorpusError::Serialization(err.to_string())
    }
}

/// How an entry came to be in the corpus.
#[derive(Debug, Clone, PartialEq)]
pub enum Provenance {
    /// Synthesized because the corpus directory was empty.
    Seed { path: PathBuf },
    /// Read from the corpus directory at startup.
    Loaded { path: PathBuf },
    /// Kept by the oracle during this session.
    Discovered { interest: Interest, path: PathBuf },
}

impl Provenance {
    pub fn path(&self) -> &Path {
        match self {
            Provenance::Seed { path }
            | Provenance::Loaded { path }
            | Provenance::Discovered { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CorpusEntry<I: Input> {
    pub input: I,
    pub provenance: Provenance,
}

/// A pool of inputs that seeds are drawn from.
///
/// Entries are append-only: once added, an entry keeps its id for the rest of
/// the campaign and is never removed or replaced. Persistence, if any, is the
/// implementation's business; the pool itself only hands out entries.
///
/// # Type Parameters
/// * `I`: The input type held by the pool.
pub trait Corpus<I: Input>: Send {
    /// Appends an entry to the pool.
    ///
    /// # Returns
    /// The id of the new entry. Ids are dense and start at zero, so the id of
    /// the n-th entry added is `n - 1`.
    fn add(&mut self, entry: CorpusEntry<I>) -> usize;

    /// Looks up an entry by the id `add` returned for it.
    ///
    /// # Returns
    /// `None` if no entry with that id has been added.
    fn get(&self, id: usize) -> Option<&CorpusEntry<I>>;

    /// Picks an entry uniformly at random.
    ///
    /// # Arguments
    /// * `rng`: Source of randomness for the pick.
    ///
    /// # Returns
    /// The chosen id together with its entry, or `None` if the pool is empty.
    fn random_select(&self, rng: &mut dyn RngCore) -> Option<(usize, &CorpusEntry<I>)>;

    /// Number of entries added so far. Never decreases.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An in-memory implementation of the `Corpus` trait.
#[derive(Debug)]
pub struct InMemoryCorpus<I: Input> {
    entries: Vec<CorpusEntry<I>>,
}

impl<I: Input> InMemoryCorpus<I> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<I: Input> Default for InMemoryCorpus<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Input> Corpus<I> for InMemoryCorpus<I> {
    fn add(&mut self, entry: CorpusEntry<I>) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    fn get(&self, id: usize) -> Option<&CorpusEntry<I>> {
        self.entries.get(id)
    }

    fn random_select(&self, rng: &mut dyn RngCore) -> Option<(usize, &CorpusEntry<I>)> {
        if self.entries.is_empty() {
            return None;
        }
        let index = rng.random_range(0..self.entries.len());
        self.entries.get(index).map(|entry| (index, entry))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A directory of flat `*.bin` files backed by an in-memory pool.
///
/// The directory has no index: every `*.bin` file is an input in its encoded
/// form. Files are only ever created, never rewritten or deleted.
#[derive(Debug)]
pub struct OnDiskCorpus<I: Input> {
    corpus_dir: PathBuf,
    pool: InMemoryCorpus<I>,
}

impl<I: Input> OnDiskCorpus<I> {
    /// Creates the corpus directory if it is missing. Does not read it; see [`Self::load`].
    pub fn new(corpus_dir: PathBuf) -> Result<Self, CorpusError> {
        if !corpus_dir.exists() {
            fs::create_dir_all(&corpus_dir).map_err(|e| {
                CorpusError::Io(format!(
                    "Failed to create corpus directory at {:?}: {}",
                    corpus_dir, e
                ))
            })?;
        } else if !corpus_dir.is_dir() {
            return Err(CorpusError::Io(format!(
                "Corpus path {:?} exists but is not a directory",
                corpus_dir
            )));
        }
        Ok(Self {
            corpus_dir,
            pool: InMemoryCorpus::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.corpus_dir
    }

    /// Reads every `*.bin` file into the pool. Unreadable files are skipped.
    pub fn load(&mut self) -> Result<usize, CorpusError> {
        let entries = fs::read_dir(&self.corpus_dir).map_err(|e| {
            CorpusError::Io(format!(
                "Failed to read corpus directory {:?}: {}",
                self.corpus_dir, e
            ))
        })?;
        let paths = input_paths(entries.map(|entry| entry.map(|e| e.path())));

        let mut loaded = 0;
        for path in paths {
            match fs::read(&path) {
                Ok(data) => {
                    self.pool.add(CorpusEntry {
                        input: I::from_bytes(&data),
                        provenance: Provenance::Loaded { path },
                    });
                    loaded += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable corpus file")
                }
            }
        }
        info!(loaded, dir = %self.corpus_dir.display(), "Loaded corpus");
        Ok(loaded)
    }

    /// Persists an input the oracle kept and adds it to the pool.
    ///
    /// Named `id_<unix-ts>_<props>.bin`, where props are the `crash`,
    /// `timeout` and `cov` tags that apply to `result`. A name that is
    /// already taken gets a `_<n>` suffix; existing files are never replaced.
    pub fn save_interesting(
        &mut self,
        input: &I,
        result: &ExecutionResult,
        interest: Interest,
    ) -> Result<PathBuf, CorpusError> {
        let bytes = input.to_bytes()?;
        let stem = format!(
            "id_{}_{}",
            chrono::Utc::now().timestamp(),
            property_tags(result).join("_")
        );
        let path = self.write_unique(&stem, &bytes)?;
        debug!(path = %path.display(), %interest, "Saved interesting input");
        self.pool.add(CorpusEntry {
            input: input.clone(),
            provenance: Provenance::Discovered {
                interest,
                path: path.clone(),
            },
        });
        Ok(path)
    }

    fn write_unique(&self, stem: &str, bytes: &[u8]) -> Result<PathBuf, CorpusError> {
        let mut counter = 0u32;
        loop {
            let name = if counter == 0 {
                format!("{stem}.{INPUT_FILE_EXTENSION}")
            } else {
                format!("{stem}_{counter}.{INPUT_FILE_EXTENSION}")
            };
            let path = self.corpus_dir.join(name);
            match write_new(&path, bytes) {
                Ok(()) => return Ok(path),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => counter += 1,
                Err(e) => {
                    return Err(CorpusError::Io(format!(
                        "Failed to write corpus file {:?}: {}",
                        path, e
                    )));
                }
            }
        }
    }
}

impl OnDiskCorpus<CameraInput> {
    /// Populates an empty corpus with random valid camera states plus the
    /// boundary states, written as `seed_NNN.bin`. Returns how many were added.
    pub fn seed_if_empty<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<usize, CorpusError> {
        if !self.pool.is_empty() {
            return Ok(0);
        }
        let seeds: Vec<CameraInput> = (0..RANDOM_SEED_COUNT)
            .map(|_| CameraInput::random_valid(rng))
            .chain(CameraInput::boundary_states())
            .collect();

        let count = seeds.len();
        for (i, seed) in seeds.into_iter().enumerate() {
            let path = self.write_unique(&format!("seed_{i:03}"), &seed.encode()?)?;
            self.pool.add(CorpusEntry {
                input: seed,
                provenance: Provenance::Seed { path },
            });
        }
        info!(count, dir = %self.corpus_dir.display(), "Seeded empty corpus");
        Ok(count)
    }
}

impl<I: Input> Corpus<I> for OnDiskCorpus<I> {
    /// Adds to the pool only; use [`OnDiskCorpus::save_interesting`] to persist.
    fn add(&mut self, entry: CorpusEntry<I>) -> usize {
        self.pool.add(entry)
    }

    fn get(&self, id: usize) -> Option<&CorpusEntry<I>> {
        self.pool.get(id)
    }

    fn random_select(&self, rng: &mut dyn RngCore) -> Option<(usize, &CorpusEntry<I>)> {
        self.pool.random_select(rng)
    }

    fn len(&self) -> usize {
        self.pool.len()
    }
}

// Sorted `*.bin` paths. Entries that fail to read are logged and skipped.
fn input_paths<T>(entries: T) -> Vec<PathBuf>
where
    T: IntoIterator<Item = io::Result<PathBuf>>,
{
    let mut paths: Vec<PathBuf> = entries
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable corpus directory entry");
                None
            }
        })
        .filter(|path| path.extension().is_some_and(|ext| ext == INPUT_FILE_EXTENSION))
        .collect();
    paths.sort();
    paths
}

/// The `crash`, `timeout` and `cov` tags that apply to `result`, in that order.
pub fn property_tags(result: &ExecutionResult) -> Vec<&'static str> {
    let mut tags = Vec::new();
    if result.crashed {
        tags.push("crash");
    }
    if result.timed_out {
        tags.push("timeout");
    }
    if result.coverage.as_ref().is_some_and(|c| !c.is_empty()) {
        tags.push("cov");
    }
    tags
}

fn write_new(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::STRUCTURED_LEN;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use tempfile::tempdir;

    fn bin_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".bin"))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn in_memory_random_select_on_empty_corpus_returns_none() {
        let corpus: InMemoryCorpus<Vec<u8>> = InMemoryCorpus::new();
        let mut rng = ChaCha8Rng::from_seed([0; 32]);
        assert!(corpus.random_select(&mut rng).is_none());
        assert!(corpus.is_empty());
    }

    #[test]
    fn in_memory_random_select_covers_all_entries() {
        let mut corpus = InMemoryCorpus::new();
        for i in 0..3u8 {
            let id = corpus.add(CorpusEntry {
                input: vec![i],
                provenance: Provenance::Loaded {
                    path: PathBuf::from(format!("{i}.bin")),
                },
            });
            assert_eq!(id, i as usize);
        }
        let mut rng = ChaCha8Rng::from_seed([1; 32]);
        let mut seen = [false; 3];
        for _ in 0..100 {
            let (id, entry) = corpus.random_select(&mut rng).unwrap();
            assert_eq!(entry.input, vec![id as u8]);
            seen[id] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn new_creates_missing_directory_and_rejects_files() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("nested").join("corpus");
        OnDiskCorpus::<CameraInput>::new(dir.clone()).unwrap();
        assert!(dir.is_dir());

        let file = tmp.path().join("plain");
        fs::write(&file, b"x").unwrap();
        assert!(OnDiskCorpus::<CameraInput>::new(file).is_err());
    }

    #[test]
    fn load_reads_bin_files_and_skips_the_rest() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("a.bin"), [0u8; STRUCTURED_LEN]).unwrap();
        fs::write(tmp.path().join("b.bin"), b"short").unwrap();
        fs::write(tmp.path().join("notes.txt"), b"ignored").unwrap();
        // A directory with the right extension cannot be read as a file.
        fs::create_dir(tmp.path().join("broken.bin")).unwrap();

        let mut corpus = OnDiskCorpus::<CameraInput>::new(tmp.path().to_path_buf()).unwrap();
        assert_eq!(corpus.load().unwrap(), 2);
        assert_eq!(corpus.len(), 2);

        let first = corpus.get(0).unwrap();
        assert_eq!(first.input.position, Some([0.0; 3]));
        assert!(matches!(first.provenance, Provenance::Loaded { .. }));
        assert_eq!(corpus.get(1).unwrap().input.bytes.as_deref(), Some(&b"short"[..]));
    }

    #[test]
    fn seed_if_empty_writes_random_and_boundary_states_once() {
        let tmp = tempdir().unwrap();
        let mut rng = ChaCha8Rng::from_seed([2; 32]);
        let mut corpus = OnDiskCorpus::<CameraInput>::new(tmp.path().to_path_buf()).unwrap();
        corpus.load().unwrap();

        assert_eq!(corpus.seed_if_empty(&mut rng).unwrap(), 13);
        assert_eq!(corpus.seed_if_empty(&mut rng).unwrap(), 0);
        assert_eq!(corpus.len(), 13);

        let names = bin_files(tmp.path());
        assert_eq!(names.len(), 13);
        assert_eq!(names[0], "seed_000.bin");
        assert_eq!(names[12], "seed_012.bin");
        for name in &names {
            let data = fs::read(tmp.path().join(name)).unwrap();
            assert_eq!(data.len(), STRUCTURED_LEN);
        }

        let mut reloaded = OnDiskCorpus::<CameraInput>::new(tmp.path().to_path_buf()).unwrap();
        assert_eq!(reloaded.load().unwrap(), 13);
        assert_eq!(reloaded.seed_if_empty(&mut rng).unwrap(), 0);
    }

    #[test]
    fn save_interesting_names_by_properties_and_never_overwrites() {
        let tmp = tempdir().unwrap();
        let mut corpus = OnDiskCorpus::<CameraInput>::new(tmp.path().to_path_buf()).unwrap();
        let input = CameraInput::raw(vec![1, 2, 3]);
        let result = ExecutionResult {
            crashed: true,
            signal: Some(11),
            coverage: Some(vec![4]),
            ..Default::default()
        };

        let first = corpus
            .save_interesting(&input, &result, Interest::Crash)
            .unwrap();
        let first_name = first.file_name().unwrap().to_string_lossy().into_owned();
        assert!(first_name.starts_with("id_"));
        assert!(first_name.ends_with("_crash_cov.bin"), "{first_name}");

        // Same second, same properties: the second file must get a fresh name.
        let stem = first_name.trim_end_matches(".bin").to_string();
        let second = corpus.write_unique(&stem, b"other").unwrap();
        assert_ne!(first, second);
        assert_eq!(fs::read(&first).unwrap(), vec![1, 2, 3]);
        assert_eq!(fs::read(&second).unwrap(), b"other".to_vec());

        assert_eq!(corpus.len(), 1);
        assert!(matches!(
            corpus.get(0).unwrap().provenance,
            Provenance::Discovered {
                interest: Interest::Crash,
                ..
            }
        ));
    }

    #[test]
    fn unreadable_directory_entries_are_skipped() {
        let entries = vec![
            Ok(PathBuf::from("corpus/b.bin")),
            Err(io::Error::other("stale entry")),
            Ok(PathBuf::from("corpus/notes.txt")),
            Ok(PathBuf::from("corpus/a.bin")),
        ];
        assert_eq!(
            input_paths(entries),
            vec![PathBuf::from("corpus/a.bin"), PathBuf::from("corpus/b.bin")]
        );
    }

    #[test]
    fn property_tags_follow_result_flags() {
        let slow = ExecutionResult::default();
        assert!(property_tags(&slow).is_empty());
        let timed_out = ExecutionResult {
            timed_out: true,
            ..Default::default()
        };
        assert_eq!(property_tags(&timed_out), vec!["timeout"]);
    }
}
