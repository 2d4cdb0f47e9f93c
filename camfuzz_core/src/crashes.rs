use crate::config::ExecutorSettings;
use crate::executor::ExecutionResult;
use crate::input::{Input, InputError};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Hex characters kept from the signature digest.
pub const SIGNATURE_LEN: usize = 16;
/// Characters of stdout/stderr kept in crash metadata.
pub const OUTPUT_EXCERPT_CHARS: usize = 1000;

pub const INPUT_FILE_NAME: &str = "input.bin";
pub const METADATA_FILE_NAME: &str = "metadata.json";
pub const REPRODUCE_FILE_NAME: &str = "reproduce.sh";

#[derive(Error, Debug)]
pub enum CrashStoreError {
    #[error("Crash store I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Encode(#[from] InputError),
    #[error("Failed to serialize crash metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> CrashStoreError + '_ {
    move |source| CrashStoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Contents of `metadata.json` in a crash directory.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CrashMetadata {
    pub signature: String,
    pub timestamp: String,
    pub signal: Option<i32>,
    pub exit_code: Option<i32>,
    pub duration_secs: f64,
    pub stdout: String,
    pub stderr: String,
}

impl CrashMetadata {
    pub fn new(signature: &str, result: &ExecutionResult) -> Self {
        Self {
            signature: signature.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            signal: result.signal,
            exit_code: result.exit_code,
            duration_secs: result.duration.as_secs_f64(),
            stdout: excerpt(&result.stdout),
            stderr: excerpt(&result.stderr),
        }
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(OUTPUT_EXCERPT_CHARS).collect()
}

/// Identity of a crash: the first 16 hex characters of the MD5 of `"<signal>:<stderr>"`.
pub fn crash_signature(result: &ExecutionResult) -> String {
    let signal = result
        .signal
        .map_or_else(|| "none".to_string(), |s| s.to_string());
    let digest = md5::compute(format!("{}:{}", signal, result.stderr));
    let mut hex = format!("{:x}", digest);
    hex.truncate(SIGNATURE_LEN);
    hex
}

fn looks_like_signature(name: &str) -> bool {
    name.len() == SIGNATURE_LEN && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Deduplicated crash artifacts, one directory per signature.
///
/// Signatures are only ever added. The directory for a new signature is
/// created with `create_dir`, so a directory that already exists (left by an
/// earlier session or another process) is never written into.
#[derive(Debug)]
pub struct CrashStore {
    crash_dir: PathBuf,
    executor: ExecutorSettings,
    known: HashSet<String>,
}

impl CrashStore {
    /// Opens (creating if needed) `crash_dir` and adopts the signatures of
    /// crash directories already present in it.
    pub fn open(crash_dir: PathBuf, executor: ExecutorSettings) -> Result<Self, CrashStoreError> {
        fs::create_dir_all(&crash_dir).map_err(io_at(&crash_dir))?;
        let mut known = HashSet::new();
        for entry in fs::read_dir(&crash_dir).map_err(io_at(&crash_dir))? {
            let entry = entry.map_err(io_at(&crash_dir))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if looks_like_signature(name) && entry.path().is_dir() {
                known.insert(name.to_string());
            }
        }
        if !known.is_empty() {
            info!(
                count = known.len(),
                dir = %crash_dir.display(),
                "Adopted existing crash signatures"
            );
        }
        Ok(Self {
            crash_dir,
            executor,
            known,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.crash_dir
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.known.contains(signature)
    }

    pub fn unique_crashes(&self) -> usize {
        self.known.len()
    }

    /// Known signatures in sorted order.
    pub fn signatures(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.known.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Records a crash. Returns the new crash directory, or `None` when the
    /// signature was already known.
    pub fn save_crash<I: Input>(
        &mut self,
        input: &I,
        result: &ExecutionResult,
    ) -> Result<Option<PathBuf>, CrashStoreError> {
        let signature = crash_signature(result);
        if !self.known.insert(signature.clone()) {
            return Ok(None);
        }

        let dir = self.crash_dir.join(&signature);
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                warn!(%signature, "Crash directory already exists, not overwriting");
                return Ok(None);
            }
            Err(e) => {
                self.known.remove(&signature);
                return Err(CrashStoreError::Io { path: dir, source: e });
            }
        }

        if let Err(e) = self.write_artifacts(&dir, &signature, input, result) {
            self.known.remove(&signature);
            if let Err(cleanup) = fs::remove_dir_all(&dir) {
                warn!(
                    dir = %dir.display(),
                    error = %cleanup,
                    "Failed to remove partial crash directory"
                );
            }
            return Err(e);
        }

        info!(
            %signature,
            signal = ?result.signal,
            dir = %dir.display(),
            "New crash found"
        );
        Ok(Some(dir))
    }

    fn write_artifacts<I: Input>(
        &self,
        dir: &Path,
        signature: &str,
        input: &I,
        result: &ExecutionResult,
    ) -> Result<(), CrashStoreError> {
        let input_path = dir.join(INPUT_FILE_NAME);
        fs::write(&input_path, input.to_bytes()?).map_err(io_at(&input_path))?;

        let metadata_path = dir.join(METADATA_FILE_NAME);
        let metadata = CrashMetadata::new(signature, result);
        fs::write(&metadata_path, serde_json::to_string_pretty(&metadata)?)
            .map_err(io_at(&metadata_path))?;

        let script_path = dir.join(REPRODUCE_FILE_NAME);
        fs::write(&script_path, self.reproduce_script(signature, result))
            .map_err(io_at(&script_path))?;
        make_executable(&script_path).map_err(io_at(&script_path))
    }

    fn reproduce_script(&self, signature: &str, result: &ExecutionResult) -> String {
        let target = reproducible_target(&self.executor.target);
        let command = std::iter::once(target.to_string_lossy().into_owned())
            .chain(self.executor.render_args(INPUT_FILE_NAME))
            .map(|arg| shell_quote(&arg))
            .collect::<Vec<_>>()
            .join(" ");
        let signal = result
            .signal
            .map_or_else(|| "unknown".to_string(), |s| s.to_string());
        format!(
            "#!/bin/sh\n\
             # Crash reproduction script\n\
             # Signature: {signature}\n\
             # Signal: {signal}\n\
             cd \"$(dirname \"$0\")\" || exit 1\n\
             exec {command}\n"
        )
    }
}

// The script changes directory before running, so a relative target path
// must be pinned. Bare command names are left for PATH lookup.
fn reproducible_target(target: &Path) -> PathBuf {
    if target.is_relative() && target.components().count() > 1 {
        std::path::absolute(target).unwrap_or_else(|_| target.to_path_buf())
    } else {
        target.to_path_buf()
    }
}

fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::test_utils::shell_settings;
    use crate::executor::{CommandExecutor, Executor};
    use crate::input::CameraInput;
    use std::time::Duration;
    use tempfile::tempdir;

    fn segv(stderr: &str) -> ExecutionResult {
        ExecutionResult {
            duration: Duration::from_millis(5),
            signal: Some(11),
            crashed: true,
            stderr: stderr.to_string(),
            ..Default::default()
        }
    }

    fn subdirs(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.is_dir())
            .collect()
    }

    #[test]
    fn signature_depends_on_signal_and_stderr() {
        let base = crash_signature(&segv("boom"));
        assert_eq!(base.len(), SIGNATURE_LEN);
        assert!(looks_like_signature(&base));
        assert_eq!(base, crash_signature(&segv("boom")));
        assert_ne!(base, crash_signature(&segv("bang")));
        let abort = ExecutionResult {
            signal: Some(6),
            ..segv("boom")
        };
        assert_ne!(base, crash_signature(&abort));
        // Exit status and stdout are not part of the identity.
        let noisy = ExecutionResult {
            stdout: "different".into(),
            exit_code: Some(1),
            ..segv("boom")
        };
        assert_eq!(base, crash_signature(&noisy));
    }

    #[test]
    fn identical_crashes_produce_one_directory() {
        let tmp = tempdir().unwrap();
        let mut store =
            CrashStore::open(tmp.path().to_path_buf(), ExecutorSettings::default()).unwrap();
        let input = CameraInput::raw(vec![0xAA; 4]);

        let first = store.save_crash(&input, &segv("boom")).unwrap();
        assert!(first.is_some());
        for _ in 0..5 {
            assert!(store.save_crash(&input, &segv("boom")).unwrap().is_none());
        }
        assert_eq!(store.unique_crashes(), 1);
        assert_eq!(subdirs(tmp.path()).len(), 1);

        store.save_crash(&input, &segv("other")).unwrap().unwrap();
        assert_eq!(store.unique_crashes(), 2);
        assert_eq!(store.signatures().len(), 2);
    }

    #[derive(Debug, Clone)]
    struct Unencodable;

    impl Input for Unencodable {
        fn to_bytes(&self) -> Result<Vec<u8>, InputError> {
            Err(InputError::Encode(bincode::error::EncodeError::Other("unencodable")))
        }
        fn from_bytes(_bytes: &[u8]) -> Self {
            Unencodable
        }
    }

    #[test]
    fn failed_write_releases_the_signature() {
        let tmp = tempdir().unwrap();
        let mut store =
            CrashStore::open(tmp.path().to_path_buf(), ExecutorSettings::default()).unwrap();
        let signature = crash_signature(&segv("boom"));

        assert!(store.save_crash(&Unencodable, &segv("boom")).is_err());
        assert!(!store.contains(&signature));
        assert!(subdirs(tmp.path()).is_empty());

        let dir = store
            .save_crash(&CameraInput::raw(vec![7]), &segv("boom"))
            .unwrap()
            .unwrap();
        assert!(dir.join(INPUT_FILE_NAME).exists());
        assert!(dir.join(REPRODUCE_FILE_NAME).exists());
        assert_eq!(store.unique_crashes(), 1);
    }

    #[test]
    fn crash_directory_holds_input_metadata_and_script() {
        let tmp = tempdir().unwrap();
        let mut store = CrashStore::open(tmp.path().to_path_buf(), ExecutorSettings {
            target: PathBuf::from("/opt/it's/camera"),
            timeout_ms: 700,
            ..ExecutorSettings::default()
        })
        .unwrap();
        let input = CameraInput::raw(vec![1, 2, 3]);
        let result = ExecutionResult {
            stdout: "o".repeat(1500),
            ..segv(&"e".repeat(1500))
        };

        let dir = store.save_crash(&input, &result).unwrap().unwrap();
        assert_eq!(
            dir.file_name().unwrap().to_str().unwrap(),
            crash_signature(&result)
        );
        assert_eq!(fs::read(dir.join(INPUT_FILE_NAME)).unwrap(), vec![1, 2, 3]);

        let metadata: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.join(METADATA_FILE_NAME)).unwrap()).unwrap();
        assert_eq!(metadata["signal"], 11);
        assert!(metadata["exit_code"].is_null());
        assert_eq!(metadata["stderr"].as_str().unwrap().len(), OUTPUT_EXCERPT_CHARS);
        assert_eq!(metadata["stdout"].as_str().unwrap().len(), OUTPUT_EXCERPT_CHARS);
        let timestamp = metadata["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());

        let script = fs::read_to_string(dir.join(REPRODUCE_FILE_NAME)).unwrap();
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("# Signal: 11"));
        assert!(script.contains(
            r"exec '/opt/it'\''s/camera' '--fuzz-input' 'input.bin' '--timeout' '700'"
        ));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir.join(REPRODUCE_FILE_NAME))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn reopening_adopts_existing_signatures() {
        let tmp = tempdir().unwrap();
        let input = CameraInput::raw(vec![7]);
        {
            let mut store =
                CrashStore::open(tmp.path().to_path_buf(), ExecutorSettings::default()).unwrap();
            store.save_crash(&input, &segv("boom")).unwrap().unwrap();
        }
        fs::create_dir(tmp.path().join("not-a-signature")).unwrap();

        let mut reopened =
            CrashStore::open(tmp.path().to_path_buf(), ExecutorSettings::default()).unwrap();
        assert_eq!(reopened.unique_crashes(), 1);
        assert!(reopened.contains(&crash_signature(&segv("boom"))));
        assert!(reopened.save_crash(&input, &segv("boom")).unwrap().is_none());
    }

    #[test]
    fn reproduce_script_replays_the_crash() {
        let tmp = tempdir().unwrap();
        let settings = shell_settings(r#"grep -q CRASH "$1" && kill -SEGV $$; exit 0"#, 1000);
        let mut executor = CommandExecutor::new(settings.clone());
        let input = b"CRASH".to_vec();
        let result = executor.execute(&input).unwrap();
        assert!(result.crashed);

        let mut store = CrashStore::open(tmp.path().to_path_buf(), settings).unwrap();
        let dir = store.save_crash(&input, &result).unwrap().unwrap();

        let status = std::process::Command::new("/bin/sh")
            .arg(dir.join(REPRODUCE_FILE_NAME))
            .status()
            .unwrap();
        assert!(!status.success());
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            // The reproduced target dies by signal; the script itself `exec`s it.
            assert_eq!(status.signal(), Some(11));
        }
    }
}
