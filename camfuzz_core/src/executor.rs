use crate::config::ExecutorSettings;
use crate::input::{Input, InputError};
use crate::observer::{CoverageObserver, Observer};
use std::io::{ErrorKind, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const INPUT_FILE_PREFIX: &str = "camfuzz_input_";
const INPUT_FILE_SUFFIX: &str = ".bin";
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(20);
/// How long to wait for a pipe to close after the target is gone.
const CAPTURE_GRACE: Duration = Duration::from_millis(200);
const READ_CHUNK: usize = 8192;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to prepare input file: {0}")]
    InputFile(#[source] std::io::Error),
    #[error(transparent)]
    Encode(#[from] InputError),
    #[error("Input file path {0:?} is not valid UTF-8")]
    NonUtf8Path(std::path::PathBuf),
    #[error("Failed to spawn target {target:?}: {source}")]
    Spawn {
        target: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Error waiting for target process: {0}")]
    Wait(#[source] std::io::Error),
}

/// Coarse classification of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Ok,
    /// Non-zero exit without a signal. Not a crash.
    Failed(i32),
    Crash(i32),
    Timeout,
}

/// Captured output of a finished target process, as handed to observers.
#[derive(Debug, Default, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

/// Everything learned from running the target once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    pub duration: Duration,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub crashed: bool,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    pub coverage: Option<Vec<i64>>,
}

impl ExecutionResult {
    pub fn status(&self) -> ExecutionStatus {
        if self.timed_out {
            ExecutionStatus::Timeout
        } else if self.crashed {
            ExecutionStatus::Crash(self.signal.unwrap_or_default())
        } else {
            match self.exit_code {
                Some(0) | None => ExecutionStatus::Ok,
                Some(code) => ExecutionStatus::Failed(code),
            }
        }
    }
}

/// An `Executor` runs the target once on a single input.
///
/// Each worker owns its own executor, so implementations need not be shareable
/// across threads, only movable onto one.
pub trait Executor<I: Input>: Send {
    /// Runs the target on `input` and reports what happened.
    ///
    /// Crashes and timeouts are ordinary outcomes and come back as `Ok`,
    /// described by the flags on the result.
    ///
    /// # Returns
    /// The execution result, or an `ExecutorError` if the harness itself
    /// failed to run the target.
    fn execute(&mut self, input: &I) -> Result<ExecutionResult, ExecutorError>;
}

/// Runs the target as a child process, one process per input.
///
/// The input is written to a fresh temporary file whose path is passed on the
/// command line. The file is removed when the handle drops, on every exit path.
/// The harness enforces its own hard timeout regardless of whether the target
/// honours the soft one it was given.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    settings: ExecutorSettings,
    coverage: CoverageObserver,
}

enum WaitOutcome {
    Exited(ExitStatus),
    TimedOut,
}

impl CommandExecutor {
    pub fn new(settings: ExecutorSettings) -> Self {
        Self {
            settings,
            coverage: CoverageObserver::new(),
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    fn wait_with_timeout(
        &self,
        child: &mut Child,
        timeout: Duration,
    ) -> Result<WaitOutcome, ExecutorError> {
        let start_time = Instant::now();
        let mut poll = Duration::from_millis(1);

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    // Anything the target left running in its group goes with it.
                    kill_tree(child);
                    return Ok(WaitOutcome::Exited(status));
                }
                Ok(None) => {
                    let elapsed = start_time.elapsed();
                    if elapsed >= timeout {
                        tracing::debug!(pid = child.id(), ?timeout, "target timed out, killing");
                        kill_tree(child);
                        child.wait().map_err(ExecutorError::Wait)?;
                        return Ok(WaitOutcome::TimedOut);
                    }
                    thread::sleep(poll.min(timeout - elapsed));
                    poll = (poll * 2).min(MAX_POLL_INTERVAL);
                }
                Err(e) => {
                    kill_tree(child);
                    let _ = child.wait();
                    return Err(ExecutorError::Wait(e));
                }
            }
        }
    }
}

impl<I: Input> Executor<I> for CommandExecutor {
    fn execute(&mut self, input: &I) -> Result<ExecutionResult, ExecutorError> {
        let bytes = input.to_bytes()?;

        let mut input_file = tempfile::Builder::new()
            .prefix(INPUT_FILE_PREFIX)
            .suffix(INPUT_FILE_SUFFIX)
            .tempfile()
            .map_err(ExecutorError::InputFile)?;
        input_file
            .write_all(&bytes)
            .and_then(|_| input_file.flush())
            .map_err(ExecutorError::InputFile)?;

        let input_path = input_file
            .path()
            .to_str()
            .ok_or_else(|| ExecutorError::NonUtf8Path(input_file.path().to_path_buf()))?
            .to_string();

        let mut cmd = Command::new(&self.settings.target);
        cmd.args(self.settings.render_args(&input_path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &self.settings.working_dir {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        self.coverage.reset();
        let start_time = Instant::now();
        let mut child = cmd.spawn().map_err(|source| ExecutorError::Spawn {
            target: self.settings.target.clone(),
            source,
        })?;

        let limit = self.settings.capture_limit;
        let stdout_capture = spawn_capture(child.stdout.take(), limit);
        let stderr_capture = spawn_capture(child.stderr.take(), limit);

        let outcome = self.wait_with_timeout(&mut child, self.settings.hard_timeout());
        let duration = start_time.elapsed();
        drop(input_file);
        let outcome = outcome?;

        let (exit_code, signal, timed_out) = match outcome {
            WaitOutcome::Exited(status) => (status.code(), exit_signal(&status), false),
            WaitOutcome::TimedOut => (None, None, true),
        };

        let output = ProcessOutput {
            stdout: collect_capture(stdout_capture),
            stderr: collect_capture(stderr_capture),
            exit_code,
            signal,
        };
        self.coverage.post_exec(&output);

        Ok(ExecutionResult {
            duration,
            exit_code,
            signal,
            crashed: !timed_out && signal.is_some(),
            timed_out,
            coverage: self.coverage.take_coverage(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Kills the target's whole process group, or just the target where process
/// groups do not exist.
#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    if pgid <= 0 {
        return;
    }
    // SAFETY: kill(2) has no memory-safety preconditions; a negative pid
    // addresses only the group the target was spawned into.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pgid, "Failed to kill target process group: {err}");
        }
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    if let Err(e) = child.kill() {
        if e.kind() != ErrorKind::InvalidInput {
            tracing::warn!("Failed to kill target: {e}");
        }
    }
}

/// Output read from one pipe so far, plus a signal that the pipe hit EOF.
struct Capture {
    kept: Arc<Mutex<Vec<u8>>>,
    closed: Receiver<()>,
}

// Drains a pipe on its own thread so a chatty target never blocks on a full
// pipe. Only the first `limit` bytes are kept.
fn spawn_capture<R>(pipe: Option<R>, limit: usize) -> Option<Capture>
where
    R: Read + Send + 'static,
{
    let mut pipe = pipe?;
    let kept = Arc::new(Mutex::new(Vec::new()));
    let (closed_tx, closed) = mpsc::channel::<()>();
    let sink = Arc::clone(&kept);
    thread::spawn(move || {
        let _closed_tx = closed_tx;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match pipe.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    let mut kept = match sink.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    let room = limit.saturating_sub(kept.len());
                    kept.extend_from_slice(&chunk[..n.min(room)]);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
    Some(Capture { kept, closed })
}

// A descriptor leaked to a process outside the target's group can keep the
// pipe open; after the grace period whatever has been read so far is used.
fn collect_capture(capture: Option<Capture>) -> String {
    let Some(capture) = capture else {
        return String::new();
    };
    let _ = capture.closed.recv_timeout(CAPTURE_GRACE);
    let bytes = match capture.kept.lock() {
        Ok(mut guard) => std::mem::take(&mut *guard),
        Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    };
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use std::path::PathBuf;

    /// Settings that run `script` through `/bin/sh -c`, with the input path as `$1`
    /// and the soft timeout as `$2`.
    pub fn shell_settings(script: &str, timeout_ms: u64) -> ExecutorSettings {
        ExecutorSettings {
            target: PathBuf::from("/bin/sh"),
            args: vec![
                "-c".to_string(),
                format!("ulimit -c 0; {script}"),
                "sh".to_string(),
                crate::config::INPUT_PLACEHOLDER.to_string(),
                crate::config::TIMEOUT_PLACEHOLDER.to_string(),
            ],
            timeout_ms,
            ..ExecutorSettings::default()
        }
    }
}
