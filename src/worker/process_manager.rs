//! Worker launchers.
//!
//! A worker is either a child process (same binary with the `--worker` flag)
//! or an in-process thread. Both are bridged onto [`Channels`] and exposed
//! through [`WorkerHandle`], so the supervisor treats them identically.

use std::ffi::OsString;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::channel::{Channels, MessageChannel};
use super::ipc_types::{FrameChannel, WireFrame};
use crate::error::{EngineError, Result};
use crate::{log_debug, log_warn};

/// How often the stdin pump re-checks its stop flag.
const PUMP_TICK: Duration = Duration::from_millis(20);

/// Cooperative cancellation flag shared between a worker and its owner.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A running worker, as seen by the supervisor.
pub trait WorkerHandle: Send {
    fn is_alive(&mut self) -> bool;

    /// Forced termination. May not take effect immediately.
    fn kill(&mut self);

    /// OS process id, when the worker is a process.
    fn pid(&self) -> Option<u32>;
}

/// Starts workers wired to a set of channels.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, channels: &Channels) -> Result<Box<dyn WorkerHandle>>;
}

/// Launches the worker as a child process speaking JSON lines over stdin/stdout.
#[derive(Debug, Clone)]
pub struct ChildProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ChildProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// The current executable with `--worker`.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| EngineError::Lifecycle(format!("cannot find own executable: {e}")))?;
        Ok(Self::new(exe).arg("--worker"))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerLauncher for ChildProcessLauncher {
    fn launch(&self, channels: &Channels) -> Result<Box<dyn WorkerHandle>> {
        log_debug!(
            "process",
            "Spawning worker: {} {:?}",
            self.program.display(),
            self.args
        );

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Worker logs go to parent's stderr
            .spawn()
            .map_err(|e| EngineError::Lifecycle(format!("failed to spawn worker: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Lifecycle("worker stdin not available".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Lifecycle("worker stdout not available".to_string()))?;

        let pump_stop = StopToken::new();
        let instructions = channels.instructions.clone();
        let writer_stop = pump_stop.clone();
        thread::Builder::new()
            .name("worker-stdin".to_string())
            .spawn(move || pump_instructions(instructions, stdin, writer_stop))?;

        let results = channels.results.clone();
        let progress = channels.progress.clone();
        thread::Builder::new()
            .name("worker-stdout".to_string())
            .spawn(move || read_frames(stdout, results, progress))?;

        Ok(Box::new(ChildWorker { child, pump_stop }))
    }
}

/// Forward instructions to the child's stdin until stopped or the pipe breaks.
fn pump_instructions(instructions: MessageChannel, mut stdin: ChildStdin, stop: StopToken) {
    while !stop.is_cancelled() {
        let Some(line) = instructions.get_timeout(PUMP_TICK) else {
            continue;
        };
        if writeln!(stdin, "{line}").and_then(|_| stdin.flush()).is_err() {
            log_debug!("process", "Worker stdin closed");
            break;
        }
    }
}

/// Route stdout frames onto the results and progress channels until EOF.
fn read_frames(stdout: ChildStdout, results: MessageChannel, progress: MessageChannel) {
    for line in BufReader::new(stdout).lines() {
        let line = match line {
            Ok(l) if l.trim().is_empty() => continue,
            Ok(l) => l,
            Err(_) => break,
        };
        match serde_json::from_str::<WireFrame>(&line) {
            Ok(frame) => {
                let target = match frame.channel {
                    FrameChannel::Results => &results,
                    FrameChannel::Progress => &progress,
                };
                target.put(frame.body.to_string());
            }
            Err(e) => {
                log_warn!("process", "Dropping malformed worker frame ({e}): {line}");
            }
        }
    }
    log_debug!("process", "Worker stdout reader exiting");
}

struct ChildWorker {
    child: Child,
    pump_stop: StopToken,
}

impl WorkerHandle for ChildWorker {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn kill(&mut self) {
        log_debug!("process", "Killing worker process {}", self.child.id());
        let _ = self.child.kill();
    }

    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }
}

impl Drop for ChildWorker {
    fn drop(&mut self) {
        self.pump_stop.cancel();
        if self.is_alive() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait(); // Reap
    }
}

type WorkerBody = dyn Fn(Channels, StopToken) + Send + Sync;

/// Runs the worker body on a thread inside the controller process.
///
/// Threads cannot be killed; `kill` only cancels the body's [`StopToken`].
#[derive(Clone)]
pub struct ThreadLauncher {
    body: Arc<WorkerBody>,
}

impl ThreadLauncher {
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(Channels, StopToken) + Send + Sync + 'static,
    {
        Self {
            body: Arc::new(body),
        }
    }
}

impl std::fmt::Debug for ThreadLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadLauncher").finish_non_exhaustive()
    }
}

impl WorkerLauncher for ThreadLauncher {
    fn launch(&self, channels: &Channels) -> Result<Box<dyn WorkerHandle>> {
        let stop = StopToken::new();
        let body = Arc::clone(&self.body);
        let worker_channels = channels.clone();
        let worker_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("engine-worker".to_string())
            .spawn(move || body(worker_channels, worker_stop))?;
        Ok(Box::new(ThreadWorker {
            handle: Some(handle),
            stop,
        }))
    }
}

struct ThreadWorker {
    handle: Option<JoinHandle<()>>,
    stop: StopToken,
}

impl WorkerHandle for ThreadWorker {
    fn is_alive(&mut self) -> bool {
        let finished = match &self.handle {
            Some(handle) => handle.is_finished(),
            None => return false,
        };
        if finished {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
            return false;
        }
        true
    }

    fn kill(&mut self) {
        self.stop.cancel();
    }

    fn pid(&self) -> Option<u32> {
        None
    }
}

impl Drop for ThreadWorker {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
