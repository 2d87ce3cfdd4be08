//! Worker lifecycle: spawn, liveness, escalating termination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;

use super::channel::Channels;
use super::ipc_types::RequestEnvelope;
use super::process_manager::{WorkerHandle, WorkerLauncher};
use crate::config::SupervisorTimings;
use crate::error::{EngineError, Result};
use crate::{log_debug, log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Starting,
    Alive,
    Stopping,
    Terminated,
}

struct Inner {
    state: ProcessState,
    worker: Option<Box<dyn WorkerHandle>>,
    channels: Option<Channels>,
}

impl Inner {
    fn worker_alive(&mut self) -> bool {
        self.worker.as_mut().is_some_and(|w| w.is_alive())
    }

    fn teardown(&mut self) {
        self.worker = None;
        self.channels = None;
    }
}

/// Owns the worker and its channels. At most one worker is alive at a time.
pub struct ProcessSupervisor {
    launcher: Box<dyn WorkerLauncher>,
    timings: SupervisorTimings,
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("state", &self.state())
            .field("timings", &self.timings)
            .finish_non_exhaustive()
    }
}

impl ProcessSupervisor {
    pub fn new(launcher: impl WorkerLauncher + 'static, timings: SupervisorTimings) -> Self {
        Self {
            launcher: Box::new(launcher),
            timings,
            inner: Mutex::new(Inner {
                state: ProcessState::NotStarted,
                worker: None,
                channels: None,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Handle poisoned mutex by recovering from panic
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn timings(&self) -> &SupervisorTimings {
        &self.timings
    }

    pub fn state(&self) -> ProcessState {
        self.lock().state
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().worker.as_ref().and_then(|w| w.pid())
    }

    /// Start a worker unless one is already alive.
    ///
    /// With `fail_when_redundant`, an alive worker is an error; otherwise the call is a no-op.
    pub fn spawn(&self, fail_when_redundant: bool) -> Result<()> {
        let mut inner = self.lock();
        if inner.worker_alive() {
            if fail_when_redundant {
                return Err(EngineError::Lifecycle(
                    "spawn called while a worker is already running".to_string(),
                ));
            }
            return Ok(());
        }
        if inner.worker.is_some() {
            log_debug!("supervisor", "Clearing state of a dead worker before respawn");
            inner.teardown();
        }

        log_debug!("supervisor", "No current worker, creating one");
        inner.state = ProcessState::Starting;
        let channels = inner.channels.get_or_insert_with(Channels::new).clone();

        let worker = match self.launcher.launch(&channels) {
            Ok(worker) => worker,
            Err(e) => {
                inner.teardown();
                inner.state = ProcessState::Terminated;
                return Err(EngineError::Lifecycle(format!("failed to start worker: {e}")));
            }
        };
        inner.worker = Some(worker);

        thread::sleep(self.timings.spawn_settle());
        if !inner.worker_alive() {
            if let Some(worker) = inner.worker.as_mut() {
                worker.kill();
            }
            inner.teardown();
            inner.state = ProcessState::Terminated;
            return Err(EngineError::Lifecycle(
                "worker died before it became responsive".to_string(),
            ));
        }

        inner.state = ProcessState::Alive;
        let pid = inner.worker.as_ref().and_then(|w| w.pid());
        log_info!("supervisor", "Worker started (pid={pid:?})");
        Ok(())
    }

    /// Whether the worker is running. A dead worker's channels are released as a side effect.
    pub fn is_alive(&self) -> bool {
        let mut inner = self.lock();
        if inner.worker.is_none() {
            return false;
        }
        if inner.worker_alive() {
            return true;
        }
        log_warn!("supervisor", "Worker exited unexpectedly, releasing its channels");
        inner.teardown();
        inner.state = ProcessState::Terminated;
        false
    }

    /// Stop the worker: ask, wait up to `timeout`, then force. Idempotent.
    pub fn terminate(&self, timeout: Option<Duration>) -> Result<()> {
        let mut inner = self.lock();
        let Some(mut worker) = inner.worker.take() else {
            if inner.channels.take().is_some() {
                log_debug!("supervisor", "Released channels of a never-started worker");
            }
            if inner.state != ProcessState::NotStarted {
                inner.state = ProcessState::Terminated;
            }
            return Ok(());
        };

        let grace = self.timings.stop_grace();
        if worker.is_alive() {
            inner.state = ProcessState::Stopping;
            if let Some(channels) = inner.channels.as_ref() {
                self.enqueue(channels, "stop", Value::Null)?;
            }
            thread::sleep(grace);

            let start = Instant::now();
            while worker.is_alive() {
                if timeout.is_some_and(|t| start.elapsed() >= t) {
                    log_debug!("supervisor", "Worker did not stop on its own, killing");
                    worker.kill();
                    thread::sleep(grace);
                    break;
                }
                thread::sleep(grace);
            }
        }

        if worker.is_alive() {
            log_debug!("supervisor", "Killing worker one more time");
            worker.kill();
            thread::sleep(grace);
        }

        if worker.is_alive() {
            inner.worker = Some(worker);
            return Err(EngineError::Lifecycle("could not terminate worker".to_string()));
        }

        drop(worker);
        inner.teardown();
        inner.state = ProcessState::Terminated;
        log_info!("supervisor", "Worker terminated");
        Ok(())
    }

    /// Channels of the current worker, created if none exist yet.
    pub fn channels(&self) -> Channels {
        self.lock().channels.get_or_insert_with(Channels::new).clone()
    }

    /// Channels only if they already exist.
    pub fn existing_channels(&self) -> Option<Channels> {
        self.lock().channels.clone()
    }

    /// Drop the channels. Not allowed while the worker is alive.
    pub fn release_channels(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.worker_alive() {
            return Err(EngineError::Lifecycle(
                "cannot release channels while the worker is alive".to_string(),
            ));
        }
        inner.channels = None;
        Ok(())
    }

    /// Whether instructions are still waiting to be consumed.
    pub fn instructions_pending(&self) -> bool {
        self.lock()
            .channels
            .as_ref()
            .is_some_and(|c| !c.instructions.is_empty())
    }

    /// Serialize a request onto the instructions channel and return its id.
    pub fn send(&self, action: &str, payload: Value) -> Result<u64> {
        let channels = self.channels();
        self.enqueue(&channels, action, payload)
    }

    fn enqueue(&self, channels: &Channels, action: &str, payload: Value) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let envelope = RequestEnvelope {
            id,
            action: action.to_string(),
            payload,
        };
        channels.instructions.put(serde_json::to_string(&envelope)?);
        Ok(id)
    }
}
