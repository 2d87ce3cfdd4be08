//! Request dispatch and reply correlation.
//!
//! Replies are matched by id. Envelopes for other ids are pushed back onto
//! their channel in arrival order, so concurrent callers never lose each
//! other's replies.

use std::thread;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::channel::MessageChannel;
use super::ipc_types::{peek_id, ProgressEnvelope, ResultEnvelope};
use super::process_manager::WorkerLauncher;
use super::supervisor::ProcessSupervisor;
use crate::config::SupervisorTimings;
use crate::error::{EngineError, Result};
use crate::pipeline::settings::ConfigurationUpdate;
use crate::{log_debug, log_error, log_warn};

/// Controller side of the worker protocol.
#[derive(Debug)]
pub struct Dispatcher {
    supervisor: ProcessSupervisor,
}

impl Dispatcher {
    pub fn new(launcher: impl WorkerLauncher + 'static, timings: SupervisorTimings) -> Self {
        Self {
            supervisor: ProcessSupervisor::new(launcher, timings),
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    fn poll_interval(&self) -> Duration {
        self.supervisor.timings().poll_interval()
    }

    /// Queue a request, starting the worker first. Returns the request id.
    pub fn dispatch(&self, action: &str, payload: Value) -> Result<u64> {
        self.dispatch_with(action, payload, true)
    }

    pub fn dispatch_with(&self, action: &str, payload: Value, spawn_process: bool) -> Result<u64> {
        if spawn_process {
            self.supervisor.spawn(false)?;
        }
        let id = self.supervisor.send(action, payload)?;
        log_debug!("dispatch", "Dispatched {action} as request {id}");
        Ok(id)
    }

    /// Block until the reply for `id` arrives.
    ///
    /// `None` waits forever; a dead worker ends the wait with a lifecycle error.
    pub fn wait(&self, id: u64, timeout: Option<Duration>) -> Result<Value> {
        let start = Instant::now();
        loop {
            if !self.supervisor.is_alive() {
                return Err(EngineError::Lifecycle(format!(
                    "worker is not running, cannot wait for request {id}"
                )));
            }
            let channels = self.supervisor.channels();
            if let Some(envelope) = take_result(&channels.results, id)? {
                return envelope.into_result();
            }

            thread::sleep(self.poll_interval());
            if let Some(limit) = timeout {
                if start.elapsed() >= limit {
                    return Err(EngineError::Timeout(limit));
                }
            }
        }
    }

    pub fn invoke(&self, action: &str, payload: Value, timeout: Option<Duration>) -> Result<Value> {
        let id = self.dispatch(action, payload)?;
        self.wait(id, timeout)
    }

    /// [`invoke`](Self::invoke), decoding the result.
    pub fn invoke_as<T: DeserializeOwned>(
        &self,
        action: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let value = self.invoke(action, payload, timeout)?;
        serde_json::from_value(value)
            .map_err(|e| EngineError::Protocol(format!("unexpected {action} result: {e}")))
    }

    /// Merged progress received so far for `id`, consuming it from the channel.
    pub fn last_progress(&self, id: u64) -> Option<ProgressEnvelope> {
        let channels = self.supervisor.existing_channels()?;
        let mut merged: Option<ProgressEnvelope> = None;
        let mut others = Vec::new();

        for raw in channels.progress.drain() {
            if peek_id(&raw) != Some(id) {
                others.push(raw);
                continue;
            }
            match serde_json::from_str::<ProgressEnvelope>(&raw) {
                Ok(snapshot) => match merged.as_mut() {
                    Some(m) => m.merge(snapshot),
                    None => merged = Some(snapshot),
                },
                Err(e) => {
                    log_warn!("dispatch", "Dropping malformed progress for request {id}: {e}");
                }
            }
        }
        for raw in others {
            channels.progress.put(raw);
        }
        merged
    }

    /// Liveness probe.
    ///
    /// Returns `false` when no worker is running. When the worker is idle a
    /// ping must come back as `"pong"`, otherwise the worker is stopped.
    pub fn keepalive(&self, timeout: Option<Duration>) -> Result<bool> {
        if !self.supervisor.is_alive() {
            return Ok(false);
        }
        if self.supervisor.instructions_pending() {
            return Ok(true);
        }
        let id = self.dispatch_with("ping", Value::Null, false)?;
        let reply = self.wait(id, timeout)?;
        if reply != Value::String("pong".to_string()) {
            self.terminate()?;
            return Err(EngineError::Protocol(format!(
                "expected 'pong' from worker, got {reply}"
            )));
        }
        Ok(true)
    }

    pub fn terminate(&self) -> Result<()> {
        let timeout = self.supervisor.timings().terminate_timeout();
        self.supervisor.terminate(Some(timeout))
    }

    pub fn configure(&self, update: &ConfigurationUpdate, timeout: Option<Duration>) -> Result<Value> {
        self.invoke("configure", serde_json::to_value(update)?, timeout)
    }

    pub fn status(&self, timeout: Option<Duration>) -> Result<Value> {
        self.invoke("status", Value::Null, timeout)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            log_error!("dispatch", "Failed to stop worker on shutdown: {e}");
        }
    }
}

/// Remove the result for `id` from `results`, requeueing everything else in order.
fn take_result(results: &MessageChannel, id: u64) -> Result<Option<ResultEnvelope>> {
    let mut found: Option<Result<ResultEnvelope>> = None;
    let mut others = Vec::new();

    for raw in results.drain() {
        match peek_id(&raw) {
            Some(envelope_id) if envelope_id == id && found.is_none() => {
                found = Some(serde_json::from_str::<ResultEnvelope>(&raw).map_err(|e| {
                    EngineError::Protocol(format!("malformed result for request {id}: {e}"))
                }));
            }
            Some(_) => others.push(raw),
            None => {
                log_warn!("dispatch", "Dropping result without a request id: {raw}");
            }
        }
    }
    for raw in others {
        results.put(raw);
    }
    found.transpose()
}
