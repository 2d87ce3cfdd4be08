//! Worker entry point.
//!
//! The consumption loop is transport independent: it reads instructions from
//! a [`Channels`] set and answers on the same set. `run_worker_process` bridges
//! that set onto stdin/stdout when the binary runs with `--worker`.
//!
//! Thread design (child process):
//! - stdin reader: lines -> instructions channel, EOF stops the worker
//! - main loop: instructions -> handler -> results/progress channels
//! - stdout writer: progress and results -> JSON line frames

use std::io::{self, BufRead, Write};
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

use serde_json::Value;

use super::channel::{Channels, MessageChannel};
use super::handler::DiffusionWorker;
use super::ipc_types::{peek_id, FrameChannel, ProgressEnvelope, RequestEnvelope, ResultEnvelope, WireFrame};
use super::process_manager::StopToken;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::pipeline::{DryRunBackend, PipelineManager};
use crate::{log_debug, log_error, log_info, log_warn};

/// Main loop tick while waiting for instructions.
const WORKER_TICK: Duration = Duration::from_millis(20);
/// Stdout writer cadence.
const WRITER_TICK: Duration = Duration::from_millis(5);

/// Emits progress envelopes for one request.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    channel: MessageChannel,
    id: u64,
}

impl ProgressSink {
    pub fn new(channel: MessageChannel, id: u64) -> Self {
        Self { channel, id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn emit(&self, mut envelope: ProgressEnvelope) {
        envelope.id = self.id;
        match serde_json::to_string(&envelope) {
            Ok(json) => self.channel.put(json),
            Err(e) => {
                log_warn!("worker", "Cannot serialize progress for request {}: {e}", self.id);
            }
        }
    }

    pub fn task(&self, task: &str) {
        self.emit(ProgressEnvelope::task(self.id, task));
    }

    /// Bare `{id}` envelope telling the controller the request is still being worked on.
    pub fn heartbeat(&self) {
        self.emit(ProgressEnvelope {
            id: self.id,
            ..ProgressEnvelope::default()
        });
    }
}

/// Executes one instruction. `ping` and `stop` never reach the handler.
pub trait InstructionHandler {
    fn handle(&mut self, request: &RequestEnvelope, progress: &ProgressSink) -> Result<Value>;
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn reply(channels: &Channels, envelope: &ResultEnvelope) {
    match serde_json::to_string(envelope) {
        Ok(json) => channels.results.put(json),
        Err(e) => {
            log_error!("worker", "Cannot serialize result for request {}: {e}", envelope.id);
        }
    }
}

/// Consume instructions until `stop` arrives or the token is cancelled.
///
/// Every failure, panics included, is answered with an error envelope.
pub fn run_worker_loop(
    channels: &Channels,
    handler: &mut dyn InstructionHandler,
    stop: &StopToken,
    tick: Duration,
) {
    log_info!("worker", "Ready, waiting for instructions");
    while !stop.is_cancelled() {
        let Some(raw) = channels.instructions.get_timeout(tick) else {
            continue;
        };

        let request: RequestEnvelope = match serde_json::from_str(&raw) {
            Ok(request) => request,
            Err(e) => {
                match peek_id(&raw) {
                    Some(id) => {
                        let error = EngineError::Protocol(format!("malformed instruction: {e}"));
                        reply(channels, &ResultEnvelope::failure(id, &error, None));
                    }
                    None => {
                        log_warn!("worker", "Dropping malformed instruction: {e}");
                    }
                }
                continue;
            }
        };

        match request.action.as_str() {
            "ping" => {
                reply(channels, &ResultEnvelope::success(request.id, Value::String("pong".to_string())));
            }
            "stop" => {
                log_info!("worker", "Stop requested");
                break;
            }
            action => {
                log_debug!("worker", "Handling {action} (request {})", request.id);
                let sink = ProgressSink::new(channels.progress.clone(), request.id);
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&request, &sink)));
                let envelope = match outcome {
                    Ok(Ok(result)) => ResultEnvelope::success(request.id, result),
                    Ok(Err(e)) => {
                        log_warn!("worker", "Request {} ({action}) failed: {e}", request.id);
                        ResultEnvelope::failure(request.id, &e, Some(format!("{e:?}")))
                    }
                    Err(payload) => {
                        let msg = panic_message(payload.as_ref());
                        log_error!("worker", "Request {} ({action}) panicked: {msg}", request.id);
                        let error = EngineError::Pipeline(format!("worker panicked: {msg}"));
                        ResultEnvelope::failure(request.id, &error, None)
                    }
                };
                reply(channels, &envelope);
            }
        }
    }
    log_info!("worker", "Consumption loop exiting");
}

fn write_frame(stdout: &mut io::StdoutLock, channel: FrameChannel, raw: &str) -> io::Result<()> {
    let body: Value = serde_json::from_str(raw).map_err(io::Error::other)?;
    let frame = serde_json::to_string(&WireFrame { channel, body }).map_err(io::Error::other)?;
    writeln!(stdout, "{frame}")?;
    stdout.flush()
}

/// Write pending progress, then pending results. Returns false once stdout is gone.
fn flush_frames(stdout: &mut io::StdoutLock, channels: &Channels) -> bool {
    for raw in channels.progress.drain() {
        if write_frame(stdout, FrameChannel::Progress, &raw).is_err() {
            return false;
        }
    }
    for raw in channels.results.drain() {
        if write_frame(stdout, FrameChannel::Results, &raw).is_err() {
            return false;
        }
    }
    true
}

/// Run as a child process: instructions on stdin, frames on stdout, logs on stderr.
pub fn run_worker_process(config: EngineConfig) -> Result<()> {
    log_info!("worker", "Starting diffusion worker (pid={})", std::process::id());

    let channels = Channels::new();
    let stop = StopToken::new();

    let reader_channels = channels.clone();
    let reader_stop = stop.clone();
    thread::Builder::new()
        .name("worker-stdin".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(l) if !l.trim().is_empty() => reader_channels.instructions.put(l),
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            log_debug!("worker", "Stdin closed, stopping");
            reader_stop.cancel();
        })?;

    let writer_channels = channels.clone();
    let writer_stop = stop.clone();
    let writer = thread::Builder::new()
        .name("worker-stdout".to_string())
        .spawn(move || {
            let stdout = io::stdout();
            let mut stdout = stdout.lock();
            while !writer_stop.is_cancelled() {
                if !flush_frames(&mut stdout, &writer_channels) {
                    return;
                }
                thread::sleep(WRITER_TICK);
            }
            flush_frames(&mut stdout, &writer_channels);
        })?;

    let manager = PipelineManager::new(DryRunBackend::default(), config);
    let mut handler = DiffusionWorker::new(manager);
    run_worker_loop(&channels, &mut handler, &stop, WORKER_TICK);

    stop.cancel();
    if writer.join().is_err() {
        log_error!("worker", "Stdout writer panicked");
    }
    log_info!("worker", "Exiting");
    Ok(())
}
