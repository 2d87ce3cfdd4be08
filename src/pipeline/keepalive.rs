//! Heartbeat while a long blocking step runs.
//!
//! The timer thread only reads the current callback; swapping the callback
//! while a guard is active is allowed and the last write wins.

use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};

use crate::config::KeepaliveTimings;
use crate::log_debug;

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Replaceable heartbeat callback shared with the timer thread.
#[derive(Clone)]
pub struct CallbackSlot(Arc<RwLock<Callback>>);

impl Default for CallbackSlot {
    fn default() -> Self {
        Self(Arc::new(RwLock::new(Arc::new(|| {}))))
    }
}

impl std::fmt::Debug for CallbackSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSlot").finish_non_exhaustive()
    }
}

impl CallbackSlot {
    pub fn set(&self, callback: impl Fn() + Send + Sync + 'static) {
        let mut slot = self.0.write().unwrap_or_else(|p| p.into_inner());
        *slot = Arc::new(callback);
    }

    pub fn fire(&self) {
        let callback = Arc::clone(&self.0.read().unwrap_or_else(|p| p.into_inner()));
        callback();
    }
}

#[derive(Debug, Clone, Default)]
pub struct Heartbeat {
    slot: CallbackSlot,
    timings: KeepaliveTimings,
}

impl Heartbeat {
    pub fn new(timings: KeepaliveTimings) -> Self {
        Self {
            slot: CallbackSlot::default(),
            timings,
        }
    }

    pub fn slot(&self) -> &CallbackSlot {
        &self.slot
    }

    /// Start beating. The returned guard stops the timer when dropped.
    pub fn start(&self) -> KeepaliveGuard {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let slot = self.slot.clone();
        let tick = self.timings.tick();
        let interval = self.timings.interval();

        let spawned = thread::Builder::new()
            .name("keepalive".to_string())
            .spawn(move || {
                let mut last = Instant::now();
                loop {
                    match stop_rx.recv_timeout(tick) {
                        Err(RecvTimeoutError::Timeout) => {
                            if last.elapsed() >= interval {
                                slot.fire();
                                last = Instant::now();
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            });

        let handle = match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                log_debug!("keepalive", "Could not start heartbeat thread: {e}");
                None
            }
        };
        KeepaliveGuard {
            stop: Some(stop_tx),
            handle,
        }
    }
}

/// Running heartbeat. Stopped and joined on [`stop`](Self::stop) or drop.
#[must_use = "the heartbeat stops when the guard is dropped"]
pub struct KeepaliveGuard {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl KeepaliveGuard {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for KeepaliveGuard {
    fn drop(&mut self) {
        self.shutdown();
    }
}
