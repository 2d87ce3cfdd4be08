//! FIFO message channels between the controller and the worker.
//!
//! Every transport (child process pipes, in-process thread) is bridged onto
//! the same three channels, so correlation logic never sees the transport.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

/// A multi-producer, multi-consumer queue of serialized envelopes.
///
/// Clones share the same queue.
#[derive(Debug, Clone)]
pub struct MessageChannel {
    tx: Sender<String>,
    rx: Receiver<String>,
}

impl Default for MessageChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageChannel {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    /// Append a message. Never blocks; the channel holds its own receiver so it cannot disconnect.
    pub fn put(&self, message: String) {
        let _ = self.tx.send(message);
    }

    pub fn try_get(&self) -> Option<String> {
        match self.rx.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Block up to `timeout` for the next message.
    pub fn get_timeout(&self, timeout: Duration) -> Option<String> {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => Some(message),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Remove and return everything currently queued, in order.
    pub fn drain(&self) -> Vec<String> {
        self.rx.try_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }
}

/// The three channels owned by one controller.
#[derive(Debug, Clone, Default)]
pub struct Channels {
    /// Controller to worker.
    pub instructions: MessageChannel,
    /// Worker to controller: final result or error per request.
    pub results: MessageChannel,
    /// Worker to controller: partial progress snapshots.
    pub progress: MessageChannel,
}

impl Channels {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_and_drain() {
        let channel = MessageChannel::new();
        channel.put("a".to_string());
        channel.put("b".to_string());
        channel.put("c".to_string());
        assert_eq!(channel.len(), 3);
        assert_eq!(channel.try_get().as_deref(), Some("a"));
        assert_eq!(channel.drain(), vec!["b".to_string(), "c".to_string()]);
        assert!(channel.is_empty());
        assert_eq!(channel.try_get(), None);
    }

    #[test]
    fn test_clones_share_queue() {
        let channels = Channels::new();
        let worker_side = channels.clone();
        worker_side.results.put("done".to_string());
        assert_eq!(channels.results.try_get().as_deref(), Some("done"));
        assert!(channels.progress.is_empty());
    }

    #[test]
    fn test_get_timeout_on_empty() {
        let channel = MessageChannel::new();
        assert_eq!(channel.get_timeout(Duration::from_millis(10)), None);
    }
}
