//! Stream observer: a sink for live, user-visible text.
//!
//! Emission is best-effort. An observer must never block the producer: a
//! slow consumer loses fragments instead of stalling a turn.

use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Accepts UTF-8 text fragments for live display.
pub trait StreamObserver: Send + Sync {
    fn emit(&self, fragment: &str);
}

/// The absent observer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl StreamObserver for NoopObserver {
    fn emit(&self, _fragment: &str) {}
}

/// Forwards fragments over a bounded channel with `try_send`.
///
/// When the buffer is full or the receiver is gone the fragment is
/// dropped.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: mpsc::Sender<String>,
}

impl ChannelObserver {
    /// Create an observer and the receiving end for the display task.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl StreamObserver for ChannelObserver {
    fn emit(&self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        if self.sender.try_send(fragment.to_string()).is_err() {
            tracing::trace!(len = fragment.len(), "Observer busy or closed, fragment dropped");
        }
    }
}

/// Writes fragments to standard output as they arrive.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutObserver;

impl StreamObserver for StdoutObserver {
    fn emit(&self, fragment: &str) {
        let mut out = std::io::stdout().lock();
        if out.write_all(fragment.as_bytes()).and_then(|()| out.flush()).is_err() {
            tracing::trace!("stdout closed, fragment dropped");
        }
    }
}

/// Convenience for the common "no observer configured" case.
pub fn noop() -> Arc<dyn StreamObserver> {
    Arc::new(NoopObserver)
}
