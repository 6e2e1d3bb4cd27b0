//! Coalescing wakeup signals between producers and a single consumer loop.
//!
//! An [`Emitter`] is owned by a producer (a source cache, or the reconciler
//! itself). A [`Sink`] is owned by the consumer and may be connected to any
//! number of emitters. Every sink keeps a single pending-notification slot,
//! so a burst of emits between two waits results in exactly one wakeup.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Producer side of a signal.
#[derive(Clone, Default)]
pub struct Emitter {
    sinks: Arc<Mutex<Vec<Arc<Notify>>>>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every connected sink. Never blocks.
    pub fn emit(&self) {
        let sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        for notify in sinks.iter() {
            // notify_one stores at most one permit when nobody is waiting
            notify.notify_one();
        }
    }

    /// Emit once `delay` has elapsed, without blocking the caller.
    pub fn emit_after(&self, delay: Duration) {
        let emitter = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            emitter.emit();
        });
    }

    /// Number of sinks connected to this emitter.
    pub fn sink_count(&self) -> usize {
        self.sinks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn connect(&self, notify: Arc<Notify>) {
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notify);
    }
}

/// Consumer side of a signal.
#[derive(Clone, Default)]
pub struct Sink {
    notify: Arc<Notify>,
}

impl Sink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register this sink with an emitter. A sink can listen to many emitters.
    pub fn subscribe(&self, emitter: &Emitter) {
        emitter.connect(Arc::clone(&self.notify));
    }

    /// Wait for a pending emit, the timeout, or cancellation, whichever comes
    /// first. The caller is not told which one happened.
    pub async fn wait(&self, timeout: Duration, cancel: &CancellationToken) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(timeout) => {}
            _ = cancel.cancelled() => {}
        }
    }
}
