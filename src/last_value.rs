//! Last-known-value cell for the watched sensor topic.
//!
//! The cell is split into a [`Recorder`] (the only writer, owned by the broker
//! adapter's event loop) and any number of [`LastValue`] read handles. The
//! payload lives in a `tokio::sync::watch` channel so a reader always sees a
//! whole string and every write bumps a version that readers can wait on.

use std::time::Duration;
use tokio::sync::watch;

/// Creates an empty cell and returns its writer and a read handle.
pub fn channel() -> (Recorder, LastValue) {
    let (tx, rx) = watch::channel(None);
    (Recorder { tx }, LastValue { rx })
}

/// Write half. Not `Clone`: there is exactly one writer per cell.
#[derive(Debug)]
pub struct Recorder {
    tx: watch::Sender<Option<String>>,
}

impl Recorder {
    /// Overwrites the stored payload and raises the arrival signal.
    ///
    /// Never blocks and succeeds whether or not anyone is reading.
    pub fn set(&self, payload: String) {
        self.tx.send_replace(Some(payload));
    }
}

/// Read half, cheap to clone.
#[derive(Debug, Clone)]
pub struct LastValue {
    rx: watch::Receiver<Option<String>>,
}

impl LastValue {
    /// Current payload, if one has ever arrived.
    pub fn snapshot(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Arms a fresh arrival signal for one wait cycle.
    ///
    /// Only writes made after this call raise the returned signal. Each caller
    /// gets its own signal, so overlapping waits never clear each other.
    pub fn reset_signal(&self) -> ArrivalSignal {
        let mut rx = self.rx.clone();
        rx.borrow_and_update();
        ArrivalSignal { rx }
    }
}

/// One caller's view of "a new value arrived since I armed this".
#[derive(Debug)]
pub struct ArrivalSignal {
    rx: watch::Receiver<Option<String>>,
}

impl ArrivalSignal {
    #[cfg(test)]
    pub fn is_raised(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    /// Suspends the calling task until the signal is raised or `timeout`
    /// elapses. Returns `true` when woken by an arrival.
    pub async fn wait(mut self, timeout: Duration) -> bool {
        let arrival = async {
            if self.rx.changed().await.is_err() {
                // writer is gone, nothing can arrive any more
                std::future::pending::<()>().await;
            }
        };
        tokio::time::timeout(timeout, arrival).await.is_ok()
    }
}
