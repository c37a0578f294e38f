//! Wall-clock limit for a single script run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Terminates V8 execution from a helper thread once `limit` elapses.
///
/// Dropping or disarming the watchdog before the deadline cancels it.
pub(crate) struct Watchdog {
    cancel: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    fired: Arc<AtomicBool>,
}

impl Watchdog {
    pub fn arm(isolate: v8::IsolateHandle, limit: Duration) -> Self {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();

        let thread = thread::Builder::new()
            .name("jshost-watchdog".to_string())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(limit) {
                    flag.store(true, Ordering::SeqCst);
                    isolate.terminate_execution();
                }
            });

        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!(error = %err, "failed to spawn watchdog, running without a time limit");
                None
            }
        };

        Self {
            cancel: Some(cancel),
            thread,
            fired,
        }
    }

    /// Stop the watchdog, returning whether it fired.
    pub fn disarm(mut self) -> bool {
        self.stop();
        self.fired.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {
        // disconnecting the channel wakes the helper immediately
        self.cancel.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("watchdog thread panicked");
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}
