//! Stall detection over the agent's progress events.
//!
//! The stdout reader calls [`ProgressHandle::mark`] for every progress event.
//! [`StallDetector`] resolves once no mark arrived within the window, then stays
//! quiet until progress resumes, so one stall episode fires exactly once.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Writer side, held by the stream reader. Dropping it ends detection.
#[derive(Debug)]
pub struct ProgressHandle {
    tx: watch::Sender<u64>,
}

impl ProgressHandle {
    pub fn mark(&self) {
        self.tx.send_modify(|count| *count += 1);
    }
}

#[derive(Debug)]
pub struct StallDetector {
    rx: watch::Receiver<u64>,
    window: Duration,
    stalled: bool,
}

pub fn stall_channel(window: Duration) -> (ProgressHandle, StallDetector) {
    let (tx, rx) = watch::channel(0);
    (
        ProgressHandle { tx },
        StallDetector {
            rx,
            window,
            stalled: false,
        },
    )
}

impl StallDetector {
    /// Wait for the next stall episode.
    ///
    /// Returns `false` when the progress handle is dropped before a stall.
    pub async fn next_stall(&mut self) -> bool {
        if self.stalled {
            if self.rx.changed().await.is_err() {
                return false;
            }
            debug!("progress resumed after stall");
            self.stalled = false;
        }
        loop {
            tokio::select! {
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                () = sleep(self.window) => {
                    warn!(window_secs = self.window.as_secs(), "no progress within stall window");
                    self.stalled = true;
                    return true;
                }
            }
        }
    }
}
