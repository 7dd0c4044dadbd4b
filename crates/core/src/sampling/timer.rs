use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, TrySendError};

use crate::{BeatlightError, Result};

const WORKER_POLL: Duration = Duration::from_millis(20);

/// Periodic tick source with a deferred worker.
///
/// The ticker stage only posts into a one-slot work queue with a
/// non-blocking send. A tick that finds the slot still occupied is
/// coalesced into the pending one, so a slow worker never backs up the
/// ticker. The worker stage runs the actual callback.
#[derive(Debug, Clone, Copy)]
pub struct PeriodicTimer {
    period: Duration,
}

impl PeriodicTimer {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Starts the ticker and worker threads. `work` runs once per
    /// delivered tick on the worker thread.
    pub fn start<F>(self, mut work: F) -> Result<TimerHandle>
    where
        F: FnMut() + Send + 'static,
    {
        if self.period.is_zero() {
            return Err(BeatlightError::InvalidInput("timer period must be non-zero"));
        }

        let running = Arc::new(AtomicBool::new(true));
        let coalesced = Arc::new(AtomicU64::new(0));
        let (work_tx, work_rx) = bounded::<()>(1);

        let worker = thread::Builder::new()
            .name("timer-work".into())
            .spawn(move || loop {
                match work_rx.recv_timeout(WORKER_POLL) {
                    Ok(()) => work(),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        let ticker = {
            let running = running.clone();
            let coalesced = coalesced.clone();
            let period = self.period;
            thread::Builder::new()
                .name("timer-tick".into())
                .spawn(move || {
                    let mut next = Instant::now();
                    while running.load(Ordering::Acquire) {
                        match work_tx.try_send(()) {
                            Ok(()) => {}
                            Err(TrySendError::Full(())) => {
                                coalesced.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(TrySendError::Disconnected(())) => break,
                        }
                        next += period;
                        let now = Instant::now();
                        if next > now {
                            thread::sleep(next - now);
                        } else {
                            // Fell behind; resynchronise instead of bursting.
                            next = now;
                        }
                    }
                    // Dropping the sender ends the worker loop.
                })?
        };

        Ok(TimerHandle {
            running,
            coalesced,
            ticker: Some(ticker),
            worker: Some(worker),
        })
    }
}

/// Owner of a running [`PeriodicTimer`]. Dropping it stops both threads.
pub struct TimerHandle {
    running: Arc<AtomicBool>,
    coalesced: Arc<AtomicU64>,
    ticker: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
}

impl TimerHandle {
    /// Ticks that were merged into an already pending work item.
    pub fn coalesced_ticks(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        for handle in [self.ticker.take(), self.worker.take()].into_iter().flatten() {
            if handle.join().is_err() {
                tracing::error!("timer thread panicked");
            }
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("coalesced", &self.coalesced_ticks())
            .finish()
    }
}
