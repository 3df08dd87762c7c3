//! Interval timers with explicit cancellable handles.
//!
//! Jobs fire first after one full period, like a classic interval timer.
//! Cancellation is cooperative: a job already running finishes, no further
//! tick fires afterwards.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

#[derive(Clone, Debug)]
pub struct TimerHandle {
    name: &'static str,
    cancel: Arc<watch::Sender<bool>>,
}

impl TimerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

#[derive(Default)]
pub struct Scheduler {
    timers: Mutex<Vec<(TimerHandle, JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` every `period` until the returned handle (or the whole
    /// scheduler) is cancelled.
    pub fn every<F, Fut>(&self, name: &'static str, period: Duration, mut job: F) -> TimerHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = watch::channel(false);
        let handle = TimerHandle {
            name,
            cancel: Arc::new(tx),
        };

        let join = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        job().await;
                    }
                }
            }
            debug!(timer = name, "timer stopped");
        });

        if let Ok(mut timers) = self.timers.lock() {
            timers.push((handle.clone(), join));
        }
        handle
    }

    /// Cancel every timer; returns how many were still live.
    pub fn cancel_all(&self) -> usize {
        let Ok(mut timers) = self.timers.lock() else {
            return 0;
        };
        let mut live = 0;
        for (handle, _) in timers.iter() {
            if !handle.is_cancelled() {
                live += 1;
            }
            handle.cancel();
        }
        timers.retain(|(_, join)| !join.is_finished());
        live
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
