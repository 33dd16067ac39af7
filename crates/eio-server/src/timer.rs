//! Cancellable timers that report back into a session inbox.
//!
//! Each arm bumps a generation counter. A timer that fires after being
//! re-armed or cancelled carries a stale generation, and [`Timer::is_current`]
//! rejects it.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::session::SessionEvent;

/// One re-armable timer slot.
#[derive(Debug, Default)]
pub(crate) struct Timer {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl Timer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Post `event(generation)` once, after `after`. Replaces any armed timer.
    pub(crate) fn arm<F>(&mut self, after: Duration, inbox: &mpsc::UnboundedSender<SessionEvent>, event: F)
    where
        F: FnOnce(u64) -> SessionEvent + Send + 'static,
    {
        self.cancel();
        let generation = self.generation;
        let inbox = inbox.clone();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = inbox.send(event(generation));
        }));
    }

    /// Post `event(generation)` every `period` until cancelled.
    pub(crate) fn arm_interval<F>(
        &mut self,
        period: Duration,
        inbox: &mpsc::UnboundedSender<SessionEvent>,
        event: F,
    ) where
        F: Fn(u64) -> SessionEvent + Send + 'static,
    {
        self.cancel();
        let generation = self.generation;
        let inbox = inbox.clone();
        self.task = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                let _ = ticks.tick().await;
                if inbox.send(event(generation)).is_err() {
                    break;
                }
            }
        }));
    }

    /// Stop the timer. Anything it already posted becomes stale.
    pub(crate) fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.generation = self.generation.wrapping_add(1);
    }

    /// Whether an event stamped `generation` came from the armed timer.
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.task.is_some() && generation == self.generation
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
