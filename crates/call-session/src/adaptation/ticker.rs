//! Fixed-period adaptation clock

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::trace;

/// Background task that fires a callback every period for one generation
///
/// The task stops when the callback returns `false`, when [`cancel`] is
/// called, or when the ticker is dropped.
///
/// [`cancel`]: AdaptationTicker::cancel
pub struct AdaptationTicker {
    generation: u64,
    handle: JoinHandle<()>,
}

impl AdaptationTicker {
    /// Start ticking; the first tick fires one full period after start
    pub fn spawn<F>(generation: u64, period: Duration, mut on_tick: F) -> Self
    where
        F: FnMut(u64) -> bool + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                if !on_tick(generation) {
                    break;
                }
            }
            trace!("Adaptation ticker for generation {} stopped", generation);
        });

        Self { generation, handle }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for AdaptationTicker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
