//! Cancellable background tasks
//!
//! A [`ScheduledTask`] runs a closure on a fixed interval until stopped.
//! Cancellation is only observed between ticks: a tick that has started
//! always runs to completion.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ScheduledTask {
    name: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Spawn `tick` every `period`
    ///
    /// With `immediate` the first tick runs right away, otherwise one period
    /// after spawning.
    pub fn spawn_interval<F, Fut>(name: &str, period: Duration, immediate: bool, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();
        let task_name = name.to_string();

        let handle = tokio::spawn(async move {
            let start = if immediate { Instant::now() } else { Instant::now() + period };
            let mut timer = interval_at(start, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = timer.tick() => {}
                }
                debug!("{}: tick", task_name);
                tick().await;
            }
            info!("{} stopped", task_name);
        });

        Self {
            name: name.to_string(),
            token,
            handle,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Cancel and wait for the task to finish
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!("{} ended abnormally: {}", self.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let task = ScheduledTask::spawn_interval("counter", Duration::from_secs(10), true, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(task.is_running());
        task.stop().await;

        // Ticks at 0s, 10s and 20s
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_start_skips_immediate_tick() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let task = ScheduledTask::spawn_interval("delayed", Duration::from_secs(10), false, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        task.stop().await;
    }
}
