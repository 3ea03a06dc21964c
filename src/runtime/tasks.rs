//! Owned background task collection

use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error};

use crate::models::HubResult;

/// Named tokio tasks owned by one service.
///
/// Nothing spawned here outlives `shutdown()`.
#[derive(Default)]
pub struct BackgroundTasks {
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `tick` every `period`, first after one period has elapsed.
    ///
    /// Errors and panics are logged and the loop carries on with the next tick.
    pub fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = HubResult<()>> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                match AssertUnwindSafe(tick()).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(task = name, "Background tick failed: {}", e),
                    Err(_) => error!(task = name, "Background tick panicked"),
                }
            }
        });

        debug!(task = name, period = ?period, "Background task started");
        self.tasks.lock().push((name, handle));
    }

    /// Number of tasks still running
    pub fn active_count(&self) -> usize {
        self.tasks
            .lock()
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .count()
    }

    /// Cancel every task and wait for it to finish; repeated calls are no-ops
    pub async fn shutdown(&self) {
        let tasks: Vec<(&'static str, JoinHandle<()>)> = self.tasks.lock().drain(..).collect();

        for (_, handle) in &tasks {
            handle.abort();
        }
        for (name, handle) in tasks {
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => debug!(task = name, "Background task cancelled"),
                Err(e) => error!(task = name, "Background task failed: {}", e),
            }
        }
    }
}

impl std::fmt::Debug for BackgroundTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&'static str> = self.tasks.lock().iter().map(|(n, _)| *n).collect();
        f.debug_struct("BackgroundTasks").field("tasks", &names).finish()
    }
}
