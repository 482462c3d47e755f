//! Periodic job runner.
//!
//! Each `Scheduler` owns its own task handle, so any number of them can
//! run side by side. Dropping a scheduler stops its task.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub struct Scheduler {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `job` every `every`, starting immediately. Returns `false` if
    /// this scheduler is already running.
    ///
    /// Ticks missed while a job is still running are skipped, so two runs
    /// of the same job never overlap.
    pub fn start<F, Fut>(&mut self, every: Duration, mut job: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_running() {
            warn!(scheduler = %self.name, "Scheduler already running");
            return false;
        }

        let name = self.name.clone();
        self.handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                debug!(scheduler = %name, "Tick");
                job().await;
            }
        }));

        info!(scheduler = %self.name, every_ms = every.as_millis() as u64, "Scheduler started");
        true
    }

    /// Abort the running task. Returns whether one was running.
    pub fn stop(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                let was_running = !handle.is_finished();
                handle.abort();
                info!(scheduler = %self.name, "Scheduler stopped");
                was_running
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
