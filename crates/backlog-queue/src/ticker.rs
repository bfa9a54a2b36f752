use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::runner::Runner;

/// In-process periodic trigger for [`Runner::sweep`].
///
/// Sweeps block (handlers and retry pauses run inline), so each one goes to
/// the blocking pool and the next tick waits for it to finish. Two sweeps
/// from the same ticker never overlap.
pub struct Ticker {
    runner: Arc<Runner>,
    every: Duration,
}

impl Ticker {
    pub fn new(runner: Arc<Runner>, every: Duration) -> Self {
        Self { runner, every }
    }

    /// Sweep every `every` until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(every_ms = self.every.as_millis() as u64, "queue ticker started");

        let mut interval = tokio::time::interval(self.every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let runner = Arc::clone(&self.runner);
                    match tokio::task::spawn_blocking(move || runner.sweep()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!("queue sweep error: {e}"),
                        Err(e) => error!("queue sweep task failed: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("queue ticker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
