use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{error, info};
use webhook_gate_core::{Clock, DEFAULT_SWEEP_INTERVAL};

use crate::idempotency::{BackendError, IdempotencyBackend};

/// Background worker that deletes expired idempotency records.
#[derive(Clone)]
pub struct IdempotencySweeper {
    backend: IdempotencyBackend,
    clock: Clock,
    interval: Duration,
}

impl IdempotencySweeper {
    /// Creates a sweeper with the wall clock and the given cadence.
    pub fn new(backend: IdempotencyBackend, interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            DEFAULT_SWEEP_INTERVAL
        } else {
            interval
        };
        Self {
            backend,
            clock: Arc::new(Utc::now),
            interval,
        }
    }

    /// Overrides the clock used for determining expiry.
    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Runs the sweep loop in the background until the handle is stopped.
    pub fn start(self) -> SweeperHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            self.run_loop(shutdown_rx).await;
        });
        SweeperHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    async fn run_loop(self, mut shutdown: oneshot::Receiver<()>) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            stage = "sweeper",
            backend = self.backend.label(),
            interval_ms = self.interval.as_millis() as u64,
            "idempotency sweeper started"
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once().await {
                        error!(stage = "sweeper", error = %err, "idempotency sweep failed");
                    }
                }
            }
        }
        info!(stage = "sweeper", "idempotency sweeper stopped");
    }

    /// Executes one sweep and returns the number of deleted records.
    pub async fn run_once(&self) -> Result<u64, BackendError> {
        let now: DateTime<Utc> = (self.clock)();
        let label = self.backend.label();
        let deleted = self.backend.sweep(now).await?;
        counter!("idempotency_swept_total", "backend" => label).increment(deleted);

        let remaining = self.backend.len().await?;
        gauge!("idempotency_records", "backend" => label).set(remaining as f64);

        info!(
            stage = "sweeper",
            backend = label,
            deleted,
            remaining,
            now = %now.to_rfc3339(),
            "idempotency sweep completed"
        );
        Ok(deleted)
    }
}

/// Handle to a running sweeper.
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signals the loop to exit and waits for it.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(err) = (&mut self.task).await {
            error!(stage = "sweeper", error = %err, "sweeper task ended abnormally");
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if self.shutdown.is_some() {
            self.task.abort();
        }
    }
}
