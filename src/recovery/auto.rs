use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::handler::RecoveryHandler;

struct Running {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Background loop sweeping reachable nodes on a fixed interval.
pub struct AutoRecovery {
    handler: Arc<RecoveryHandler>,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl AutoRecovery {
    pub fn new(handler: Arc<RecoveryHandler>, interval: Duration) -> Self {
        Self {
            handler,
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Starts the loop. Returns false if it was already running.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            return false;
        }

        let (stop, mut stopped) = watch::channel(false);
        let handler = Arc::clone(&self.handler);
        let period = self.interval.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let reports = handler.recover_reachable().await;
                        for report in reports.iter().filter(|r| r.recovered > 0 || r.failed > 0) {
                            debug!(node = %report.node, recovered = report.recovered, failed = report.failed, "automatic recovery");
                        }
                    }
                }
            }
        });

        *running = Some(Running { stop, task });
        info!(interval_ms = period.as_millis() as u64, "automatic recovery started");
        true
    }

    /// Stops the loop and waits for an in-flight sweep to finish. Returns
    /// false if it was not running.
    pub async fn stop(&self) -> bool {
        let Some(Running { stop, task }) = self.running.lock().take() else {
            return false;
        };
        let _ = stop.send(true);
        if let Err(err) = task.await {
            warn!(error = %err, "automatic recovery task ended abnormally");
        }
        info!("automatic recovery stopped");
        true
    }
}
