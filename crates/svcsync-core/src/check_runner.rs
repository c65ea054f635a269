//! Delegated-check execution
//!
//! A [`CheckRunner`] owns the execution of one delegated check: it runs the
//! probe on the check's own cadence and pushes each result to the agent's
//! TTL endpoint. Runners are created (unstarted) when `set_services`
//! encounters a delegated check, started when the sync driver first
//! presents the check to the agent, and stopped when the check is
//! deregistered or the engine shuts down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::availability::Availability;
use crate::traits::{CatalogAgent, Check, TtlStatus};

/// Owned execution context for one delegated check
pub struct CheckRunner {
    check: Arc<dyn Check>,
    agent: Arc<dyn CatalogAgent>,
    availability: Arc<Availability>,
    started: AtomicBool,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CheckRunner {
    pub(crate) fn new(
        check: Arc<dyn Check>,
        agent: Arc<dyn CatalogAgent>,
        availability: Arc<Availability>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            check,
            agent,
            availability,
            started: AtomicBool::new(false),
            stop_tx,
            stop_rx,
            task: Mutex::new(None),
        }
    }

    /// Begin running the check on its cadence. Idempotent; a stopped runner
    /// stays stopped.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if *self.stop_rx.borrow() {
            return;
        }

        let check = Arc::clone(&self.check);
        let agent = Arc::clone(&self.agent);
        let availability = Arc::clone(&self.availability);
        let mut stop_rx = self.stop_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        debug!(check_id = %check.id(), "check runner stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        run_once(&*check, &*agent, &availability).await;
                    }
                }
            }
        });

        *self.task.lock().unwrap() = Some(handle);
    }

    /// Stop the runner. The cooperative signal ends the loop; the abort
    /// covers a probe still in flight.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Whether `stop` has been called
    pub fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }
}

/// Execute the probe once and report the translated result
async fn run_once(check: &dyn Check, agent: &dyn CatalogAgent, availability: &Availability) {
    let (status, output) = match check.run().await {
        Ok(result) => {
            if result.duration >= check.timeout() {
                debug!(
                    check_id = %check.id(),
                    duration_ms = result.duration.as_millis() as u64,
                    timeout_ms = check.timeout().as_millis() as u64,
                    "check run exceeded its timeout"
                );
            }
            let status = match result.exit_code {
                0 => TtlStatus::Passing,
                1 => TtlStatus::Warning,
                _ => TtlStatus::Critical,
            };
            (status, result.output)
        }
        Err(err) => (TtlStatus::Critical, err.to_string()),
    };

    if let Err(err) = agent
        .update_ttl(check.id().as_str(), &output, status)
        .await
    {
        if availability.mark(false) {
            warn!(
                check_id = %check.id(),
                error = %err,
                "ttl update failed, agent unreachable"
            );
        }
    }
}

impl Drop for CheckRunner {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}
