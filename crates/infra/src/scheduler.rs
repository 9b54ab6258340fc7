//! Periodic trigger: starts runs on a fixed cadence and sweeps timeouts.
//!
//! - Schedule: one run per parameter every `schedule_interval` (first tick immediately)
//! - Skips a parameter while its previous run is still non-terminal
//! - Sweeps deadlines every `sweep_interval`
//! - Failures are logged, never propagated

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use batchflow_core::Parameter;

use crate::config::validate_schedule_hours;
use crate::orchestrator::{Orchestrator, OrchestratorError, sweep_period};

/// Render a schedule interval for humans ("daily", "every 6 hours", ...).
pub fn describe_schedule(hours: u64) -> Result<String, String> {
    let hours = validate_schedule_hours(hours)?;
    let text = match hours {
        1 => "hourly".to_string(),
        24 => "daily".to_string(),
        168 => "weekly".to_string(),
        h if h % 168 == 0 => format!("every {} weeks", h / 168),
        h if h % 24 == 0 => format!("every {} days", h / 24),
        h => format!("every {h} hours"),
    };
    Ok(text)
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    pub parameters: Vec<Parameter>,
    pub schedule_interval: Duration,
    pub sweep_interval: Duration,
}

/// Handle for the running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl Scheduler {
    pub fn spawn(self, orchestrator: Arc<Orchestrator>) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(scheduler_loop(self, orchestrator, shutdown_rx));
        SchedulerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

async fn scheduler_loop(
    cfg: Scheduler,
    orchestrator: Arc<Orchestrator>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let sweep_every = sweep_period(cfg.sweep_interval, orchestrator.budgets());
    info!(
        parameters = cfg.parameters.len(),
        schedule_secs = cfg.schedule_interval.as_secs(),
        sweep_ms = sweep_every.as_millis() as u64,
        "scheduler started"
    );

    let mut schedule = tokio::time::interval(cfg.schedule_interval.max(Duration::from_millis(1)));
    schedule.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sweep = tokio::time::interval(sweep_every);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            _ = schedule.tick() => {
                for parameter in &cfg.parameters {
                    trigger(&orchestrator, parameter.clone()).await;
                }
            }
            _ = sweep.tick() => {
                match orchestrator.sweep_timeouts(Utc::now()).await {
                    Ok(report) if !report.timed_out.is_empty() || !report.resumed.is_empty() => {
                        info!(
                            timed_out = report.timed_out.len(),
                            resumed = report.resumed.len(),
                            "timeout sweep"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "timeout sweep failed"),
                }
            }
        }
    }

    info!("scheduler stopped");
}

/// Start a run in the background unless one is already active.
async fn trigger(orchestrator: &Arc<Orchestrator>, parameter: Parameter) {
    match orchestrator.active_for(&parameter).await {
        Ok(Some(active)) => {
            debug!(parameter = %parameter, run_id = %active.run_id, "previous run still active; skipping");
            return;
        }
        Ok(None) => {}
        Err(e) => {
            warn!(parameter = %parameter, error = %e, "could not check for active run");
            return;
        }
    }

    let orchestrator = orchestrator.clone();
    tokio::spawn(async move {
        match orchestrator.start_run(parameter.clone()).await {
            Ok(_) => {}
            Err(OrchestratorError::RunAlreadyActive(_)) => {
                debug!(parameter = %parameter, "previous run still active; skipping");
            }
            Err(e) => error!(parameter = %parameter, error = %e, "scheduled run failed to start"),
        }
    });
}
