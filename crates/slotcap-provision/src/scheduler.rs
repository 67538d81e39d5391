//! Background re-provisioning on a wall-clock anchor plus a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, Local, NaiveDateTime, NaiveTime, Utc};
use serde::Serialize;
use slotcap_core::Period;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{error, info, warn};

use crate::{ProvisionSummary, Provisioner};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler is already active")]
    AlreadyActive,
    #[error("scheduler is not active")]
    NotActive,
    #[error("job scheduler failure: {0}")]
    Backend(String),
}

fn backend(err: JobSchedulerError) -> SchedulerError {
    SchedulerError::Backend(format!("{err:?}"))
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Local wall-clock time of the first firing.
    pub anchor: NaiveTime,
    /// Gap between firings after the first one.
    pub interval: Duration,
    /// Window provisioned by every firing, always without overwrite.
    pub period: Period,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            anchor: NaiveTime::from_hms_opt(6, 0, 0).unwrap_or(NaiveTime::MIN),
            interval: Duration::from_secs(24 * 60 * 60),
            period: Period::OneMonth,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum RunOutcome {
    Succeeded { summary: ProvisionSummary },
    Failed { error: String },
}

/// Result of one background firing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    #[serde(rename = "schedulerActive")]
    pub active: bool,
    pub last_run: Option<RunReport>,
}

/// Delay from `now` to the next `anchor`. An anchor already passed today rolls to tomorrow.
pub fn delay_until_anchor(now: NaiveDateTime, anchor: NaiveTime) -> Duration {
    let today_anchor = now.date().and_time(anchor);
    let next = if now > today_anchor {
        today_anchor.checked_add_days(Days::new(1)).unwrap_or(today_anchor)
    } else {
        today_anchor
    };
    (next - now).to_std().unwrap_or_default()
}

/// Shared by every firing of one scheduler. Overlap is prevented by the provisioner's run lock.
struct Firing {
    provisioner: Provisioner,
    period: Period,
    last_run: Mutex<Option<RunReport>>,
}

impl Firing {
    async fn fire(&self) {
        let started_at = Utc::now();
        let today = Local::now().date_naive();
        let outcome = match self.provisioner.run_period(self.period, false, today).await {
            Ok(summary) => {
                info!(
                    run_id = %summary.run_id,
                    provisioned = summary.provisioned,
                    "scheduled provisioning run succeeded"
                );
                RunOutcome::Succeeded { summary }
            }
            Err(err) => {
                error!(error = %err, "scheduled provisioning run failed");
                RunOutcome::Failed {
                    error: err.to_string(),
                }
            }
        };
        *self.last_run.lock().await = Some(RunReport {
            started_at,
            finished_at: Utc::now(),
            outcome,
        });
    }
}

#[derive(Default)]
struct SchedulerState {
    jobs: Option<JobScheduler>,
}

/// Process-wide provisioning scheduler with start/stop/status.
///
/// Start and stop are serialized on one lock, so concurrent callers always
/// observe a clean `Inactive`/`Active` transition.
pub struct CapacityScheduler {
    config: SchedulerConfig,
    firing: Arc<Firing>,
    state: Mutex<SchedulerState>,
}

impl CapacityScheduler {
    pub fn new(provisioner: Provisioner, config: SchedulerConfig) -> Self {
        let firing = Arc::new(Firing {
            provisioner,
            period: config.period,
            last_run: Mutex::new(None),
        });
        Self {
            config,
            firing,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().await;
        if state.jobs.is_some() {
            warn!("start requested while scheduler is active");
            return Err(SchedulerError::AlreadyActive);
        }

        let delay = delay_until_anchor(Local::now().naive_local(), self.config.anchor);
        let jobs = JobScheduler::new().await.map_err(backend)?;

        let firing = self.firing.clone();
        let interval = self.config.interval;
        let first = Job::new_one_shot_async(delay, move |_uuid, jobs| {
            let firing = firing.clone();
            Box::pin(async move {
                firing.fire().await;
                if let Err(err) = arm_recurring(&jobs, firing, interval).await {
                    error!(error = ?err, "failed to arm recurring provisioning job");
                }
            })
        })
        .map_err(backend)?;
        jobs.add(first).await.map_err(backend)?;
        jobs.start().await.map_err(backend)?;

        info!(
            anchor = %self.config.anchor,
            first_fire_in_secs = delay.as_secs(),
            interval_secs = interval.as_secs(),
            period = %self.config.period,
            "capacity scheduler started"
        );
        state.jobs = Some(jobs);
        Ok(())
    }

    /// Cancel future firings. A run already executing is left to finish.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().await;
        let Some(mut jobs) = state.jobs.take() else {
            warn!("stop requested while scheduler is inactive");
            return Err(SchedulerError::NotActive);
        };
        if let Err(err) = jobs.shutdown().await {
            state.jobs = Some(jobs);
            return Err(backend(err));
        }
        info!("capacity scheduler stopped");
        Ok(())
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.jobs.is_some()
    }

    pub async fn status(&self) -> SchedulerStatus {
        let active = self.is_active().await;
        let last_run = self.firing.last_run.lock().await.clone();
        SchedulerStatus { active, last_run }
    }

    #[cfg(test)]
    async fn fire_now(&self) -> Option<RunReport> {
        self.firing.fire().await;
        self.firing.last_run.lock().await.clone()
    }
}

async fn arm_recurring(
    jobs: &JobScheduler,
    firing: Arc<Firing>,
    interval: Duration,
) -> Result<(), JobSchedulerError> {
    let job = Job::new_repeated_async(interval, move |_uuid, _jobs| {
        let firing = firing.clone();
        Box::pin(async move {
            firing.fire().await;
        })
    })?;
    jobs.add(job).await?;
    info!(interval_secs = interval.as_secs(), "recurring provisioning job armed");
    Ok(())
}
