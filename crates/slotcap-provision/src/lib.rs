//! Capacity auto-provisioning: the provisioning run and its background scheduler.

use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::Serialize;
use slotcap_core::{generate_window, reconcile, Action, CapacityTemplate, Period, PeriodError, ProvisioningWindow};
use slotcap_storage::{DateCapacityStore, StoreError, TemplateStore};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;

pub mod config;
pub mod scheduler;

pub use config::AppConfig;
pub use scheduler::{CapacityScheduler, RunOutcome, RunReport, SchedulerConfig, SchedulerError, SchedulerStatus};

pub const CRATE_NAME: &str = "slotcap-provision";

/// Period used by a manual trigger that names none.
pub const DEFAULT_TRIGGER_PERIOD: Period = Period::TwoMonths;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    InvalidPeriod(#[from] PeriodError),
    #[error("failed to read {what}: {source}")]
    StoreRead {
        what: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("failed to write capacity for {date}: {source}")]
    StoreWrite {
        date: NaiveDate,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionSummary {
    pub run_id: Uuid,
    pub period: Period,
    pub overwrite: bool,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub considered: usize,
    pub provisioned: usize,
    pub skipped: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Expands a window, reconciles each date against stored overrides and
/// writes template snapshots for the dates that need one.
///
/// Clones share one run lock, so manual and scheduled runs never overlap.
#[derive(Clone)]
pub struct Provisioner {
    templates: Arc<dyn TemplateStore>,
    dates: Arc<dyn DateCapacityStore>,
    run_lock: Arc<Mutex<()>>,
}

impl Provisioner {
    pub fn new(templates: Arc<dyn TemplateStore>, dates: Arc<dyn DateCapacityStore>) -> Self {
        Self {
            templates,
            dates,
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: TemplateStore + DateCapacityStore + 'static,
    {
        Self::new(store.clone(), store)
    }

    pub fn templates(&self) -> &Arc<dyn TemplateStore> {
        &self.templates
    }

    pub fn dates(&self) -> &Arc<dyn DateCapacityStore> {
        &self.dates
    }

    /// Manual trigger: a missing or blank period means [`DEFAULT_TRIGGER_PERIOD`].
    pub async fn trigger(&self, period: Option<&str>, overwrite: bool) -> Result<ProvisionSummary, ProvisionError> {
        match period.map(str::trim) {
            None | Some("") => self.run_period(DEFAULT_TRIGGER_PERIOD, overwrite, today()).await,
            Some(period) => self.run(period, overwrite).await,
        }
    }

    pub async fn run(&self, period: &str, overwrite: bool) -> Result<ProvisionSummary, ProvisionError> {
        let period: Period = period.parse()?;
        self.run_period(period, overwrite, today()).await
    }

    /// One provisioning run over `[today, today + period)`.
    ///
    /// Waits for any run already in progress. Dates are written one at a
    /// time in ascending order. A failed write stops the run; dates written
    /// before it stay committed.
    #[instrument(skip_all, fields(period = %period, overwrite = overwrite, today = %today))]
    pub async fn run_period(
        &self,
        period: Period,
        overwrite: bool,
        today: NaiveDate,
    ) -> Result<ProvisionSummary, ProvisionError> {
        let dates = generate_window(period.as_str(), today)?;
        let _running = self.run_lock.lock().await;
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let existing = self
            .dates
            .list_overrides_from(today)
            .await
            .map_err(|source| ProvisionError::StoreRead {
                what: "date overrides",
                source,
            })?;
        let template = CapacityTemplate::from_limits(self.templates.list_defaults().await.map_err(|source| {
            ProvisionError::StoreRead {
                what: "capacity template",
                source,
            }
        })?);

        let window = ProvisioningWindow::new(period, today, overwrite);
        info!(
            %run_id,
            window_start = %window.start,
            window_end = %window.end,
            window_days = window.day_count(),
            template_slots = template.len(),
            "provisioning run started"
        );

        let mut considered = 0usize;
        let mut provisioned = 0usize;
        let mut skipped = 0usize;
        for date in dates {
            considered += 1;
            match reconcile(date, &existing, &template, window.overwrite_existing) {
                Action::Skip => {
                    debug!(%date, "date already configured, skipping");
                    skipped += 1;
                }
                Action::WriteSnapshot(snapshot) => {
                    self.dates
                        .write_date_capacity(&snapshot)
                        .await
                        .map_err(|source| ProvisionError::StoreWrite { date, source })?;
                    debug!(%date, slots = snapshot.slots.len(), "date provisioned");
                    provisioned += 1;
                }
            }
        }

        let summary = ProvisionSummary {
            run_id,
            period,
            overwrite,
            window_start: window.start,
            window_end: window.end,
            considered,
            provisioned,
            skipped,
            started_at,
            finished_at: Utc::now(),
        };
        info!(%run_id, considered, provisioned, skipped, "provisioning run finished");
        Ok(summary)
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}
