//! Persistence collaborators for the capacity template and per-date capacity.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use slotcap_core::{DateCapacity, OverrideCalendar, SlotLimit};
use thiserror::Error;

mod memory;
mod postgres;

pub use memory::MemoryCapacityStore;
pub use postgres::PgCapacityStore;

pub const CRATE_NAME: &str = "slotcap-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("time slot {0:?} already exists")]
    Conflict(String),
    #[error("stored value out of range: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Source of the global default slot limits.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn list_defaults(&self) -> Result<Vec<SlotLimit>, StoreError>;

    /// Fails with [`StoreError::Conflict`] when the slot already exists.
    async fn insert_default(&self, limit: &SlotLimit) -> Result<(), StoreError>;

    /// Update existing slots; returns the slot names that were not found.
    async fn update_defaults(&self, limits: &BTreeMap<String, u32>) -> Result<Vec<String>, StoreError>;
}

/// Realized per-date capacity rows.
#[async_trait]
pub trait DateCapacityStore: Send + Sync {
    /// Configured dates on or after `from`, grouped by month.
    async fn list_overrides_from(&self, from: NaiveDate) -> Result<OverrideCalendar, StoreError>;

    async fn date_exists(&self, date: NaiveDate) -> Result<bool, StoreError>;

    async fn create_date_if_absent(&self, date: NaiveDate) -> Result<(), StoreError>;

    async fn upsert_slot_limit(&self, date: NaiveDate, slot: &str, limit: u32) -> Result<(), StoreError>;

    /// Update a slot row only if it exists; returns whether a row changed.
    async fn update_existing_slot_limit(
        &self,
        date: NaiveDate,
        slot: &str,
        limit: u32,
    ) -> Result<bool, StoreError>;

    /// Ensure the date row, then upsert every slot of `capacity`.
    ///
    /// Implementations should apply this atomically where the backend allows it.
    async fn write_date_capacity(&self, capacity: &DateCapacity) -> Result<(), StoreError> {
        self.create_date_if_absent(capacity.date).await?;
        for (slot, limit) in &capacity.slots {
            self.upsert_slot_limit(capacity.date, slot, *limit).await?;
        }
        Ok(())
    }
}

pub(crate) fn limit_from_db(slot: &str, value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative limit {value} for slot {slot}")))
}

pub(crate) fn limit_to_db(slot: &str, value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Corrupt(format!("limit {value} for slot {slot} exceeds INTEGER")))
}
