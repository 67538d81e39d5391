use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use slotcap_core::{DateCapacity, OverrideCalendar, SlotLimit};
use tokio::sync::Mutex;

use crate::{DateCapacityStore, StoreError, TemplateStore};

/// In-process store used by tests and dry runs.
///
/// Supports failure injection: reads can be made to fail, and date writes can
/// be given a budget after which every further date write fails.
#[derive(Debug, Default)]
pub struct MemoryCapacityStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    template: BTreeMap<String, u32>,
    dates: BTreeSet<NaiveDate>,
    limits: BTreeMap<NaiveDate, BTreeMap<String, u32>>,
    mutations: usize,
    fail_reads: bool,
    date_write_budget: Option<usize>,
}

impl MemoryState {
    fn check_read(&self) -> Result<(), StoreError> {
        if self.fail_reads {
            return Err(StoreError::Unavailable("injected read failure".into()));
        }
        Ok(())
    }
}

impl MemoryCapacityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(limits: impl IntoIterator<Item = SlotLimit>) -> Self {
        let state = MemoryState {
            template: limits.into_iter().map(|l| (l.slot, l.limit)).collect(),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    /// Replace or add one template slot without counting it as a date mutation.
    pub async fn set_template_slot(&self, slot: &str, limit: u32) {
        self.state.lock().await.template.insert(slot.to_string(), limit);
    }

    /// Seed a date directly, bypassing failure injection and counters.
    pub async fn seed_date(&self, capacity: DateCapacity) {
        let mut state = self.state.lock().await;
        state.dates.insert(capacity.date);
        state.limits.entry(capacity.date).or_default().extend(capacity.slots);
    }

    pub async fn date_capacity(&self, date: NaiveDate) -> Option<BTreeMap<String, u32>> {
        self.state.lock().await.limits.get(&date).cloned()
    }

    pub async fn configured_dates(&self) -> Vec<NaiveDate> {
        let state = self.state.lock().await;
        state
            .limits
            .iter()
            .filter(|(_, slots)| !slots.is_empty())
            .map(|(date, _)| *date)
            .collect()
    }

    /// Number of write operations applied to date data so far.
    pub async fn mutation_count(&self) -> usize {
        self.state.lock().await.mutations
    }

    pub async fn fail_reads(&self, fail: bool) {
        self.state.lock().await.fail_reads = fail;
    }

    /// Allow `budget` more successful date writes, then fail each one after.
    pub async fn fail_date_writes_after(&self, budget: usize) {
        self.state.lock().await.date_write_budget = Some(budget);
    }

    pub async fn clear_failures(&self) {
        let mut state = self.state.lock().await;
        state.fail_reads = false;
        state.date_write_budget = None;
    }
}

#[async_trait]
impl TemplateStore for MemoryCapacityStore {
    async fn list_defaults(&self) -> Result<Vec<SlotLimit>, StoreError> {
        let state = self.state.lock().await;
        state.check_read()?;
        Ok(state
            .template
            .iter()
            .map(|(slot, limit)| SlotLimit::new(slot.clone(), *limit))
            .collect())
    }

    async fn insert_default(&self, limit: &SlotLimit) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.template.contains_key(&limit.slot) {
            return Err(StoreError::Conflict(limit.slot.clone()));
        }
        state.template.insert(limit.slot.clone(), limit.limit);
        Ok(())
    }

    async fn update_defaults(&self, limits: &BTreeMap<String, u32>) -> Result<Vec<String>, StoreError> {
        let mut state = self.state.lock().await;
        let mut missing = Vec::new();
        for (slot, limit) in limits {
            match state.template.get_mut(slot) {
                Some(current) => *current = *limit,
                None => missing.push(slot.clone()),
            }
        }
        Ok(missing)
    }
}

#[async_trait]
impl DateCapacityStore for MemoryCapacityStore {
    async fn list_overrides_from(&self, from: NaiveDate) -> Result<OverrideCalendar, StoreError> {
        let state = self.state.lock().await;
        state.check_read()?;
        let mut calendar = OverrideCalendar::new();
        for (date, slots) in state.limits.range(from..) {
            for (slot, limit) in slots {
                calendar.insert(*date, slot.clone(), *limit);
            }
        }
        Ok(calendar)
    }

    async fn date_exists(&self, date: NaiveDate) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        state.check_read()?;
        Ok(state.dates.contains(&date))
    }

    async fn create_date_if_absent(&self, date: NaiveDate) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.dates.insert(date) {
            state.mutations += 1;
        }
        Ok(())
    }

    async fn upsert_slot_limit(&self, date: NaiveDate, slot: &str, limit: u32) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.dates.contains(&date) {
            return Err(StoreError::Unavailable(format!("no date row for {date}")));
        }
        state.limits.entry(date).or_default().insert(slot.to_string(), limit);
        state.mutations += 1;
        Ok(())
    }

    async fn update_existing_slot_limit(
        &self,
        date: NaiveDate,
        slot: &str,
        limit: u32,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(current) = state.limits.get_mut(&date).and_then(|slots| slots.get_mut(slot)) else {
            return Ok(false);
        };
        *current = limit;
        state.mutations += 1;
        Ok(true)
    }

    async fn write_date_capacity(&self, capacity: &DateCapacity) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(remaining) = state.date_write_budget.as_mut() {
            if *remaining == 0 {
                return Err(StoreError::Unavailable(format!(
                    "injected write failure for {}",
                    capacity.date
                )));
            }
            *remaining -= 1;
        }
        state.dates.insert(capacity.date);
        let slots = state.limits.entry(capacity.date).or_default();
        for (slot, limit) in &capacity.slots {
            slots.insert(slot.clone(), *limit);
        }
        state.mutations += 1 + capacity.slots.len();
        Ok(())
    }
}
