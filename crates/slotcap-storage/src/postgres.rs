use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use slotcap_core::{DateCapacity, OverrideCalendar, SlotLimit};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::{limit_from_db, limit_to_db, DateCapacityStore, StoreError, TemplateStore};

/// Postgres-backed template and date capacity store.
#[derive(Debug, Clone)]
pub struct PgCapacityStore {
    pool: PgPool,
}

impl PgCapacityStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl TemplateStore for PgCapacityStore {
    async fn list_defaults(&self) -> Result<Vec<SlotLimit>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT time_slot, limit_count
              FROM time_slot_limits
             ORDER BY time_slot
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let slot: String = row.try_get("time_slot")?;
            let limit = limit_from_db(&slot, row.try_get("limit_count")?)?;
            out.push(SlotLimit { slot, limit });
        }
        Ok(out)
    }

    async fn insert_default(&self, limit: &SlotLimit) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO time_slot_limits (time_slot, limit_count)
            VALUES ($1, $2)
            "#,
        )
        .bind(&limit.slot)
        .bind(limit_to_db(&limit.slot, limit.limit)?)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(StoreError::Conflict(limit.slot.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update_defaults(&self, limits: &BTreeMap<String, u32>) -> Result<Vec<String>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut missing = Vec::new();
        for (slot, limit) in limits {
            let result = sqlx::query(
                r#"
                UPDATE time_slot_limits
                   SET limit_count = $1
                 WHERE time_slot = $2
                "#,
            )
            .bind(limit_to_db(slot, *limit)?)
            .bind(slot)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                missing.push(slot.clone());
            }
        }
        tx.commit().await?;
        Ok(missing)
    }
}

#[async_trait]
impl DateCapacityStore for PgCapacityStore {
    async fn list_overrides_from(&self, from: NaiveDate) -> Result<OverrideCalendar, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT date, time_slot, limit_count
              FROM date_limits
             WHERE date >= $1
             ORDER BY date, time_slot
            "#,
        )
        .bind(from)
        .fetch_all(&self.pool)
        .await?;

        let mut calendar = OverrideCalendar::new();
        for row in rows {
            let date: NaiveDate = row.try_get("date")?;
            let slot: String = row.try_get("time_slot")?;
            let limit = limit_from_db(&slot, row.try_get("limit_count")?)?;
            calendar.insert(date, slot, limit);
        }
        Ok(calendar)
    }

    async fn date_exists(&self, date: NaiveDate) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM dates WHERE date = $1)")
            .bind(date)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn create_date_if_absent(&self, date: NaiveDate) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO dates (date) VALUES ($1) ON CONFLICT (date) DO NOTHING")
            .bind(date)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_slot_limit(&self, date: NaiveDate, slot: &str, limit: u32) -> Result<(), StoreError> {
        sqlx::query(UPSERT_DATE_LIMIT)
            .bind(date)
            .bind(slot)
            .bind(limit_to_db(slot, limit)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_existing_slot_limit(
        &self,
        date: NaiveDate,
        slot: &str,
        limit: u32,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE date_limits
               SET limit_count = $1
             WHERE date = $2
               AND time_slot = $3
            "#,
        )
        .bind(limit_to_db(slot, limit)?)
        .bind(date)
        .bind(slot)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn write_date_capacity(&self, capacity: &DateCapacity) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO dates (date) VALUES ($1) ON CONFLICT (date) DO NOTHING")
            .bind(capacity.date)
            .execute(&mut *tx)
            .await?;
        for (slot, limit) in &capacity.slots {
            sqlx::query(UPSERT_DATE_LIMIT)
                .bind(capacity.date)
                .bind(slot)
                .bind(limit_to_db(slot, *limit)?)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!(date = %capacity.date, slots = capacity.slots.len(), "date capacity committed");
        Ok(())
    }
}

const UPSERT_DATE_LIMIT: &str = r#"
    INSERT INTO date_limits (date, time_slot, limit_count)
    VALUES ($1, $2, $3)
    ON CONFLICT (date, time_slot) DO UPDATE SET limit_count = EXCLUDED.limit_count
"#;
