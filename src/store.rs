use crate::error::AppError;

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use tracing::warn;

/// Disposition recorded when a contacted number is first inserted by the
/// coordinator; the agent pipeline upstream may overwrite it later.
pub const DEFAULT_DISPOSITION: &str = "no interesado";

/// A queued call target awaiting an outbound attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingNumber {
    pub name: String,
    pub phone_number: String,
}

/// Row for the contacted table, used by the manual registration endpoint.
#[derive(Debug, Clone)]
pub struct ContactedRecord {
    pub name: String,
    pub phone_number: String,
    pub disposition: String,
}

/// Narrow read/write contract the coordinator needs from the relational
/// store.  Behind a trait so the lifecycle state machine can be exercised
/// against an in-memory fake.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Single-row kill switch read before every origination.
    async fn bot_enabled(&self) -> Result<bool, AppError>;
    /// Oldest queued number, if any.  The number stays queued until its call
    /// attempt resolves.
    async fn next_pending(&self) -> Result<Option<PendingNumber>, AppError>;
    async fn delete_pending(&self, phone_number: &str) -> Result<(), AppError>;
    /// Insert a contacted row, or refresh its talk time when the number was
    /// already contacted on an earlier attempt.
    async fn upsert_contacted(
        &self,
        name: &str,
        phone_number: &str,
        talk_time: &str,
    ) -> Result<(), AppError>;
    /// Duplicate inserts are ignored; an unreachable number stays unreachable.
    async fn insert_unreachable(&self, phone_number: &str, name: &str) -> Result<(), AppError>;
    /// Manual insert from the registration endpoint.
    async fn register_contact(&self, record: &ContactedRecord) -> Result<(), AppError>;
}

pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueueStore for PgStore {
    async fn bot_enabled(&self) -> Result<bool, AppError> {
        let row = sqlx::query("select enabled from bot_status limit 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.try_get("enabled")?),
            None => {
                warn!("bot_status has no row; treating outbound calling as disabled");
                Ok(false)
            }
        }
    }

    async fn next_pending(&self) -> Result<Option<PendingNumber>, AppError> {
        let row = sqlx::query(
            "
            select name, phone_number
            from pending_numbers
            order by id asc
            limit 1
            ",
        )
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(PendingNumber {
                name: row.try_get("name")?,
                phone_number: row.try_get("phone_number")?,
            })),
            None => Ok(None),
        }
    }

    async fn delete_pending(&self, phone_number: &str) -> Result<(), AppError> {
        sqlx::query("delete from pending_numbers where phone_number = $1")
            .bind(phone_number)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_contacted(
        &self,
        name: &str,
        phone_number: &str,
        talk_time: &str,
    ) -> Result<(), AppError> {
        // Check-then-write in one transaction; the transaction rolls back on
        // drop if any statement fails.
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query("select 1 from contacted_numbers where phone_number = $1")
            .bind(phone_number)
            .fetch_optional(&mut *tx)
            .await?;
        if existing.is_some() {
            sqlx::query("update contacted_numbers set talk_time = $1 where phone_number = $2")
                .bind(talk_time)
                .bind(phone_number)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query(
                "
                insert into contacted_numbers (name, phone_number, disposition, talk_time)
                values ($1, $2, $3, $4)
                ",
            )
            .bind(name)
            .bind(phone_number)
            .bind(DEFAULT_DISPOSITION)
            .bind(talk_time)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_unreachable(&self, phone_number: &str, name: &str) -> Result<(), AppError> {
        sqlx::query(
            "
            insert into unreachable_numbers (phone_number, name)
            values ($1, $2)
            on conflict (phone_number) do nothing
            ",
        )
        .bind(phone_number)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn register_contact(&self, record: &ContactedRecord) -> Result<(), AppError> {
        sqlx::query(
            "
            insert into contacted_numbers (name, phone_number, disposition)
            values ($1, $2, $3)
            ",
        )
        .bind(&record.name)
        .bind(&record.phone_number)
        .bind(&record.disposition)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
