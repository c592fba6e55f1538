//! PostgreSQL two-table backend.
//!
//! Queued messages live in the queue table, Taken messages in an ephemeral
//! table with the same schema. A claim moves the head row from one table to
//! the other inside a single transaction:
//!
//! ```text
//! SELECT ... FROM queue [ORDER BY queue_id] LIMIT 1 FOR UPDATE SKIP LOCKED
//! DELETE FROM queue WHERE queue_id = $1          -- 0 rows: lost race
//! INSERT INTO queue_ephemeral (...) VALUES (...)
//! ```
//!
//! Schema (both tables):
//!
//! ```sql
//! CREATE TABLE queue (
//!     queue_id          BIGSERIAL PRIMARY KEY,
//!     msg_org_timestamp TIMESTAMPTZ NOT NULL,
//!     msg_timestamp     TIMESTAMPTZ NOT NULL,
//!     msg_num_requeues  INTEGER NOT NULL DEFAULT 0,
//!     msg_content       BYTEA NOT NULL,
//!     msg_partition_key VARCHAR(255)
//! );
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::error::QueueError;
use super::message::Message;
use super::models::QueueConfig;
use super::sql::{requeues_column, validate_table_name, QueueRow, COLUMNS};
use super::storage::{QueueStorage, RequeueMode};

/// Statements rendered once for the configured table names.
struct Statements {
    insert: String,
    reinsert: String,
    select_head: String,
    delete_queued: String,
    insert_ephemeral: String,
    claim_untracked: String,
    has_queued: String,
    delete_ephemeral: String,
    release: String,
    scan_orphans: String,
    count_queued: String,
    count_ephemeral: String,
}

impl Statements {
    fn render(table: &str, ephemeral: &str, fifo: bool) -> Self {
        let order = if fifo { " ORDER BY queue_id ASC" } else { "" };
        let head = format!(
            "SELECT queue_id FROM {table}{order} LIMIT 1 FOR UPDATE SKIP LOCKED"
        );

        Self {
            insert: format!(
                "INSERT INTO {table} ({COLUMNS}) \
                 SELECT COALESCE($1::int8, nextval(pg_get_serial_sequence('{table}', 'queue_id'))), \
                        $2::timestamptz, $3::timestamptz, $4::int4, $5::bytea, $6::varchar \
                 WHERE NOT EXISTS (SELECT 1 FROM {ephemeral} WHERE queue_id = $1::int8) \
                 RETURNING queue_id"
            ),
            reinsert: format!("INSERT INTO {table} ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6)"),
            select_head: format!(
                "SELECT {COLUMNS} FROM {table}{order} LIMIT 1 FOR UPDATE SKIP LOCKED"
            ),
            delete_queued: format!("DELETE FROM {table} WHERE queue_id = $1"),
            insert_ephemeral: format!(
                "INSERT INTO {ephemeral} ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6)"
            ),
            claim_untracked: format!(
                "DELETE FROM {table} WHERE queue_id = ({head}) RETURNING {COLUMNS}"
            ),
            has_queued: format!("SELECT EXISTS (SELECT 1 FROM {table})"),
            delete_ephemeral: format!("DELETE FROM {ephemeral} WHERE queue_id = $1"),
            release: format!(
                "DELETE FROM {ephemeral} WHERE queue_id = $1 RETURNING {COLUMNS}"
            ),
            scan_orphans: format!(
                "SELECT {COLUMNS} FROM {ephemeral} WHERE msg_timestamp < $1 ORDER BY queue_id"
            ),
            count_queued: format!("SELECT COUNT(*) FROM {table}"),
            count_ephemeral: format!("SELECT COUNT(*) FROM {ephemeral}"),
        }
    }
}

/// PostgreSQL backend with separate queue and ephemeral tables.
pub struct PostgresQueueBackend {
    pool: PgPool,
    config: QueueConfig,
    table: String,
    ephemeral_table: String,
    sql: Statements,
}

impl PostgresQueueBackend {
    /// Create a backend over `table` and `ephemeral_table`.
    pub fn new(
        config: QueueConfig,
        pool: PgPool,
        table: impl Into<String>,
        ephemeral_table: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let table = table.into();
        let ephemeral_table = ephemeral_table.into();
        validate_table_name(&table)?;
        validate_table_name(&ephemeral_table)?;
        if table == ephemeral_table {
            return Err(QueueError::InvalidConfig(
                "queue and ephemeral tables must differ".into(),
            ));
        }

        let sql = Statements::render(&table, &ephemeral_table, config.fifo);

        Ok(Self {
            pool,
            config,
            table,
            ephemeral_table,
            sql,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn ephemeral_table(&self) -> &str {
        &self.ephemeral_table
    }

    async fn count(&self, statement: &str) -> Result<usize, QueueError> {
        let count: i64 = sqlx::query_scalar(statement).fetch_one(&self.pool).await?;
        Ok(count.max(0) as usize)
    }

    async fn check_ephemeral_capacity(&self) -> Result<(), QueueError> {
        if let Some(capacity) = self.config.ephemeral_max_size {
            if self.count(&self.sql.count_ephemeral).await? >= capacity {
                return Err(QueueError::EphemeralFull {
                    queue: self.config.name.clone(),
                    capacity,
                });
            }
        }
        Ok(())
    }

    /// Nothing claimable: either empty, or every Queued row is locked by
    /// another claimant (a lost race the caller should retry).
    async fn empty_or_conflict(&self) -> Result<Option<Message<i64>>, QueueError> {
        let has_queued: bool = sqlx::query_scalar(&self.sql.has_queued)
            .fetch_one(&self.pool)
            .await?;
        if has_queued {
            Err(QueueError::Conflict(format!(
                "head of {} locked by another claimant",
                self.table
            )))
        } else {
            Ok(None)
        }
    }

    async fn claim_tracked(&self) -> Result<Option<Message<i64>>, QueueError> {
        self.check_ephemeral_capacity().await?;

        let mut tx = self.pool.begin().await?;

        let row: Option<QueueRow> = sqlx::query_as(&self.sql.select_head)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return self.empty_or_conflict().await;
        };

        let deleted = sqlx::query(&self.sql.delete_queued)
            .bind(row.queue_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if deleted == 0 {
            tx.rollback().await?;
            return Err(QueueError::Conflict(format!(
                "message {} vanished from {} during claim",
                row.queue_id, self.table
            )));
        }

        sqlx::query(&self.sql.insert_ephemeral)
            .bind(row.queue_id)
            .bind(row.msg_org_timestamp)
            .bind(row.msg_timestamp)
            .bind(row.msg_num_requeues)
            .bind(&row.msg_content)
            .bind(&row.msg_partition_key)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::trace!(
            queue = %self.config.name,
            message_id = row.queue_id,
            "Message moved to ephemeral table"
        );

        Ok(Some(row.into()))
    }

    async fn claim_untracked(&self) -> Result<Option<Message<i64>>, QueueError> {
        let row: Option<QueueRow> = sqlx::query_as(&self.sql.claim_untracked)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.into())),
            None => self.empty_or_conflict().await,
        }
    }
}

#[async_trait]
impl QueueStorage<i64> for PostgresQueueBackend {
    fn backend_type(&self) -> &'static str {
        "postgres"
    }

    fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn insert(&self, msg: &Message<i64>) -> Result<i64, QueueError> {
        if let Some(capacity) = self.config.max_size {
            if self.count(&self.sql.count_queued).await? >= capacity {
                return Err(QueueError::QueueFull {
                    queue: self.config.name.clone(),
                    capacity,
                });
            }
        }

        let id: Option<i64> = sqlx::query_scalar(&self.sql.insert)
            .bind(msg.id)
            .bind(msg.original_timestamp)
            .bind(msg.queue_timestamp)
            .bind(requeues_column(msg.num_requeues))
            .bind(&msg.payload)
            .bind(&msg.partition_key)
            .fetch_optional(&self.pool)
            .await?;

        // No row returned: the id is currently Taken
        id.ok_or_else(|| QueueError::DuplicateKey(msg.id_label()))
    }

    async fn claim_one(&self) -> Result<Option<Message<i64>>, QueueError> {
        if self.config.ephemeral_enabled {
            self.claim_tracked().await
        } else {
            self.claim_untracked().await
        }
    }

    async fn delete(&self, id: &i64) -> Result<bool, QueueError> {
        let result = sqlx::query(&self.sql.delete_ephemeral)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release(
        &self,
        msg: &Message<i64>,
        mode: RequeueMode,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let id = msg.id.ok_or(QueueError::MissingId)?;
        let mut tx = self.pool.begin().await?;

        let row: Option<QueueRow> = sqlx::query_as(&self.sql.release)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(false);
        };

        let stored: Message<i64> = row.into();
        let back = match mode {
            RequeueMode::Loud => stored.requeued_at(now),
            RequeueMode::Silent => stored,
        };

        sqlx::query(&self.sql.reinsert)
            .bind(id)
            .bind(back.original_timestamp)
            .bind(back.queue_timestamp)
            .bind(requeues_column(back.num_requeues))
            .bind(&back.payload)
            .bind(&back.partition_key)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn scan_orphans(&self, cutoff: DateTime<Utc>) -> Result<Vec<Message<i64>>, QueueError> {
        let rows: Vec<QueueRow> = sqlx::query_as(&self.sql.scan_orphans)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Message::from).collect())
    }

    async fn queue_size(&self) -> Result<Option<usize>, QueueError> {
        self.count(&self.sql.count_queued).await.map(Some)
    }

    async fn ephemeral_size(&self) -> Result<Option<usize>, QueueError> {
        self.count(&self.sql.count_ephemeral).await.map(Some)
    }
}
