//! PostgreSQL single-table "less-locking" backend.
//!
//! Both states share one table. The `ephemeral_id` column is the state
//! sentinel: `0` means Queued, any other value is the random claim token of
//! the consumer holding the message. A claim is a single conditional UPDATE,
//! so no row ever moves between tables:
//!
//! ```sql
//! UPDATE queue SET ephemeral_id = $token
//!  WHERE queue_id = (SELECT queue_id FROM queue WHERE ephemeral_id = 0
//!                     ORDER BY queue_id ASC LIMIT 1 FOR UPDATE SKIP LOCKED)
//!    AND ephemeral_id = 0;
//! SELECT ... FROM queue WHERE ephemeral_id = $token;
//! ```
//!
//! Schema:
//!
//! ```sql
//! CREATE TABLE queue (
//!     queue_id          BIGSERIAL PRIMARY KEY,
//!     msg_org_timestamp TIMESTAMPTZ NOT NULL,
//!     msg_timestamp     TIMESTAMPTZ NOT NULL,
//!     msg_num_requeues  INTEGER NOT NULL DEFAULT 0,
//!     msg_content       BYTEA NOT NULL,
//!     msg_partition_key VARCHAR(255),
//!     ephemeral_id      BIGINT NOT NULL DEFAULT 0,
//!     queue_name        VARCHAR(255)           -- only when scoped by name
//! );
//! CREATE INDEX queue_ephemeral_idx ON queue (ephemeral_id, queue_id);
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::error::QueueError;
use super::message::Message;
use super::models::QueueConfig;
use super::sql::{requeues_column, validate_table_name, QueueRow, COLUMNS};
use super::storage::{QueueStorage, RequeueMode};

/// Sentinel value of `ephemeral_id` for Queued rows.
pub const QUEUED: i64 = 0;

struct Statements {
    insert: String,
    claim: String,
    select_claimed: String,
    claim_untracked: String,
    has_queued: String,
    delete: String,
    requeue_loud: String,
    requeue_silent: String,
    scan_orphans: String,
    count_queued: String,
    count_ephemeral: String,
}

impl Statements {
    fn render(table: &str, scoped: bool, fifo: bool) -> Self {
        let order = if fifo { " ORDER BY queue_id ASC" } else { "" };
        // Scope predicate bound as parameter $n
        let scope = |n: usize| {
            if scoped {
                format!(" AND queue_name = ${}", n)
            } else {
                String::new()
            }
        };
        let head = |n: usize| {
            format!(
                "SELECT queue_id FROM {table} WHERE ephemeral_id = {QUEUED}{}{order} \
                 LIMIT 1 FOR UPDATE SKIP LOCKED",
                scope(n)
            )
        };
        let (name_column, name_value) = if scoped {
            (", queue_name", ", $7")
        } else {
            ("", "")
        };

        Self {
            insert: format!(
                "INSERT INTO {table} ({COLUMNS}, ephemeral_id{name_column}) \
                 VALUES (COALESCE($1::int8, nextval(pg_get_serial_sequence('{table}', 'queue_id'))), \
                         $2::timestamptz, $3::timestamptz, $4::int4, $5::bytea, $6::varchar, \
                         {QUEUED}{name_value}) \
                 RETURNING queue_id"
            ),
            claim: format!(
                "UPDATE {table} SET ephemeral_id = $1 \
                 WHERE queue_id = ({}) AND ephemeral_id = {QUEUED}",
                head(2)
            ),
            select_claimed: format!(
                "SELECT {COLUMNS} FROM {table} WHERE ephemeral_id = $1{}",
                scope(2)
            ),
            claim_untracked: format!(
                "DELETE FROM {table} WHERE queue_id = ({}) RETURNING {COLUMNS}",
                head(1)
            ),
            has_queued: format!(
                "SELECT EXISTS (SELECT 1 FROM {table} WHERE ephemeral_id = {QUEUED}{})",
                scope(1)
            ),
            delete: format!(
                "DELETE FROM {table} WHERE queue_id = $1 AND ephemeral_id <> {QUEUED}{}",
                scope(2)
            ),
            requeue_loud: format!(
                "UPDATE {table} SET ephemeral_id = {QUEUED}, \
                 msg_num_requeues = msg_num_requeues + 1, \
                 msg_timestamp = GREATEST($2, msg_org_timestamp) \
                 WHERE queue_id = $1 AND ephemeral_id <> {QUEUED}{}",
                scope(3)
            ),
            requeue_silent: format!(
                "UPDATE {table} SET ephemeral_id = {QUEUED} \
                 WHERE queue_id = $1 AND ephemeral_id <> {QUEUED}{}",
                scope(2)
            ),
            scan_orphans: format!(
                "SELECT {COLUMNS} FROM {table} \
                 WHERE ephemeral_id <> {QUEUED} AND msg_timestamp < $1{} ORDER BY queue_id",
                scope(2)
            ),
            count_queued: format!(
                "SELECT COUNT(*) FROM {table} WHERE ephemeral_id = {QUEUED}{}",
                scope(1)
            ),
            count_ephemeral: format!(
                "SELECT COUNT(*) FROM {table} WHERE ephemeral_id <> {QUEUED}{}",
                scope(1)
            ),
        }
    }
}

/// Non-zero random claim token.
fn claim_token() -> i64 {
    loop {
        let token: i64 = rand::random();
        if token != QUEUED {
            return token;
        }
    }
}

/// Single-table PostgreSQL backend using a sentinel column.
pub struct PostgresLessLockingBackend {
    pool: PgPool,
    config: QueueConfig,
    table: String,
    /// `queue_name` value scoping every statement, when the table is shared
    scope: Option<String>,
    sql: Statements,
}

impl PostgresLessLockingBackend {
    /// Create a backend over `table`.
    ///
    /// With `scope_by_name` every statement is restricted to rows whose
    /// `queue_name` equals the configured queue name.
    pub fn new(
        config: QueueConfig,
        pool: PgPool,
        table: impl Into<String>,
        scope_by_name: bool,
    ) -> Result<Self, QueueError> {
        let table = table.into();
        validate_table_name(&table)?;

        let scope = scope_by_name.then(|| config.name.clone());
        let sql = Statements::render(&table, scope.is_some(), config.fifo);

        Ok(Self {
            pool,
            config,
            table,
            scope,
            sql,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    async fn count(&self, statement: &str) -> Result<usize, QueueError> {
        let mut query = sqlx::query_scalar::<_, i64>(statement);
        if let Some(name) = &self.scope {
            query = query.bind(name);
        }
        let count = query.fetch_one(&self.pool).await?;
        Ok(count.max(0) as usize)
    }

    async fn empty_or_conflict(&self) -> Result<Option<Message<i64>>, QueueError> {
        let mut query = sqlx::query_scalar::<_, bool>(&self.sql.has_queued);
        if let Some(name) = &self.scope {
            query = query.bind(name);
        }

        if query.fetch_one(&self.pool).await? {
            Err(QueueError::Conflict(format!(
                "claim on {} lost to a concurrent consumer",
                self.table
            )))
        } else {
            Ok(None)
        }
    }

    async fn claim_tracked(&self) -> Result<Option<Message<i64>>, QueueError> {
        if let Some(capacity) = self.config.ephemeral_max_size {
            if self.count(&self.sql.count_ephemeral).await? >= capacity {
                return Err(QueueError::EphemeralFull {
                    queue: self.config.name.clone(),
                    capacity,
                });
            }
        }

        let token = claim_token();

        let mut claim = sqlx::query(&self.sql.claim).bind(token);
        if let Some(name) = &self.scope {
            claim = claim.bind(name);
        }
        let affected = claim.execute(&self.pool).await?.rows_affected();

        if affected == 0 {
            return self.empty_or_conflict().await;
        }

        let mut select = sqlx::query_as::<_, QueueRow>(&self.sql.select_claimed).bind(token);
        if let Some(name) = &self.scope {
            select = select.bind(name);
        }

        match select.fetch_optional(&self.pool).await? {
            Some(row) => {
                tracing::trace!(
                    queue = %self.config.name,
                    message_id = row.queue_id,
                    token,
                    "Message claimed"
                );
                Ok(Some(row.into()))
            }
            // Finished or requeued by someone else between the two statements
            None => Err(QueueError::Conflict(format!(
                "claimed row in {} changed before it could be read",
                self.table
            ))),
        }
    }

    async fn claim_untracked(&self) -> Result<Option<Message<i64>>, QueueError> {
        let mut query = sqlx::query_as::<_, QueueRow>(&self.sql.claim_untracked);
        if let Some(name) = &self.scope {
            query = query.bind(name);
        }

        match query.fetch_optional(&self.pool).await? {
            Some(row) => Ok(Some(row.into())),
            None => self.empty_or_conflict().await,
        }
    }
}

#[async_trait]
impl QueueStorage<i64> for PostgresLessLockingBackend {
    fn backend_type(&self) -> &'static str {
        "postgres_less_locking"
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

        let mut query = sqlx::query_scalar::<_, i64>(&self.sql.insert)
            .bind(msg.id)
            .bind(msg.original_timestamp)
            .bind(msg.queue_timestamp)
            .bind(requeues_column(msg.num_requeues))
            .bind(&msg.payload)
            .bind(&msg.partition_key);
        if let Some(name) = &self.scope {
            query = query.bind(name);
        }

        Ok(query.fetch_one(&self.pool).await?)
    }

    async fn claim_one(&self) -> Result<Option<Message<i64>>, QueueError> {
        if self.config.ephemeral_enabled {
            self.claim_tracked().await
        } else {
            self.claim_untracked().await
        }
    }

    async fn delete(&self, id: &i64) -> Result<bool, QueueError> {
        let mut query = sqlx::query(&self.sql.delete).bind(id);
        if let Some(name) = &self.scope {
            query = query.bind(name);
        }
        Ok(query.execute(&self.pool).await?.rows_affected() > 0)
    }

    async fn release(
        &self,
        msg: &Message<i64>,
        mode: RequeueMode,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let id = msg.id.ok_or(QueueError::MissingId)?;

        let mut query = match mode {
            RequeueMode::Loud => sqlx::query(&self.sql.requeue_loud).bind(id).bind(now),
            RequeueMode::Silent => sqlx::query(&self.sql.requeue_silent).bind(id),
        };
        if let Some(name) = &self.scope {
            query = query.bind(name);
        }

        Ok(query.execute(&self.pool).await?.rows_affected() > 0)
    }

    async fn scan_orphans(&self, cutoff: DateTime<Utc>) -> Result<Vec<Message<i64>>, QueueError> {
        let mut query = sqlx::query_as::<_, QueueRow>(&self.sql.scan_orphans).bind(cutoff);
        if let Some(name) = &self.scope {
            query = query.bind(name);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Message::from).collect())
    }

    async fn queue_size(&self) -> Result<Option<usize>, QueueError> {
        self.count(&self.sql.count_queued).await.map(Some)
    }

    async fn ephemeral_size(&self) -> Result<Option<usize>, QueueError> {
        self.count(&self.sql.count_ephemeral).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_token_is_never_queued() {
        for _ in 0..1000 {
            assert_ne!(claim_token(), QUEUED);
        }
    }

    #[test]
    fn test_statements_unscoped() {
        let sql = Statements::render("jobs", false, true);

        assert!(sql.claim.starts_with("UPDATE jobs SET ephemeral_id = $1"));
        assert!(sql.claim.contains("WHERE ephemeral_id = 0 ORDER BY queue_id ASC"));
        assert!(sql.claim.contains("FOR UPDATE SKIP LOCKED"));
        assert!(sql.claim.ends_with("AND ephemeral_id = 0"));
        assert!(!sql.claim.contains("queue_name"));
        assert!(!sql.insert.contains("queue_name"));
        assert!(sql.requeue_silent.contains("ephemeral_id <> 0"));
        assert!(!sql.requeue_silent.contains("msg_num_requeues"));
        assert!(sql.requeue_loud.contains("msg_num_requeues = msg_num_requeues + 1"));
    }

    #[test]
    fn test_statements_scoped() {
        let sql = Statements::render("shared", true, false);

        assert!(sql.claim.contains("AND queue_name = $2"));
        assert!(!sql.claim.contains("ORDER BY"));
        assert!(sql.select_claimed.ends_with("AND queue_name = $2"));
        assert!(sql.insert.contains(", queue_name)"));
        assert!(sql.insert.contains(", $7)"));
        assert!(sql.requeue_loud.ends_with("AND queue_name = $3"));
        assert!(sql.count_queued.ends_with("AND queue_name = $1"));
        assert!(sql.scan_orphans.contains("AND queue_name = $2 ORDER BY queue_id"));
    }
}
