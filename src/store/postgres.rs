use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, instrument};

use super::{ClaimRequest, CommandStore, ExpireRequest, HistoryEntry, Outcome};
use crate::domain::{Command, Dictionaries, Dictionary, NewCommand};
use crate::error::{RelayError, Result};

const SELECT_COMMAND: &str = r#"
    SELECT id, exchange_id, instrument, direction_id, order_type_id, limit_price, amount,
           status_id, connector_id, execution_type_id, execute_till, ref_position_id,
           time_in_force_id, update_timestamp, account_id, description, api_key, secret_key,
           result_order_id, fill_price, commission, commission_asset, fingerprint
    FROM execution
"#;

const RETURNING_COMMAND: &str = r#"
    RETURNING e.id, e.exchange_id, e.instrument, e.direction_id, e.order_type_id, e.limit_price,
              e.amount, e.status_id, e.connector_id, e.execution_type_id, e.execute_till,
              e.ref_position_id, e.time_in_force_id, e.update_timestamp, e.account_id,
              e.description, e.api_key, e.secret_key, e.result_order_id, e.fill_price,
              e.commission, e.commission_asset, e.fingerprint
"#;

const INSERT_HISTORY: &str = r#"
    INSERT INTO execution_history (execution_id, status_from_id, status_to_id, timestamp)
    VALUES ($1, $2, $3, $4)
"#;

const UNIQUE_VIOLATION: &str = "23505";

/// PostgreSQL command store
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect with a dedicated pool. Each coordinator activity owns its own
    /// store so a slow collector never starves claims.
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!(max_connections, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Load the six enumeration tables
    #[instrument(skip(self))]
    pub async fn load_dictionaries(&self) -> Result<Dictionaries> {
        let dictionaries = Dictionaries::new(
            self.load_dictionary("exchange").await?,
            self.load_dictionary("direction").await?,
            self.load_dictionary("order_type").await?,
            self.load_dictionary("time_in_force").await?,
            self.load_dictionary("execution_type").await?,
            self.load_dictionary("execution_status").await?,
        )?;

        info!("Dictionaries loaded");
        Ok(dictionaries)
    }

    async fn load_dictionary(&self, table: &'static str) -> Result<Dictionary> {
        let rows = sqlx::query(&format!("SELECT id, name FROM {} ORDER BY id", table))
            .fetch_all(&self.pool)
            .await?;

        let entries: Vec<(i16, String)> = rows
            .iter()
            .map(|r| (r.get("id"), r.get("name")))
            .collect();

        debug!(table, entries = entries.len(), "loaded dictionary");
        Ok(Dictionary::new(table, entries))
    }
}

fn command_from_row(r: &PgRow) -> Command {
    Command {
        id: r.get("id"),
        exchange_id: r.get("exchange_id"),
        instrument: r.get("instrument"),
        direction_id: r.get("direction_id"),
        order_type_id: r.get("order_type_id"),
        limit_price: r.get("limit_price"),
        amount: r.get("amount"),
        status_id: r.get("status_id"),
        connector_id: r.get("connector_id"),
        execution_type_id: r.get("execution_type_id"),
        execute_till: r.get("execute_till"),
        ref_position_id: r.get("ref_position_id"),
        time_in_force_id: r.get("time_in_force_id"),
        updated_at: r.get("update_timestamp"),
        account_id: r.get("account_id"),
        description: r.get("description"),
        api_key: r.get("api_key"),
        secret_key: r.get("secret_key"),
        result_order_id: r.get("result_order_id"),
        fill_price: r.get("fill_price"),
        commission: r.get("commission"),
        commission_asset: r.get("commission_asset"),
        fingerprint: r.get("fingerprint"),
    }
}

#[async_trait]
impl CommandStore for PostgresStore {
    #[instrument(skip(self))]
    async fn claim_for_execution(&self, request: &ClaimRequest) -> Result<Option<Command>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            WITH candidate AS (
                SELECT id FROM execution
                WHERE exchange_id = $1
                  AND status_id = $2
                  AND connector_id IS NULL
                  AND ($3::timestamptz IS NULL OR execute_till > $3)
                  AND ($4::timestamptz IS NULL OR update_timestamp <= $4)
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE execution e
            SET status_id = $5, connector_id = $6, update_timestamp = $7
            FROM candidate
            WHERE e.id = candidate.id
            {}
            "#,
            RETURNING_COMMAND
        );

        let row = sqlx::query(&sql)
            .bind(request.exchange_id)
            .bind(request.status_from)
            .bind(request.deadline_after)
            .bind(request.updated_before)
            .bind(request.status_to)
            .bind(request.connector_id)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let command = command_from_row(&row);

        sqlx::query(INSERT_HISTORY)
            .bind(command.id)
            .bind(request.status_from)
            .bind(request.status_to)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(command_id = command.id, "claimed command");
        Ok(Some(command))
    }

    #[instrument(skip(self))]
    async fn claim_batch_for_recovery(
        &self,
        exchange_id: i16,
        connector_id: i16,
        status_executing: i16,
        as_of: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Command>> {
        let sql = format!(
            r#"
            {}
            WHERE exchange_id = $1 AND connector_id = $2 AND status_id = $3
              AND update_timestamp <= $4
            ORDER BY id
            LIMIT $5
            "#,
            SELECT_COMMAND
        );

        let rows = sqlx::query(&sql)
            .bind(exchange_id)
            .bind(connector_id)
            .bind(status_executing)
            .bind(as_of)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(command_from_row).collect())
    }

    #[instrument(skip(self))]
    async fn load_by_id(&self, id: i64) -> Result<Option<Command>> {
        let sql = format!("{} WHERE id = $1", SELECT_COMMAND);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(command_from_row))
    }

    #[instrument(skip(self, command), fields(fingerprint = %command.fingerprint))]
    async fn insert(&self, command: &NewCommand, status_created: i16) -> Result<i64> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO execution (exchange_id, instrument, direction_id, order_type_id,
                limit_price, amount, status_id, execution_type_id, execute_till,
                ref_position_id, time_in_force_id, update_timestamp, account_id,
                api_key, secret_key, fingerprint)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING id
            "#,
        )
        .bind(command.exchange_id)
        .bind(&command.instrument)
        .bind(command.direction_id)
        .bind(command.order_type_id)
        .bind(command.limit_price)
        .bind(command.amount)
        .bind(status_created)
        .bind(command.execution_type_id)
        .bind(command.execute_till)
        .bind(&command.ref_position_id)
        .bind(command.time_in_force_id)
        .bind(now)
        .bind(command.account_id)
        .bind(&command.api_key)
        .bind(&command.secret_key)
        .bind(&command.fingerprint)
        .fetch_one(&mut *tx)
        .await;

        let id: i64 = match inserted {
            Ok(row) => row.get("id"),
            Err(sqlx::Error::Database(db))
                if db.code().as_deref() == Some(UNIQUE_VIOLATION) =>
            {
                return Err(RelayError::Validation(format!(
                    "fingerprint '{}' already used",
                    command.fingerprint
                )));
            }
            Err(e) => return Err(e.into()),
        };

        sqlx::query(INSERT_HISTORY)
            .bind(id)
            .bind(status_created)
            .bind(status_created)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(id)
    }

    #[instrument(skip(self, outcome), fields(command_id = outcome.command_id))]
    async fn record_outcome(&self, outcome: &Outcome) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let order = outcome.order.as_ref();

        let result = sqlx::query(
            r#"
            UPDATE execution
            SET status_id = $1,
                connector_id = NULL,
                update_timestamp = $2,
                description = $3,
                result_order_id = COALESCE($4, result_order_id),
                fill_price = COALESCE($5, fill_price),
                commission = COALESCE($6, commission),
                commission_asset = COALESCE($7, commission_asset)
            WHERE id = $8 AND status_id = $9
            "#,
        )
        .bind(outcome.status_to)
        .bind(outcome.timestamp)
        .bind(&outcome.description)
        .bind(order.map(|o| o.external_order_id.clone()))
        .bind(order.map(|o| o.price))
        .bind(order.map(|o| o.commission))
        .bind(order.and_then(|o| o.commission_asset.clone()))
        .bind(outcome.command_id)
        .bind(outcome.status_from)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            debug!("outcome already recorded");
            return Ok(false);
        }

        sqlx::query(INSERT_HISTORY)
            .bind(outcome.command_id)
            .bind(outcome.status_from)
            .bind(outcome.status_to)
            .bind(outcome.timestamp)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn expire_overdue(&self, request: &ExpireRequest) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            r#"
            WITH overdue AS (
                SELECT id, status_id FROM execution
                WHERE status_id = ANY($1)
                  AND connector_id IS NULL
                  AND execute_till <= $2
                ORDER BY id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            ), moved AS (
                UPDATE execution e
                SET status_id = $4,
                    update_timestamp = $2,
                    description = 'deadline passed before execution'
                FROM overdue
                WHERE e.id = overdue.id
                RETURNING e.id, overdue.status_id AS status_from
            )
            INSERT INTO execution_history (execution_id, status_from_id, status_to_id, timestamp)
            SELECT id, status_from, $4, $2 FROM moved
            RETURNING execution_id
            "#,
        )
        .bind(&request.status_from)
        .bind(request.now)
        .bind(request.limit)
        .bind(request.status_to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|r| r.get("execution_id")).collect())
    }

    #[instrument(skip(self))]
    async fn history(&self, id: i64) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT execution_id, status_from_id, status_to_id, timestamp
            FROM execution_history
            WHERE execution_id = $1
            ORDER BY id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| HistoryEntry {
                command_id: r.get("execution_id"),
                status_from: r.get("status_from_id"),
                status_to: r.get("status_to_id"),
                timestamp: r.get("timestamp"),
            })
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
