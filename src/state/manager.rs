//! PostgreSQL state manager

use super::store::{StatusTransition, SwapStats, SwapStore, SwapUpdate};
use crate::config::DatabaseConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::swap::{Chain, Hashlock, Preimage, Swap, SwapStatus};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};

const SWAP_COLUMNS: &str = "id, direction, status, sender, recipient, from_token_address, \
     to_token_address, amount, evm_htlc_address, aptos_htlc_address, hashlock, preimage, \
     timelock, destination_timelock, error_message, timestamp, updated_at, completed_at, \
     cancelled_at";

/// State manager for PostgreSQL persistence
pub struct StateManager {
    pool: PgPool,
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> RelayerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swaps (
                id TEXT PRIMARY KEY,
                direction VARCHAR(20) NOT NULL,
                status VARCHAR(24) NOT NULL,
                sender TEXT NOT NULL,
                recipient TEXT NOT NULL,
                from_token_address TEXT NOT NULL,
                to_token_address TEXT NOT NULL,
                amount TEXT NOT NULL,
                evm_htlc_address TEXT UNIQUE,
                aptos_htlc_address TEXT UNIQUE,
                hashlock BYTEA NOT NULL UNIQUE,
                preimage BYTEA,
                timelock BIGINT NOT NULL,
                destination_timelock BIGINT NOT NULL,
                error_message TEXT,
                timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                completed_at TIMESTAMPTZ,
                cancelled_at TIMESTAMPTZ,
                CHECK (completed_at IS NULL OR cancelled_at IS NULL),
                CHECK (destination_timelock < timelock)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_swaps_status_timelock
            ON swaps (status, timelock)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swap_transitions (
                id BIGSERIAL PRIMARY KEY,
                swap_id TEXT NOT NULL REFERENCES swaps (id),
                from_status VARCHAR(24) NOT NULL,
                to_status VARCHAR(24) NOT NULL,
                details TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transitions_swap_id
            ON swap_transitions (swap_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS watcher_checkpoints (
                stream TEXT PRIMARY KEY,
                position BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    async fn fetch_one_where(
        &self,
        clause: &str,
        bind: impl AsRef<[u8]>,
        as_text: bool,
    ) -> RelayerResult<Option<Swap>> {
        let sql = format!("SELECT {} FROM swaps WHERE {} = $1", SWAP_COLUMNS, clause);
        let query = sqlx::query(&sql);
        let query = if as_text {
            query.bind(String::from_utf8_lossy(bind.as_ref()).into_owned())
        } else {
            query.bind(bind.as_ref().to_vec())
        };

        query
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row_to_swap(&row))
            .transpose()
    }

    async fn fetch_many(&self, sql: &str, binds: &[i64]) -> RelayerResult<Vec<Swap>> {
        let mut query = sqlx::query(sql);
        for b in binds {
            query = query.bind(*b);
        }
        query
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(row_to_swap)
            .collect()
    }
}

fn to_i64(value: u64, field: &str) -> RelayerResult<i64> {
    i64::try_from(value)
        .map_err(|_| RelayerError::Validation(format!("{} out of range: {}", field, value)))
}

fn parse_column<T, E: std::fmt::Display>(
    value: Result<T, E>,
    column: &str,
) -> RelayerResult<T> {
    value.map_err(|e| RelayerError::Internal(format!("corrupt column {}: {}", column, e)))
}

fn row_to_swap(row: &PgRow) -> RelayerResult<Swap> {
    let hashlock_bytes: Vec<u8> = row.try_get("hashlock")?;
    let hashlock_array: [u8; 32] = parse_column(
        hashlock_bytes.as_slice().try_into(),
        "hashlock",
    )?;
    let preimage: Option<Vec<u8>> = row.try_get("preimage")?;
    let preimage = preimage
        .map(|bytes| parse_column(Preimage::new(bytes), "preimage"))
        .transpose()?;

    Ok(Swap {
        id: row.try_get("id")?,
        direction: parse_column(row.try_get::<String, _>("direction")?.parse(), "direction")?,
        status: parse_column(row.try_get::<String, _>("status")?.parse(), "status")?,
        sender: row.try_get("sender")?,
        recipient: row.try_get("recipient")?,
        from_token_address: row.try_get("from_token_address")?,
        to_token_address: row.try_get("to_token_address")?,
        amount: parse_column(row.try_get::<String, _>("amount")?.parse(), "amount")?,
        evm_htlc_address: row.try_get("evm_htlc_address")?,
        aptos_htlc_address: row.try_get("aptos_htlc_address")?,
        hashlock: Hashlock::new(hashlock_array),
        preimage,
        timelock: row.try_get::<i64, _>("timelock")? as u64,
        destination_timelock: row.try_get::<i64, _>("destination_timelock")? as u64,
        error_message: row.try_get("error_message")?,
        timestamp: row.try_get("timestamp")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
        cancelled_at: row.try_get("cancelled_at")?,
    })
}

fn map_unique_violation(e: sqlx::Error, swap: &Swap) -> RelayerError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some("23505") {
            return RelayerError::Validation(format!(
                "swap {} conflicts with an existing swap (id or hashlock {})",
                swap.id, swap.hashlock
            ));
        }
    }
    RelayerError::Database(e)
}

#[async_trait]
impl SwapStore for StateManager {
    async fn insert_swap(&self, swap: &Swap) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO swaps
                (id, direction, status, sender, recipient, from_token_address,
                 to_token_address, amount, evm_htlc_address, aptos_htlc_address,
                 hashlock, preimage, timelock, destination_timelock, error_message,
                 timestamp, updated_at, completed_at, cancelled_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(&swap.id)
        .bind(swap.direction.as_str())
        .bind(swap.status.as_str())
        .bind(&swap.sender)
        .bind(&swap.recipient)
        .bind(&swap.from_token_address)
        .bind(&swap.to_token_address)
        .bind(swap.amount.as_str())
        .bind(&swap.evm_htlc_address)
        .bind(&swap.aptos_htlc_address)
        .bind(&swap.hashlock.as_bytes()[..])
        .bind(swap.preimage.as_ref().map(|p| p.as_bytes().to_vec()))
        .bind(to_i64(swap.timelock, "timelock")?)
        .bind(to_i64(swap.destination_timelock, "destination_timelock")?)
        .bind(&swap.error_message)
        .bind(swap.timestamp)
        .bind(swap.updated_at)
        .bind(swap.completed_at)
        .bind(swap.cancelled_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, swap))?;

        debug!("Stored swap {} ({})", swap.id, swap.direction.as_str());
        Ok(())
    }

    async fn get_swap(&self, id: &str) -> RelayerResult<Option<Swap>> {
        self.fetch_one_where("id", id, true).await
    }

    async fn find_by_htlc_address(
        &self,
        chain: Chain,
        address: &str,
    ) -> RelayerResult<Option<Swap>> {
        let column = match chain {
            Chain::Evm => "evm_htlc_address",
            Chain::Aptos => "aptos_htlc_address",
        };
        self.fetch_one_where(column, address, true).await
    }

    async fn find_by_hashlock(&self, hashlock: &Hashlock) -> RelayerResult<Option<Swap>> {
        self.fetch_one_where("hashlock", hashlock.as_bytes(), false).await
    }

    async fn find_expired_unresolved(&self, now: u64) -> RelayerResult<Vec<Swap>> {
        let sql = format!(
            "SELECT {} FROM swaps \
             WHERE status IN ('EVM_HTLC_CREATED', 'APTOS_HTLC_CREATED') AND timelock < $1 \
             ORDER BY timelock",
            SWAP_COLUMNS
        );
        self.fetch_many(&sql, &[to_i64(now, "now")?]).await
    }

    async fn find_by_status(&self, status: SwapStatus) -> RelayerResult<Vec<Swap>> {
        let sql = format!(
            "SELECT {} FROM swaps WHERE status = $1 ORDER BY timestamp",
            SWAP_COLUMNS
        );
        sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(row_to_swap)
            .collect()
    }

    async fn update_status(
        &self,
        id: &str,
        expected: SwapStatus,
        new: SwapStatus,
        update: SwapUpdate,
    ) -> RelayerResult<Option<Swap>> {
        let mut tx = self.pool.begin().await?;

        // Row lock makes the status check and the write one atomic step.
        let sql = format!("SELECT {} FROM swaps WHERE id = $1 FOR UPDATE", SWAP_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| RelayerError::SwapNotFound {
                swap_id: id.to_string(),
            })?;
        let current = row_to_swap(&row)?;

        if current.status != expected {
            debug!(
                "Swap {} is {} (expected {}); skipping write",
                id, current.status, expected
            );
            return Ok(None);
        }
        update.validate(&current, expected, new)?;

        let details = update.error_message.clone();
        let now: DateTime<Utc> = Utc::now();
        let mut swap = current;
        update.apply(&mut swap, new, now);

        sqlx::query(
            r#"
            UPDATE swaps
            SET status = $2, evm_htlc_address = $3, aptos_htlc_address = $4,
                preimage = $5, error_message = $6, completed_at = $7,
                cancelled_at = $8, updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(new.as_str())
        .bind(&swap.evm_htlc_address)
        .bind(&swap.aptos_htlc_address)
        .bind(swap.preimage.as_ref().map(|p| p.as_bytes().to_vec()))
        .bind(&swap.error_message)
        .bind(swap.completed_at)
        .bind(swap.cancelled_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if new != expected {
            sqlx::query(
                r#"
                INSERT INTO swap_transitions (swap_id, from_status, to_status, details, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(id)
            .bind(expected.as_str())
            .bind(new.as_str())
            .bind(details)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(Some(swap))
    }

    async fn get_transitions(&self, id: &str) -> RelayerResult<Vec<StatusTransition>> {
        let rows = sqlx::query(
            r#"
            SELECT from_status, to_status, details, created_at
            FROM swap_transitions
            WHERE swap_id = $1
            ORDER BY id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(StatusTransition {
                    from_status: parse_column(
                        row.try_get::<String, _>("from_status")?.parse(),
                        "from_status",
                    )?,
                    to_status: parse_column(
                        row.try_get::<String, _>("to_status")?.parse(),
                        "to_status",
                    )?,
                    at: row.try_get("created_at")?,
                    details: row.try_get("details")?,
                })
            })
            .collect()
    }

    async fn list_swaps(&self, limit: usize) -> RelayerResult<Vec<Swap>> {
        let sql = format!(
            "SELECT {} FROM swaps ORDER BY timestamp DESC LIMIT $1",
            SWAP_COLUMNS
        );
        self.fetch_many(&sql, &[to_i64(limit as u64, "limit")?]).await
    }

    async fn get_stats(&self) -> RelayerResult<SwapStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM swaps GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = SwapStats::default();
        for row in rows {
            let status: SwapStatus =
                parse_column(row.try_get::<String, _>("status")?.parse(), "status")?;
            stats.record(status, row.try_get::<i64, _>("count")? as u64);
        }
        Ok(stats)
    }

    async fn get_checkpoint(&self, stream: &str) -> RelayerResult<Option<u64>> {
        let row = sqlx::query("SELECT position FROM watcher_checkpoints WHERE stream = $1")
            .bind(stream)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<i64, _>("position") as u64))
    }

    async fn save_checkpoint(&self, stream: &str, position: u64) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO watcher_checkpoints (stream, position, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (stream)
            DO UPDATE SET position = $2, updated_at = NOW()
            "#,
        )
        .bind(stream)
        .bind(to_i64(position, "position")?)
        .execute(&self.pool)
        .await?;

        debug!("Saved checkpoint for {}: {}", stream, position);
        Ok(())
    }

    async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
