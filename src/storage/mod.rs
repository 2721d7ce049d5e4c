use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use sqlx::{sqlite::SqlitePoolOptions, FromRow, Row, SqlitePool};
use tracing::warn;

use crate::alerts::AlertStates;
use crate::models::{
    Alert, AlertDirection, AlertNotification, AlertTransition, BlockMetrics, ChartPoint,
    GasStats, LargeTransfer, TransitionKind, WhaleSummary,
};

pub type DbPool = SqlitePool;

const DB_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Column names of `block_data`, in insert order. Other tooling reads this table
/// directly, so the names must not drift.
pub const BLOCK_DATA_COLUMNS: [&str; 17] = [
    "block_number",
    "block_hash",
    "timestamp",
    "base_fee_gwei",
    "gas_limit",
    "gas_used",
    "utilization_percent",
    "network_congestion",
    "network_trend",
    "avg_gas_price",
    "median_gas_price",
    "avg_priority_fee",
    "median_priority_fee",
    "total_transactions",
    "eip1559_transactions",
    "legacy_transactions",
    "total_value_transferred",
];

pub async fn init_pool(database_url: &str) -> Result<DbPool> {
    ensure_dir_exists(database_url)?;

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("failed to connect to SQLite")?;

    apply_schema(&pool).await?;
    Ok(pool)
}

fn ensure_dir_exists(database_url: &str) -> Result<()> {
    if let Some(path) = database_url.strip_prefix("sqlite://") {
        if path != ":memory:" {
            if let Some(dir) = Path::new(path).parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed creating db directory {:?}", dir))?;
            }
        }
    }
    Ok(())
}

async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS block_data (
            block_number INTEGER PRIMARY KEY,
            block_hash TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            base_fee_gwei REAL NOT NULL,
            gas_limit INTEGER NOT NULL,
            gas_used INTEGER NOT NULL,
            utilization_percent REAL NOT NULL,
            network_congestion TEXT NOT NULL,
            network_trend TEXT NOT NULL,
            avg_gas_price REAL NOT NULL,
            median_gas_price REAL NOT NULL,
            avg_priority_fee REAL NOT NULL,
            median_priority_fee REAL NOT NULL,
            total_transactions INTEGER NOT NULL,
            eip1559_transactions INTEGER NOT NULL,
            legacy_transactions INTEGER NOT NULL,
            total_value_transferred REAL NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_block_data_timestamp ON block_data(timestamp);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS gas_alerts (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(4)))),
            name TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            threshold REAL NOT NULL,
            type TEXT CHECK(type IN ('below', 'above')) NOT NULL,
            triggered INTEGER NOT NULL DEFAULT 0,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            last_triggered DATETIME
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alert_notifications (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(4)))),
            alert_id TEXT NOT NULL,
            message TEXT NOT NULL,
            timestamp DATETIME NOT NULL,
            read INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(alert_id) REFERENCES gas_alerts(id)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS whale_transfers (
            tx_hash TEXT PRIMARY KEY,
            block_number INTEGER NOT NULL,
            from_address TEXT NOT NULL,
            to_address TEXT,
            value_eth REAL NOT NULL,
            timestamp TEXT NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_whale_transfers_from ON whale_transfers(from_address);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    verify_block_data_columns(pool).await?;
    Ok(())
}

/// One `block_data` row, column for column.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct BlockDataRow {
    pub block_number: i64,
    pub block_hash: String,
    pub timestamp: String,
    pub base_fee_gwei: f64,
    pub gas_limit: i64,
    pub gas_used: i64,
    pub utilization_percent: f64,
    pub network_congestion: String,
    pub network_trend: String,
    pub avg_gas_price: f64,
    pub median_gas_price: f64,
    pub avg_priority_fee: f64,
    pub median_priority_fee: f64,
    pub total_transactions: i64,
    pub eip1559_transactions: i64,
    pub legacy_transactions: i64,
    pub total_value_transferred: f64,
}

impl From<&BlockMetrics> for BlockDataRow {
    fn from(m: &BlockMetrics) -> Self {
        let stats = &m.transaction_stats;
        let (avg_priority_fee, median_priority_fee) = stats
            .priority_fees_stats
            .as_ref()
            .map(|p| (p.avg_priority_fee, p.median_priority_fee))
            .unwrap_or((0.0, 0.0));

        Self {
            block_number: to_i64(m.number),
            block_hash: m.hash.clone(),
            timestamp: format_db_timestamp(&m.timestamp),
            base_fee_gwei: m.base_fee_gwei,
            gas_limit: to_i64(m.gas_limit),
            gas_used: to_i64(m.gas_used),
            utilization_percent: m.utilization_percent,
            network_congestion: m.network_status.congestion.as_str().to_string(),
            network_trend: m.network_status.trend.as_str().to_string(),
            avg_gas_price: stats.avg_gas_price,
            median_gas_price: stats.median_gas_price,
            avg_priority_fee,
            median_priority_fee,
            total_transactions: to_i64(stats.count),
            eip1559_transactions: to_i64(stats.types.eip1559),
            legacy_transactions: to_i64(stats.types.legacy),
            total_value_transferred: stats.total_value_transferred,
        }
    }
}

impl BlockDataRow {
    pub fn chart_point(&self) -> Option<ChartPoint> {
        Some(ChartPoint {
            time: parse_db_timestamp(&self.timestamp)?,
            price: self.base_fee_gwei,
            network_load: self.utilization_percent,
            transactions: self.total_transactions.max(0) as u64,
            value_transferred: self.total_value_transferred,
            block_number: self.block_number.max(0) as u64,
        })
    }
}

pub fn format_db_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(DB_TIMESTAMP_FORMAT).to_string()
}

pub fn parse_db_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, DB_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Returns `false` when the block number was already stored.
pub async fn insert_block_data(pool: &SqlitePool, metrics: &BlockMetrics) -> Result<bool> {
    let row = BlockDataRow::from(metrics);
    let result = sqlx::query(
        r#"
        INSERT INTO block_data (
            block_number, block_hash, timestamp, base_fee_gwei, gas_limit, gas_used,
            utilization_percent, network_congestion, network_trend, avg_gas_price,
            median_gas_price, avg_priority_fee, median_priority_fee, total_transactions,
            eip1559_transactions, legacy_transactions, total_value_transferred
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        ON CONFLICT(block_number) DO NOTHING;
        "#,
    )
    .bind(row.block_number)
    .bind(&row.block_hash)
    .bind(&row.timestamp)
    .bind(row.base_fee_gwei)
    .bind(row.gas_limit)
    .bind(row.gas_used)
    .bind(row.utilization_percent)
    .bind(&row.network_congestion)
    .bind(&row.network_trend)
    .bind(row.avg_gas_price)
    .bind(row.median_gas_price)
    .bind(row.avg_priority_fee)
    .bind(row.median_priority_fee)
    .bind(row.total_transactions)
    .bind(row.eip1559_transactions)
    .bind(row.legacy_transactions)
    .bind(row.total_value_transferred)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn latest_block_data(pool: &SqlitePool) -> Result<Option<BlockDataRow>> {
    let row = sqlx::query_as::<_, BlockDataRow>(
        r#"
        SELECT block_number, block_hash, timestamp, base_fee_gwei, gas_limit, gas_used,
               utilization_percent, network_congestion, network_trend, avg_gas_price,
               median_gas_price, avg_priority_fee, median_priority_fee, total_transactions,
               eip1559_transactions, legacy_transactions, total_value_transferred
        FROM block_data
        ORDER BY block_number DESC
        LIMIT 1;
        "#,
    )
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn max_block_number(pool: &SqlitePool) -> Result<Option<u64>> {
    let max: Option<i64> = sqlx::query_scalar("SELECT MAX(block_number) FROM block_data;")
        .fetch_one(pool)
        .await?;
    Ok(max.map(|n| n.max(0) as u64))
}

/// Chart points at or after `cutoff`, oldest first.
pub async fn get_chart_points_since(
    pool: &SqlitePool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<ChartPoint>> {
    let rows = sqlx::query_as::<_, BlockDataRow>(
        r#"
        SELECT block_number, block_hash, timestamp, base_fee_gwei, gas_limit, gas_used,
               utilization_percent, network_congestion, network_trend, avg_gas_price,
               median_gas_price, avg_priority_fee, median_priority_fee, total_transactions,
               eip1559_transactions, legacy_transactions, total_value_transferred
        FROM block_data
        WHERE timestamp >= ?1
        ORDER BY timestamp ASC, block_number ASC;
        "#,
    )
    .bind(format_db_timestamp(&cutoff))
    .fetch_all(pool)
    .await?;

    let mut points = Vec::with_capacity(rows.len());
    for row in rows {
        match row.chart_point() {
            Some(point) => points.push(point),
            None => warn!(
                "skipping block {} with unparseable timestamp {:?}",
                row.block_number, row.timestamp
            ),
        }
    }
    Ok(points)
}

pub async fn get_gas_stats(pool: &SqlitePool, last_n_blocks: i64) -> Result<Option<GasStats>> {
    #[derive(FromRow)]
    struct Row {
        min_base_fee: Option<f64>,
        max_base_fee: Option<f64>,
        avg_base_fee: Option<f64>,
        blocks: i64,
    }

    let row = sqlx::query_as::<_, Row>(
        r#"
        SELECT
            MIN(base_fee_gwei) as min_base_fee,
            MAX(base_fee_gwei) as max_base_fee,
            AVG(base_fee_gwei) as avg_base_fee,
            COUNT(*) as blocks
        FROM (
            SELECT base_fee_gwei
            FROM block_data
            ORDER BY block_number DESC
            LIMIT ?1
        );
        "#,
    )
    .bind(last_n_blocks)
    .fetch_one(pool)
    .await?;

    match (row.min_base_fee, row.max_base_fee, row.avg_base_fee) {
        (Some(min), Some(max), Some(avg)) => Ok(Some(GasStats {
            min,
            max,
            avg,
            blocks: row.blocks,
        })),
        _ => Ok(None),
    }
}

#[derive(FromRow)]
struct AlertRow {
    id: String,
    name: String,
    enabled: bool,
    threshold: f64,
    direction: String,
    created_at: Option<String>,
    last_triggered: Option<String>,
}

impl AlertRow {
    fn into_alert(self) -> Option<Alert> {
        let direction: AlertDirection = match self.direction.parse() {
            Ok(direction) => direction,
            Err(err) => {
                warn!("alert {} has invalid direction: {}", self.id, err);
                return None;
            }
        };
        Some(Alert {
            id: self.id,
            name: self.name,
            enabled: self.enabled,
            threshold: self.threshold,
            direction,
            created_at: self.created_at.as_deref().and_then(parse_db_timestamp),
            last_triggered: self.last_triggered.as_deref().and_then(parse_db_timestamp),
        })
    }
}

pub async fn create_alert(
    pool: &SqlitePool,
    name: &str,
    threshold: f64,
    direction: AlertDirection,
    enabled: bool,
) -> Result<String> {
    let id: String = sqlx::query_scalar(
        r#"
        INSERT INTO gas_alerts (name, threshold, type, enabled)
        VALUES (?1, ?2, ?3, ?4)
        RETURNING id;
        "#,
    )
    .bind(name)
    .bind(threshold)
    .bind(direction.as_str())
    .bind(enabled)
    .fetch_one(pool)
    .await
    .context("failed to create alert")?;
    Ok(id)
}

/// Newest first.
pub async fn list_alerts(pool: &SqlitePool) -> Result<Vec<Alert>> {
    let rows = sqlx::query_as::<_, AlertRow>(
        r#"
        SELECT id, name, enabled, threshold, type AS direction, created_at, last_triggered
        FROM gas_alerts
        ORDER BY created_at DESC, rowid DESC;
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().filter_map(AlertRow::into_alert).collect())
}

pub async fn set_alert_enabled(pool: &SqlitePool, id: &str, enabled: bool) -> Result<bool> {
    let result = sqlx::query("UPDATE gas_alerts SET enabled = ?1 WHERE id = ?2;")
        .bind(enabled)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete_alert(pool: &SqlitePool, id: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM alert_notifications WHERE alert_id = ?1;")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    let result = sqlx::query("DELETE FROM gas_alerts WHERE id = ?1;")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}

pub async fn load_alert_states(pool: &SqlitePool) -> Result<AlertStates> {
    let rows = sqlx::query("SELECT id, triggered FROM gas_alerts;")
        .fetch_all(pool)
        .await?;

    let mut states = AlertStates::default();
    for row in rows {
        let id: String = row.try_get("id")?;
        let triggered: bool = row.try_get("triggered")?;
        states.set(id, triggered);
    }
    Ok(states)
}

/// Persists the new triggered flag and writes the notification row in one transaction.
pub async fn record_alert_transition(
    pool: &SqlitePool,
    transition: &AlertTransition,
    message: &str,
) -> Result<()> {
    let ts = format_db_timestamp(&transition.timestamp);
    let mut tx = pool.begin().await?;

    match transition.kind {
        TransitionKind::Entered => {
            sqlx::query(
                "UPDATE gas_alerts SET triggered = 1, last_triggered = ?1 WHERE id = ?2;",
            )
            .bind(&ts)
            .bind(&transition.alert_id)
            .execute(&mut *tx)
            .await?;
        }
        TransitionKind::Cleared => {
            sqlx::query("UPDATE gas_alerts SET triggered = 0 WHERE id = ?1;")
                .bind(&transition.alert_id)
                .execute(&mut *tx)
                .await?;
        }
    }

    sqlx::query(
        r#"
        INSERT INTO alert_notifications (alert_id, message, timestamp, read)
        VALUES (?1, ?2, ?3, 0);
        "#,
    )
    .bind(&transition.alert_id)
    .bind(message)
    .bind(&ts)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

pub async fn list_notifications(pool: &SqlitePool, limit: i64) -> Result<Vec<AlertNotification>> {
    #[derive(FromRow)]
    struct NotificationRow {
        id: String,
        alert_id: String,
        message: String,
        timestamp: String,
        read: bool,
    }

    let rows = sqlx::query_as::<_, NotificationRow>(
        r#"
        SELECT id, alert_id, message, timestamp, read
        FROM alert_notifications
        ORDER BY timestamp DESC, rowid DESC
        LIMIT ?1;
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            Some(AlertNotification {
                timestamp: parse_db_timestamp(&row.timestamp)?,
                id: row.id,
                alert_id: row.alert_id,
                message: row.message,
                read: row.read,
            })
        })
        .collect())
}

pub async fn insert_large_transfers(pool: &SqlitePool, transfers: &[LargeTransfer]) -> Result<()> {
    if transfers.is_empty() {
        return Ok(());
    }
    let mut txn = pool.begin().await?;

    for transfer in transfers {
        sqlx::query(
            r#"
            INSERT INTO whale_transfers (
                tx_hash, block_number, from_address, to_address, value_eth, timestamp
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(tx_hash) DO NOTHING;
            "#,
        )
        .bind(&transfer.tx_hash)
        .bind(to_i64(transfer.block_number))
        .bind(&transfer.from)
        .bind(&transfer.to)
        .bind(transfer.value_eth)
        .bind(format_db_timestamp(&transfer.timestamp))
        .execute(&mut *txn)
        .await?;
    }

    txn.commit().await?;
    Ok(())
}

pub async fn get_top_whales(
    pool: &SqlitePool,
    limit: i64,
    offset: i64,
) -> Result<Vec<WhaleSummary>> {
    #[derive(FromRow)]
    struct Row {
        address: String,
        total_blocks: i64,
        total_transactions: i64,
        total_value_eth: f64,
        last_seen: Option<String>,
    }

    let rows = sqlx::query_as::<_, Row>(
        r#"
        SELECT
            from_address as address,
            COUNT(DISTINCT block_number) as total_blocks,
            COUNT(*) as total_transactions,
            SUM(value_eth) as total_value_eth,
            MAX(timestamp) as last_seen
        FROM whale_transfers
        GROUP BY from_address
        ORDER BY total_value_eth DESC
        LIMIT ?1 OFFSET ?2;
        "#,
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| WhaleSummary {
            address: row.address,
            total_blocks: row.total_blocks,
            total_transactions: row.total_transactions,
            total_value_eth: row.total_value_eth,
            last_seen: row.last_seen.as_deref().and_then(parse_db_timestamp),
        })
        .collect())
}

async fn verify_block_data_columns(pool: &SqlitePool) -> Result<()> {
    let rows = sqlx::query("PRAGMA table_info(block_data);")
        .fetch_all(pool)
        .await?;

    let mut present = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.try_get("name")?;
        present.push(name);
    }

    for column in BLOCK_DATA_COLUMNS {
        if !present.iter().any(|name| name == column) {
            warn!(
                "block_data.{} is missing; delete/recreate DB to pick up the current schema",
                column
            );
        }
    }
    Ok(())
}
