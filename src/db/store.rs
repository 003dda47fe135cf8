use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::StoreError;
use crate::watch::models::{IdentityKey, Offer, OfferRecord, PriceObservation};

/// Durable record of observed offers, keyed by identity.
///
/// Upserts are serialized through `write_lock` and run inside a transaction,
/// so two adapters racing on the same key cannot lose an update.
pub struct OfferStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

#[derive(Debug, Clone, FromRow)]
struct OfferRow {
    identity_key: String,
    store: String,
    title: String,
    url: String,
    sku: Option<String>,
    price_pln: String,
    first_seen: String,
    last_seen: String,
}

impl TryFrom<OfferRow> for OfferRecord {
    type Error = StoreError;

    fn try_from(row: OfferRow) -> Result<Self, Self::Error> {
        let malformed = |reason: String| StoreError::Malformed {
            key: row.identity_key.clone(),
            reason,
        };

        let price_pln = Decimal::from_str(&row.price_pln)
            .map_err(|e| malformed(format!("price {:?}: {e}", row.price_pln)))?;
        if price_pln.is_sign_negative() {
            return Err(malformed(format!("negative price {price_pln}")));
        }
        let first_seen = parse_timestamp(&row.first_seen)
            .map_err(|e| malformed(format!("first_seen {:?}: {e}", row.first_seen)))?;
        let last_seen = parse_timestamp(&row.last_seen)
            .map_err(|e| malformed(format!("last_seen {:?}: {e}", row.last_seen)))?;

        Ok(OfferRecord {
            identity_key: IdentityKey::from_raw(row.identity_key),
            store: row.store,
            title: row.title,
            url: row.url,
            sku: row.sku,
            price_pln,
            first_seen,
            last_seen,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RunRecord {
    pub id: Option<i64>,
    pub run_id: String,
    pub started_at: String,
    pub duration_ms: Option<i64>,
    pub products: Option<i64>,
    pub adapter_calls: Option<i64>,
    pub offers_seen: Option<i64>,
    pub notifications_sent: Option<i64>,
    pub adapter_failures: Option<i64>,
    pub notify_failures: Option<i64>,
    pub created_at: Option<String>,
}

/// Every connection to ":memory:" opens its own database, so that path gets
/// exactly one connection that is never reaped between runs.
fn pool_options(database_path: &str) -> SqlitePoolOptions {
    if database_path == ":memory:" {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    }
}

const OFFER_COLUMNS: &str =
    "identity_key, store, title, url, sku, price_pln, first_seen, last_seen";

impl OfferStore {
    pub async fn new(database_path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{database_path}"))
            .map_err(StoreError::unavailable("invalid database path"))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = pool_options(database_path)
            .connect_with(options)
            .await
            .map_err(StoreError::unavailable("failed to connect to SQLite database"))?;

        let store = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        store.migrate().await?;

        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        let migration_sql = include_str!("../../migrations/001_init.sql");
        // Execute each statement separately (sqlx doesn't support multiple statements in one call)
        for statement in migration_sql.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed)
                    .execute(&self.pool)
                    .await
                    .map_err(StoreError::unavailable(format!(
                        "failed to execute migration: {trimmed}"
                    )))?;
            }
        }
        Ok(())
    }

    // --- Offer records ---

    pub async fn get(&self, key: &IdentityKey) -> Result<Option<OfferRecord>, StoreError> {
        let row = sqlx::query_as::<_, OfferRow>(&format!(
            "SELECT {OFFER_COLUMNS} FROM offer_records WHERE identity_key = ?"
        ))
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::unavailable("failed to fetch offer record"))?;

        row.map(OfferRecord::try_from).transpose()
    }

    /// Record a sighting and return the record as it was before.
    ///
    /// `first_seen` survives updates. A previous row that cannot be decoded is
    /// logged, replaced, and reported as absent.
    pub async fn upsert(
        &self,
        key: &IdentityKey,
        offer: &Offer,
        seen_at: DateTime<Utc>,
    ) -> Result<Option<OfferRecord>, StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(StoreError::unavailable("failed to begin upsert"))?;

        let previous_row = sqlx::query_as::<_, OfferRow>(&format!(
            "SELECT {OFFER_COLUMNS} FROM offer_records WHERE identity_key = ?"
        ))
        .bind(key.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::unavailable("failed to read previous offer record"))?;

        let previous = match previous_row.map(OfferRecord::try_from) {
            None => None,
            Some(Ok(record)) => Some(record),
            Some(Err(e)) => {
                warn!(key = %key, error = %e, "Replacing malformed offer record");
                sqlx::query("DELETE FROM offer_records WHERE identity_key = ?")
                    .bind(key.as_str())
                    .execute(&mut *tx)
                    .await
                    .map_err(StoreError::unavailable("failed to drop malformed record"))?;
                None
            }
        };

        let seen_at_str = seen_at.to_rfc3339();
        let price_str = offer.price_pln.to_string();

        sqlx::query(
            "INSERT INTO offer_records (identity_key, store, title, url, sku, price_pln, first_seen, last_seen)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(identity_key) DO UPDATE SET
                store = excluded.store,
                title = excluded.title,
                url = excluded.url,
                sku = excluded.sku,
                price_pln = excluded.price_pln,
                last_seen = excluded.last_seen",
        )
        .bind(key.as_str())
        .bind(&offer.store)
        .bind(&offer.title)
        .bind(&offer.url)
        .bind(&offer.sku)
        .bind(&price_str)
        .bind(&seen_at_str)
        .bind(&seen_at_str)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::unavailable("failed to upsert offer record"))?;

        sqlx::query("INSERT INTO price_history (identity_key, price_pln, seen_at) VALUES (?, ?, ?)")
            .bind(key.as_str())
            .bind(&price_str)
            .bind(&seen_at_str)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::unavailable("failed to append price history"))?;

        tx.commit()
            .await
            .map_err(StoreError::unavailable("failed to commit upsert"))?;

        Ok(previous)
    }

    /// All records for a store, ordered by key. Malformed rows are logged and skipped.
    pub async fn all_for_store(&self, store: &str) -> Result<Vec<OfferRecord>, StoreError> {
        let rows = sqlx::query_as::<_, OfferRow>(&format!(
            "SELECT {OFFER_COLUMNS} FROM offer_records WHERE store = ? ORDER BY identity_key"
        ))
        .bind(store)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::unavailable("failed to fetch offer records for store"))?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match OfferRecord::try_from(row) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(store, error = %e, "Skipping malformed offer record");
                    None
                }
            })
            .collect())
    }

    /// Price history for one key, oldest first.
    pub async fn price_history(&self, key: &IdentityKey) -> Result<Vec<PriceObservation>, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT price_pln, seen_at FROM price_history WHERE identity_key = ? ORDER BY id",
        )
        .bind(key.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::unavailable("failed to fetch price history"))?;

        Ok(rows
            .into_iter()
            .filter_map(|(price, seen_at)| {
                let parsed = Decimal::from_str(&price)
                    .ok()
                    .zip(parse_timestamp(&seen_at).ok());
                if parsed.is_none() {
                    warn!(key = %key, price = %price, seen_at = %seen_at, "Skipping malformed price observation");
                }
                parsed.map(|(price_pln, seen_at)| PriceObservation { price_pln, seen_at })
            })
            .collect())
    }

    // --- Run operations ---

    pub async fn insert_run(&self, run: &RunRecord) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO runs (run_id, started_at, duration_ms, products, adapter_calls, offers_seen, notifications_sent, adapter_failures, notify_failures)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&run.run_id)
        .bind(&run.started_at)
        .bind(run.duration_ms)
        .bind(run.products)
        .bind(run.adapter_calls)
        .bind(run.offers_seen)
        .bind(run.notifications_sent)
        .bind(run.adapter_failures)
        .bind(run.notify_failures)
        .execute(&self.pool)
        .await
        .map_err(StoreError::unavailable("failed to insert run"))?;

        Ok(result.last_insert_rowid())
    }

    pub async fn latest_run(&self) -> Result<Option<RunRecord>, StoreError> {
        let run = sqlx::query_as::<_, RunRecord>("SELECT * FROM runs ORDER BY id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::unavailable("failed to fetch latest run"))?;
        Ok(run)
    }

    #[cfg(test)]
    async fn corrupt_price(&self, key: &IdentityKey, raw: &str) {
        sqlx::query("UPDATE offer_records SET price_pln = ? WHERE identity_key = ?")
            .bind(raw)
            .bind(key.as_str())
            .execute(&self.pool)
            .await
            .expect("should corrupt row");
    }
}
