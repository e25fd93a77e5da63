//! Metadata store: the durable record of every cached entry
//!
//! The store is the single source of truth for which transformed assets exist.
//! Uniqueness of the derived key (and of the option tuple) is enforced by the
//! schema, so a second insert for the same key resolves to the existing row.

use crate::error::Result;
use crate::key::CacheKey;
use crate::types::{CacheEntry, ImageFormat, NewCacheEntry, TransformOptions};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Look up the live entry for a (source URL, options) tuple
    async fn find(&self, source_url: &str, options: &TransformOptions)
        -> Result<Option<CacheEntry>>;

    async fn find_by_key(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;

    async fn get(&self, id: i64) -> Result<Option<CacheEntry>>;

    /// Insert a new entry. If the key is already registered the existing
    /// entry is returned instead of an error.
    async fn insert(&self, entry: NewCacheEntry) -> Result<CacheEntry>;

    /// Bump `accessed_at`; never moves it backwards
    async fn touch(&self, id: i64, now: DateTime<Utc>) -> Result<()>;

    /// Entries whose `accessed_at` is strictly before `cutoff`
    async fn list_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<CacheEntry>>;

    async fn list_by_source(&self, source_url: &str) -> Result<Vec<CacheEntry>>;

    /// Returns whether a row was removed
    async fn delete(&self, id: i64) -> Result<bool>;

    async fn count(&self) -> Result<u64>;
}

const COLUMNS: &str = "id, cache_key, source_url, storage_path, format, width, height, quality, created_at, accessed_at";

#[derive(sqlx::FromRow)]
struct CacheRow {
    id: i64,
    cache_key: String,
    source_url: String,
    storage_path: String,
    format: String,
    width: Option<i64>,
    height: Option<i64>,
    quality: i64,
    created_at: i64,
    accessed_at: i64,
}

impl TryFrom<CacheRow> for CacheEntry {
    type Error = sqlx::Error;

    fn try_from(row: CacheRow) -> std::result::Result<Self, Self::Error> {
        let format = ImageFormat::from_str(&row.format)
            .map_err(|e| sqlx::Error::Decode(e.to_string().into()))?;
        let dimension = |v: Option<i64>| -> std::result::Result<Option<u32>, sqlx::Error> {
            v.map(|n| u32::try_from(n).map_err(|e| sqlx::Error::Decode(Box::new(e))))
                .transpose()
        };
        Ok(CacheEntry {
            id: row.id,
            cache_key: row.cache_key,
            source_url: row.source_url,
            storage_path: row.storage_path,
            format,
            width: dimension(row.width)?,
            height: dimension(row.height)?,
            quality: u8::try_from(row.quality).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            created_at: from_millis(row.created_at),
            accessed_at: from_millis(row.accessed_at),
        })
    }
}

fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn into_entries(rows: Vec<CacheRow>) -> Result<Vec<CacheEntry>> {
    rows.into_iter()
        .map(|row| CacheEntry::try_from(row).map_err(Into::into))
        .collect()
}

/// SQLite-backed metadata store
#[derive(Clone)]
pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    /// Connect to the database, creating the file if needed
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("Connecting to metadata database...");
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        info!("Metadata database connection established");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run database migrations (versioned, tracked in `_sqlx_migrations` table)
    pub async fn migrate(&self) -> Result<()> {
        info!("Running metadata migrations...");
        sqlx::migrate!().run(&self.pool).await?;
        info!("Metadata migrations completed");
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn find(
        &self,
        source_url: &str,
        options: &TransformOptions,
    ) -> Result<Option<CacheEntry>> {
        let row = sqlx::query_as::<_, CacheRow>(&format!(
            r#"
            SELECT {COLUMNS} FROM image_cache
            WHERE source_url = ?
              AND format = ?
              AND width IS ?
              AND height IS ?
              AND quality = ?
            LIMIT 1
            "#
        ))
        .bind(source_url)
        .bind(options.format.extension())
        .bind(options.width.map(i64::from))
        .bind(options.height.map(i64::from))
        .bind(i64::from(options.quality))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(CacheEntry::try_from).transpose()?)
    }

    async fn find_by_key(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let row = sqlx::query_as::<_, CacheRow>(&format!(
            "SELECT {COLUMNS} FROM image_cache WHERE cache_key = ?"
        ))
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(CacheEntry::try_from).transpose()?)
    }

    async fn get(&self, id: i64) -> Result<Option<CacheEntry>> {
        let row = sqlx::query_as::<_, CacheRow>(&format!(
            "SELECT {COLUMNS} FROM image_cache WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(CacheEntry::try_from).transpose()?)
    }

    async fn insert(&self, entry: NewCacheEntry) -> Result<CacheEntry> {
        let now = to_millis(entry.created_at);
        let inserted = sqlx::query_as::<_, CacheRow>(&format!(
            r#"
            INSERT INTO image_cache
                (cache_key, source_url, storage_path, format, width, height, quality, created_at, accessed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            RETURNING {COLUMNS}
            "#
        ))
        .bind(&entry.cache_key)
        .bind(&entry.source_url)
        .bind(&entry.storage_path)
        .bind(entry.options.format.extension())
        .bind(entry.options.width.map(i64::from))
        .bind(entry.options.height.map(i64::from))
        .bind(i64::from(entry.options.quality))
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(CacheEntry::try_from(row)?);
        }

        debug!(key = %entry.cache_key, "Insert conflicted, returning existing entry");
        let existing = sqlx::query_as::<_, CacheRow>(&format!(
            "SELECT {COLUMNS} FROM image_cache WHERE cache_key = ? OR storage_path = ? LIMIT 1"
        ))
        .bind(&entry.cache_key)
        .bind(&entry.storage_path)
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            Some(row) => Ok(CacheEntry::try_from(row)?),
            None => self
                .find(&entry.source_url, &entry.options)
                .await?
                .ok_or_else(|| sqlx::Error::RowNotFound.into()),
        }
    }

    async fn touch(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE image_cache SET accessed_at = MAX(accessed_at, ?) WHERE id = ?")
            .bind(to_millis(now))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<CacheEntry>> {
        let rows = sqlx::query_as::<_, CacheRow>(&format!(
            "SELECT {COLUMNS} FROM image_cache WHERE accessed_at < ? ORDER BY accessed_at"
        ))
        .bind(to_millis(cutoff))
        .fetch_all(&self.pool)
        .await?;

        into_entries(rows)
    }

    async fn list_by_source(&self, source_url: &str) -> Result<Vec<CacheEntry>> {
        let rows = sqlx::query_as::<_, CacheRow>(&format!(
            "SELECT {COLUMNS} FROM image_cache WHERE source_url = ? ORDER BY id"
        ))
        .bind(source_url)
        .fetch_all(&self.pool)
        .await?;

        into_entries(rows)
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM image_cache WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM image_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}
