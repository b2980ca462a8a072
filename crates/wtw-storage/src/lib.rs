//! SQLite-backed opinion store, random selection and CSV bulk import.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use sqlx::error::ErrorKind;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tracing::{info, warn};
use wtw_core::{NewOpinion, Opinion};

pub const CRATE_NAME: &str = "wtw-storage";

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const OPINION_COLUMNS: &str = "id, title, text, source, images, timestamp, added_by";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("opinion {id} not found")]
    NotFound { id: i64 },

    /// Unique constraint violation on `text`.
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// NOT NULL or CHECK constraint violation.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("data corruption: {0}")]
    DataCorruption(#[from] serde_json::Error),
}

impl StorageError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            match db_err.kind() {
                ErrorKind::UniqueViolation => return Self::Duplicate(db_err.message().to_owned()),
                ErrorKind::CheckViolation | ErrorKind::NotNullViolation => {
                    return Self::ConstraintViolation(db_err.message().to_owned())
                }
                _ => {}
            }
        }
        Self::Database(err)
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Handle to the `opinions` table. Cheap to clone; clones share one pool.
#[derive(Debug, Clone)]
pub struct OpinionStore {
    pool: SqlitePool,
}

impl OpinionStore {
    /// Open (creating the file if needed) the database at `database_uri`.
    pub async fn connect(database_uri: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_uri)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Migrated in-memory store. One pinned connection, so every query sees the same database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|err| StorageError::Migration(err.to_string()))?;
        info!("opinion schema migrated");
        Ok(())
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM opinions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Opinion>> {
        let row = sqlx::query(&format!("SELECT {OPINION_COLUMNS} FROM opinions WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(opinion_from_row).transpose()
    }

    pub async fn list(&self) -> Result<Vec<Opinion>> {
        let rows = sqlx::query(&format!("SELECT {OPINION_COLUMNS} FROM opinions ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(opinion_from_row).collect()
    }

    /// Whether any opinion other than `exclude_id` already has exactly this text.
    pub async fn text_exists(&self, text: &str, exclude_id: Option<i64>) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id
              FROM opinions
             WHERE text = ?
               AND (? IS NULL OR id <> ?)
             LIMIT 1
            "#,
        )
        .bind(text)
        .bind(exclude_id)
        .bind(exclude_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    pub async fn insert(&self, new: &NewOpinion) -> Result<Opinion> {
        let images = serde_json::to_string(&new.images)?;
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO opinions (title, text, source, images, timestamp, added_by)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING {OPINION_COLUMNS}
            "#
        ))
        .bind(&new.title)
        .bind(&new.text)
        .bind(&new.source)
        .bind(images)
        .bind(Utc::now())
        .bind(&new.added_by)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => {
                let opinion = opinion_from_row(&row)?;
                info!(id = opinion.id, images = opinion.images.len(), "opinion created");
                Ok(opinion)
            }
            Err(err) => {
                let err = StorageError::from(err);
                warn!(error = %err, "opinion insert rejected");
                Err(err)
            }
        }
    }

    /// Persist every mutable column of `opinion`. `id` and `timestamp` are never written.
    pub async fn update(&self, opinion: &Opinion) -> Result<Opinion> {
        let images = serde_json::to_string(&opinion.images)?;
        let row = sqlx::query(&format!(
            r#"
            UPDATE opinions
               SET title = ?,
                   text = ?,
                   source = ?,
                   images = ?,
                   added_by = ?
             WHERE id = ?
            RETURNING {OPINION_COLUMNS}
            "#
        ))
        .bind(&opinion.title)
        .bind(&opinion.text)
        .bind(&opinion.source)
        .bind(images)
        .bind(&opinion.added_by)
        .bind(opinion.id)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or(StorageError::NotFound { id: opinion.id })?;
        let updated = opinion_from_row(&row)?;
        info!(id = updated.id, "opinion updated");
        Ok(updated)
    }

    /// Returns `false` when no row had this id.
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM opinions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            info!(id, "opinion deleted");
        }
        Ok(deleted)
    }

    /// Uniformly random opinion, or `None` when the table is empty.
    ///
    /// Count and fetch share a transaction so the offset always lands on a row
    /// of the snapshot it was drawn from.
    pub async fn random(&self) -> Result<Option<Opinion>> {
        let mut tx = self.pool.begin().await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM opinions")
            .fetch_one(&mut *tx)
            .await?;
        let offset = pick_offset(&mut rand::thread_rng(), count);
        let Some(offset) = offset else {
            tx.commit().await?;
            return Ok(None);
        };

        let row = sqlx::query(&format!(
            "SELECT {OPINION_COLUMNS} FROM opinions ORDER BY id LIMIT 1 OFFSET ?"
        ))
        .bind(offset)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        row.as_ref().map(opinion_from_row).transpose()
    }
}

/// Uniform offset in `[0, count)`, or `None` for an empty table.
pub fn pick_offset<R: Rng>(rng: &mut R, count: i64) -> Option<i64> {
    if count <= 0 {
        return None;
    }
    Some(rng.gen_range(0..count))
}

fn opinion_from_row(row: &SqliteRow) -> Result<Opinion> {
    let images: String = row.try_get("images")?;
    Ok(Opinion {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        text: row.try_get("text")?,
        source: row.try_get("source")?,
        images: serde_json::from_str(&images)?,
        timestamp: row.try_get("timestamp")?,
        added_by: row.try_get("added_by")?,
    })
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("row {record} is malformed ({loaded} opinions loaded before it): {source}")]
    Csv {
        loaded: usize,
        record: usize,
        #[source]
        source: csv::Error,
    },

    #[error("row {record} was rejected by the store ({loaded} opinions loaded before it): {source}")]
    Store {
        loaded: usize,
        record: usize,
        #[source]
        source: StorageError,
    },
}

impl LoadError {
    /// Rows committed before the import stopped.
    pub fn loaded(&self) -> usize {
        match self {
            Self::Io { .. } => 0,
            Self::Csv { loaded, .. } | Self::Store { loaded, .. } => *loaded,
        }
    }
}

/// Import opinions from a CSV file whose header names opinion fields.
///
/// Only `title`, `text`, `source` and `added_by` are read. Other columns,
/// `id` and `timestamp` included, are ignored: the store assigns both.
///
/// Rows are committed one at a time; the first failing row stops the import
/// and everything before it stays in the store.
pub async fn load_opinions_csv(
    store: &OpinionStore,
    path: impl AsRef<Path>,
) -> std::result::Result<usize, LoadError> {
    let path = path.as_ref();
    let bytes = tokio::fs::read(path).await.map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let mut reader = csv::Reader::from_reader(bytes.as_slice());
    let mut loaded = 0usize;
    for (idx, record) in reader.deserialize::<NewOpinion>().enumerate() {
        let record_no = idx + 1;
        let new = record.map_err(|source| LoadError::Csv {
            loaded,
            record: record_no,
            source,
        })?;
        store.insert(&new).await.map_err(|source| LoadError::Store {
            loaded,
            record: record_no,
            source,
        })?;
        loaded += 1;
    }

    info!(loaded, path = %path.display(), "opinion import finished");
    Ok(loaded)
}
