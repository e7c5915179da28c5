pub mod entities;

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use time::OffsetDateTime;
use tracing::{debug, info, instrument};

use self::entities::Watermark;

/// The watermark of a source that has never been polled. Predates every item a source can return.
pub const BEGINNING_OF_TIME: OffsetDateTime = OffsetDateTime::UNIX_EPOCH;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        let pool = SqlitePoolOptions::new()
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(db_path)
                    .journal_mode(SqliteJournalMode::Delete)
                    .busy_timeout(BUSY_TIMEOUT)
                    .create_if_missing(true),
            )
            .await
            .with_context(|| anyhow!("could not open a SQLite database `{}`", db_path.display()))?;
        info!("Using an SQLite database `{}`", db_path.display());
        sqlx::migrate!()
            .run(&pool)
            .await
            .with_context(|| anyhow!("could not prepare a database schema"))?;

        Ok(Self { pool })
    }

    pub async fn begin(&self) -> Result<Tx> {
        self.pool
            .begin()
            .await
            .context("could not begin a new DB transaction")
            .map(Tx)
    }

    pub async fn watermark(&self, source_name: &str) -> Result<Option<OffsetDateTime>> {
        let mut tx = self.begin().await?;
        let watermark = tx.get_watermark(source_name).await?;
        tx.commit().await?;

        Ok(watermark)
    }

    /// Returns the stored watermark, or [`BEGINNING_OF_TIME`] for a source that has none.
    pub async fn watermark_or_default(&self, source_name: &str) -> Result<OffsetDateTime> {
        Ok(self
            .watermark(source_name)
            .await?
            .unwrap_or(BEGINNING_OF_TIME))
    }

    /// Durably stores the watermark before returning.
    pub async fn set_watermark(
        &self,
        source_name: &str,
        last_checked: OffsetDateTime,
    ) -> Result<()> {
        let mut tx = self.begin().await?;
        tx.set_watermark(source_name, last_checked).await?;
        tx.commit().await
    }

    pub async fn watermarks(&self) -> Result<Vec<Watermark>> {
        let mut tx = self.begin().await?;
        let watermarks = tx.get_watermarks().await?;
        tx.commit().await?;

        Ok(watermarks)
    }
}

pub struct Tx(Transaction<'static, Sqlite>);

impl Tx {
    pub async fn commit(self) -> Result<()> {
        self.0
            .commit()
            .await
            .context("could not commit a DB transaction")
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn get_watermark(&mut self, source_name: &str) -> Result<Option<OffsetDateTime>> {
        sqlx::query_scalar(
            "SELECT last_checked
            FROM watermarks
            WHERE source_name = ?1",
        )
        .bind(source_name)
        .fetch_optional(self.0.as_mut())
        .await
        .with_context(|| anyhow!("could not retrieve the watermark of `{source_name}`"))
    }

    /// Upserts the watermark in a single statement. An older timestamp never replaces a newer one.
    #[instrument(level = "TRACE", skip(self))]
    pub async fn set_watermark(
        &mut self,
        source_name: &str,
        last_checked: OffsetDateTime,
    ) -> Result<()> {
        debug!(%source_name, %last_checked, "Storing watermark");

        sqlx::query(
            "INSERT
            INTO watermarks (source_name, last_checked)
            VALUES (?1, ?2)
            ON CONFLICT (source_name) DO UPDATE SET
              last_checked = CASE
                WHEN julianday(excluded.last_checked) >= julianday(watermarks.last_checked)
                  THEN excluded.last_checked
                ELSE watermarks.last_checked
              END",
        )
        .bind(source_name)
        .bind(last_checked)
        .execute(self.0.as_mut())
        .await
        .with_context(|| anyhow!("could not store the watermark of `{source_name}`"))?;

        Ok(())
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn get_watermarks(&mut self) -> Result<Vec<Watermark>> {
        sqlx::query_as(
            "SELECT source_name, last_checked
            FROM watermarks
            ORDER BY source_name ASC",
        )
        .fetch_all(self.0.as_mut())
        .await
        .context("could not retrieve the watermark list")
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    async fn open() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("watermarks.sqlite3"))
            .await
            .unwrap();

        (dir, storage)
    }

    #[tokio::test]
    async fn unknown_source_gets_the_sentinel() {
        let (_dir, storage) = open().await;

        assert_eq!(storage.watermark("reddit").await.unwrap(), None);
        assert_eq!(
            storage.watermark_or_default("reddit").await.unwrap(),
            BEGINNING_OF_TIME
        );
    }

    #[tokio::test]
    async fn set_upserts_one_row_per_source() {
        let (_dir, storage) = open().await;
        let first = datetime!(2024-01-01 12:00:00.25 UTC);
        let second = datetime!(2024-01-02 08:30:00.5 UTC);

        storage.set_watermark("reddit", first).await.unwrap();
        storage.set_watermark("youtube", first).await.unwrap();
        storage.set_watermark("reddit", second).await.unwrap();

        assert_eq!(storage.watermark("reddit").await.unwrap(), Some(second));
        assert_eq!(storage.watermark("youtube").await.unwrap(), Some(first));

        let rows = storage.watermarks().await.unwrap();
        assert_eq!(
            rows,
            [
                Watermark {
                    source_name: "reddit".into(),
                    last_checked: second
                },
                Watermark {
                    source_name: "youtube".into(),
                    last_checked: first
                },
            ]
        );
    }

    #[tokio::test]
    async fn watermark_never_moves_backwards() {
        let (_dir, storage) = open().await;
        let newer = datetime!(2024-03-01 00:00:00 UTC);
        let older = datetime!(2024-02-01 00:00:00 UTC);

        storage.set_watermark("bluesky", newer).await.unwrap();
        storage.set_watermark("bluesky", older).await.unwrap();

        assert_eq!(storage.watermark("bluesky").await.unwrap(), Some(newer));
    }

    #[tokio::test]
    async fn watermarks_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watermarks.sqlite3");
        let ts = datetime!(2024-05-05 05:05:05 UTC);

        {
            let storage = Storage::new(&path).await.unwrap();
            storage.set_watermark("reddit", ts).await.unwrap();
        }

        let storage = Storage::new(&path).await.unwrap();
        assert_eq!(storage.watermark("reddit").await.unwrap(), Some(ts));
    }
}
