//! Durable staging store
//!
//! One SQLite database per staged source path tracks every encoded chunk:
//! its local file, Message-ID, digests, ordering, and posting/verification
//! timestamps. Upload resumes from the first row without a posted
//! timestamp, so a crashed run picks up exactly where it stopped.

use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Row};
use std::path::Path;
use tracing::debug;

/// A staged chunk ready to be inserted
#[derive(Debug, Clone)]
pub struct NewStagedArticle {
    /// Staged text file on disk
    pub local_file: String,
    /// Message-ID without brackets
    pub message_id: String,
    /// Subject line
    pub subject: String,
    /// From line
    pub poster: String,
    /// Remote file name this chunk belongs to
    pub remote_file: String,
    /// Staged file size in bytes
    pub size: i64,
    /// SHA-1 of the staged file
    pub sha1: String,
    /// Part number within its file
    pub sequence_no: i64,
    /// File ordering across the upload
    pub sort_no: i64,
}

/// A staged chunk as stored
#[derive(Debug, Clone, FromRow)]
pub struct StagedArticle {
    /// Row id
    pub id: i64,
    /// Staged text file on disk
    pub local_file: String,
    /// Message-ID without brackets
    pub message_id: String,
    /// Subject line
    pub subject: String,
    /// From line
    pub poster: String,
    /// Remote file name this chunk belongs to
    pub remote_file: String,
    /// Staged file size in bytes
    pub size: i64,
    /// SHA-1 recorded at staging time
    pub sha1: String,
    /// Part number within its file
    pub sequence_no: i64,
    /// File ordering across the upload
    pub sort_no: i64,
    /// Unix timestamp of the accepted POST; null until posted
    pub posted_date: Option<i64>,
    /// Unix timestamp of the verifying HEAD; null until verified
    pub verified_date: Option<i64>,
}

/// Store handle over the staging database
pub struct StagedStore {
    pool: SqlitePool,
}

impl StagedStore {
    /// Open (creating if missing) the staging database at `path`
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS staged_article (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                local_file TEXT NOT NULL,
                message_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                poster TEXT NOT NULL,
                remote_file TEXT NOT NULL,
                size INTEGER NOT NULL,
                sha1 TEXT NOT NULL,
                sequence_no INTEGER NOT NULL,
                sort_no INTEGER NOT NULL,
                posted_date INTEGER,
                verified_date INTEGER
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS staged_article_group (
                article_id INTEGER NOT NULL,
                name TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS staged_article_header (
                article_id INTEGER NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        debug!("staging store open at {}", path.display());
        Ok(Self { pool })
    }

    /// Insert a staged chunk with its groups and headers in one transaction
    pub async fn insert(
        &self,
        row: &NewStagedArticle,
        groups: &[String],
        headers: &[(String, String)],
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO staged_article (
                local_file, message_id, subject, poster, remote_file,
                size, sha1, sequence_no, sort_no
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.local_file)
        .bind(&row.message_id)
        .bind(&row.subject)
        .bind(&row.poster)
        .bind(&row.remote_file)
        .bind(row.size)
        .bind(&row.sha1)
        .bind(row.sequence_no)
        .bind(row.sort_no)
        .execute(&mut *tx)
        .await?;
        let article_id = result.last_insert_rowid();

        // SQLite's default bind-variable limit is 999; 2 variables per
        // group row and 3 per header row set the chunk sizes
        const MAX_GROUPS_PER_BATCH: usize = 499;
        const MAX_HEADERS_PER_BATCH: usize = 333;

        for chunk in groups.chunks(MAX_GROUPS_PER_BATCH) {
            let mut query_builder = sqlx::QueryBuilder::new(
                "INSERT INTO staged_article_group (article_id, name) ",
            );
            query_builder.push_values(chunk, |mut b, group| {
                b.push_bind(article_id).push_bind(group);
            });
            query_builder.build().execute(&mut *tx).await?;
        }

        for chunk in headers.chunks(MAX_HEADERS_PER_BATCH) {
            let mut query_builder = sqlx::QueryBuilder::new(
                "INSERT INTO staged_article_header (article_id, key, value) ",
            );
            query_builder.push_values(chunk, |mut b, (key, value)| {
                b.push_bind(article_id).push_bind(key).push_bind(value);
            });
            query_builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(article_id)
    }

    /// Every staged chunk in upload order `(sort_no, sequence_no)`
    pub async fn all_ordered(&self) -> Result<Vec<StagedArticle>> {
        Ok(sqlx::query_as::<_, StagedArticle>(
            "SELECT * FROM staged_article ORDER BY sort_no, sequence_no",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Chunks posted but not yet verified, in upload order
    pub async fn posted_unverified(&self) -> Result<Vec<StagedArticle>> {
        Ok(sqlx::query_as::<_, StagedArticle>(
            r#"
            SELECT * FROM staged_article
            WHERE posted_date IS NOT NULL AND verified_date IS NULL
            ORDER BY sort_no, sequence_no
            "#,
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Groups recorded for a chunk, in insertion order
    pub async fn groups_for(&self, article_id: i64) -> Result<Vec<String>> {
        let rows =
            sqlx::query("SELECT name FROM staged_article_group WHERE article_id = ? ORDER BY rowid")
                .bind(article_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.iter().map(|row| row.get::<String, _>(0)).collect())
    }

    /// Headers recorded for a chunk, in insertion order
    pub async fn headers_for(&self, article_id: i64) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT key, value FROM staged_article_header WHERE article_id = ? ORDER BY rowid",
        )
        .bind(article_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get::<String, _>(0), row.get::<String, _>(1)))
            .collect())
    }

    /// Replace a chunk's Message-ID (collision during upload)
    pub async fn update_message_id(&self, article_id: i64, message_id: &str) -> Result<()> {
        sqlx::query("UPDATE staged_article SET message_id = ? WHERE id = ?")
            .bind(message_id)
            .bind(article_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Stamp a chunk as posted
    pub async fn mark_posted(&self, article_id: i64, timestamp: i64) -> Result<()> {
        sqlx::query("UPDATE staged_article SET posted_date = ? WHERE id = ?")
            .bind(timestamp)
            .bind(article_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Stamp a chunk as verified
    pub async fn mark_verified(&self, article_id: i64, timestamp: i64) -> Result<()> {
        sqlx::query("UPDATE staged_article SET verified_date = ? WHERE id = ?")
            .bind(timestamp)
            .bind(article_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Close the pool, flushing writers
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl Drop for StagedStore {
    fn drop(&mut self) {
        if !self.pool.is_closed() {
            debug!("staging store dropped without close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_row(seq: i64, sort: i64) -> NewStagedArticle {
        NewStagedArticle {
            local_file: format!("staged/{:03}.{:03}.ntx", sort, seq),
            message_id: format!("{}.{}@newsreap", sort, seq),
            subject: format!("\"vol{}.rar\" yEnc ({}/3)", sort, seq),
            poster: "reaper <r@example.com>".to_string(),
            remote_file: format!("vol{}.rar", sort),
            size: 768000,
            sha1: "da39a3ee5e6b4b0d3255bfef95601890afd80709".to_string(),
            sequence_no: seq,
            sort_no: sort,
        }
    }

    #[tokio::test]
    async fn test_insert_and_order() {
        let dir = tempdir().unwrap();
        let store = StagedStore::open(&dir.path().join("staged.db")).await.unwrap();

        // insert out of order; reads come back (sort_no, sequence_no) sorted
        store
            .insert(&sample_row(2, 1), &["alt.binaries.test".to_string()], &[])
            .await
            .unwrap();
        store.insert(&sample_row(1, 2), &[], &[]).await.unwrap();
        store.insert(&sample_row(1, 1), &[], &[]).await.unwrap();

        let rows = store.all_ordered().await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!((rows[0].sort_no, rows[0].sequence_no), (1, 1));
        assert_eq!((rows[1].sort_no, rows[1].sequence_no), (1, 2));
        assert_eq!((rows[2].sort_no, rows[2].sequence_no), (2, 1));
        assert!(rows[0].posted_date.is_none());
        assert!(rows[0].verified_date.is_none());

        store.close().await;
    }

    #[tokio::test]
    async fn test_groups_and_headers_roundtrip() {
        let dir = tempdir().unwrap();
        let store = StagedStore::open(&dir.path().join("staged.db")).await.unwrap();

        let groups = vec![
            "alt.binaries.test".to_string(),
            "alt.binaries.other".to_string(),
        ];
        let headers = vec![("X-Newsreader".to_string(), "newsreap".to_string())];
        let id = store
            .insert(&sample_row(1, 1), &groups, &headers)
            .await
            .unwrap();

        assert_eq!(store.groups_for(id).await.unwrap(), groups);
        assert_eq!(store.headers_for(id).await.unwrap(), headers);
        store.close().await;
    }

    #[tokio::test]
    async fn test_posting_lifecycle() {
        let dir = tempdir().unwrap();
        let store = StagedStore::open(&dir.path().join("staged.db")).await.unwrap();

        let id = store.insert(&sample_row(1, 1), &[], &[]).await.unwrap();
        store.insert(&sample_row(2, 1), &[], &[]).await.unwrap();

        store.mark_posted(id, 1407746387).await.unwrap();
        let unverified = store.posted_unverified().await.unwrap();
        assert_eq!(unverified.len(), 1);
        assert_eq!(unverified[0].id, id);
        assert_eq!(unverified[0].posted_date, Some(1407746387));

        store.mark_verified(id, 1407746400).await.unwrap();
        assert!(store.posted_unverified().await.unwrap().is_empty());
        store.close().await;
    }

    #[tokio::test]
    async fn test_update_message_id() {
        let dir = tempdir().unwrap();
        let store = StagedStore::open(&dir.path().join("staged.db")).await.unwrap();

        let id = store.insert(&sample_row(1, 1), &[], &[]).await.unwrap();
        store.update_message_id(id, "fresh@newsreap").await.unwrap();

        let rows = store.all_ordered().await.unwrap();
        assert_eq!(rows[0].message_id, "fresh@newsreap");
        store.close().await;
    }
}
