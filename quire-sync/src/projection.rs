//! Best-effort projection of document fields into the relational model.
//!
//! After a change the repository extracts a couple of fields from the
//! document and hands them to a [`ProjectionSink`]. Failures are logged by the
//! caller and never reach the sync path.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use yrs::{Any, Doc, GetString, Map, Out, ReadTxn, Transact};

use crate::protocol::DocumentId;

/// Root text holding the document title.
pub const TITLE_ROOT: &str = "title";
/// Root map holding document metadata.
pub const META_ROOT: &str = "meta";
/// Key of the cover image URL inside [`META_ROOT`].
pub const COVER_IMAGE_KEY: &str = "coverImage";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProjectionError {
    #[error("projection store error: {0}")]
    Store(String),
}

impl From<sqlx::Error> for ProjectionError {
    fn from(e: sqlx::Error) -> Self {
        ProjectionError::Store(e.to_string())
    }
}

/// Fields derived from a document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectedFields {
    pub title: Option<String>,
    pub cover_image: Option<String>,
}

impl ProjectedFields {
    pub fn extract(doc: &Doc) -> Self {
        let txn = doc.transact();
        let title = txn.get_text(TITLE_ROOT).map(|text| text.get_string(&txn));
        let cover_image = txn
            .get_map(META_ROOT)
            .and_then(|meta| meta.get(&txn, COVER_IMAGE_KEY))
            .and_then(|value| match value {
                Out::Any(Any::String(s)) => Some(s.to_string()),
                _ => None,
            });
        Self { title, cover_image }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.cover_image.is_none()
    }
}

/// Receiver of projected fields.
#[async_trait]
pub trait ProjectionSink: Send + Sync {
    async fn project(&self, document: &DocumentId, fields: &ProjectedFields) -> Result<(), ProjectionError>;
}

/// Discards projections.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProjection;

#[async_trait]
impl ProjectionSink for NoProjection {
    async fn project(&self, _document: &DocumentId, _fields: &ProjectedFields) -> Result<(), ProjectionError> {
        Ok(())
    }
}

/// Default statement: `?1` document id, `?2` title, `?3` cover image.
/// Absent fields keep their stored value.
pub const DEFAULT_PROJECTION_STATEMENT: &str = "\
UPDATE nodes SET title = COALESCE(?2, title), cover_image = COALESCE(?3, cover_image) \
WHERE document_id = ?1";

/// Writes projections with one SQL statement.
pub struct SqlProjectionSink {
    pool: SqlitePool,
    statement: String,
}

impl SqlProjectionSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_statement(pool, DEFAULT_PROJECTION_STATEMENT)
    }

    pub fn with_statement(pool: SqlitePool, statement: impl Into<String>) -> Self {
        Self {
            pool,
            statement: statement.into(),
        }
    }
}

#[async_trait]
impl ProjectionSink for SqlProjectionSink {
    async fn project(&self, document: &DocumentId, fields: &ProjectedFields) -> Result<(), ProjectionError> {
        let result = sqlx::query(&self.statement)
            .bind(document.as_str())
            .bind(fields.title.as_deref())
            .bind(fields.cover_image.as_deref())
            .execute(&self.pool)
            .await?;
        log::trace!(
            "Projected {document}: {} row(s) updated",
            result.rows_affected()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;
    use yrs::{MapPrelim, Text, WriteTxn};

    fn doc_with_fields(title: &str, cover: &str) -> Doc {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text(TITLE_ROOT);
            text.insert(&mut txn, 0, title);
            let meta = txn.get_or_insert_map(META_ROOT);
            meta.insert(&mut txn, COVER_IMAGE_KEY, cover);
        }
        doc
    }

    #[test]
    fn test_extract_fields() {
        let doc = doc_with_fields("My Paper", "https://img/cover.png");
        let fields = ProjectedFields::extract(&doc);
        assert_eq!(fields.title.as_deref(), Some("My Paper"));
        assert_eq!(fields.cover_image.as_deref(), Some("https://img/cover.png"));
    }

    #[test]
    fn test_extract_missing_fields() {
        let fields = ProjectedFields::extract(&Doc::new());
        assert!(fields.is_empty());

        // Non-string cover image is ignored.
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            let meta = txn.get_or_insert_map(META_ROOT);
            meta.insert(&mut txn, COVER_IMAGE_KEY, MapPrelim::default());
        }
        assert_eq!(ProjectedFields::extract(&doc).cover_image, None);
    }

    #[tokio::test]
    async fn test_sql_sink_updates_row() {
        let pool = crate::storage::sql::open_pool("sqlite::memory:", 1).await.unwrap();
        sqlx::query("CREATE TABLE nodes (document_id TEXT, title TEXT, cover_image TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO nodes VALUES ('d1', 'old', 'old.png')")
            .execute(&pool)
            .await
            .unwrap();

        let sink = SqlProjectionSink::new(pool.clone());
        let fields = ProjectedFields {
            title: Some("new".into()),
            cover_image: None,
        };
        sink.project(&DocumentId::new("d1"), &fields).await.unwrap();

        let row = sqlx::query("SELECT title, cover_image FROM nodes WHERE document_id = 'd1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("title"), "new");
        assert_eq!(row.get::<String, _>("cover_image"), "old.png");
    }

    #[tokio::test]
    async fn test_sql_sink_reports_errors() {
        let pool = crate::storage::sql::open_pool("sqlite::memory:", 1).await.unwrap();
        let sink = SqlProjectionSink::new(pool);
        assert!(sink
            .project(&DocumentId::new("d1"), &ProjectedFields::default())
            .await
            .is_err());
    }
}
