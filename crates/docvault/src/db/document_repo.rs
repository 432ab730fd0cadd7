//! Document repository: the registry of every ingested file.
//!
//! Artifact paths and `is_compressed` are only ever written together by
//! [`complete`], so a row with `is_compressed = 1` always names two files
//! that were fully written before the update.

use std::fmt;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{now_rfc3339, Database, DatabaseError};
use crate::detect::FileCategory;

/// Processing status of a Document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Pending => "PENDING",
            DocumentStatus::Processing => "PROCESSING",
            DocumentStatus::Completed => "COMPLETED",
            DocumentStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(DocumentStatus::Pending),
            "PROCESSING" => Some(DocumentStatus::Processing),
            "COMPLETED" => Some(DocumentStatus::Completed),
            "FAILED" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }

    /// Transitions an external caller may request. Re-asserting the current
    /// status is allowed so a reconciler can adjust `retries_count` alone.
    pub fn can_transition_to(self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        self == next
            || matches!(
                (self, next),
                (Pending, Processing)
                    | (Pending, Failed)
                    | (Processing, Completed)
                    | (Processing, Failed)
                    | (Failed, Pending)
            )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DocumentStatus::Completed | DocumentStatus::Failed)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registry row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRow {
    pub id: i64,
    pub document_type: FileCategory,
    pub display_name: String,
    pub document_encrypted_id: String,
    pub original_file_size: f64,
    pub current_file_size: f64,
    pub file_extension: String,
    pub mime_type: String,
    pub document_path: Option<String>,
    pub thumb_path: Option<String>,
    pub is_compressed: bool,
    pub is_processed: bool,
    pub status: DocumentStatus,
    pub retries_count: i64,
    pub processed_date_time: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl DocumentRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let type_id: i64 = row.get("document_type")?;
        let document_type = FileCategory::from_id(type_id).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                Type::Integer,
                format!("unknown document type {}", type_id).into(),
            )
        })?;
        let status_text: String = row.get("status")?;
        let status = DocumentStatus::parse(&status_text).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                12,
                Type::Text,
                format!("unknown status {}", status_text).into(),
            )
        })?;

        Ok(Self {
            id: row.get("id")?,
            document_type,
            display_name: row.get("display_name")?,
            document_encrypted_id: row.get("document_encrypted_id")?,
            original_file_size: row.get("original_file_size")?,
            current_file_size: row.get("current_file_size")?,
            file_extension: row.get("file_extension")?,
            mime_type: row.get("mime_type")?,
            document_path: row.get("document_path")?,
            thumb_path: row.get("thumb_path")?,
            is_compressed: row.get("is_compressed")?,
            is_processed: row.get("is_processed")?,
            status,
            retries_count: row.get("retries_count")?,
            processed_date_time: row.get("processed_date_time")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Values known at intake time.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub category: FileCategory,
    pub display_name: String,
    pub encrypted_id: String,
    pub size_mb: f64,
    pub file_extension: String,
    pub mime_type: String,
}

/// What a worker writes when it finishes.
#[derive(Debug, Clone)]
pub struct CompletedArtifacts {
    pub document_path: String,
    pub thumb_path: String,
    pub size_mb: f64,
}

/// Query filter parameters for document listing.
#[derive(Debug, Default, Clone)]
pub struct DocumentFilter {
    pub document_type: Option<FileCategory>,
    /// Case-insensitive substring of `display_name`.
    pub name_contains: Option<String>,
    pub status: Option<DocumentStatus>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Inserts a PENDING row on an existing connection (used inside the
/// dispatch transaction). Returns the new id.
pub fn insert_in(conn: &Connection, doc: &NewDocument) -> Result<i64, DatabaseError> {
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO documents (document_type, display_name, document_encrypted_id,
         original_file_size, current_file_size, file_extension, mime_type,
         status, retries_count, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6, 'PENDING', 0, ?7, ?7)",
        params![
            doc.category.id(),
            doc.display_name,
            doc.encrypted_id,
            doc.size_mb,
            doc.file_extension,
            doc.mime_type,
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert(db: &Database, doc: &NewDocument) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| insert_in(conn, doc))
}

pub fn find_by_id(db: &Database, id: i64) -> Result<Option<DocumentRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM documents WHERE id = ?1",
                params![id],
                DocumentRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

pub fn find_by_public_id(
    db: &Database,
    encrypted_id: &str,
) -> Result<Option<DocumentRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM documents WHERE document_encrypted_id = ?1",
                params![encrypted_id],
                DocumentRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Worker start: PENDING (or a PROCESSING row left by a crashed worker)
/// becomes PROCESSING.
pub fn mark_processing(db: &Database, id: i64) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let updated = conn.execute(
            "UPDATE documents SET status = 'PROCESSING', updated_at = ?2
             WHERE id = ?1 AND status IN ('PENDING', 'PROCESSING')",
            params![id, now_rfc3339()],
        )?;
        Ok(updated == 1)
    })
}

/// The worker's terminal success update.
pub fn complete(
    db: &Database,
    id: i64,
    artifacts: &CompletedArtifacts,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let now = now_rfc3339();
        let updated = conn.execute(
            "UPDATE documents SET status = 'COMPLETED', document_path = ?2, thumb_path = ?3,
             current_file_size = ?4, is_compressed = 1, is_processed = 1,
             processed_date_time = ?5, updated_at = ?5
             WHERE id = ?1 AND status = 'PROCESSING'",
            params![
                id,
                artifacts.document_path,
                artifacts.thumb_path,
                artifacts.size_mb,
                now
            ],
        )?;
        Ok(updated == 1)
    })
}

/// A failed attempt that will be retried: back to PENDING, one more retry
/// counted.
pub fn release_for_retry(db: &Database, id: i64) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let updated = conn.execute(
            "UPDATE documents SET status = 'PENDING', retries_count = retries_count + 1,
             updated_at = ?2
             WHERE id = ?1 AND status = 'PROCESSING'",
            params![id, now_rfc3339()],
        )?;
        Ok(updated == 1)
    })
}

/// Attempts exhausted.
pub fn mark_failed(db: &Database, id: i64) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let updated = conn.execute(
            "UPDATE documents SET status = 'FAILED', is_processed = 0, updated_at = ?2
             WHERE id = ?1 AND status IN ('PENDING', 'PROCESSING')",
            params![id, now_rfc3339()],
        )?;
        Ok(updated == 1)
    })
}

/// Reconciler update. COMPLETED sets `is_processed`, anything else clears it.
pub fn update_status(
    db: &Database,
    id: i64,
    status: DocumentStatus,
    retries_count: Option<i64>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let updated = conn.execute(
            "UPDATE documents SET status = ?2, is_processed = ?3,
             retries_count = COALESCE(?4, retries_count), updated_at = ?5
             WHERE id = ?1",
            params![
                id,
                status.as_str(),
                status == DocumentStatus::Completed,
                retries_count,
                now_rfc3339()
            ],
        )?;
        Ok(updated == 1)
    })
}

/// Queries documents with filters, newest first, returning (rows, total_count).
pub fn query(
    db: &Database,
    filter: &DocumentFilter,
) -> Result<(Vec<DocumentRow>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(category) = filter.document_type {
            conditions.push(format!("document_type = ?{}", param_values.len() + 1));
            param_values.push(Box::new(category.id()));
        }
        if let Some(ref name) = filter.name_contains {
            conditions.push(format!(
                "LOWER(display_name) LIKE ?{} ESCAPE '\\'",
                param_values.len() + 1
            ));
            param_values.push(Box::new(like_pattern(name)));
        }
        if let Some(status) = filter.status {
            conditions.push(format!("status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status.as_str()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM documents {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT * FROM documents {} ORDER BY id DESC LIMIT ?{} OFFSET ?{}",
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows: Vec<DocumentRow> = stmt
            .query_map(params_ref.as_slice(), DocumentRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}

/// `%needle%` with LIKE wildcards in the needle escaped.
///
/// SQLite's `LOWER()` only folds ASCII letters, so the needle is folded the
/// same way. Non-ASCII names match case-sensitively.
fn like_pattern(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len() + 2);
    escaped.push('%');
    for c in needle.to_ascii_lowercase().chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

/// Rows not yet processed, oldest first.
pub fn find_unprocessed(db: &Database, limit: u64) -> Result<Vec<DocumentRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM documents WHERE is_processed = 0 ORDER BY id ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], DocumentRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// `(encrypted_id, display_name)` pairs for the ids that exist.
pub fn names_by_public_ids(
    db: &Database,
    encrypted_ids: &[String],
) -> Result<Vec<(String, String)>, DatabaseError> {
    if encrypted_ids.is_empty() {
        return Ok(Vec::new());
    }

    db.with_conn(|conn| {
        let placeholders = (1..=encrypted_ids.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT document_encrypted_id, display_name FROM documents
             WHERE document_encrypted_id IN ({}) ORDER BY id ASC",
            placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(encrypted_ids.iter()), |r| {
                Ok((r.get(0)?, r.get(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

pub fn delete(db: &Database, id: i64) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let deleted = conn.execute("DELETE FROM documents WHERE id = ?1", params![id])?;
        Ok(deleted == 1)
    })
}
