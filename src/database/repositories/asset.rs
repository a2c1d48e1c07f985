use crate::database::connection::{open_database, open_in_memory};
use crate::database::models::{
    from_millis, to_millis, AnalysisStatus, Asset, AssetUpdate, MediaType, NewAsset,
};
use crate::database::predicate::{Field, Predicate, Value};
use crate::database::{AssetStore, DatabaseError};
use crate::schema::{column, ASSET_COLUMNS};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// SQLite-backed asset store. One connection, serialized behind a mutex, so a
/// reader never observes a half-applied batch.
pub struct AssetRepository {
    conn: Mutex<Connection>,
}

impl AssetRepository {
    pub fn open(db_path: &Path) -> Result<Self, DatabaseError> {
        Ok(Self::from_connection(open_database(db_path)?))
    }

    pub fn in_memory() -> Result<Self, DatabaseError> {
        Ok(Self::from_connection(open_in_memory()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn get_connection(&self) -> Result<MutexGuard<'_, Connection>, DatabaseError> {
        self.conn
            .lock()
            .map_err(|_| DatabaseError::Connection("connection mutex poisoned".to_string()))
    }
}

impl AssetStore for AssetRepository {
    fn register_assets(&self, assets: &[NewAsset]) -> Result<usize, DatabaseError> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO assets (identifier, media_type, modified_at, created_at, width, height)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(identifier) DO UPDATE SET
                    media_type = excluded.media_type,
                    modified_at = excluded.modified_at,
                    created_at = excluded.created_at,
                    width = excluded.width,
                    height = excluded.height,
                    content_hash = CASE WHEN excluded.modified_at = assets.modified_at
                        THEN assets.content_hash END,
                    perceptual_fingerprint = CASE WHEN excluded.modified_at = assets.modified_at
                        THEN assets.perceptual_fingerprint END,
                    embedding = CASE WHEN excluded.modified_at = assets.modified_at
                        THEN assets.embedding END,
                    embedding_version = CASE WHEN excluded.modified_at = assets.modified_at
                        THEN assets.embedding_version END,
                    analysis_updated_at = CASE WHEN excluded.modified_at = assets.modified_at
                        THEN assets.analysis_updated_at END,
                    analysis_status = CASE WHEN excluded.modified_at = assets.modified_at
                        THEN assets.analysis_status ELSE 'pending' END,
                    analysis_attempt_count = CASE WHEN excluded.modified_at = assets.modified_at
                        THEN assets.analysis_attempt_count ELSE 0 END,
                    analysis_next_retry_at = CASE WHEN excluded.modified_at = assets.modified_at
                        THEN assets.analysis_next_retry_at END,
                    analysis_error_message = CASE WHEN excluded.modified_at = assets.modified_at
                        THEN assets.analysis_error_message END",
            )?;
            for asset in assets {
                changed += stmt.execute(params![
                    asset.identifier,
                    String::from(asset.media_type),
                    to_millis(asset.modified_at),
                    asset.created_at.map(to_millis),
                    asset.width,
                    asset.height,
                ])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    fn fetch(
        &self,
        predicate: &Predicate,
        limit: Option<usize>,
    ) -> Result<Vec<Asset>, DatabaseError> {
        let mut params = Vec::new();
        let clause = render(predicate, &mut params);
        let sql = format!(
            "SELECT {} FROM assets WHERE {} ORDER BY added_order ASC{}",
            ASSET_COLUMNS,
            clause,
            limit_clause(limit)
        );

        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), asset_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DatabaseError::Query)
    }

    fn fetch_identifiers(
        &self,
        predicate: &Predicate,
        limit: Option<usize>,
    ) -> Result<Vec<String>, DatabaseError> {
        let mut params = Vec::new();
        let clause = render(predicate, &mut params);
        let sql = format!(
            "SELECT identifier FROM assets WHERE {} ORDER BY added_order ASC{}",
            clause,
            limit_clause(limit)
        );

        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DatabaseError::Query)
    }

    fn count(&self, predicate: &Predicate) -> Result<usize, DatabaseError> {
        let mut params = Vec::new();
        let clause = render(predicate, &mut params);
        let sql = format!("SELECT COUNT(*) FROM assets WHERE {}", clause);

        let conn = self.get_connection()?;
        let count: i64 = conn.query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    fn upsert_batch(&self, updates: &[AssetUpdate]) -> Result<usize, DatabaseError> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;
        let mut written = 0;
        {
            // The modified_at guard drops results computed from content that changed mid-run
            let mut stmt = tx.prepare_cached(
                "UPDATE assets SET
                    content_hash = COALESCE(?2, content_hash),
                    perceptual_fingerprint = COALESCE(?3, perceptual_fingerprint),
                    embedding = COALESCE(?4, embedding),
                    embedding_version = COALESCE(?5, embedding_version),
                    analysis_status = ?6,
                    analysis_attempt_count = ?7,
                    analysis_next_retry_at = ?8,
                    analysis_error_message = ?9,
                    analysis_updated_at = ?10
                 WHERE identifier = ?1 AND modified_at = ?11",
            )?;
            for update in updates {
                let n = stmt.execute(params![
                    update.identifier,
                    update.content_hash,
                    update.perceptual_fingerprint,
                    update.embedding,
                    update.embedding_version,
                    String::from(update.analysis_status),
                    update.analysis_attempt_count,
                    update.analysis_next_retry_at.map(to_millis),
                    update.analysis_error_message,
                    to_millis(update.analysis_updated_at),
                    to_millis(update.source_modified_at),
                ])?;
                if n == 0 {
                    log::debug!(
                        "Skipped analysis result for {} (removed or modified)",
                        update.identifier
                    );
                }
                written += n;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    fn reset_analysis(&self, predicate: &Predicate) -> Result<usize, DatabaseError> {
        let mut params = Vec::new();
        let clause = render(predicate, &mut params);
        let sql = format!(
            "UPDATE assets SET
                content_hash = NULL,
                perceptual_fingerprint = NULL,
                embedding = NULL,
                embedding_version = NULL,
                analysis_updated_at = NULL,
                analysis_status = 'pending',
                analysis_attempt_count = 0,
                analysis_next_retry_at = NULL,
                analysis_error_message = NULL
             WHERE {}",
            clause
        );

        let conn = self.get_connection()?;
        Ok(conn.execute(&sql, params_from_iter(params.iter()))?)
    }

    fn remove(&self, identifiers: &[String]) -> Result<usize, DatabaseError> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare_cached("DELETE FROM assets WHERE identifier = ?1")?;
            for identifier in identifiers {
                removed += stmt.execute(params![identifier])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }
}

fn limit_clause(limit: Option<usize>) -> String {
    match limit {
        Some(n) => format!(" LIMIT {}", n),
        None => String::new(),
    }
}

fn sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Timestamp(t) => SqlValue::Integer(to_millis(*t)),
    }
}

/// Translate a predicate into a WHERE clause with positional parameters.
fn render(predicate: &Predicate, params: &mut Vec<SqlValue>) -> String {
    match predicate {
        Predicate::Always => "1 = 1".to_string(),
        Predicate::IsNull(field) => format!("{} IS NULL", column(*field)),
        Predicate::NotNull(field) => format!("{} IS NOT NULL", column(*field)),
        Predicate::Eq(field, value) => compare(*field, "=", value, params),
        Predicate::Ne(field, value) => compare(*field, "IS NOT", value, params),
        Predicate::Lt(field, value) => compare(*field, "<", value, params),
        Predicate::Le(field, value) => compare(*field, "<=", value, params),
        Predicate::Gt(field, value) => compare(*field, ">", value, params),
        Predicate::Ge(field, value) => compare(*field, ">=", value, params),
        Predicate::FieldLt(left, right) => format!(
            "({l} IS NOT NULL AND {r} IS NOT NULL AND {l} < {r})",
            l = column(*left),
            r = column(*right)
        ),
        Predicate::In(field, values) => {
            if values.is_empty() {
                return "1 = 0".to_string();
            }
            params.extend(values.iter().map(sql_value));
            let placeholders = vec!["?"; values.len()].join(", ");
            format!("{} IN ({})", column(*field), placeholders)
        }
        Predicate::And(parts) => join(parts, " AND ", "1 = 1", params),
        Predicate::Or(parts) => join(parts, " OR ", "1 = 0", params),
        Predicate::Not(inner) => format!("NOT ({})", render(inner, params)),
    }
}

fn compare(field: Field, op: &str, value: &Value, params: &mut Vec<SqlValue>) -> String {
    params.push(sql_value(value));
    format!("{} {} ?", column(field), op)
}

fn join(parts: &[Predicate], separator: &str, empty: &str, params: &mut Vec<SqlValue>) -> String {
    if parts.is_empty() {
        return empty.to_string();
    }
    let rendered: Vec<String> = parts
        .iter()
        .map(|p| format!("({})", render(p, params)))
        .collect();
    rendered.join(separator)
}

// Derived columns are read leniently: a wrongly-typed value surfaces later as
// invalid data for that one asset instead of failing the whole fetch.
fn optional_text(row: &Row, idx: usize) -> rusqlite::Result<Option<String>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => None,
        ValueRef::Text(t) | ValueRef::Blob(t) => Some(String::from_utf8_lossy(t).to_string()),
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
    })
}

fn optional_bytes(row: &Row, idx: usize) -> rusqlite::Result<Option<Vec<u8>>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => None,
        ValueRef::Blob(b) | ValueRef::Text(b) => Some(b.to_vec()),
        ValueRef::Integer(i) => Some(i.to_le_bytes().to_vec()),
        ValueRef::Real(f) => Some(f.to_le_bytes().to_vec()),
    })
}

fn asset_from_row(row: &Row) -> rusqlite::Result<Asset> {
    let attempts: i64 = row.get(13)?;
    Ok(Asset {
        identifier: row.get(0)?,
        media_type: MediaType::from(row.get::<_, String>(1)?),
        modified_at: from_millis(row.get(2)?),
        created_at: row.get::<_, Option<i64>>(3)?.map(from_millis),
        width: row.get(4)?,
        height: row.get(5)?,
        added_order: row.get(6)?,
        content_hash: optional_text(row, 7)?,
        perceptual_fingerprint: optional_text(row, 8)?,
        embedding: optional_bytes(row, 9)?,
        embedding_version: row.get(10)?,
        analysis_updated_at: row.get::<_, Option<i64>>(11)?.map(from_millis),
        analysis_status: AnalysisStatus::from(row.get::<_, String>(12)?),
        analysis_attempt_count: attempts.clamp(0, u32::MAX as i64) as u32,
        analysis_next_retry_at: row.get::<_, Option<i64>>(14)?.map(from_millis),
        analysis_error_message: row.get(15)?,
    })
}
