use super::DatabaseError;
use crate::schema::CREATE_ASSETS;
use rusqlite::Connection;
use std::path::Path;

pub fn open_database(db_path: &Path) -> Result<Connection, DatabaseError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            DatabaseError::Connection(format!("Could not create {}: {}", parent.display(), e))
        })?;
    }

    let conn = Connection::open(db_path)?;
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection, DatabaseError> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(CREATE_ASSETS)?;
    Ok(())
}
