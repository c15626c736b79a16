pub mod migrations;
pub mod pivot;
pub mod search;
pub mod sqlite;
pub mod traces;
pub mod writer;

use crate::error::{AppError, AppResult};
use deadpool_sqlite::Pool;

/// Run `f` on a pooled connection. Pool and interaction failures are dependency errors.
pub async fn interact<T, F>(pool: &Pool, f: F) -> AppResult<T>
where
    F: FnOnce(&mut rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let conn = pool
        .get()
        .await
        .map_err(|e| AppError::Dependency(format!("store unavailable: {e}")))?;
    conn.interact(f)
        .await
        .map_err(|e| AppError::Dependency(format!("store interaction failed: {e}")))?
        .map_err(AppError::Database)
}

/// Little-endian f32 packing for embedding columns.
pub fn embedding_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// JSON array literal for `json_each(?)` bindings.
pub fn json_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

/// Fresh in-memory database with the schema applied.
#[cfg(test)]
pub(crate) fn test_conn() -> rusqlite::Connection {
    let conn = rusqlite::Connection::open_in_memory().unwrap();
    migrations::run_migrations(&conn).unwrap();
    conn
}
