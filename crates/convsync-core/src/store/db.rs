use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

use crate::store::cache::{CacheError, DurableCache};

/// SQLite-backed durable cache.
///
/// Entries are scoped by a session key (the signed-in user) so a device shared
/// between sessions never serves another session's rows. `clear` wipes every
/// session's entries.
#[derive(Clone)]
pub struct SqliteCache {
    conn: Arc<Mutex<Connection>>,
    session_key: String,
}

impl SqliteCache {
    pub fn open<P: AsRef<Path>>(db_dir: P, file_name: &str, session_key: &str) -> Result<Self> {
        let db_dir = db_dir.as_ref();
        std::fs::create_dir_all(db_dir)?;

        let conn = Connection::open(db_dir.join(file_name))?;
        Self::with_connection(conn, session_key)
    }

    /// Used in tests and by the replay command
    pub fn open_in_memory(session_key: &str) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, session_key)
    }

    fn with_connection(conn: Connection, session_key: &str) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                session_key TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                written_at INTEGER NOT NULL,
                PRIMARY KEY (session_key, key)
            );
            "#,
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            session_key: session_key.to_string(),
        })
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    /// Number of entries across all sessions.
    pub fn total_entries(&self) -> Result<usize, CacheError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl DurableCache for SqliteCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM cache_entries WHERE session_key = ?1 AND key = ?2",
                params![self.session_key, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO cache_entries (session_key, key, value, written_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(session_key, key) DO UPDATE SET
                value = excluded.value,
                written_at = excluded.written_at
            "#,
            params![self.session_key, key, value, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM cache_entries", [])?;
        Ok(())
    }

    fn entries(&self, prefix: &str) -> Result<Vec<(String, String)>, CacheError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT key, value FROM cache_entries
             WHERE session_key = ?1 AND substr(key, 1, length(?2)) = ?2
             ORDER BY key",
        )?;
        let rows = stmt
            .query_map(params![self.session_key, prefix], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<Vec<(String, String)>, _>>()?;
        Ok(rows)
    }
}
